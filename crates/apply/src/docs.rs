//! Desired documents from YAML or JSON text.

use anyhow::{anyhow, Context, Result};
use kapply_core::Document;
use serde::Deserialize;
use serde_json::Value as Json;

use crate::config::env_parse;

/// Size guards applied before any document reaches the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadLimits {
    /// Largest accepted input, in bytes.
    pub max_bytes: usize,
    /// Most JSON nodes (scalars and containers) a single document may hold.
    pub max_nodes: usize,
}

impl Default for LoadLimits {
    fn default() -> Self {
        Self { max_bytes: 1 << 20, max_nodes: 100_000 }
    }
}

impl LoadLimits {
    /// `KAPPLY_MAX_YAML_BYTES` and `KAPPLY_MAX_YAML_NODES` over the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_bytes: env_parse("KAPPLY_MAX_YAML_BYTES").unwrap_or(d.max_bytes),
            max_nodes: env_parse("KAPPLY_MAX_YAML_NODES").unwrap_or(d.max_nodes),
        }
    }

    /// Whether `doc` has more than `max_nodes` nodes. Stops counting at the limit.
    fn too_many_nodes(&self, doc: &Json) -> bool {
        let mut pending = vec![doc];
        let mut seen = 0usize;
        while let Some(v) = pending.pop() {
            seen += 1;
            if seen > self.max_nodes {
                return true;
            }
            match v {
                Json::Object(map) => pending.extend(map.values()),
                Json::Array(items) => pending.extend(items.iter()),
                _ => {}
            }
        }
        false
    }
}

fn is_list(doc: &Json) -> bool {
    doc.get("kind").and_then(Json::as_str).map(|k| k.ends_with("List")).unwrap_or(false)
        && doc.get("items").map(Json::is_array).unwrap_or(false)
}

/// Parse every document in a multi-document stream under the limits from
/// the environment. Empty documents are skipped and `*List` wrappers
/// contribute their items.
pub fn load_documents(text: &str) -> Result<Vec<Document>> {
    load_documents_with(text, &LoadLimits::from_env())
}

pub fn load_documents_with(text: &str, limits: &LoadLimits) -> Result<Vec<Document>> {
    if text.len() > limits.max_bytes {
        return Err(anyhow!("input too large: {} bytes, limit {}", text.len(), limits.max_bytes));
    }
    let mut out = Vec::new();
    for (i, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(de).with_context(|| format!("parsing YAML document {}", i + 1))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).with_context(|| format!("converting YAML document {} to JSON", i + 1))?;
        if limits.too_many_nodes(&json) {
            return Err(anyhow!("document {} has more than {} nodes", i + 1, limits.max_nodes));
        }
        if is_list(&json) {
            if let Json::Object(mut map) = json {
                if let Some(Json::Array(items)) = map.remove("items") {
                    out.extend(items.into_iter().filter(|d| !d.is_null()));
                }
            }
        } else {
            out.push(json);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_multi_document_streams() {
        let text = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: b\n";
        let docs = load_documents(text).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["kind"], "Service");
    }

    #[test]
    fn flattens_lists_and_accepts_json() {
        let text = r#"{"apiVersion": "v1", "kind": "List", "items": [
            {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}},
            {"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "b"}}
        ]}"#;
        let docs = load_documents(text).unwrap();
        assert_eq!(docs.iter().map(|d| d["kind"].as_str().unwrap()).collect::<Vec<_>>(), vec!["ConfigMap", "Secret"]);
    }

    #[test]
    fn node_limit_counts_every_value() {
        // root, a, 1, 2, 3, b, c
        let v = serde_json::json!({"a": [1, 2, 3], "b": {"c": 1}});
        let limits = |max_nodes| LoadLimits { max_nodes, ..LoadLimits::default() };
        assert!(limits(3).too_many_nodes(&v));
        assert!(limits(6).too_many_nodes(&v));
        assert!(!limits(7).too_many_nodes(&v));
    }

    #[test]
    fn oversized_input_is_refused() {
        let limits = LoadLimits { max_bytes: 16, ..LoadLimits::default() };
        let e = load_documents_with("apiVersion: v1\nkind: ConfigMap\n", &limits).unwrap_err();
        assert!(e.to_string().contains("input too large"), "e={}", e);
        let limits = LoadLimits { max_nodes: 4, ..LoadLimits::default() };
        let e = load_documents_with("a: [1, 2, 3, 4]\n", &limits).unwrap_err();
        assert!(e.to_string().contains("more than 4 nodes"), "e={}", e);
    }

    #[test]
    fn parse_errors_name_the_document() {
        let e = load_documents("a: 1\n---\nb: [1, 2\n").unwrap_err();
        assert!(format!("{:#}", e).contains("parsing YAML document"), "e={:#}", e);
    }
}
