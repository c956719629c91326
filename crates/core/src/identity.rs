//! Identity resolution: defaults namespaces and rejects colliding identities
//! before anything is written.

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

use crate::{DesiredObject, Document, Identity, ManagedSet, TypeCategory};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("duplicate identity {identity}: declared as {first} and again as {second}")]
    DuplicateIdentity { identity: Identity, first: TypeCategory, second: TypeCategory },
    #[error("document #{index} is invalid: {reason}")]
    InvalidObject { index: usize, reason: String },
}

/// Resolve identities for the desired documents in input order.
///
/// For namespaced kinds the namespace comes from `metadata.namespace` when
/// set, otherwise `default_namespace`, and is written back into the document.
/// Kinds for which `namespaced` answers `false` resolve to an empty namespace
/// and lose any `metadata.namespace`. An identity recorded in `previous` under
/// a different category is flagged through [`DesiredObject::previous_type`].
pub fn resolve(
    docs: Vec<Document>,
    default_namespace: &str,
    previous: &ManagedSet,
    namespaced: impl Fn(&TypeCategory) -> bool,
) -> Result<Vec<DesiredObject>, ResolveError> {
    let mut seen: FxHashMap<Identity, TypeCategory> = FxHashMap::default();
    let mut out = Vec::with_capacity(docs.len());
    for (index, mut doc) in docs.into_iter().enumerate() {
        let invalid = |reason: &str| ResolveError::InvalidObject { index, reason: reason.to_string() };
        if !doc.is_object() {
            return Err(invalid("not a mapping"));
        }
        if doc.get("apiVersion").and_then(Json::as_str).map_or(true, str::is_empty) {
            return Err(invalid("missing apiVersion"));
        }
        let type_category = TypeCategory::of(&doc).ok_or_else(|| invalid("missing kind"))?;
        let name = doc
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Json::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("missing metadata.name"))?
            .to_string();
        let explicit_ns = doc
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Json::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let namespace = if namespaced(&type_category) {
            let ns = explicit_ns.unwrap_or_else(|| default_namespace.to_string());
            if let Some(meta) = doc.get_mut("metadata").and_then(Json::as_object_mut) {
                meta.insert("namespace".into(), Json::String(ns.clone()));
            }
            ns
        } else {
            if let Some(ns) = explicit_ns {
                debug!(name = %name, kind = %type_category, namespace = %ns, "ignoring namespace of cluster-scoped object");
            }
            if let Some(meta) = doc.get_mut("metadata").and_then(Json::as_object_mut) {
                meta.remove("namespace");
            }
            String::new()
        };

        let identity = Identity { namespace, name };
        if let Some(first) = seen.get(&identity) {
            return Err(ResolveError::DuplicateIdentity {
                identity,
                first: first.clone(),
                second: type_category,
            });
        }
        seen.insert(identity.clone(), type_category.clone());

        let previous_type = previous
            .get(&identity)
            .filter(|prev| !prev.same_type(&type_category))
            .cloned();
        if let Some(prev) = previous_type.as_ref() {
            debug!(identity = %identity, from = %prev, to = %type_category, "type change flagged");
        }
        out.push(DesiredObject { identity, type_category, doc, previous_type });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str, ns: Option<&str>) -> Document {
        let mut v = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}});
        if let Some(ns) = ns {
            v["metadata"]["namespace"] = json!(ns);
        }
        v
    }

    #[test]
    fn defaults_namespace_only_when_absent() {
        let docs = vec![cm("nons", None), cm("ns1", Some("n1")), cm("ns2", Some("n2"))];
        let out = resolve(docs, "n0", &ManagedSet::new(), TypeCategory::builtin_namespaced).unwrap();
        let ids: Vec<_> = out.iter().map(|o| o.identity.to_string()).collect();
        assert_eq!(ids, vec!["n0/nons", "n1/ns1", "n2/ns2"]);
        assert_eq!(out[0].doc["metadata"]["namespace"], "n0");
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let docs = vec![cm("a", Some("x")), cm("a", None)];
        let err = resolve(docs, "x", &ManagedSet::new(), TypeCategory::builtin_namespaced).unwrap_err();
        assert!(matches!(err, ResolveError::DuplicateIdentity { .. }), "err={}", err);
    }

    #[test]
    fn same_name_in_other_namespace_is_fine() {
        let docs = vec![cm("a", Some("x")), cm("a", Some("y"))];
        assert_eq!(resolve(docs, "x", &ManagedSet::new(), TypeCategory::builtin_namespaced).unwrap().len(), 2);
    }

    #[test]
    fn type_change_is_flagged_against_previous_run() {
        let mut prev = ManagedSet::new();
        prev.insert(Identity::new("ns", "testobj"), TypeCategory::from_api_version("v1", "Service"));
        let out = resolve(vec![cm("testobj", None)], "ns", &prev, TypeCategory::builtin_namespaced).unwrap();
        assert_eq!(out[0].previous_type.as_ref().map(|t| t.kind.as_str()), Some("Service"));

        let mut same = ManagedSet::new();
        same.insert(Identity::new("ns", "testobj"), TypeCategory::from_api_version("v1", "ConfigMap"));
        let out = resolve(vec![cm("testobj", None)], "ns", &same, TypeCategory::builtin_namespaced).unwrap();
        assert!(out[0].previous_type.is_none());
    }

    #[test]
    fn cluster_scoped_kinds_ignore_namespaces() {
        let ns = |name: &str, ns: Option<&str>| {
            let mut v = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": name}});
            if let Some(ns) = ns {
                v["metadata"]["namespace"] = json!(ns);
            }
            v
        };
        let out = resolve(vec![ns("team-a", None), ns("team-b", Some("x"))], "dev", &ManagedSet::new(), TypeCategory::builtin_namespaced)
            .unwrap();
        assert_eq!(out[0].identity, Identity::cluster("team-a"));
        assert_eq!(out[1].identity, Identity::cluster("team-b"));
        assert!(out[0].doc["metadata"].get("namespace").is_none());
        assert!(out[1].doc["metadata"].get("namespace").is_none());

        let err = resolve(vec![ns("team-a", Some("x")), ns("team-a", Some("y"))], "dev", &ManagedSet::new(), TypeCategory::builtin_namespaced)
            .unwrap_err();
        assert!(matches!(err, ResolveError::DuplicateIdentity { .. }), "err={}", err);
    }

    #[test]
    fn scope_comes_from_the_caller() {
        let widget = json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}});
        let out = resolve(vec![widget.clone()], "dev", &ManagedSet::new(), |_| false).unwrap();
        assert_eq!(out[0].identity, Identity::cluster("w"));
        let out = resolve(vec![widget], "dev", &ManagedSet::new(), |_| true).unwrap();
        assert_eq!(out[0].identity, Identity::new("dev", "w"));
    }

    #[test]
    fn invalid_documents_are_reported_by_index() {
        let e = resolve(vec![cm("ok", None), json!({"kind": "ConfigMap"})], "ns", &ManagedSet::new(), TypeCategory::builtin_namespaced).unwrap_err();
        assert_eq!(e, ResolveError::InvalidObject { index: 1, reason: "missing apiVersion".into() });
        let e = resolve(vec![json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}})], "ns", &ManagedSet::new(), TypeCategory::builtin_namespaced)
            .unwrap_err();
        assert!(e.to_string().contains("missing metadata.name"));
    }
}
