//! kapply schema: per-field merge policies and immutable-field registry.
//!
//! Built-in kinds carry the strategic-merge keys the control plane declares for
//! them; custom resources get theirs from the CRD's OpenAPI list/map markers.
//! Schema paths are dotted mapping keys; elements of keyed lists are
//! transparent, so a container's env list lives at `spec.template.spec.containers.env`.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kapply_core::{FieldPath, MergePolicy, TypeCategory};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KindPolicies {
    pub merge: FxHashMap<String, MergePolicy>,
    pub immutable: Vec<FieldPath>,
}

/// Registry of merge policies keyed by `group/Kind`.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    kinds: FxHashMap<String, KindPolicies>,
    /// Policies that hold for every kind (object metadata).
    common: FxHashMap<String, MergePolicy>,
}

fn kind_key(group: &str, kind: &str) -> String {
    format!("{}/{}", group, kind)
}

const POD_SPEC_PREFIXES: &[(&str, &str, &str)] = &[
    ("", "Pod", "spec"),
    ("", "PodTemplate", "template.spec"),
    ("", "ReplicationController", "spec.template.spec"),
    ("apps", "Deployment", "spec.template.spec"),
    ("apps", "ReplicaSet", "spec.template.spec"),
    ("apps", "StatefulSet", "spec.template.spec"),
    ("apps", "DaemonSet", "spec.template.spec"),
    ("batch", "Job", "spec.template.spec"),
    ("batch", "CronJob", "spec.jobTemplate.spec.template.spec"),
];

const POD_SPEC_LISTS: &[(&str, &str)] = &[
    ("containers", "name"),
    ("initContainers", "name"),
    ("ephemeralContainers", "name"),
    ("volumes", "name"),
    ("imagePullSecrets", "name"),
    ("hostAliases", "ip"),
    ("topologySpreadConstraints", "topologyKey"),
];

const CONTAINER_LISTS: &[(&str, &str)] = &[
    ("ports", "containerPort"),
    ("env", "name"),
    ("volumeMounts", "mountPath"),
    ("volumeDevices", "devicePath"),
];

impl PolicyRegistry {
    pub fn empty() -> Self { Self::default() }

    /// Policies for the built-in kinds.
    pub fn builtin() -> Self {
        let mut reg = Self::default();
        reg.common.insert("metadata.ownerReferences".into(), MergePolicy::MergeByKey("uid".into()));

        for (group, kind, prefix) in POD_SPEC_PREFIXES {
            for (list, key) in POD_SPEC_LISTS {
                reg.add(group, kind, &format!("{}.{}", prefix, list), MergePolicy::MergeByKey((*key).to_string()));
            }
            for container in ["containers", "initContainers", "ephemeralContainers"] {
                for (list, key) in CONTAINER_LISTS {
                    let path = format!("{}.{}.{}", prefix, container, list);
                    reg.add(group, kind, &path, MergePolicy::MergeByKey((*key).to_string()));
                }
            }
        }
        for kind in ["Deployment", "ReplicaSet", "StatefulSet", "DaemonSet"] {
            reg.add("apps", kind, "spec.selector", MergePolicy::Atomic);
            reg.add_immutable("apps", kind, "spec.selector");
        }
        reg.add_immutable("apps", "StatefulSet", "spec.serviceName");
        reg.add_immutable("batch", "Job", "spec.selector");
        reg.add_immutable("batch", "Job", "spec.template");

        reg.add("", "Service", "spec.ports", MergePolicy::MergeByKey("port".into()));
        reg.add("", "Service", "spec.selector", MergePolicy::Atomic);
        reg.add_immutable("", "Service", "spec.clusterIP");
        reg.add_immutable("", "PersistentVolumeClaim", "spec.storageClassName");
        reg.add_immutable("", "PersistentVolumeClaim", "spec.volumeName");
        reg
    }

    pub fn add(&mut self, group: &str, kind: &str, path: &str, policy: MergePolicy) {
        self.kinds.entry(kind_key(group, kind)).or_default().merge.insert(path.to_string(), policy);
    }

    pub fn add_immutable(&mut self, group: &str, kind: &str, path: &str) {
        self.kinds.entry(kind_key(group, kind)).or_default().immutable.push(FieldPath::parse(path));
    }

    /// Register every policy derived for a custom kind.
    pub fn extend(&mut self, group: &str, kind: &str, policies: impl IntoIterator<Item = (String, MergePolicy)>) {
        let entry = self.kinds.entry(kind_key(group, kind)).or_default();
        for (path, policy) in policies {
            entry.merge.insert(path, policy);
        }
    }

    pub fn knows(&self, ty: &TypeCategory) -> bool {
        self.kinds.contains_key(&kind_key(&ty.group, &ty.kind))
    }

    /// Declared policy at `schema_path`, if any. Callers apply the defaults
    /// (mappings merge recursively, lists replace) when this is `None`.
    pub fn policy_for(&self, ty: &TypeCategory, schema_path: &str) -> Option<&MergePolicy> {
        self.kinds
            .get(&kind_key(&ty.group, &ty.kind))
            .and_then(|k| k.merge.get(schema_path))
            .or_else(|| self.common.get(schema_path))
    }

    pub fn immutable_paths(&self, ty: &TypeCategory) -> &[FieldPath] {
        self.kinds.get(&kind_key(&ty.group, &ty.kind)).map(|k| k.immutable.as_slice()).unwrap_or(&[])
    }
}

/// Derive merge policies from a CRD `openAPIV3Schema`.
///
/// `x-kubernetes-list-type: map` yields `MergeByKey` on the first entry of
/// `x-kubernetes-list-map-keys`; `atomic` list or map types yield `Atomic`.
pub fn policies_from_openapi(schema: &serde_json::Value) -> Vec<(String, MergePolicy)> {
    use serde_json::Value;

    fn walk(node: &Value, base: &str, depth: usize, out: &mut Vec<(String, MergePolicy)>) {
        if depth > 16 { return; }
        let Some(props) = node.get("properties").and_then(Value::as_object) else { return };
        for (k, v) in props.iter() {
            let path = if base.is_empty() { k.clone() } else { format!("{}.{}", base, k) };
            match v.get("type").and_then(Value::as_str).unwrap_or("") {
                "object" => {
                    if v.get("x-kubernetes-map-type").and_then(Value::as_str) == Some("atomic") {
                        out.push((path, MergePolicy::Atomic));
                    } else {
                        walk(v, &path, depth + 1, out);
                    }
                }
                "array" => {
                    match v.get("x-kubernetes-list-type").and_then(Value::as_str) {
                        Some("map") => {
                            let key = v
                                .get("x-kubernetes-list-map-keys")
                                .and_then(Value::as_array)
                                .and_then(|keys| keys.first())
                                .and_then(Value::as_str);
                            if let Some(key) = key {
                                out.push((path.clone(), MergePolicy::MergeByKey(key.to_string())));
                            }
                        }
                        Some("atomic") => out.push((path.clone(), MergePolicy::Atomic)),
                        _ => {}
                    }
                    if let Some(items) = v.get("items") {
                        walk(items, &path, depth + 1, out);
                    }
                }
                _ => {}
            }
        }
    }

    let mut out = Vec::new();
    walk(schema, "", 0, &mut out);
    out
}

/// Load the CRD for `group`/`kind` and derive its merge policies.
/// Returns `Ok(None)` for built-in (group-less) kinds.
pub async fn fetch_crd_policies(client: kube::Client, ty: &TypeCategory) -> Result<Option<Vec<(String, MergePolicy)>>> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
    use kube::{api::ListParams, Api};

    if ty.group.is_empty() {
        return Ok(None);
    }
    let api: Api<apiextv1::CustomResourceDefinition> = Api::all(client);
    let crds = api.list(&ListParams::default()).await.context("listing CustomResourceDefinitions")?;
    let mut found: Option<serde_json::Value> = None;
    for crd in crds {
        let v = serde_json::to_value(&crd)?;
        let spec = match v.get("spec") { Some(s) => s, None => continue };
        let g = spec.get("group").and_then(|s| s.as_str()).unwrap_or("");
        let k = spec.get("names").and_then(|n| n.get("kind")).and_then(|s| s.as_str()).unwrap_or("");
        if g == ty.group && k == ty.kind { found = Some(v); break; }
    }
    let v = found.ok_or_else(|| anyhow!("CRD not found for {}", ty))?;
    let versions = v
        .get("spec").and_then(|s| s.get("versions"))
        .and_then(|vv| vv.as_array())
        .cloned()
        .unwrap_or_default();

    // Requested version first, then the storage version.
    let chosen = versions
        .iter()
        .find(|ver| ver.get("name").and_then(|s| s.as_str()) == Some(ty.version.as_str()))
        .or_else(|| versions.iter().find(|ver| ver.get("storage").and_then(|b| b.as_bool()).unwrap_or(false)));
    let schema = chosen.and_then(|ver| ver.get("schema")).and_then(|s| s.get("openAPIV3Schema"));
    let policies = schema.map(policies_from_openapi).unwrap_or_default();
    debug!(crd = %ty, count = policies.len(), "derived merge policies from CRD schema");
    Ok(Some(policies))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(api_version: &str, kind: &str) -> TypeCategory { TypeCategory::from_api_version(api_version, kind) }

    #[test]
    fn builtin_service_ports_merge_by_port() {
        let reg = PolicyRegistry::builtin();
        assert_eq!(reg.policy_for(&ty("v1", "Service"), "spec.ports"), Some(&MergePolicy::MergeByKey("port".into())));
        assert_eq!(reg.policy_for(&ty("v1", "Service"), "spec.selector"), Some(&MergePolicy::Atomic));
        assert_eq!(reg.policy_for(&ty("v1", "ConfigMap"), "data"), None);
    }

    #[test]
    fn builtin_pod_template_lists_follow_kind_prefix() {
        let reg = PolicyRegistry::builtin();
        let dep = ty("apps/v1", "Deployment");
        assert_eq!(
            reg.policy_for(&dep, "spec.template.spec.containers.env"),
            Some(&MergePolicy::MergeByKey("name".into()))
        );
        let cj = ty("batch/v1", "CronJob");
        assert_eq!(
            reg.policy_for(&cj, "spec.jobTemplate.spec.template.spec.volumes"),
            Some(&MergePolicy::MergeByKey("name".into()))
        );
        assert_eq!(reg.policy_for(&ty("v1", "Pod"), "spec.containers.ports"), Some(&MergePolicy::MergeByKey("containerPort".into())));
    }

    #[test]
    fn owner_references_are_common() {
        let reg = PolicyRegistry::builtin();
        assert_eq!(
            reg.policy_for(&ty("example.com/v1", "Widget"), "metadata.ownerReferences"),
            Some(&MergePolicy::MergeByKey("uid".into()))
        );
    }

    #[test]
    fn immutable_registry_lists_cluster_ip() {
        let reg = PolicyRegistry::builtin();
        let paths: Vec<String> = reg.immutable_paths(&ty("v1", "Service")).iter().map(|p| p.to_string()).collect();
        assert_eq!(paths, vec!["spec.clusterIP"]);
        assert!(reg.immutable_paths(&ty("v1", "ConfigMap")).is_empty());
    }

    #[test]
    fn openapi_markers_become_policies() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "spec": {
                    "type": "object",
                    "properties": {
                        "listeners": {
                            "type": "array",
                            "x-kubernetes-list-type": "map",
                            "x-kubernetes-list-map-keys": ["name", "port"],
                            "items": {
                                "type": "object",
                                "properties": {
                                    "name": {"type": "string"},
                                    "hosts": {"type": "array", "x-kubernetes-list-type": "atomic", "items": {"type": "string"}}
                                }
                            }
                        },
                        "selector": {"type": "object", "x-kubernetes-map-type": "atomic"},
                        "tags": {"type": "array", "x-kubernetes-list-type": "set", "items": {"type": "string"}}
                    }
                }
            }
        });
        let mut got = policies_from_openapi(&schema);
        got.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(got, vec![
            ("spec.listeners".to_string(), MergePolicy::MergeByKey("name".into())),
            ("spec.listeners.hosts".to_string(), MergePolicy::Atomic),
            ("spec.selector".to_string(), MergePolicy::Atomic),
        ]);

        let mut reg = PolicyRegistry::empty();
        reg.extend("example.com", "Gateway", got);
        assert!(reg.knows(&ty("example.com/v1", "Gateway")));
    }
}
