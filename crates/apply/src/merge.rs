//! Three-way merge: last-applied baseline, desired document, live object.
//!
//! The result is a [`Patch`] that moves live toward desired while leaving
//! fields other actors own alone. A field is considered ours when the baseline
//! holds it; a field only live holds is never touched.

use kapply_core::{FieldPath, MergePolicy, Patch, PatchOp, TypeCategory};
use kapply_schema::PolicyRegistry;
use serde_json::{Map, Value as Json};

pub struct Merger<'a> {
    policies: &'a PolicyRegistry,
    ty: &'a TypeCategory,
}

fn schema_child(schema: &str, key: &str) -> String {
    if schema.is_empty() { key.to_string() } else { format!("{}.{}", schema, key) }
}

/// Copy of `v` with every `null` mapping entry removed, at any depth.
pub fn strip_nulls(v: &Json) -> Json {
    match v {
        Json::Object(map) => Json::Object(
            map.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), strip_nulls(v))).collect(),
        ),
        Json::Array(items) => Json::Array(items.iter().map(strip_nulls).collect()),
        other => other.clone(),
    }
}

impl<'a> Merger<'a> {
    pub fn new(policies: &'a PolicyRegistry, ty: &'a TypeCategory) -> Self {
        Self { policies, ty }
    }

    /// Patch for `live` given the recorded `baseline` (if any) and `desired`.
    pub fn diff(&self, baseline: Option<&Json>, desired: &Json, live: &Json) -> Patch {
        let mut ops = Vec::new();
        self.merge_field("", &FieldPath::root(), baseline, desired, Some(live), &mut ops);
        Patch { ops }
    }

    fn merge_field(
        &self,
        schema: &str,
        path: &FieldPath,
        base: Option<&Json>,
        desired: &Json,
        live: Option<&Json>,
        ops: &mut Vec<PatchOp>,
    ) {
        if desired.is_null() {
            if base != Some(&Json::Null) {
                ops.push(PatchOp::Delete { path: path.clone() });
            }
            return;
        }
        match self.policies.policy_for(self.ty, schema) {
            Some(MergePolicy::MergeByKey(key)) => match desired {
                Json::Array(items) => self.merge_keyed(schema, path, key, base, items, live, ops),
                _ => replace(path, base, desired, ops),
            },
            Some(MergePolicy::Replace) | Some(MergePolicy::Atomic) => replace(path, base, desired, ops),
            None => match (desired, live) {
                (Json::Object(d), Some(Json::Object(l))) => self.merge_map(schema, path, base, d, l, ops),
                _ => replace(path, base, desired, ops),
            },
        }
    }

    fn merge_map(
        &self,
        schema: &str,
        path: &FieldPath,
        base: Option<&Json>,
        desired: &Map<String, Json>,
        live: &Map<String, Json>,
        ops: &mut Vec<PatchOp>,
    ) {
        for (k, dv) in desired.iter() {
            let child_base = base.and_then(|b| b.get(k));
            self.merge_field(&schema_child(schema, k), &path.child(k), child_base, dv, live.get(k), ops);
        }
        // Dropped from desired: remove only what still looks like our write.
        if let Some(Json::Object(bm)) = base {
            for (k, bv) in bm.iter() {
                if desired.contains_key(k) || bv.is_null() {
                    continue;
                }
                if live.get(k) == Some(bv) {
                    ops.push(PatchOp::Delete { path: path.child(k) });
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_keyed(
        &self,
        schema: &str,
        path: &FieldPath,
        key: &str,
        base: Option<&Json>,
        desired: &[Json],
        live: Option<&Json>,
        ops: &mut Vec<PatchOp>,
    ) {
        let key_of = |v: &Json| v.get(key).filter(|k| !k.is_null()).cloned();
        if desired.iter().any(|e| key_of(e).is_none()) {
            replace(path, base, &Json::Array(desired.to_vec()), ops);
            return;
        }
        let live_items: &[Json] = match live {
            Some(Json::Array(items)) => items,
            _ => &[],
        };
        let base_items: &[Json] = match base {
            Some(Json::Array(items)) => items,
            _ => &[],
        };
        let find = |items: &[Json], k: &Json| items.iter().position(|e| e.get(key) == Some(k));

        let mut merged = Vec::with_capacity(desired.len().max(live_items.len()));
        let mut desired_keys = Vec::with_capacity(desired.len());
        for de in desired.iter() {
            let Some(k) = key_of(de) else { continue };
            let live_el = find(live_items, &k).map(|i| &live_items[i]);
            match (de.as_object(), live_el, live_el.and_then(Json::as_object)) {
                (Some(dm), Some(le), Some(lm)) => {
                    let base_el = find(base_items, &k).map(|i| &base_items[i]);
                    let mut sub = Vec::new();
                    self.merge_map(schema, &FieldPath::root(), base_el, dm, lm, &mut sub);
                    let mut el = le.clone();
                    Patch { ops: sub }.apply_to(&mut el);
                    merged.push(el);
                }
                _ => merged.push(strip_nulls(de)),
            }
            desired_keys.push(k);
        }
        for le in live_items.iter() {
            match le.get(key).filter(|k| !k.is_null()) {
                Some(k) if desired_keys.contains(k) => {}
                // Was ours and is no longer desired.
                Some(k) if find(base_items, k).is_some() => {}
                _ => merged.push(le.clone()),
            }
        }
        let merged = Json::Array(merged);
        if live != Some(&merged) {
            ops.push(PatchOp::Set { path: path.clone(), value: merged });
        }
    }
}

fn replace(path: &FieldPath, base: Option<&Json>, desired: &Json, ops: &mut Vec<PatchOp>) {
    if base != Some(desired) {
        ops.push(PatchOp::Set { path: path.clone(), value: strip_nulls(desired) });
    }
}

/// First registered immutable path whose existing live value `patch` would change.
pub fn immutable_violation(paths: &[FieldPath], patch: &Patch, live: &Json) -> Option<FieldPath> {
    if paths.is_empty() || patch.is_empty() {
        return None;
    }
    let mut next = live.clone();
    patch.apply_to(&mut next);
    paths.iter().find(|p| p.lookup(live).is_some() && p.lookup(live) != p.lookup(&next)).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn svc() -> TypeCategory { TypeCategory::from_api_version("v1", "Service") }

    fn merged(baseline: Option<Json>, desired: Json, live: Json) -> Json {
        let reg = PolicyRegistry::builtin();
        let ty = svc();
        let patch = Merger::new(&reg, &ty).diff(baseline.as_ref(), &desired, &live);
        let mut out = live;
        patch.apply_to(&mut out);
        out
    }

    #[test]
    fn unchanged_when_desired_matches_baseline() {
        let d = json!({"metadata": {"name": "a"}, "spec": {"type": "NodePort"}});
        let live = json!({"metadata": {"name": "a", "uid": "u"}, "spec": {"type": "NodePort", "clusterIP": "10.0.0.1"}});
        let reg = PolicyRegistry::builtin();
        let ty = svc();
        assert!(Merger::new(&reg, &ty).diff(Some(&d), &d, &live).is_empty());
    }

    #[test]
    fn out_of_band_fields_survive() {
        let base = json!({"metadata": {"labels": {"app": "a"}}});
        let desired = json!({"metadata": {"labels": {"app": "b"}}});
        let live = json!({"metadata": {"labels": {"app": "a", "team": "x"}, "annotations": {"a": "b"}}});
        let out = merged(Some(base), desired, live);
        assert_eq!(out["metadata"]["labels"], json!({"app": "b", "team": "x"}));
        assert_eq!(out["metadata"]["annotations"], json!({"a": "b"}));
    }

    #[test]
    fn keys_dropped_from_desired_are_removed_only_if_unchanged() {
        let base = json!({"metadata": {"labels": {"foo": "bar", "keep": "1"}}});
        let desired = json!({"metadata": {"labels": {"baz": "xyzzy"}}});
        let live = json!({"metadata": {"labels": {"foo": "bar", "keep": "2"}}});
        let out = merged(Some(base), desired, live);
        assert_eq!(out["metadata"]["labels"], json!({"keep": "2", "baz": "xyzzy"}));
    }

    #[test]
    fn keyed_list_merges_by_port() {
        let base = json!({"spec": {"ports": [{"port": 80}]}});
        let desired = json!({"spec": {"ports": [{"port": 81}]}});
        let live = json!({"spec": {"ports": [{"port": 80, "protocol": "TCP"}, {"port": 9000, "name": "sidecar"}]}});
        let out = merged(Some(base), desired, live);
        assert_eq!(out["spec"]["ports"], json!([{"port": 81}, {"port": 9000, "name": "sidecar"}]));
    }

    #[test]
    fn keyed_list_keeps_live_defaults_on_matching_element() {
        let desired = json!({"spec": {"ports": [{"port": 80, "name": "http"}]}});
        let live = json!({"spec": {"ports": [{"port": 80, "name": "web", "protocol": "TCP"}]}});
        let out = merged(Some(json!({"spec": {"ports": [{"port": 80, "name": "web"}]}})), desired, live);
        assert_eq!(out["spec"]["ports"], json!([{"port": 80, "name": "http", "protocol": "TCP"}]));
    }

    #[test]
    fn explicit_null_deletes_unless_baseline_null() {
        let desired = json!({"spec": {"type": null}});
        let live = json!({"spec": {"type": "NodePort"}});
        let reg = PolicyRegistry::builtin();
        let ty = svc();
        let m = Merger::new(&reg, &ty);
        let first = m.diff(Some(&json!({"spec": {"type": "NodePort"}})), &desired, &live);
        assert_eq!(first.ops, vec![PatchOp::Delete { path: FieldPath::parse("spec.type") }]);
        let again = m.diff(Some(&desired), &desired, &json!({"spec": {"type": "ClusterIP"}}));
        assert!(again.is_empty());
    }

    #[test]
    fn atomic_selector_is_replaced_whole() {
        let base = json!({"spec": {"selector": {"app": "a", "tier": "web"}}});
        let desired = json!({"spec": {"selector": {"app": "b"}}});
        let live = json!({"spec": {"selector": {"app": "a", "tier": "web", "extra": "x"}}});
        let out = merged(Some(base), desired, live);
        assert_eq!(out["spec"]["selector"], json!({"app": "b"}));
    }

    #[test]
    fn plain_lists_replace_and_nulls_are_stripped() {
        let desired = json!({"spec": {"externalIPs": ["1.1.1.1"], "extra": {"a": 1, "b": null}}});
        let live = json!({"spec": {"externalIPs": ["2.2.2.2", "3.3.3.3"], "extra": 5}});
        let out = merged(None, desired, live);
        assert_eq!(out["spec"]["externalIPs"], json!(["1.1.1.1"]));
        assert_eq!(out["spec"]["extra"], json!({"a": 1}));
    }

    #[test]
    fn immutable_changes_are_detected() {
        let live = json!({"spec": {"clusterIP": "10.0.0.1"}});
        let mut patch = Patch::new();
        patch.set(FieldPath::parse("spec.clusterIP"), json!("10.0.0.2"));
        let paths = [FieldPath::parse("spec.clusterIP")];
        assert_eq!(immutable_violation(&paths, &patch, &live), Some(FieldPath::parse("spec.clusterIP")));
        let unset = json!({"spec": {}});
        assert_eq!(immutable_violation(&paths, &patch, &unset), None);
    }
}
