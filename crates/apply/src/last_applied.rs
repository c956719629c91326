//! Last-applied baseline, stored as an annotation on the object itself so it
//! is written in the same request as the change it describes.

use kapply_core::{Document, FieldPath, Patch, PatchOp};
use serde_json::Value as Json;
use tracing::warn;

pub const ANNOTATION: &str = "kapply.dev/last-applied";

fn annotation_path() -> FieldPath {
    // The key contains dots, so it cannot go through `FieldPath::parse`.
    FieldPath::from_iter(["metadata", "annotations", ANNOTATION])
}

/// Desired document as recorded in the annotation.
fn serialized(desired: &Document) -> String {
    strip(desired).to_string()
}

/// Baseline recorded on `live`. Missing or unreadable annotations yield `None`.
pub fn load(live: &Json) -> Option<Document> {
    let raw = annotation_path().lookup(live)?.as_str()?;
    match serde_json::from_str::<Json>(raw) {
        Ok(doc) => Some(doc),
        Err(e) => {
            warn!(error = %e, "ignoring unreadable last-applied annotation");
            None
        }
    }
}

/// Record `desired` as the baseline of `target`, the document about to be created.
pub fn embed(target: &mut Document, desired: &Document) {
    let value = Json::String(serialized(desired));
    Patch { ops: vec![PatchOp::Set { path: annotation_path(), value }] }.apply_to(target);
}

/// Op that brings the live annotation to `desired`; `None` if it already matches.
pub fn store_op(live: &Json, desired: &Document) -> Option<PatchOp> {
    let value = serialized(desired);
    match annotation_path().lookup(live).and_then(Json::as_str) {
        Some(current) if current == value => None,
        _ => Some(PatchOp::Set { path: annotation_path(), value: Json::String(value) }),
    }
}

/// Append the baseline update to `patch`. Also appended when an earlier op
/// overwrites a parent of the annotation, so the record is never dropped.
pub fn record(patch: &mut Patch, live: &Json, desired: &Document) {
    let path = annotation_path();
    let clobbers = patch.ops.iter().any(|op| path.starts_with(op.path()));
    match store_op(live, desired) {
        Some(op) => patch.push(op),
        None if clobbers => patch.push(PatchOp::Set { path, value: Json::String(serialized(desired)) }),
        None => {}
    }
}

/// Copy of `doc` without the annotation; an annotations map left empty is dropped too.
pub fn strip(doc: &Json) -> Json {
    let mut out = doc.clone();
    if let Some(annotations) = out
        .get_mut("metadata")
        .and_then(|m| m.get_mut("annotations"))
        .and_then(Json::as_object_mut)
    {
        annotations.remove(ANNOTATION);
        if annotations.is_empty() {
            if let Some(meta) = out.get_mut("metadata").and_then(Json::as_object_mut) {
                meta.remove("annotations");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm() -> Json {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x", "namespace": "ns"}, "data": {"k": "v"}})
    }

    #[test]
    fn embed_then_load_returns_desired() {
        let mut doc = cm();
        embed(&mut doc, &cm());
        assert!(doc["metadata"]["annotations"][ANNOTATION].is_string());
        assert_eq!(load(&doc), Some(cm()));
        assert_eq!(strip(&doc), cm());
    }

    #[test]
    fn store_op_only_when_baseline_differs() {
        let mut live = cm();
        embed(&mut live, &cm());
        assert!(store_op(&live, &cm()).is_none());
        let mut changed = cm();
        changed["data"]["k"] = json!("w");
        let op = store_op(&live, &changed).unwrap();
        assert_eq!(op.path().segments().last().map(String::as_str), Some(ANNOTATION));
    }

    #[test]
    fn garbage_annotation_is_ignored() {
        let live = json!({"metadata": {"annotations": {ANNOTATION: "{not json"}}});
        assert_eq!(load(&live), None);
    }

    #[test]
    fn strip_keeps_foreign_annotations() {
        let mut doc = cm();
        doc["metadata"]["annotations"] = json!({"a": "b"});
        let desired = doc.clone();
        embed(&mut doc, &desired);
        let s = strip(&doc);
        assert_eq!(s["metadata"]["annotations"], json!({"a": "b"}));
    }

    #[test]
    fn record_survives_parent_overwrite() {
        let mut live = cm();
        embed(&mut live, &cm());
        let mut patch = Patch::new();
        patch.set(FieldPath::parse("metadata.annotations"), json!({"a": "b"}));
        record(&mut patch, &live, &cm());
        let mut next = live.clone();
        patch.apply_to(&mut next);
        assert_eq!(load(&next), Some(cm()));
        assert_eq!(next["metadata"]["annotations"]["a"], "b");
    }
}
