//! kapply apply: three-way merge, per-identity apply orchestration and garbage
//! collection of identities no longer desired.

#![forbid(unsafe_code)]

use kapply_core::{Patch, PatchOp};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod config;
pub mod docs;
pub mod gc;
pub mod last_applied;
pub mod merge;
pub mod reconcile;

pub use config::{ImmutablePolicy, ReconcileConfig};
pub use docs::{load_documents, load_documents_with, LoadLimits};
pub use merge::Merger;
pub use reconcile::{ObjectReport, PlannedAction, PlannedChange, ReconcileError, Reconciler, RunResult, Stage};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

/// Count what `patch` would change on `live`: sets of absent paths are adds,
/// sets of different values updates, deletes of present values removes.
pub fn diff_summary(patch: &Patch, live: &Json) -> DiffSummary {
    let mut s = DiffSummary::default();
    for op in patch.ops.iter() {
        match op {
            PatchOp::Set { path, value } => match path.lookup(live) {
                None => s.adds += 1,
                Some(cur) if cur != value => s.updates += 1,
                Some(_) => {}
            },
            PatchOp::Delete { path } => {
                if path.lookup(live).is_some() {
                    s.removes += 1;
                }
            }
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use kapply_core::FieldPath;

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let live = serde_json::json!({
            "a": 1,
            "b": { "x": 1 },
            "c": [1, 2, 3]
        });
        let mut patch = Patch::new();
        patch.set(FieldPath::parse("a"), serde_json::json!(2)); // update
        patch.set(FieldPath::parse("b.y"), serde_json::json!(2)); // add
        patch.set(FieldPath::parse("b.x"), serde_json::json!(1)); // same value, not counted
        patch.set(FieldPath::parse("c"), serde_json::json!([1, 9])); // update
        patch.delete(FieldPath::parse("d")); // absent, not counted
        patch.delete(FieldPath::parse("b.x")); // remove
        let s = diff_summary(&patch, &live);
        assert_eq!(s, DiffSummary { adds: 1, updates: 2, removes: 1 });
    }
}
