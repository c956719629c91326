//! Garbage collection of identities the previous run applied and this run no
//! longer desires.

use std::collections::BTreeSet;

use futures::stream::{self, StreamExt};
use kapply_core::{Identity, ManagedSet, ObjectError, Outcome, TypeCategory};
use kapply_kubehub::Remote;
use metrics::counter;
use tracing::{info, warn};

/// Entries of `previous` absent from `desired`, keeping their recorded category.
pub fn orphans(previous: &ManagedSet, desired: &BTreeSet<Identity>) -> ManagedSet {
    previous.iter().filter(|(id, _)| !desired.contains(*id)).map(|(id, ty)| (id.clone(), ty.clone())).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Collected {
    pub identity: Identity,
    pub type_category: TypeCategory,
    pub outcome: Outcome,
}

/// Delete every orphan, at most `concurrency` at a time. One attempt each;
/// an orphan that is already gone counts as deleted.
pub async fn collect(remote: &dyn Remote, orphans: &ManagedSet, concurrency: usize) -> Vec<Collected> {
    stream::iter(orphans.iter())
        .map(|(id, ty)| async move {
            let outcome = match remote.delete(id, ty).await {
                Ok(existed) => {
                    info!(identity = %id, kind = %ty, existed, "orphan deleted");
                    counter!("gc_deleted_total", 1u64);
                    Outcome::Deleted
                }
                Err(e) => {
                    warn!(identity = %id, kind = %ty, error = %e, "orphan deletion failed");
                    Outcome::Failed(ObjectError::from(e))
                }
            };
            Collected { identity: id.clone(), type_category: ty.clone(), outcome }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

/// Orphans to keep tracking: those whose deletion failed.
pub fn still_managed(results: &[Collected]) -> ManagedSet {
    results
        .iter()
        .filter(|c| c.outcome.is_failed())
        .map(|c| (c.identity.clone(), c.type_category.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kapply_core::RemoteError;
    use kapply_kubehub::memory::{MemoryRemote, Op};
    use serde_json::json;

    fn cm() -> TypeCategory { TypeCategory::from_api_version("v1", "ConfigMap") }

    #[test]
    fn orphans_are_previous_minus_desired() {
        let previous: ManagedSet = vec![
            (Identity::new("ns", "a"), cm()),
            (Identity::new("ns", "b"), TypeCategory::from_api_version("v1", "Service")),
        ]
        .into_iter()
        .collect();
        let desired: BTreeSet<Identity> = [Identity::new("ns", "a")].into_iter().collect();
        let o = orphans(&previous, &desired);
        assert_eq!(o.len(), 1);
        assert_eq!(o.get(&Identity::new("ns", "b")).unwrap().kind, "Service");
    }

    #[tokio::test]
    async fn failed_deletions_stay_managed() {
        let remote = MemoryRemote::new();
        let a = Identity::new("ns", "a");
        let b = Identity::new("ns", "b");
        remote.seed(&a, &cm(), json!({"metadata": {"name": "a"}}));
        remote.fail_next(Op::Delete, RemoteError::Unavailable("down".into()));
        let set: ManagedSet = vec![(a.clone(), cm()), (b.clone(), cm())].into_iter().collect();
        let results = collect(&remote, &set, 1).await;
        assert_eq!(results.len(), 2);
        let kept = still_managed(&results);
        assert_eq!(kept.len(), 1);
        // Deletion order follows the set, so the fault lands on `a`.
        assert!(kept.contains(&a));
        assert!(remote.object(&a, &cm()).is_some());
    }
}
