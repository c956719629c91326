//! Apply orchestration: one state machine per identity, run on a bounded pool,
//! followed by garbage collection of identities no longer desired.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use kapply_core::{
    resolve, DesiredObject, Document, FieldPath, Fingerprint, Identity, LiveObject, ManagedSet, ObjectError, Outcome,
    Patch, RemoteError, ResolveError, TypeCategory,
};
use kapply_kubehub::Remote;
use kapply_persist::ManagedSetStore;
use kapply_schema::PolicyRegistry;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ImmutablePolicy, ReconcileConfig};
use crate::merge::{immutable_violation, strip_nulls, Merger};
use crate::{diff_summary, last_applied, DiffSummary};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("managed set store: {0:#}")]
    Store(anyhow::Error),
}

/// Which phase produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Apply,
    GarbageCollect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReport {
    pub type_category: TypeCategory,
    pub outcome: Outcome,
    /// Fetch/write cycles spent; 1 for a clean run.
    pub attempts: u32,
    pub stage: Stage,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub outcomes: BTreeMap<Identity, ObjectReport>,
    /// Every desired identity ended in a non-failed outcome and the managed set was saved.
    pub aggregate_succeeded: bool,
    pub cancelled: bool,
    pub gc_ran: bool,
    pub store_error: Option<String>,
}

impl RunResult {
    pub fn report(&self, identity: &Identity) -> Option<&ObjectReport> {
        self.outcomes.get(identity)
    }

    pub fn outcome(&self, identity: &Identity) -> Option<&Outcome> {
        self.outcomes.get(identity).map(|r| &r.outcome)
    }

    /// Number of reports per outcome label.
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut out = BTreeMap::new();
        for r in self.outcomes.values() {
            *out.entry(r.outcome.label()).or_insert(0) += 1;
        }
        out
    }
}

/// What a dry run expects to do for one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PlannedAction {
    Create,
    Patch { patch: Patch, summary: DiffSummary },
    Replace { from: TypeCategory },
    Unchanged,
    Delete,
    Error { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedChange {
    pub identity: Identity,
    pub type_category: TypeCategory,
    pub action: PlannedAction,
}

pub struct Reconciler {
    remote: Arc<dyn Remote>,
    store: Arc<dyn ManagedSetStore>,
    policies: Arc<PolicyRegistry>,
    config: ReconcileConfig,
}

/// Patch that moves `live` to `desired`, including the baseline update.
fn desired_patch(policies: &PolicyRegistry, obj: &DesiredObject, live: &LiveObject) -> Patch {
    let baseline = last_applied::load(&live.doc);
    let stripped = last_applied::strip(&live.doc);
    let mut patch = Merger::new(policies, &obj.type_category).diff(baseline.as_ref(), &obj.doc, &stripped);
    last_applied::record(&mut patch, &live.doc, &obj.doc);
    patch
}

enum Step {
    /// Delete the object under the category recorded by the previous run.
    Replace(TypeCategory),
    Fetch,
    Create,
    Diff(LiveObject),
    Write { patch: Patch, fingerprint: Fingerprint },
    Retry(RemoteError),
    Done(Outcome),
}

impl Step {
    fn phase(&self) -> &'static str {
        match self {
            Step::Replace(_) => "replacing",
            Step::Fetch => "fetching",
            Step::Create => "creating",
            Step::Diff(_) => "diffing",
            Step::Write { .. } => "writing",
            Step::Retry(_) => "retrying",
            Step::Done(_) => "done",
        }
    }
}

struct Applied {
    identity: Identity,
    report: ObjectReport,
    /// Category to record in the managed set.
    record: TypeCategory,
}

struct Worker {
    remote: Arc<dyn Remote>,
    policies: Arc<PolicyRegistry>,
    config: ReconcileConfig,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(&self, obj: DesiredObject) -> Applied {
        let id = &obj.identity;
        let ty = &obj.type_category;
        let max = self.config.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut pending_old = obj.previous_type.clone();
        let mut replaced = false;
        let mut step = match pending_old.clone() {
            Some(old) => Step::Replace(old),
            None => Step::Fetch,
        };
        let outcome = loop {
            debug!(identity = %id, kind = %ty, attempt = attempts, phase = step.phase(), "step");
            step = match step {
                Step::Done(outcome) => break outcome,
                Step::Replace(old) => {
                    attempts += 1;
                    match self.remote.delete(id, &old).await {
                        Ok(existed) => {
                            info!(identity = %id, from = %old, to = %ty, existed, "deleted object of previous type");
                            pending_old = None;
                            replaced = true;
                            Step::Fetch
                        }
                        Err(e) if e.is_retryable() => Step::Retry(e),
                        Err(e) => Step::Done(Outcome::Failed(e.into())),
                    }
                }
                Step::Fetch => {
                    attempts += 1;
                    match self.remote.get(id, ty).await {
                        Ok(Some(live)) => Step::Diff(live),
                        Ok(None) => Step::Create,
                        Err(e) if e.is_retryable() => Step::Retry(e),
                        Err(e) => Step::Done(Outcome::Failed(e.into())),
                    }
                }
                Step::Create => {
                    let mut doc: Document = strip_nulls(&obj.doc);
                    last_applied::embed(&mut doc, &obj.doc);
                    match self.remote.create(id, ty, &doc).await {
                        Ok(_) => Step::Done(if replaced { Outcome::Replaced } else { Outcome::Created }),
                        // Someone else created it between fetch and create; AlreadyExists retries.
                        Err(e) if e.is_retryable() => Step::Retry(e),
                        Err(e) => Step::Done(Outcome::Failed(e.into())),
                    }
                }
                Step::Diff(live) => {
                    let patch = desired_patch(&self.policies, &obj, &live);
                    if patch.is_noop_against(&live.doc) {
                        Step::Done(if replaced { Outcome::Replaced } else { Outcome::Unchanged })
                    } else if let Some(path) = self.rejected_immutable(ty, &patch, &live) {
                        Step::Done(Outcome::Failed(ObjectError::ImmutableField { path: path.to_string() }))
                    } else {
                        Step::Write { patch, fingerprint: live.fingerprint }
                    }
                }
                Step::Write { patch, fingerprint } => match self.remote.patch(id, ty, &patch, &fingerprint).await {
                    Ok(_) => Step::Done(if replaced { Outcome::Replaced } else { Outcome::Patched }),
                    Err(RemoteError::Conflict) => {
                        counter!("reconcile_conflict_retries_total", 1u64);
                        Step::Retry(RemoteError::Conflict)
                    }
                    // Deleted under us; the next fetch recreates it.
                    Err(RemoteError::NotFound) => Step::Retry(RemoteError::NotFound),
                    Err(e) if e.is_retryable() => Step::Retry(e),
                    Err(e) => Step::Done(Outcome::Failed(e.into())),
                },
                Step::Retry(err) => {
                    if attempts >= max {
                        warn!(identity = %id, kind = %ty, attempts, error = %err, "retry budget exhausted");
                        Step::Done(Outcome::Failed(match err {
                            RemoteError::Unavailable(m) => ObjectError::RemoteUnavailable(m),
                            _ => ObjectError::ConflictBudgetExhausted { attempts },
                        }))
                    } else {
                        let delay = self.config.backoff(attempts);
                        debug!(identity = %id, attempt = attempts, delay_ms = delay.as_millis() as u64, error = %err, "backing off");
                        tokio::select! {
                            _ = self.cancel.cancelled() => Step::Done(Outcome::Failed(ObjectError::Cancelled)),
                            _ = tokio::time::sleep(delay) => match pending_old.clone() {
                                Some(old) => Step::Replace(old),
                                None => Step::Fetch,
                            },
                        }
                    }
                }
            };
        };
        match &outcome {
            Outcome::Failed(e) => warn!(identity = %id, kind = %ty, attempts, error = %e, "apply failed"),
            o => info!(identity = %id, kind = %ty, attempts, outcome = o.label(), "applied"),
        }
        Applied {
            identity: id.clone(),
            record: pending_old.unwrap_or_else(|| ty.clone()),
            report: ObjectReport { type_category: ty.clone(), outcome, attempts, stage: Stage::Apply },
        }
    }

    fn rejected_immutable(&self, ty: &TypeCategory, patch: &Patch, live: &LiveObject) -> Option<FieldPath> {
        if self.config.immutable_policy != ImmutablePolicy::RejectEarly {
            return None;
        }
        immutable_violation(self.policies.immutable_paths(ty), patch, &live.doc)
    }
}

impl Reconciler {
    pub fn new(
        remote: Arc<dyn Remote>,
        store: Arc<dyn ManagedSetStore>,
        policies: Arc<PolicyRegistry>,
        config: ReconcileConfig,
    ) -> Self {
        Self { remote, store, policies, config }
    }

    pub fn config(&self) -> &ReconcileConfig { &self.config }

    fn load_previous(&self) -> Result<ManagedSet, ReconcileError> {
        self.store.load().map_err(ReconcileError::Store)
    }

    /// Resolve identities, asking the remote once per kind whether it is namespaced.
    async fn resolve_desired(
        &self,
        docs: Vec<Document>,
        default_namespace: &str,
        previous: &ManagedSet,
    ) -> Result<Vec<DesiredObject>, ReconcileError> {
        let kinds: BTreeSet<TypeCategory> = docs.iter().filter_map(TypeCategory::of).collect();
        let mut cluster_scoped = BTreeSet::new();
        for ty in kinds {
            if !self.remote.is_namespaced(&ty).await {
                cluster_scoped.insert(ty);
            }
        }
        Ok(resolve(docs, default_namespace, previous, |ty| !cluster_scoped.contains(ty))?)
    }

    fn save(&self, set: &ManagedSet, store_error: &mut Option<String>) -> bool {
        match self.store.save(set) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %format!("{:#}", e), "saving managed set failed");
                *store_error = Some(format!("{:#}", e));
                false
            }
        }
    }

    /// Converge the remote on `docs` and collect identities the previous run
    /// applied that `docs` no longer contain.
    ///
    /// Fails up front, before any write, when identities cannot be resolved
    /// or the managed set cannot be loaded. Per-identity failures are reported
    /// in the result.
    pub async fn reconcile(
        &self,
        docs: Vec<Document>,
        default_namespace: &str,
        cancel: CancellationToken,
    ) -> Result<RunResult, ReconcileError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("reconcile", run_id = %run_id);
        self.reconcile_inner(run_id, docs, default_namespace, cancel).instrument(span).await
    }

    async fn reconcile_inner(
        &self,
        run_id: String,
        docs: Vec<Document>,
        default_namespace: &str,
        cancel: CancellationToken,
    ) -> Result<RunResult, ReconcileError> {
        let started = Instant::now();
        counter!("reconcile_runs_total", 1u64);
        let previous = self.load_previous()?;
        let desired = self.resolve_desired(docs, default_namespace, &previous).await?;
        info!(desired = desired.len(), previous = previous.len(), "reconcile started");

        let desired_ids: BTreeSet<Identity> = desired.iter().map(|d| d.identity.clone()).collect();
        let expected: Vec<(Identity, TypeCategory)> =
            desired.iter().map(|d| (d.identity.clone(), d.type_category.clone())).collect();

        let applied = self.apply_phase(desired, &cancel).await;
        let mut outcomes: BTreeMap<Identity, ObjectReport> = BTreeMap::new();
        let mut records = ManagedSet::new();
        let mut settled = ManagedSet::new();
        for a in applied {
            if !a.report.outcome.is_failed() {
                settled.insert(a.identity.clone(), a.record.clone());
                records.insert(a.identity.clone(), a.record);
            } else if previous.contains(&a.identity) {
                // Failed identities stay tracked only if an earlier run put them there.
                records.insert(a.identity.clone(), a.record);
            }
            outcomes.insert(a.identity, a.report);
        }
        for (id, ty) in expected {
            if outcomes.contains_key(&id) {
                continue;
            }
            // Never started, or its task died without reporting.
            let outcome = if cancel.is_cancelled() {
                Outcome::Failed(ObjectError::Cancelled)
            } else {
                Outcome::Failed(ObjectError::Remote("apply task aborted".into()))
            };
            outcomes.insert(id, ObjectReport { type_category: ty, outcome, attempts: 0, stage: Stage::Apply });
        }
        let apply_ok = outcomes.values().all(|r| !r.outcome.is_failed());

        let cancelled = cancel.is_cancelled();
        let mut store_error = None;
        let mut gc_ran = false;
        if cancelled {
            // Keep everything we knew about plus what this run put in place.
            warn!("run cancelled; skipping garbage collection");
            self.save(&settled.union(&previous), &mut store_error);
        } else {
            let orphans = crate::gc::orphans(&previous, &desired_ids);
            let persisted = self.save(&records.union(&orphans), &mut store_error);
            if !self.config.gc {
                info!(orphans = orphans.len(), "garbage collection disabled");
            } else if !persisted {
                warn!(orphans = orphans.len(), "managed set not persisted; skipping garbage collection");
            } else if !orphans.is_empty() {
                gc_ran = true;
                let collected = crate::gc::collect(self.remote.as_ref(), &orphans, self.config.concurrency).await;
                let still = crate::gc::still_managed(&collected);
                for c in collected {
                    outcomes.insert(
                        c.identity,
                        ObjectReport { type_category: c.type_category, outcome: c.outcome, attempts: 1, stage: Stage::GarbageCollect },
                    );
                }
                self.save(&records.union(&still), &mut store_error);
            } else {
                gc_ran = true;
            }
        }

        for r in outcomes.values() {
            counter!("reconcile_objects_total", 1u64, "outcome" => r.outcome.label());
        }
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        let aggregate_succeeded = apply_ok && store_error.is_none();
        info!(aggregate_succeeded, cancelled, gc_ran, objects = outcomes.len(), "reconcile finished");
        Ok(RunResult { run_id, outcomes, aggregate_succeeded, cancelled, gc_ran, store_error })
    }

    async fn apply_phase(&self, desired: Vec<DesiredObject>, cancel: &CancellationToken) -> Vec<Applied> {
        let worker = Arc::new(Worker {
            remote: self.remote.clone(),
            policies: self.policies.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
        });
        let sem = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for obj in desired {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                p = sem.clone().acquire_owned() => p.ok(),
            };
            let Some(permit) = permit else {
                debug!("cancelled; no new identities start");
                break;
            };
            let worker = worker.clone();
            tasks.spawn(
                async move {
                    let _permit = permit;
                    let identity = obj.identity.clone();
                    let ty = obj.type_category.clone();
                    let record = obj.previous_type.clone().unwrap_or_else(|| ty.clone());
                    match AssertUnwindSafe(worker.run(obj)).catch_unwind().await {
                        Ok(applied) => applied,
                        Err(_) => {
                            error!(identity = %identity, "apply worker panicked");
                            Applied {
                                identity,
                                record,
                                report: ObjectReport {
                                    type_category: ty,
                                    outcome: Outcome::Failed(ObjectError::Remote("apply worker panicked".into())),
                                    attempts: 0,
                                    stage: Stage::Apply,
                                },
                            }
                        }
                    }
                }
                .in_current_span(),
            );
        }
        let mut out = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(applied) => out.push(applied),
                Err(e) => warn!(error = %e, "apply task did not complete"),
            }
        }
        out
    }

    /// Dry run: what `reconcile` would do, without writing anything.
    pub async fn plan(&self, docs: Vec<Document>, default_namespace: &str) -> Result<Vec<PlannedChange>, ReconcileError> {
        let previous = self.load_previous()?;
        let desired = self.resolve_desired(docs, default_namespace, &previous).await?;
        let desired_ids: BTreeSet<Identity> = desired.iter().map(|d| d.identity.clone()).collect();
        let mut changes: Vec<PlannedChange> = stream::iter(desired.iter())
            .map(|obj| self.plan_one(obj))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;
        for (id, ty) in crate::gc::orphans(&previous, &desired_ids).iter() {
            changes.push(PlannedChange { identity: id.clone(), type_category: ty.clone(), action: PlannedAction::Delete });
        }
        Ok(changes)
    }

    async fn plan_one(&self, obj: &DesiredObject) -> PlannedChange {
        let action = if let Some(from) = obj.previous_type.clone() {
            PlannedAction::Replace { from }
        } else {
            match self.remote.get(&obj.identity, &obj.type_category).await {
                Ok(None) => PlannedAction::Create,
                Ok(Some(live)) => {
                    let patch = desired_patch(&self.policies, obj, &live);
                    if patch.is_noop_against(&live.doc) {
                        PlannedAction::Unchanged
                    } else {
                        let summary = diff_summary(&patch, &live.doc);
                        PlannedAction::Patch { patch, summary }
                    }
                }
                Err(e) => PlannedAction::Error { reason: e.to_string() },
            }
        };
        PlannedChange { identity: obj.identity.clone(), type_category: obj.type_category.clone(), action }
    }

    /// Delete every identity in `docs` and stop tracking it. An identity the
    /// managed set records under another category is deleted under both; the
    /// record stays, pointing at whichever object could not be deleted.
    pub async fn delete_all(&self, docs: Vec<Document>, default_namespace: &str) -> Result<RunResult, ReconcileError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("delete", run_id = %run_id);
        self.delete_inner(run_id, docs, default_namespace).instrument(span).await
    }

    async fn delete_inner(
        &self,
        run_id: String,
        docs: Vec<Document>,
        default_namespace: &str,
    ) -> Result<RunResult, ReconcileError> {
        let mut managed = self.load_previous()?;
        let desired = self.resolve_desired(docs, default_namespace, &managed).await?;
        let remote = self.remote.as_ref();
        let results: Vec<(Identity, TypeCategory, Outcome, Option<TypeCategory>)> = stream::iter(desired)
            .map(|obj| async move {
                let mut remaining = None;
                let mut outcome = match remote.delete(&obj.identity, &obj.type_category).await {
                    Ok(true) => Outcome::Deleted,
                    Ok(false) => Outcome::Unchanged,
                    Err(e) => {
                        remaining = Some(obj.type_category.clone());
                        Outcome::Failed(e.into())
                    }
                };
                if let Some(old) = obj.previous_type {
                    match remote.delete(&obj.identity, &old).await {
                        Ok(true) if !outcome.is_failed() => outcome = Outcome::Deleted,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(identity = %obj.identity, kind = %old, error = %e, "deleting object of recorded type failed");
                            remaining = Some(old);
                            outcome = Outcome::Failed(e.into());
                        }
                    }
                }
                (obj.identity, obj.type_category, outcome, remaining)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        let mut outcomes = BTreeMap::new();
        for (id, ty, outcome, remaining) in results {
            match remaining {
                Some(left) if managed.contains(&id) => managed.insert(id.clone(), left),
                Some(_) => {}
                None => {
                    managed.remove(&id);
                }
            }
            counter!("reconcile_objects_total", 1u64, "outcome" => outcome.label());
            info!(identity = %id, kind = %ty, outcome = outcome.label(), "delete");
            outcomes.insert(id, ObjectReport { type_category: ty, outcome, attempts: 1, stage: Stage::Apply });
        }
        let mut store_error = None;
        self.save(&managed, &mut store_error);
        let aggregate_succeeded = store_error.is_none() && outcomes.values().all(|r| !r.outcome.is_failed());
        Ok(RunResult { run_id, outcomes, aggregate_succeeded, cancelled: false, gc_ran: false, store_error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kapply_kubehub::memory::{MemoryRemote, Op};
    use kapply_persist::MemoryStore;
    use serde_json::json;

    fn reconciler(remote: Arc<MemoryRemote>, store: Arc<MemoryStore>) -> Reconciler {
        let config = ReconcileConfig { backoff_base: std::time::Duration::from_millis(1), ..ReconcileConfig::default() };
        Reconciler::new(remote, store, Arc::new(PolicyRegistry::builtin()), config)
    }

    fn cm(name: &str) -> Document {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}, "data": {"k": "v"}})
    }

    #[tokio::test]
    async fn not_found_on_write_recreates() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MemoryStore::new());
        let r = reconciler(remote.clone(), store);
        let id = Identity::new("ns", "a");
        let ty = TypeCategory::from_api_version("v1", "ConfigMap");
        remote.seed(&id, &ty, json!({"metadata": {"name": "a"}, "data": {"k": "old"}}));
        remote.fail_next(Op::Patch, RemoteError::NotFound);
        let res = r.reconcile(vec![cm("a")], "ns", CancellationToken::new()).await.unwrap();
        // The injected NotFound leaves the object in place, so the retry patches it.
        assert_eq!(res.outcome(&id), Some(&Outcome::Patched));
        assert_eq!(res.report(&id).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn unavailable_exhausts_into_remote_unavailable() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MemoryStore::new());
        let r = reconciler(remote.clone(), store);
        for _ in 0..4 {
            remote.fail_next(Op::Get, RemoteError::Unavailable("down".into()));
        }
        let res = r.reconcile(vec![cm("a")], "ns", CancellationToken::new()).await.unwrap();
        assert!(matches!(
            res.outcome(&Identity::new("ns", "a")),
            Some(Outcome::Failed(ObjectError::RemoteUnavailable(_)))
        ));
        assert!(!res.aggregate_succeeded);
    }

    #[tokio::test]
    async fn plan_reports_without_writing() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MemoryStore::new());
        let r = reconciler(remote.clone(), store.clone());
        r.reconcile(vec![cm("a"), cm("b")], "ns", CancellationToken::new()).await.unwrap();
        let mut changed = cm("a");
        changed["data"]["k"] = json!("w");
        let plan = r.plan(vec![changed, cm("c")], "ns").await.unwrap();
        let by_name: BTreeMap<String, &PlannedAction> = plan.iter().map(|c| (c.identity.name.clone(), &c.action)).collect();
        assert!(matches!(by_name["a"], PlannedAction::Patch { summary, .. } if summary.updates == 2));
        assert_eq!(by_name["c"], &PlannedAction::Create);
        assert_eq!(by_name["b"], &PlannedAction::Delete);
        assert_eq!(remote.calls().patches, 0);
        assert_eq!(store.saves(), 1);
    }

    #[tokio::test]
    async fn delete_all_removes_the_recorded_type_too() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MemoryStore::new());
        let r = reconciler(remote.clone(), store.clone());
        let id = Identity::new("ns", "thing");
        let svc_ty = TypeCategory::from_api_version("v1", "Service");
        let svc = json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "thing"}, "spec": {"ports": [{"port": 80}]}});
        r.reconcile(vec![svc], "ns", CancellationToken::new()).await.unwrap();

        remote.fail_next(Op::Delete, RemoteError::Unavailable("apiserver restarting".into()));
        remote.fail_next(Op::Delete, RemoteError::Unavailable("apiserver restarting".into()));
        let res = r.delete_all(vec![cm("thing")], "ns").await.unwrap();
        assert!(!res.aggregate_succeeded);
        assert!(remote.object(&id, &svc_ty).is_some());
        assert_eq!(store.load().unwrap().get(&id), Some(&svc_ty));

        let res = r.delete_all(vec![cm("thing")], "ns").await.unwrap();
        assert!(res.aggregate_succeeded);
        assert_eq!(res.outcome(&id), Some(&Outcome::Deleted));
        assert!(remote.object(&id, &svc_ty).is_none());
        assert!(!store.load().unwrap().contains(&id));
    }

    #[tokio::test]
    async fn delete_all_forgets_deleted_identities() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MemoryStore::new());
        let r = reconciler(remote.clone(), store.clone());
        r.reconcile(vec![cm("a"), cm("b")], "ns", CancellationToken::new()).await.unwrap();
        let res = r.delete_all(vec![cm("a"), cm("gone")], "ns").await.unwrap();
        assert!(res.aggregate_succeeded);
        assert_eq!(res.outcome(&Identity::new("ns", "a")), Some(&Outcome::Deleted));
        assert_eq!(res.outcome(&Identity::new("ns", "gone")), Some(&Outcome::Unchanged));
        let managed = store.load().unwrap();
        assert_eq!(managed.len(), 1);
        assert!(managed.contains(&Identity::new("ns", "b")));
    }
}
