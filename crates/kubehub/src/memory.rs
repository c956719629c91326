//! In-process remote: optimistic concurrency, server-side defaults, optional
//! immutable fields and injectable faults.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use kapply_core::{Document, FieldPath, Fingerprint, Identity, LiveObject, Patch, PatchOp, RemoteError, TypeCategory};
use serde_json::Value as Json;
use tracing::debug;

use crate::Remote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Patch,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calls {
    pub gets: usize,
    pub creates: usize,
    pub patches: usize,
    pub deletes: usize,
}

type Key = (Identity, String, String);

struct Stored {
    doc: Json,
    rv: u64,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Stored>,
    next_rv: u64,
    defaults: Vec<(String, FieldPath, Json)>,
    immutable: Vec<(String, FieldPath)>,
    cluster_scoped: Vec<(String, String)>,
    faults: VecDeque<(Op, RemoteError)>,
    calls: Calls,
}

impl Inner {
    fn namespaced(&self, ty: &TypeCategory) -> bool {
        ty.builtin_namespaced() && !self.cluster_scoped.iter().any(|(g, k)| *g == ty.group && *k == ty.kind)
    }

    /// Cluster-scoped objects are stored without a namespace, whatever the caller passes.
    fn key(&self, identity: &Identity, ty: &TypeCategory) -> Key {
        let identity = if self.namespaced(ty) { identity.clone() } else { Identity::cluster(identity.name.clone()) };
        (identity, ty.group.clone(), ty.kind.clone())
    }

    fn bump(&mut self) -> u64 {
        self.next_rv += 1;
        self.next_rv
    }

    fn take_fault(&mut self, op: Op) -> Option<RemoteError> {
        let idx = self.faults.iter().position(|(o, _)| *o == op)?;
        self.faults.remove(idx).map(|(_, e)| e)
    }

    fn apply_defaults(&self, kind: &str, doc: &mut Json) {
        let mut fill = Patch::new();
        for (k, path, value) in self.defaults.iter() {
            if k == kind && path.lookup(doc).is_none() {
                fill.push(PatchOp::Set { path: path.clone(), value: value.clone() });
            }
        }
        fill.apply_to(doc);
    }
}

fn stamp(doc: &mut Json, rv: u64) {
    Patch { ops: vec![PatchOp::Set { path: FieldPath::parse("metadata.resourceVersion"), value: Json::String(rv.to_string()) }] }
        .apply_to(doc);
}

/// Objects held in memory. Every write bumps a store-wide version counter,
/// used as the fingerprint.
#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self { Self::default() }

    /// Delay every call, so concurrent callers overlap.
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency: Some(latency), ..Self::default() }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Value the store fills in for `kind` when a write leaves `path` unset.
    pub fn default_field(&self, kind: &str, path: &str, value: Json) {
        self.lock().defaults.push((kind.to_string(), FieldPath::parse(path), value));
    }

    /// Reject patches that change `path` on objects of `kind`.
    pub fn immutable_field(&self, kind: &str, path: &str) {
        self.lock().immutable.push((kind.to_string(), FieldPath::parse(path)));
    }

    /// Treat `group`/`kind` as cluster-scoped, on top of the built-in table.
    pub fn cluster_scoped(&self, group: &str, kind: &str) {
        self.lock().cluster_scoped.push((group.to_string(), kind.to_string()));
    }

    /// Fail the next call of `op` with `err`. Faults queue per operation.
    /// An injected `Conflict` also bumps the target's version, as a concurrent
    /// writer would.
    pub fn fail_next(&self, op: Op, err: RemoteError) {
        self.lock().faults.push_back((op, err));
    }

    /// Store an object as-is, bypassing defaults, like another actor would.
    pub fn seed(&self, identity: &Identity, ty: &TypeCategory, mut doc: Document) -> Fingerprint {
        let mut inner = self.lock();
        let rv = inner.bump();
        stamp(&mut doc, rv);
        let k = inner.key(identity, ty);
        inner.objects.insert(k, Stored { doc, rv });
        Fingerprint(rv.to_string())
    }

    /// Modify a stored object out-of-band.
    pub fn mutate(&self, identity: &Identity, ty: &TypeCategory, f: impl FnOnce(&mut Json)) -> bool {
        let mut inner = self.lock();
        let rv = inner.bump();
        let k = inner.key(identity, ty);
        match inner.objects.get_mut(&k) {
            Some(stored) => {
                f(&mut stored.doc);
                stored.rv = rv;
                stamp(&mut stored.doc, rv);
                true
            }
            None => false,
        }
    }

    /// Current stored document.
    pub fn object(&self, identity: &Identity, ty: &TypeCategory) -> Option<Json> {
        let inner = self.lock();
        inner.objects.get(&inner.key(identity, ty)).map(|s| s.doc.clone())
    }

    /// Every stored identity with its kind, in order.
    pub fn list(&self) -> Vec<(Identity, String)> {
        self.lock().objects.keys().map(|(id, _, kind)| (id.clone(), kind.clone())).collect()
    }

    pub fn calls(&self) -> Calls { self.lock().calls }

    /// Most calls ever in flight at once.
    pub fn high_water(&self) -> usize { self.high_water.load(Ordering::SeqCst) }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
        InFlight(&self.in_flight)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Remote for MemoryRemote {
    async fn is_namespaced(&self, ty: &TypeCategory) -> bool {
        self.lock().namespaced(ty)
    }

    async fn get(&self, identity: &Identity, ty: &TypeCategory) -> Result<Option<LiveObject>, RemoteError> {
        let _guard = self.enter().await;
        let mut inner = self.lock();
        inner.calls.gets += 1;
        if let Some(err) = inner.take_fault(Op::Get) {
            return Err(err);
        }
        let k = inner.key(identity, ty);
        Ok(inner
            .objects
            .get(&k)
            .map(|s| LiveObject { doc: s.doc.clone(), fingerprint: Fingerprint(s.rv.to_string()) }))
    }

    async fn create(&self, identity: &Identity, ty: &TypeCategory, doc: &Document) -> Result<Fingerprint, RemoteError> {
        let _guard = self.enter().await;
        let mut inner = self.lock();
        inner.calls.creates += 1;
        if let Some(err) = inner.take_fault(Op::Create) {
            return Err(err);
        }
        let k = inner.key(identity, ty);
        if inner.objects.contains_key(&k) {
            return Err(RemoteError::AlreadyExists);
        }
        let mut doc = doc.clone();
        inner.apply_defaults(&ty.kind, &mut doc);
        let rv = inner.bump();
        stamp(&mut doc, rv);
        inner.objects.insert(k, Stored { doc, rv });
        debug!(identity = %identity, kind = %ty, rv, "memory create");
        Ok(Fingerprint(rv.to_string()))
    }

    async fn patch(
        &self,
        identity: &Identity,
        ty: &TypeCategory,
        patch: &Patch,
        precondition: &Fingerprint,
    ) -> Result<Fingerprint, RemoteError> {
        let _guard = self.enter().await;
        let mut inner = self.lock();
        inner.calls.patches += 1;
        let k = inner.key(identity, ty);
        if let Some(err) = inner.take_fault(Op::Patch) {
            if err == RemoteError::Conflict {
                let rv = inner.bump();
                if let Some(stored) = inner.objects.get_mut(&k) {
                    stored.rv = rv;
                    stamp(&mut stored.doc, rv);
                }
            }
            return Err(err);
        }
        let current = match inner.objects.get(&k) {
            Some(s) => s,
            None => return Err(RemoteError::NotFound),
        };
        if current.rv.to_string() != precondition.0 {
            return Err(RemoteError::Conflict);
        }
        let mut next = current.doc.clone();
        patch.apply_to(&mut next);
        inner.apply_defaults(&ty.kind, &mut next);
        for (kind, path) in inner.immutable.iter() {
            if kind == &ty.kind && path.lookup(&current.doc).is_some() && path.lookup(&current.doc) != path.lookup(&next) {
                return Err(RemoteError::Rejected(format!("{}: field is immutable", path)));
            }
        }
        let rv = inner.bump();
        stamp(&mut next, rv);
        inner.objects.insert(k, Stored { doc: next, rv });
        debug!(identity = %identity, kind = %ty, rv, ops = patch.len(), "memory patch");
        Ok(Fingerprint(rv.to_string()))
    }

    async fn delete(&self, identity: &Identity, ty: &TypeCategory) -> Result<bool, RemoteError> {
        let _guard = self.enter().await;
        let mut inner = self.lock();
        inner.calls.deletes += 1;
        if let Some(err) = inner.take_fault(Op::Delete) {
            return Err(err);
        }
        let k = inner.key(identity, ty);
        Ok(inner.objects.remove(&k).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn svc() -> TypeCategory { TypeCategory::from_api_version("v1", "Service") }

    #[tokio::test]
    async fn stale_precondition_conflicts() {
        let r = MemoryRemote::new();
        let id = Identity::new("ns", "a");
        let fp = r.create(&id, &svc(), &json!({"metadata": {"name": "a"}})).await.unwrap();
        r.mutate(&id, &svc(), |d| d["spec"] = json!({"x": 1}));
        let mut p = Patch::new();
        p.set(FieldPath::parse("spec.y"), json!(2));
        assert_eq!(r.patch(&id, &svc(), &p, &fp).await, Err(RemoteError::Conflict));
        let live = r.get(&id, &svc()).await.unwrap().unwrap();
        r.patch(&id, &svc(), &p, &live.fingerprint).await.unwrap();
        assert_eq!(r.object(&id, &svc()).unwrap()["spec"], json!({"x": 1, "y": 2}));
    }

    #[tokio::test]
    async fn defaults_fill_cleared_fields() {
        let r = MemoryRemote::new();
        r.default_field("Service", "spec.type", json!("ClusterIP"));
        let id = Identity::new("ns", "a");
        let fp = r.create(&id, &svc(), &json!({"spec": {"type": "NodePort"}})).await.unwrap();
        let mut p = Patch::new();
        p.delete(FieldPath::parse("spec.type"));
        r.patch(&id, &svc(), &p, &fp).await.unwrap();
        assert_eq!(r.object(&id, &svc()).unwrap()["spec"]["type"], "ClusterIP");
    }

    #[tokio::test]
    async fn immutable_fields_reject_changes() {
        let r = MemoryRemote::new();
        r.immutable_field("Service", "spec.clusterIP");
        let id = Identity::new("ns", "a");
        let fp = r.create(&id, &svc(), &json!({"spec": {"clusterIP": "10.0.0.99"}})).await.unwrap();
        let mut p = Patch::new();
        p.set(FieldPath::parse("spec.clusterIP"), json!("10.0.0.100"));
        assert!(matches!(r.patch(&id, &svc(), &p, &fp).await, Err(RemoteError::Rejected(_))));
    }

    #[tokio::test]
    async fn cluster_scoped_objects_ignore_namespace() {
        let r = MemoryRemote::new();
        let ns = TypeCategory::from_api_version("v1", "Namespace");
        r.create(&Identity::new("dev", "team-a"), &ns, &json!({})).await.unwrap();
        assert!(r.get(&Identity::new("staging", "team-a"), &ns).await.unwrap().is_some());
        assert!(r.object(&Identity::cluster("team-a"), &ns).is_some());
        assert!(!r.is_namespaced(&ns).await);

        let widget = TypeCategory::from_api_version("example.com/v1", "Widget");
        assert!(r.is_namespaced(&widget).await);
        r.cluster_scoped("example.com", "Widget");
        assert!(!r.is_namespaced(&widget).await);
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let r = MemoryRemote::new();
        let id = Identity::new("ns", "a");
        r.fail_next(Op::Create, RemoteError::Unavailable("boom".into()));
        assert!(r.create(&id, &svc(), &json!({})).await.is_err());
        assert!(r.create(&id, &svc(), &json!({})).await.is_ok());
        assert_eq!(r.create(&id, &svc(), &json!({})).await, Err(RemoteError::AlreadyExists));
        assert_eq!(r.calls().creates, 3);
        assert!(r.delete(&id, &svc()).await.unwrap());
        assert!(!r.delete(&id, &svc()).await.unwrap());
    }
}
