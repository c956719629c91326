//! kapply kubehub: the remote control-plane seam.
//!
//! The reconciler only sees [`Remote`]: a fallible key-value store with
//! optimistic concurrency. [`KubeRemote`] talks to a cluster through kube-rs;
//! [`MemoryRemote`] keeps objects in process for tests and offline planning.

#![forbid(unsafe_code)]

use kapply_core::{Document, Fingerprint, Identity, LiveObject, Patch, RemoteError, TypeCategory};

mod kube_remote;
pub mod memory;

pub use kube_remote::{map_kube_error, KubeRemote};
pub use memory::MemoryRemote;

#[async_trait::async_trait]
pub trait Remote: Send + Sync {
    /// Whether objects of `ty` live in a namespace. Falls back to the
    /// built-in scope table.
    async fn is_namespaced(&self, ty: &TypeCategory) -> bool {
        ty.builtin_namespaced()
    }

    /// Current object and its fingerprint; `Ok(None)` when it does not exist.
    async fn get(&self, identity: &Identity, ty: &TypeCategory) -> Result<Option<LiveObject>, RemoteError>;

    /// Create `doc`; `AlreadyExists` when another actor created it first.
    async fn create(&self, identity: &Identity, ty: &TypeCategory, doc: &Document) -> Result<Fingerprint, RemoteError>;

    /// Apply `patch` only if the object still carries `precondition`;
    /// `Conflict` otherwise.
    async fn patch(
        &self,
        identity: &Identity,
        ty: &TypeCategory,
        patch: &Patch,
        precondition: &Fingerprint,
    ) -> Result<Fingerprint, RemoteError>;

    /// Delete the object; `Ok(false)` when it was already gone.
    async fn delete(&self, identity: &Identity, ty: &TypeCategory) -> Result<bool, RemoteError>;
}
