//! kapply core types: documents, identities, patches and per-object outcomes.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod identity;
pub mod patch;

pub use identity::{resolve, ResolveError};
pub use patch::{FieldPath, Patch, PatchOp};

/// A resource document as an untyped JSON tree.
pub type Document = serde_json::Value;

/// Group/version/kind of a document. Two categories describe the same type
/// when group and kind match; a version bump alone is not a type change.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeCategory {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl TypeCategory {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Parse from `apiVersion` (`v1` or `group/v1`) and `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Read `apiVersion` + `kind` off a document.
    pub fn of(doc: &Document) -> Option<Self> {
        let api_version = doc.get("apiVersion")?.as_str()?;
        let kind = doc.get("kind")?.as_str()?;
        if api_version.is_empty() || kind.is_empty() {
            return None;
        }
        Some(Self::from_api_version(api_version, kind))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn same_type(&self, other: &TypeCategory) -> bool {
        self.group == other.group && self.kind == other.kind
    }

    /// Scope of built-in kinds when nothing better is known. Kinds missing
    /// from [`CLUSTER_SCOPED`] are assumed namespaced.
    pub fn builtin_namespaced(&self) -> bool {
        !CLUSTER_SCOPED.iter().any(|(g, k)| *g == self.group && *k == self.kind)
    }
}

/// Built-in `(group, kind)` pairs that live outside any namespace.
pub const CLUSTER_SCOPED: &[(&str, &str)] = &[
    ("", "Namespace"),
    ("", "Node"),
    ("", "PersistentVolume"),
    ("rbac.authorization.k8s.io", "ClusterRole"),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
    ("apiextensions.k8s.io", "CustomResourceDefinition"),
    ("apiregistration.k8s.io", "APIService"),
    ("storage.k8s.io", "StorageClass"),
    ("storage.k8s.io", "CSIDriver"),
    ("scheduling.k8s.io", "PriorityClass"),
    ("networking.k8s.io", "IngressClass"),
    ("node.k8s.io", "RuntimeClass"),
    ("admissionregistration.k8s.io", "MutatingWebhookConfiguration"),
    ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration"),
    ("certificates.k8s.io", "CertificateSigningRequest"),
];

impl fmt::Display for TypeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// `(namespace, name)`: the key of one managed resource across runs,
/// independent of its type category. Cluster-scoped objects have an empty
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub namespace: String,
    pub name: String,
}

impl Identity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new("", name)
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cluster_scoped() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// A desired document after identity resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredObject {
    pub identity: Identity,
    pub type_category: TypeCategory,
    pub doc: Document,
    /// Category recorded for this identity by the previous run, when it differs.
    pub previous_type: Option<TypeCategory>,
}

/// Opaque optimistic-concurrency token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A document as currently stored remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveObject {
    pub doc: Document,
    pub fingerprint: Fingerprint,
}

/// How a field is merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Whole value replaced when the desired value changed.
    Replace,
    /// List of mappings merged element-wise by the named key field.
    MergeByKey(String),
    /// Indivisible value: never field-merged, even when it is a mapping.
    Atomic,
}

/// Identities applied by the previous run, with the category they were applied as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedSet {
    pub entries: BTreeMap<Identity, TypeCategory>,
}

impl ManagedSet {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, identity: Identity, type_category: TypeCategory) {
        self.entries.insert(identity, type_category);
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<TypeCategory> {
        self.entries.remove(identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&TypeCategory> {
        self.entries.get(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &TypeCategory)> {
        self.entries.iter()
    }

    pub fn union(&self, other: &ManagedSet) -> ManagedSet {
        let mut out = self.clone();
        for (id, ty) in other.iter() {
            out.entries.entry(id.clone()).or_insert_with(|| ty.clone());
        }
        out
    }
}

impl FromIterator<(Identity, TypeCategory)> for ManagedSet {
    fn from_iter<I: IntoIterator<Item = (Identity, TypeCategory)>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

/// Errors reported by a remote control plane.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("precondition failed: object was modified concurrently")]
    Conflict,
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Conflict | RemoteError::AlreadyExists | RemoteError::Unavailable(_))
    }
}

/// Why one identity failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ObjectError {
    #[error("gave up after {attempts} attempts against concurrent modification")]
    ConflictBudgetExhausted { attempts: u32 },
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("rejected by remote validation: {0}")]
    SchemaRejected(String),
    #[error("immutable field {path} would change")]
    ImmutableField { path: String },
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Remote(String),
}

impl From<RemoteError> for ObjectError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Unavailable(m) => ObjectError::RemoteUnavailable(m),
            RemoteError::Rejected(m) => ObjectError::SchemaRejected(m),
            other => ObjectError::Remote(other.to_string()),
        }
    }
}

/// Terminal result for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum Outcome {
    Created,
    Patched,
    Replaced,
    Deleted,
    Unchanged,
    Failed(ObjectError),
}

impl Outcome {
    pub fn is_failed(&self) -> bool { matches!(self, Outcome::Failed(_)) }

    /// Short label for summaries and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Patched => "patched",
            Outcome::Replaced => "replaced",
            Outcome::Deleted => "deleted",
            Outcome::Unchanged => "unchanged",
            Outcome::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Failed(e) => write!(f, "failed: {}", e),
            other => f.write_str(other.label()),
        }
    }
}

pub mod prelude {
    pub use super::{
        DesiredObject, Document, Fingerprint, Identity, LiveObject, ManagedSet, MergePolicy, ObjectError, Outcome,
        RemoteError, TypeCategory,
    };
    pub use super::patch::{FieldPath, Patch, PatchOp};
}
