//! Field-path patches over untyped documents.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use smallvec::SmallVec;

/// Path of mapping keys from the document root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath(SmallVec<[String; 6]>);

impl FieldPath {
    pub fn root() -> Self { Self(SmallVec::new()) }

    /// Parse a dotted path (`spec.ports`). Empty segments are ignored.
    pub fn parse(dotted: &str) -> Self {
        Self(dotted.split('.').filter(|s| !s.is_empty()).map(str::to_string).collect())
    }

    pub fn child(&self, key: &str) -> Self {
        let mut next = self.0.clone();
        next.push(key.to_string());
        Self(next)
    }

    pub fn segments(&self) -> &[String] { &self.0 }
    pub fn is_root(&self) -> bool { self.0.is_empty() }

    /// Value at this path, if every segment resolves through a mapping.
    pub fn lookup<'a>(&self, doc: &'a Json) -> Option<&'a Json> {
        let mut cur = doc;
        for seg in self.0.iter() {
            cur = cur.as_object()?.get(seg)?;
        }
        Some(cur)
    }

    /// True when `self` equals `other` or lies underneath it.
    pub fn starts_with(&self, other: &FieldPath) -> bool {
        self.0.len() >= other.0.len() && self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }
}

impl<S: Into<String>> FromIterator<S> for FieldPath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Set { path: FieldPath, value: Json },
    Delete { path: FieldPath },
}

impl PatchOp {
    pub fn path(&self) -> &FieldPath {
        match self {
            PatchOp::Set { path, .. } | PatchOp::Delete { path } => path,
        }
    }
}

/// Ordered field operations; later operations see the effect of earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
}

impl Patch {
    pub fn new() -> Self { Self::default() }

    pub fn set(&mut self, path: FieldPath, value: Json) { self.ops.push(PatchOp::Set { path, value }); }
    pub fn delete(&mut self, path: FieldPath) { self.ops.push(PatchOp::Delete { path }); }
    pub fn push(&mut self, op: PatchOp) { self.ops.push(op); }

    pub fn is_empty(&self) -> bool { self.ops.is_empty() }
    pub fn len(&self) -> usize { self.ops.len() }

    /// Apply every op in order. `Set` creates (or overwrites non-mapping)
    /// intermediate values; `Delete` of an absent path does nothing.
    pub fn apply_to(&self, doc: &mut Json) {
        for op in self.ops.iter() {
            match op {
                PatchOp::Set { path, value } => set_path(doc, path.segments(), value.clone()),
                PatchOp::Delete { path } => delete_path(doc, path.segments()),
            }
        }
    }

    /// True when applying the patch would leave `live` untouched.
    pub fn is_noop_against(&self, live: &Json) -> bool {
        if self.ops.is_empty() {
            return true;
        }
        let mut next = live.clone();
        self.apply_to(&mut next);
        &next == live
    }
}

fn set_path(doc: &mut Json, segs: &[String], value: Json) {
    let Some((last, parents)) = segs.split_last() else {
        *doc = value;
        return;
    };
    let mut cur = doc;
    for seg in parents {
        if !cur.is_object() {
            *cur = Json::Object(Map::new());
        }
        if let Json::Object(map) = cur {
            cur = map.entry(seg.clone()).or_insert_with(|| Json::Object(Map::new()));
        }
    }
    if !cur.is_object() {
        *cur = Json::Object(Map::new());
    }
    if let Json::Object(map) = cur {
        map.insert(last.clone(), value);
    }
}

fn delete_path(doc: &mut Json, segs: &[String]) {
    let Some((last, parents)) = segs.split_last() else {
        return;
    };
    let mut cur = doc;
    for seg in parents {
        match cur.as_object_mut().and_then(|m| m.get_mut(seg)) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let Some(map) = cur.as_object_mut() {
        map.remove(last);
    }
}
