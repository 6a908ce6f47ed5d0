//! Commit DAG nodes.
//!
//! Commits are stored as JSON chunks, so the chunk store doubles as a
//! hash-keyed arena: each commit names its predecessor by `basis` hash and
//! never holds a direct reference to it. A client group's history is the
//! chain reached by following `basis` from its head.

use crate::hash::Hash;
use crate::store::{Chunk, Read, StoreError, Write};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Identifier of one client (tab or worker).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh, lexicographically time-ordered id.
    pub fn random() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Errors from walking or decoding the commit DAG.
#[derive(Error, Debug)]
pub enum DagError {
    #[error("commit not found: {}", .0.short())]
    NotFound(Hash),

    #[error("chain from {} has no snapshot commit", .0.short())]
    NoSnapshot(Hash),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Metadata of a mutation applied locally and not yet confirmed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMeta {
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    #[serde(rename = "mutationID")]
    pub mutation_id: u64,
    pub mutator_name: String,
    #[serde(rename = "mutatorArgsJSON")]
    pub mutator_args_json: serde_json::Value,
    /// Hash of the commit this one was rebased from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_hash: Option<Hash>,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CommitMeta {
    /// State pulled from the server.
    #[serde(rename_all = "camelCase")]
    Snapshot {
        #[serde(rename = "lastMutationIDs")]
        last_mutation_ids: BTreeMap<ClientId, u64>,
        #[serde(default)]
        cookie: serde_json::Value,
    },
    Local(LocalMeta),
}

impl CommitMeta {
    pub fn is_snapshot(&self) -> bool {
        matches!(self, CommitMeta::Snapshot { .. })
    }

    pub fn as_local(&self) -> Option<&LocalMeta> {
        match self {
            CommitMeta::Local(meta) => Some(meta),
            CommitMeta::Snapshot { .. } => None,
        }
    }
}

// On-chunk form; the hash is derived, never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitData {
    basis: Option<Hash>,
    meta: CommitMeta,
    value_hash: Hash,
}

/// A commit together with its content hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    hash: Hash,
    data: CommitData,
}

impl Commit {
    /// Content hash; the commit's identity in the DAG.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The commit this one builds on. `None` for a root commit.
    pub fn basis(&self) -> Option<Hash> {
        self.data.basis
    }

    pub fn meta(&self) -> &CommitMeta {
        &self.data.meta
    }

    /// Hash of the key/value tree this commit points at. Opaque here.
    pub fn value_hash(&self) -> Hash {
        self.data.value_hash
    }

    pub fn is_snapshot(&self) -> bool {
        self.data.meta.is_snapshot()
    }

    pub fn local(&self) -> Option<&LocalMeta> {
        self.data.meta.as_local()
    }

    /// Root snapshot of a new client group.
    pub fn genesis() -> Self {
        CommitBuilder::snapshot(BTreeMap::new(), serde_json::Value::Null).build()
    }

    fn to_chunk(&self) -> Result<Chunk, StoreError> {
        Chunk::from_json(&self.data)
    }

    fn from_chunk(chunk: &Chunk) -> Result<Self, StoreError> {
        let data: CommitData = chunk.decode()?;
        Ok(Commit {
            hash: chunk.hash(),
            data,
        })
    }
}

/// Builder for commits.
#[derive(Clone, Debug)]
pub struct CommitBuilder {
    basis: Option<Hash>,
    meta: CommitMeta,
    value_hash: Hash,
}

impl CommitBuilder {
    /// Snapshot carrying the server's acknowledged mutation ids.
    pub fn snapshot(last_mutation_ids: BTreeMap<ClientId, u64>, cookie: serde_json::Value) -> Self {
        CommitBuilder {
            basis: None,
            meta: CommitMeta::Snapshot {
                last_mutation_ids,
                cookie,
            },
            value_hash: Hash::empty(),
        }
    }

    pub fn local(meta: LocalMeta) -> Self {
        CommitBuilder {
            basis: None,
            meta: CommitMeta::Local(meta),
            value_hash: Hash::empty(),
        }
    }

    pub fn with_basis(mut self, basis: Hash) -> Self {
        self.basis = Some(basis);
        self
    }

    pub fn with_value_hash(mut self, value_hash: Hash) -> Self {
        self.value_hash = value_hash;
        self
    }

    /// Finish the commit and compute its hash.
    pub fn build(self) -> Commit {
        let data = CommitData {
            basis: self.basis,
            meta: self.meta,
            value_hash: self.value_hash,
        };
        // Encoding a tree of strings, integers and JSON values cannot fail.
        let hash = serde_json::to_vec(&data)
            .map(|bytes| Hash::of(&bytes))
            .unwrap_or_default();
        Commit { hash, data }
    }
}

/// Store `commit` and return its hash.
pub fn put_commit<W: Write>(tx: &mut W, commit: &Commit) -> Result<Hash, DagError> {
    let chunk = commit.to_chunk()?;
    debug_assert_eq!(chunk.hash(), commit.hash());
    let hash = chunk.hash();
    tx.put_chunk(chunk);
    Ok(hash)
}

/// Decode the commit stored under `hash`.
pub fn read_commit<R: Read>(tx: &R, hash: &Hash) -> Result<Commit, DagError> {
    let chunk = tx.get_chunk(hash).ok_or(DagError::NotFound(*hash))?;
    Ok(Commit::from_chunk(&chunk)?)
}

/// Local-mutation commits from `head` back to (not including) the first
/// snapshot, newest first.
pub fn local_mutations<R: Read>(tx: &R, head: &Hash) -> Result<Vec<Commit>, DagError> {
    let mut out = Vec::new();
    let mut cursor = Some(*head);
    while let Some(hash) = cursor {
        let commit = read_commit(tx, &hash)?;
        if commit.is_snapshot() {
            return Ok(out);
        }
        cursor = commit.basis();
        out.push(commit);
    }
    Err(DagError::NoSnapshot(*head))
}

/// First snapshot commit reachable from `head` (possibly `head` itself).
pub fn base_snapshot<R: Read>(tx: &R, head: &Hash) -> Result<Commit, DagError> {
    let mut cursor = Some(*head);
    while let Some(hash) = cursor {
        let commit = read_commit(tx, &hash)?;
        if commit.is_snapshot() {
            return Ok(commit);
        }
        cursor = commit.basis();
    }
    Err(DagError::NoSnapshot(*head))
}

/// Whole chain from `head` down to the root, newest first.
pub fn commit_chain<R: Read>(tx: &R, head: &Hash) -> Result<Vec<Commit>, DagError> {
    let mut out = Vec::new();
    let mut cursor = Some(*head);
    while let Some(hash) = cursor {
        let commit = read_commit(tx, &hash)?;
        cursor = commit.basis();
        out.push(commit);
    }
    Ok(out)
}
