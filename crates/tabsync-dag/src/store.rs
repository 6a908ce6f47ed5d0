//! Chunk storage contract and the in-memory implementation.
//!
//! A [`Store`] hands out read and write transactions. Reads may run
//! concurrently; at most one write transaction is in flight per store. A
//! write stages its changes and applies them only on [`Write::commit`];
//! dropping an uncommitted write discards everything it staged.

use crate::hash::Hash;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Errors raised by the storage layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,

    #[error("chunk {0} is corrupt: {1}")]
    Corrupt(Hash, String),

    #[error("encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// An immutable, content-addressed blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    hash: Hash,
    data: Arc<[u8]>,
}

impl Chunk {
    pub fn new(data: Vec<u8>) -> Self {
        let hash = Hash::of(&data);
        Chunk {
            hash,
            data: data.into(),
        }
    }

    /// Encode `value` as JSON and wrap it in a chunk.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, StoreError> {
        Ok(Chunk::new(serde_json::to_vec(value)?))
    }

    /// Hash of the chunk data.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode the chunk's JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_slice(&self.data)
            .map_err(|e| StoreError::Corrupt(self.hash, e.to_string()))
    }
}

/// Read access to a consistent view of the store.
pub trait Read: Send + Sync {
    fn has_chunk(&self, hash: &Hash) -> bool;

    fn get_chunk(&self, hash: &Hash) -> Option<Chunk>;

    /// Resolve a named head.
    fn get_head(&self, name: &str) -> Option<Hash>;

    /// End the transaction. Dropping has the same effect.
    fn release(self)
    where
        Self: Sized,
    {
        drop(self)
    }
}

/// Read-write transaction. Changes become visible only after `commit`.
#[async_trait]
pub trait Write: Read + Sized {
    fn put_chunk(&mut self, chunk: Chunk);

    fn set_head(&mut self, name: &str, hash: Hash);

    fn remove_head(&mut self, name: &str);

    async fn commit(self) -> Result<(), StoreError>;
}

/// Transaction factory over content-addressed chunks.
#[async_trait]
pub trait Store: Send + Sync {
    type Read: Read;
    type Write: Write;

    async fn read(&self) -> Result<Self::Read, StoreError>;

    async fn write(&self) -> Result<Self::Write, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    chunks: HashMap<Hash, Chunk>,
    heads: HashMap<String, Hash>,
}

/// In-memory store shared by every clone. Used by tests and the simulator
/// in place of an on-device database.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    closed: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent transaction request fail with
    /// [`StoreError::Closed`]. Transactions already held are unaffected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Chunk and head counts, for diagnostics.
    pub async fn stats(&self) -> MemoryStoreStats {
        let state = self.state.read().await;
        MemoryStoreStats {
            chunk_count: state.chunks.len(),
            head_count: state.heads.len(),
            total_bytes: state.chunks.values().map(Chunk::len).sum(),
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub chunk_count: usize,
    pub head_count: usize,
    pub total_bytes: usize,
}

#[async_trait]
impl Store for MemoryStore {
    type Read = MemoryRead;
    type Write = MemoryWrite;

    async fn read(&self) -> Result<MemoryRead, StoreError> {
        self.check_open()?;
        let guard = self.state.clone().read_owned().await;
        Ok(MemoryRead { guard })
    }

    async fn write(&self) -> Result<MemoryWrite, StoreError> {
        self.check_open()?;
        let guard = self.state.clone().write_owned().await;
        Ok(MemoryWrite {
            guard,
            chunks: HashMap::new(),
            heads: HashMap::new(),
        })
    }
}

pub struct MemoryRead {
    guard: OwnedRwLockReadGuard<MemoryState>,
}

impl Read for MemoryRead {
    fn has_chunk(&self, hash: &Hash) -> bool {
        self.guard.chunks.contains_key(hash)
    }

    fn get_chunk(&self, hash: &Hash) -> Option<Chunk> {
        self.guard.chunks.get(hash).cloned()
    }

    fn get_head(&self, name: &str) -> Option<Hash> {
        self.guard.heads.get(name).copied()
    }
}

pub struct MemoryWrite {
    guard: OwnedRwLockWriteGuard<MemoryState>,
    chunks: HashMap<Hash, Chunk>,
    // `None` marks a staged removal.
    heads: HashMap<String, Option<Hash>>,
}

impl Read for MemoryWrite {
    fn has_chunk(&self, hash: &Hash) -> bool {
        self.chunks.contains_key(hash) || self.guard.chunks.contains_key(hash)
    }

    fn get_chunk(&self, hash: &Hash) -> Option<Chunk> {
        self.chunks
            .get(hash)
            .or_else(|| self.guard.chunks.get(hash))
            .cloned()
    }

    fn get_head(&self, name: &str) -> Option<Hash> {
        match self.heads.get(name) {
            Some(staged) => *staged,
            None => self.guard.heads.get(name).copied(),
        }
    }
}

#[async_trait]
impl Write for MemoryWrite {
    fn put_chunk(&mut self, chunk: Chunk) {
        self.chunks.insert(chunk.hash(), chunk);
    }

    fn set_head(&mut self, name: &str, hash: Hash) {
        self.heads.insert(name.to_string(), Some(hash));
    }

    fn remove_head(&mut self, name: &str) {
        self.heads.insert(name.to_string(), None);
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        tracing::trace!(
            chunks = self.chunks.len(),
            heads = self.heads.len(),
            "committing memory write"
        );
        let chunks = std::mem::take(&mut self.chunks);
        let heads = std::mem::take(&mut self.heads);
        self.guard.chunks.extend(chunks);
        for (name, hash) in heads {
            match hash {
                Some(hash) => {
                    self.guard.heads.insert(name, hash);
                }
                None => {
                    self.guard.heads.remove(&name);
                }
            }
        }
        Ok(())
    }
}
