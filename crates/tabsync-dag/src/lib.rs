//! # tabsync-dag
//!
//! Storage substrate shared by every client of a tabsync replica.
//!
//! This crate provides:
//! - Content hashes and immutable chunks
//! - The transactional [`Store`] contract and an in-memory [`MemoryStore`]
//! - A scoped transaction runner ([`with_read`], [`with_write`])
//! - The commit DAG: snapshot and local-mutation commits linked by basis hash
//!
//! ## Example
//!
//! ```rust
//! use tabsync_dag::{put_commit, with_write, Commit, MemoryStore, Write};
//!
//! # tokio_test::block_on(async {
//! let store = MemoryStore::new();
//! let genesis = Commit::genesis();
//! let head = with_write(&store, |tx| -> Result<_, tabsync_dag::DagError> {
//!     let hash = put_commit(tx, &genesis)?;
//!     tx.set_head("main", hash);
//!     Ok(hash)
//! })
//! .await
//! .unwrap();
//! assert_eq!(head, genesis.hash());
//! # });
//! ```

mod commit;
mod hash;
mod store;
mod transaction;

pub use commit::{
    base_snapshot, commit_chain, local_mutations, put_commit, read_commit, ClientId, Commit,
    CommitBuilder, CommitMeta, DagError, LocalMeta,
};
pub use hash::{Hash, InvalidHash};
pub use store::{Chunk, MemoryRead, MemoryStore, MemoryStoreStats, MemoryWrite, Read, Store, StoreError, Write};
pub use transaction::{with_read, with_write};
