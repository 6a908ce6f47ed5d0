//! Scoped transaction runner.
//!
//! These helpers are the only way the rest of the workspace touches a
//! [`Store`]. The transaction is released on every exit path, and a write
//! is committed only when its body returns `Ok`.

use crate::store::{Read, Store, StoreError, Write};

/// Run `body` inside a read transaction.
pub async fn with_read<S, R, E, F>(store: &S, body: F) -> Result<R, E>
where
    S: Store + ?Sized,
    E: From<StoreError>,
    F: FnOnce(&S::Read) -> Result<R, E>,
{
    let tx = store.read().await?;
    let result = body(&tx);
    tx.release();
    result
}

/// Run `body` inside a write transaction and commit if it succeeds.
///
/// An `Err` from `body` releases the transaction without committing, so
/// none of its staged changes become visible.
pub async fn with_write<S, R, E, F>(store: &S, body: F) -> Result<R, E>
where
    S: Store + ?Sized,
    E: From<StoreError>,
    F: FnOnce(&mut S::Write) -> Result<R, E>,
{
    let mut tx = store.write().await?;
    match body(&mut tx) {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            tx.release();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Chunk, MemoryStore};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("store: {0}")]
        Store(#[from] StoreError),
        #[error("body failed")]
        Body,
    }

    #[tokio::test]
    async fn test_write_commits_on_success() {
        let store = MemoryStore::new();
        let chunk = Chunk::new(b"a".to_vec());
        let hash = chunk.hash();

        let out: Result<u8, TestError> = with_write(&store, |tx| {
            tx.put_chunk(chunk);
            tx.set_head("h", hash);
            Ok(7)
        })
        .await;
        assert_eq!(out.unwrap(), 7);

        let head: Option<_> = with_read::<_, _, TestError, _>(&store, |tx| Ok(tx.get_head("h")))
            .await
            .unwrap();
        assert_eq!(head, Some(hash));
    }

    #[tokio::test]
    async fn test_write_discards_on_error() {
        let store = MemoryStore::new();
        let chunk = Chunk::new(b"a".to_vec());
        let hash = chunk.hash();

        let out: Result<(), TestError> = with_write(&store, |tx| {
            tx.put_chunk(chunk);
            tx.set_head("h", hash);
            Err(TestError::Body)
        })
        .await;
        assert!(matches!(out, Err(TestError::Body)));

        // The write lock was released, so a new write can start.
        let seen = with_write::<_, _, TestError, _>(&store, |tx| Ok(tx.get_head("h")))
            .await
            .unwrap();
        assert_eq!(seen, None);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_before_body() {
        let store = MemoryStore::new();
        store.close();
        let mut ran = false;
        let out: Result<(), TestError> = with_write(&store, |_| {
            ran = true;
            Ok(())
        })
        .await;
        assert!(matches!(out, Err(TestError::Store(StoreError::Closed))));
        assert!(!ran);
    }
}
