//! Client garbage collection.
//!
//! Removes records of clients whose heartbeat is older than
//! `max_inactive_ms`. The collecting client never removes itself.

use crate::client::{get_clients, set_clients};
use crate::clock::Clock;
use crate::error::{ClientError, Result};
use crate::periodic::{ensure_live, spawn_periodic, Trigger};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tabsync_dag::{with_write, ClientId, Store, Write};
use tabsync_scheduler::{
    CancellationToken, ProcessResult, ProcessScheduler, SchedulerConfigBuilder,
};
use tokio::task::JoinHandle;
use tracing::info;

pub const CLIENT_GC_INTERVAL_MS: u64 = 5 * 60 * 1000;
pub const CLIENT_MAX_INACTIVE_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientGcConfig {
    pub interval_ms: u64,
    pub max_inactive_ms: u64,
}

impl Default for ClientGcConfig {
    fn default() -> Self {
        Self {
            interval_ms: CLIENT_GC_INTERVAL_MS,
            max_inactive_ms: CLIENT_MAX_INACTIVE_MS,
        }
    }
}

impl ClientGcConfig {
    pub fn with_interval(mut self, ms: u64) -> Self {
        self.interval_ms = ms;
        self
    }

    pub fn with_max_inactive(mut self, ms: u64) -> Self {
        self.max_inactive_ms = ms;
        self
    }
}

pub type ClientsDeletedCallback = Arc<dyn Fn(&[ClientId]) + Send + Sync>;

/// Delete stale clients other than `self_id`; returns the deleted ids.
pub fn gc_clients<W: Write>(
    tx: &mut W,
    self_id: &ClientId,
    now_ms: u64,
    max_inactive_ms: u64,
) -> Result<Vec<ClientId>> {
    let mut clients = get_clients(tx)?;
    let mut deleted = Vec::new();
    clients.retain(|id, client| {
        let stale = id != self_id
            && now_ms.saturating_sub(client.heartbeat_timestamp_ms) > max_inactive_ms;
        if stale {
            deleted.push(id.clone());
        }
        !stale
    });
    if !deleted.is_empty() {
        set_clients(tx, &clients)?;
    }
    Ok(deleted)
}

/// Periodic client GC run by one live client.
pub struct ClientGc {
    scheduler: ProcessScheduler<ClientError>,
    task: JoinHandle<()>,
}

impl ClientGc {
    /// Collect every `config.interval_ms`, first one interval from now,
    /// reporting removed peers through `on_clients_deleted`.
    pub fn start<S>(
        self_id: ClientId,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        config: ClientGcConfig,
        on_clients_deleted: ClientsDeletedCallback,
        cancel: CancellationToken,
    ) -> Self
    where
        S: Store + 'static,
    {
        let max_inactive_ms = config.max_inactive_ms;
        let live = cancel.clone();
        let scheduler = ProcessScheduler::<ClientError>::new(
            move || {
                let store = Arc::clone(&store);
                let clock = Arc::clone(&clock);
                let self_id = self_id.clone();
                let on_clients_deleted = Arc::clone(&on_clients_deleted);
                let live = live.clone();
                async move {
                    let deleted = with_write(store.as_ref(), |tx| {
                        ensure_live(&live)?;
                        gc_clients(tx, &self_id, clock.now_ms(), max_inactive_ms)
                    })
                    .await?;
                    if !deleted.is_empty() {
                        info!(collector = %self_id, deleted = deleted.len(), "client gc");
                        on_clients_deleted(&deleted);
                    }
                    Ok(())
                }
            },
            SchedulerConfigBuilder::new().name("client-gc").build(),
            cancel.clone(),
        );

        let task = spawn_periodic(
            "client-gc",
            scheduler.clone(),
            Duration::from_millis(config.interval_ms),
            Trigger::Run,
            cancel,
        );
        Self { scheduler, task }
    }

    /// Collect immediately, serialized after any pass in flight.
    pub fn collect_now(&self) -> BoxFuture<'static, ProcessResult<ClientError>> {
        self.scheduler.run()
    }
}

impl Drop for ClientGc {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{set_client, Client};
    use crate::client_group::ClientGroupId;
    use tabsync_dag::{Hash, MemoryStore};

    #[tokio::test]
    async fn test_removes_only_stale_peers() {
        let store = MemoryStore::new();
        let mut tx = store.write().await.unwrap();
        let group = ClientGroupId::new("g");
        for (id, beat) in [("me", 0), ("stale", 0), ("fresh", 150)] {
            set_client(&mut tx, &id.into(), Client::new(group.clone(), Hash::empty(), beat)).unwrap();
        }

        let deleted = gc_clients(&mut tx, &"me".into(), 200, 100).unwrap();
        assert_eq!(deleted, vec![ClientId::new("stale")]);

        let remaining: Vec<_> = get_clients(&tx).unwrap().into_keys().collect();
        assert_eq!(remaining, vec![ClientId::new("fresh"), ClientId::new("me")]);
    }

    #[tokio::test]
    async fn test_exactly_max_inactive_is_kept() {
        let store = MemoryStore::new();
        let mut tx = store.write().await.unwrap();
        let group = ClientGroupId::new("g");
        for (id, beat) in [("me", 0), ("edge", 100), ("over", 99)] {
            set_client(&mut tx, &id.into(), Client::new(group.clone(), Hash::empty(), beat)).unwrap();
        }

        let deleted = gc_clients(&mut tx, &"me".into(), 200, 100).unwrap();
        assert_eq!(deleted, vec![ClientId::new("over")]);
        assert!(get_clients(&tx).unwrap().contains_key(&ClientId::new("edge")));
    }
}
