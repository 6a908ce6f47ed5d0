//! Mutation recovery.
//!
//! Pushes the pending mutations of client groups other than one's own,
//! typically left behind by tabs that closed before their push finished,
//! and records the server's acknowledgements so client-group GC can
//! reclaim the groups afterwards.

use crate::client_group::{
    get_client_group, get_client_groups, set_client_group, ClientGroupId,
};
use crate::error::{ClientError, Result};
use crate::pending::{pending_mutations, PendingMutation};
use crate::periodic::{ensure_live, spawn_periodic, Trigger};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tabsync_dag::{with_read, with_write, ClientId, Store, Write};
use tabsync_scheduler::{
    CancellationToken, ProcessResult, ProcessScheduler, SchedulerConfigBuilder,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
    pub mutations: Vec<PendingMutation>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    #[serde(rename = "lastMutationIDs")]
    pub last_mutation_ids: BTreeMap<ClientId, u64>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("push rejected: {0}")]
    Rejected(String),

    #[error("server unreachable: {0}")]
    Unreachable(String),
}

/// Transport for pushing recovered mutations.
#[async_trait]
pub trait MutationPusher: Send + Sync {
    async fn push(&self, request: PushRequest) -> std::result::Result<PushResponse, PushError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub throttle_ms: u64,
    pub idle_timeout_ms: u64,
    pub interval_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 10_000,
            idle_timeout_ms: 5_000,
            interval_ms: 5 * 60 * 1000,
        }
    }
}

impl RecoveryConfig {
    pub fn with_throttle(mut self, ms: u64) -> Self {
        self.throttle_ms = ms;
        self
    }

    pub fn with_idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn with_interval(mut self, ms: u64) -> Self {
        self.interval_ms = ms;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub recovered: Vec<ClientGroupId>,
    pub failed: Vec<(ClientGroupId, PushError)>,
}

/// Merge server acks into a group; missing groups are skipped.
pub fn record_acks<W: Write>(
    tx: &mut W,
    client_group_id: &ClientGroupId,
    last_mutation_ids: &BTreeMap<ClientId, u64>,
) -> Result<bool> {
    let Some(mut group) = get_client_group(tx, client_group_id)? else {
        return Ok(false);
    };
    for (client, id) in last_mutation_ids {
        let entry = group
            .last_server_ackd_mutation_ids
            .entry(client.clone())
            .or_insert(0);
        *entry = (*entry).max(*id);
    }
    set_client_group(tx, client_group_id, group)?;
    Ok(true)
}

/// One recovery pass over every enabled group except `own_group`.
pub async fn recover_mutations<S, P>(
    store: &S,
    own_group: Option<&ClientGroupId>,
    pusher: &P,
) -> Result<RecoveryOutcome>
where
    S: Store + ?Sized,
    P: MutationPusher + ?Sized,
{
    recover_until(store, own_group, pusher, &CancellationToken::new()).await
}

// Stops before the next push once `cancel` fires; acks are never recorded
// after that.
async fn recover_until<S, P>(
    store: &S,
    own_group: Option<&ClientGroupId>,
    pusher: &P,
    cancel: &CancellationToken,
) -> Result<RecoveryOutcome>
where
    S: Store + ?Sized,
    P: MutationPusher + ?Sized,
{
    let candidates: Vec<(ClientGroupId, Vec<PendingMutation>)> = with_read(store, |tx| {
        let mut out = Vec::new();
        for (id, group) in get_client_groups(tx)? {
            if Some(&id) == own_group || group.disabled || !group.has_pending_mutations() {
                continue;
            }
            let pending = pending_mutations(tx, &group)?;
            if !pending.is_empty() {
                out.push((id, pending));
            }
        }
        Ok::<_, ClientError>(out)
    })
    .await?;

    let mut outcome = RecoveryOutcome::default();
    for (client_group_id, mutations) in candidates {
        ensure_live(cancel)?;
        let count = mutations.len();
        let request = PushRequest {
            client_group_id: client_group_id.clone(),
            mutations,
        };
        match pusher.push(request).await {
            Ok(response) => {
                let still_there = with_write(store, |tx| {
                    ensure_live(cancel)?;
                    record_acks(tx, &client_group_id, &response.last_mutation_ids)
                })
                .await?;
                if still_there {
                    info!(
                        client_group_id = %client_group_id,
                        mutations = count,
                        "recovered mutations"
                    );
                } else {
                    debug!(client_group_id = %client_group_id, "group removed during recovery");
                }
                outcome.recovered.push(client_group_id);
            }
            Err(err) => {
                warn!(
                    client_group_id = %client_group_id,
                    error = %err,
                    "mutation recovery push failed"
                );
                outcome.failed.push((client_group_id, err));
            }
        }
    }
    Ok(outcome)
}

/// Background mutation recovery driven through the scheduler's debounced
/// path.
pub struct MutationRecovery {
    scheduler: ProcessScheduler<ClientError>,
    outcomes: broadcast::Sender<RecoveryOutcome>,
    task: JoinHandle<()>,
}

impl MutationRecovery {
    /// Schedule a pass every `config.interval_ms`, first one interval from
    /// now, through the throttled and idle-preferring path.
    pub fn start<S, P>(
        store: Arc<S>,
        own_group: Option<ClientGroupId>,
        pusher: Arc<P>,
        config: RecoveryConfig,
        cancel: CancellationToken,
    ) -> Self
    where
        S: Store + 'static,
        P: MutationPusher + 'static,
    {
        let (outcomes, _) = broadcast::channel(16);
        let scheduler = {
            let outcomes = outcomes.clone();
            let live = cancel.clone();
            ProcessScheduler::<ClientError>::new(
                move || {
                    let store = Arc::clone(&store);
                    let pusher = Arc::clone(&pusher);
                    let own_group = own_group.clone();
                    let outcomes = outcomes.clone();
                    let live = live.clone();
                    async move {
                        let outcome = recover_until(
                            store.as_ref(),
                            own_group.as_ref(),
                            pusher.as_ref(),
                            &live,
                        )
                        .await?;
                        let _ = outcomes.send(outcome);
                        Ok(())
                    }
                },
                SchedulerConfigBuilder::new()
                    .name("mutation-recovery")
                    .throttle(config.throttle_ms)
                    .idle_timeout(config.idle_timeout_ms)
                    .build(),
                cancel.clone(),
            )
        };

        let task = spawn_periodic(
            "mutation-recovery",
            scheduler.clone(),
            Duration::from_millis(config.interval_ms),
            Trigger::Schedule,
            cancel,
        );

        Self {
            scheduler,
            outcomes,
            task,
        }
    }

    /// Request a pass; concurrent requests share one.
    pub fn recover(&self) -> BoxFuture<'static, ProcessResult<ClientError>> {
        self.scheduler.schedule()
    }

    /// Receive the outcome of every later pass.
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryOutcome> {
        self.outcomes.subscribe()
    }
}

impl Drop for MutationRecovery {
    fn drop(&mut self) {
        self.task.abort();
    }
}
