//! Client-group garbage collection.
//!
//! A group is kept while any client references it. With mutation recovery
//! enabled, a group that still holds unacknowledged mutations is kept too,
//! so recovery in some later tab can push them. Everything else is
//! deleted.

use crate::client::get_clients;
use crate::client_group::{
    get_client_groups, set_client_groups, ClientGroup, ClientGroupId, ClientGroupMap,
};
use crate::error::{ClientError, Result};
use crate::periodic::{ensure_live, spawn_periodic, Trigger};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tabsync_dag::{with_write, Store, Write};
use tabsync_scheduler::{
    CancellationToken, ProcessResult, ProcessScheduler, SchedulerConfigBuilder,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const GC_INTERVAL_MS: u64 = 5 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcConfig {
    pub interval_ms: u64,
    /// How long a scheduled pass waits for an idle slot.
    pub idle_timeout_ms: u64,
    /// Keep groups with unacknowledged mutations.
    pub enable_mutation_recovery: bool,
}

impl GcConfig {
    pub fn with_interval(mut self, ms: u64) -> Self {
        self.interval_ms = ms;
        self
    }

    pub fn with_idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Disabling recovery makes GC reclaim groups on liveness alone, which
    /// can drop mutations the server never saw.
    pub fn with_mutation_recovery(mut self, enabled: bool) -> Self {
        self.enable_mutation_recovery = enabled;
        self
    }

    /// Period between scheduled passes.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_ms: GC_INTERVAL_MS,
            idle_timeout_ms: 5_000,
            enable_mutation_recovery: true,
        }
    }
}

/// Result of one pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcOutcome {
    pub removed: Vec<ClientGroupId>,
    pub retained: Vec<ClientGroupId>,
}

/// Referenced groups are always kept; unacknowledged mutations keep a
/// group only while recovery is enabled.
pub fn should_retain(
    id: &ClientGroupId,
    group: &ClientGroup,
    referenced: &BTreeSet<ClientGroupId>,
    enable_mutation_recovery: bool,
) -> bool {
    referenced.contains(id) || (enable_mutation_recovery && group.has_pending_mutations())
}

/// One collection pass inside an existing write transaction.
pub fn gc_client_groups<W: Write>(tx: &mut W, enable_mutation_recovery: bool) -> Result<GcOutcome> {
    let referenced: BTreeSet<ClientGroupId> = get_clients(tx)?
        .into_values()
        .map(|client| client.client_group_id)
        .collect();

    let (kept, dropped): (Vec<_>, Vec<_>) = get_client_groups(tx)?
        .into_iter()
        .partition(|(id, group)| should_retain(id, group, &referenced, enable_mutation_recovery));

    let outcome = GcOutcome {
        removed: dropped.into_iter().map(|(id, _)| id).collect(),
        retained: kept.iter().map(|(id, _)| id.clone()).collect(),
    };
    if !outcome.removed.is_empty() {
        let kept: ClientGroupMap = kept.into_iter().collect();
        set_client_groups(tx, &kept)?;
    }
    Ok(outcome)
}

/// Run one pass in its own write transaction.
pub async fn collect_client_groups<S>(store: &S, enable_mutation_recovery: bool) -> Result<GcOutcome>
where
    S: Store + ?Sized,
{
    with_write(store, |tx| gc_client_groups(tx, enable_mutation_recovery)).await
}

/// Periodic client-group GC.
pub struct ClientGroupGc {
    scheduler: ProcessScheduler<ClientError>,
    outcomes: broadcast::Sender<GcOutcome>,
    task: JoinHandle<()>,
}

impl ClientGroupGc {
    /// Schedule a pass every `config.interval()`, first one interval from
    /// now. A pass still waiting on the store when `cancel` fires writes
    /// nothing.
    pub fn start<S>(store: Arc<S>, config: GcConfig, cancel: CancellationToken) -> Self
    where
        S: Store + 'static,
    {
        let (outcomes, _) = broadcast::channel(16);
        let enable_mutation_recovery = config.enable_mutation_recovery;

        let scheduler = {
            let outcomes = outcomes.clone();
            let live = cancel.clone();
            ProcessScheduler::<ClientError>::new(
                move || {
                    let store = Arc::clone(&store);
                    let outcomes = outcomes.clone();
                    let live = live.clone();
                    async move {
                        let outcome = with_write(store.as_ref(), |tx| {
                            ensure_live(&live)?;
                            gc_client_groups(tx, enable_mutation_recovery)
                        })
                        .await?;
                        if outcome.removed.is_empty() {
                            debug!(
                                retained = outcome.retained.len(),
                                "client group gc: nothing to remove"
                            );
                        } else {
                            info!(
                                removed = ?outcome.removed,
                                retained = outcome.retained.len(),
                                "client group gc"
                            );
                        }
                        let _ = outcomes.send(outcome);
                        Ok(())
                    }
                },
                SchedulerConfigBuilder::new()
                    .name("client-group-gc")
                    .idle_timeout(config.idle_timeout_ms)
                    .build(),
                cancel.clone(),
            )
        };

        let task = spawn_periodic(
            "client-group-gc",
            scheduler.clone(),
            config.interval(),
            Trigger::Schedule,
            cancel,
        );

        Self {
            scheduler,
            outcomes,
            task,
        }
    }

    /// Collect now, skipping the idle wait.
    pub fn collect_now(&self) -> BoxFuture<'static, ProcessResult<ClientError>> {
        self.scheduler.run()
    }

    /// Receive the outcome of every later pass.
    pub fn subscribe(&self) -> broadcast::Receiver<GcOutcome> {
        self.outcomes.subscribe()
    }

    /// Passes started so far.
    pub fn passes(&self) -> u64 {
        self.scheduler.executions()
    }
}

impl Drop for ClientGroupGc {
    fn drop(&mut self) {
        self.task.abort();
    }
}
