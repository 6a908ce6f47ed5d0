//! Client heartbeat.
//!
//! Each live client refreshes its `heartbeat_timestamp_ms` on an interval
//! so other tabs' client GC can tell it apart from an abandoned one. If the
//! record has vanished, the loop reports it once through the
//! state-not-found callback and stops for good.

use crate::client::touch_client;
use crate::clock::Clock;
use crate::error::{ClientError, Result};
use crate::periodic::{ensure_live, spawn_periodic, Trigger};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabsync_dag::{with_write, ClientId, Store};
use tabsync_scheduler::{
    CancellationToken, ProcessResult, ProcessScheduler, SchedulerConfigBuilder,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const HEARTBEAT_INTERVAL_MS: u64 = 60_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl HeartbeatConfig {
    pub fn with_interval(mut self, ms: u64) -> Self {
        self.interval_ms = ms;
        self
    }

    /// Period between beats.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: HEARTBEAT_INTERVAL_MS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatEvent {
    Beat { client_id: ClientId, timestamp_ms: u64 },
    ClientStateNotFound(ClientId),
    Failed(String),
}

pub type StateNotFoundCallback = Arc<dyn Fn(&ClientId) + Send + Sync>;

/// Write one heartbeat for `client_id` and return the stored timestamp.
pub async fn write_heartbeat<S>(store: &S, client_id: &ClientId, clock: &dyn Clock) -> Result<u64>
where
    S: Store + ?Sized,
{
    with_write(store, |tx| {
        let client = touch_client(tx, client_id, clock.now_ms())?;
        Ok(client.heartbeat_timestamp_ms)
    })
    .await
}

pub struct HeartbeatLoop {
    scheduler: ProcessScheduler<ClientError>,
    events: broadcast::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatLoop {
    /// Start beating every `config.interval()`; the first beat is one
    /// interval from now. Nothing is written once `cancel` fires, including
    /// a beat already queued on the store. Missing client state ends the
    /// loop, and later `beat_now` calls fail without touching the store.
    pub fn start<S>(
        client_id: ClientId,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        config: HeartbeatConfig,
        on_client_state_not_found: StateNotFoundCallback,
        cancel: CancellationToken,
    ) -> Self
    where
        S: Store + 'static,
    {
        let (events, _) = broadcast::channel(64);
        let reported = Arc::new(AtomicBool::new(false));
        // Stops the periodic task; the parent token still governs `beat_now`.
        let ticks = cancel.child_token();

        let scheduler = {
            let events = events.clone();
            let live = cancel.clone();
            let ticks = ticks.clone();
            ProcessScheduler::<ClientError>::new(
                move || {
                    let store = Arc::clone(&store);
                    let clock = Arc::clone(&clock);
                    let client_id = client_id.clone();
                    let events = events.clone();
                    let reported = Arc::clone(&reported);
                    let on_not_found = Arc::clone(&on_client_state_not_found);
                    let live = live.clone();
                    let ticks = ticks.clone();
                    async move {
                        if reported.load(Ordering::SeqCst) {
                            return Err(ClientError::ClientStateNotFound(client_id));
                        }
                        let written: Result<u64> = with_write(store.as_ref(), |tx| {
                            ensure_live(&live)?;
                            let client = touch_client(tx, &client_id, clock.now_ms())?;
                            Ok(client.heartbeat_timestamp_ms)
                        })
                        .await;
                        match written {
                            Ok(timestamp_ms) => {
                                debug!(client_id = %client_id, timestamp_ms, "heartbeat");
                                let _ = events.send(HeartbeatEvent::Beat {
                                    client_id,
                                    timestamp_ms,
                                });
                                Ok(())
                            }
                            Err(err) if err.is_state_not_found() => {
                                if !reported.swap(true, Ordering::SeqCst) {
                                    warn!(
                                        client_id = %client_id,
                                        "client state not found; heartbeat stopped"
                                    );
                                    ticks.cancel();
                                    on_not_found(&client_id);
                                    let _ = events.send(HeartbeatEvent::ClientStateNotFound(client_id));
                                }
                                Err(err)
                            }
                            Err(err) if err.is_cancelled() => Err(err),
                            Err(err) => {
                                let _ = events.send(HeartbeatEvent::Failed(err.to_string()));
                                Err(err)
                            }
                        }
                    }
                },
                SchedulerConfigBuilder::new()
                    .name("heartbeat")
                    .throttle(0)
                    .idle_timeout(0)
                    .build(),
                cancel.clone(),
            )
        };

        let task = spawn_periodic(
            "heartbeat",
            scheduler.clone(),
            config.interval(),
            Trigger::Run,
            ticks,
        );

        Self {
            scheduler,
            events,
            cancel,
            task,
        }
    }

    /// Beat immediately, serialized after any beat in flight.
    pub fn beat_now(&self) -> BoxFuture<'static, ProcessResult<ClientError>> {
        self.scheduler.run()
    }

    /// Receive every beat and terminal condition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.events.subscribe()
    }

    /// Beats attempted so far, including failed ones.
    pub fn beats(&self) -> u64 {
        self.scheduler.executions()
    }

    /// Whether the loop has exited, through cancellation or missing state.
    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the loop's token.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HeartbeatLoop {
    fn drop(&mut self) {
        self.task.abort();
    }
}
