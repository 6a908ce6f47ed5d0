// Interval driver shared by the heartbeat, GC and recovery loops.

use crate::error::{ClientError, Result};
use std::time::Duration;
use tabsync_scheduler::{CancellationToken, ProcessScheduler, SchedulerError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// Bypass throttle and idle.
    Run,
    /// Debounced, throttled, idle-preferring.
    Schedule,
}

/// Fails once `cancel` has fired. Loop processes call this first inside
/// their write bodies, so a pass queued on the store lock commits nothing.
pub(crate) fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ClientError::Cancelled)
    } else {
        Ok(())
    }
}

/// Tick every `period` (first tick one period from now) until `cancel`
/// fires or the process reports missing client state.
pub(crate) fn spawn_periodic(
    name: &'static str,
    scheduler: ProcessScheduler<ClientError>,
    period: Duration,
    trigger: Trigger,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let first_tick = Instant::now() + period;
    tokio::spawn(async move {
        let mut ticker = interval_at(first_tick, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = match trigger {
                Trigger::Run => scheduler.run().await,
                Trigger::Schedule => scheduler.schedule().await,
            };
            match outcome {
                Ok(()) => {}
                Err(SchedulerError::Cancelled) => break,
                Err(SchedulerError::Process(err)) if err.is_cancelled() => break,
                Err(SchedulerError::Process(err)) if err.is_state_not_found() => {
                    debug!(task = name, error = %err, "stopping: state not found");
                    break;
                }
                Err(SchedulerError::Process(err)) => {
                    error!(task = name, error = %err, "periodic run failed");
                }
            }
        }
        debug!(task = name, "periodic task stopped");
    })
}
