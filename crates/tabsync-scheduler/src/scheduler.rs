//! The process scheduler.
//!
//! A [`ProcessScheduler`] owns one asynchronous `process` and runs it under
//! three constraints at once:
//!
//! - **Mutual exclusion**: two executions never overlap.
//! - **Throttle**: a scheduled execution starts no sooner than `throttle`
//!   after the *start* of the previous execution.
//! - **Idle preference**: a scheduled execution waits for the host to report
//!   idle, capped by `idle_timeout`.
//!
//! [`schedule`](ProcessScheduler::schedule) collapses every call made while a
//! request is still waiting into one pending batch. [`run`](ProcessScheduler::run)
//! skips throttle and idle and, if a batch is waiting, takes it over so the
//! batch settles with the run's outcome.
//!
//! State machine for the pending batch:
//!
//! ```text
//!            schedule()                in-flight done         throttle elapsed
//!   Idle ───────────────▶ Debouncing ───────────────▶ Throttling ───────────────▶ AwaitingIdle
//!    ▲                        │                          │                            │ idle / timeout
//!    │                        └──── run() steals ────────┴──────── run() steals ──────┤
//!    │                                                                                ▼
//!    └─────────────────────────────── process settles ◀──────────────────────── Running
//! ```
//!
//! Cancelling the bound token settles every outstanding future with
//! [`SchedulerError::Cancelled`] and makes later calls fail immediately.

use crate::config::SchedulerConfig;
use crate::error::{ProcessResult, SchedulerError};
use crate::idle::{IdleYield, TimerIdle};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type ProcessFn<E> = dyn Fn() -> BoxFuture<'static, Result<(), E>> + Send + Sync;
type Waiter<E> = oneshot::Sender<ProcessResult<E>>;

/// Observable state of a scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// Nothing pending or running.
    Idle,
    /// A scheduled batch waits for the in-flight execution to finish.
    Debouncing,
    /// A scheduled batch waits out the throttle window.
    Throttling,
    /// A scheduled batch waits for an idle slot.
    AwaitingIdle,
    /// An execution is in progress and nothing is scheduled behind it.
    Running,
}

struct Batch<E> {
    id: u64,
    phase: SchedulerPhase,
    waiters: Vec<Waiter<E>>,
    // Fired when `run()` takes this batch over; child of the scheduler token.
    stolen: CancellationToken,
}

struct State<E> {
    pending: Option<Batch<E>>,
    running: bool,
    last_run_start: Option<Instant>,
    next_batch_id: u64,
    executions: u64,
}

struct Inner<E> {
    process: Arc<ProcessFn<E>>,
    config: SchedulerConfig,
    idle: Arc<dyn IdleYield>,
    cancel: CancellationToken,
    state: Mutex<State<E>>,
    // Held for the whole duration of one execution.
    run_slot: tokio::sync::Mutex<()>,
}

/// Debounced, throttled, idle-aware runner for one process.
///
/// Cloning is cheap; clones share state and the cancellation token. All
/// entry points must be called within a Tokio runtime.
///
/// # Example
///
/// ```rust
/// use tabsync_scheduler::{ProcessScheduler, SchedulerConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let cancel = CancellationToken::new();
/// let scheduler = ProcessScheduler::new(
///     || async { Ok::<(), std::io::Error>(()) },
///     SchedulerConfig::default(),
///     cancel.clone(),
/// );
///
/// let a = scheduler.schedule();
/// let b = scheduler.schedule();
/// assert!(a.await.is_ok());
/// assert!(b.await.is_ok());
/// assert_eq!(scheduler.executions(), 1);
/// # });
/// ```
pub struct ProcessScheduler<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for ProcessScheduler<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Send + Sync + 'static> ProcessScheduler<E> {
    /// Create a scheduler bound to `cancel`, using [`TimerIdle`] as its idle
    /// source.
    pub fn new<F, Fut>(process: F, config: SchedulerConfig, cancel: CancellationToken) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        Self::with_idle_source(process, config, Arc::new(TimerIdle::default()), cancel)
    }

    /// Create a scheduler whose scheduled runs wait on `idle`.
    pub fn with_idle_source<F, Fut>(
        process: F,
        config: SchedulerConfig,
        idle: Arc<dyn IdleYield>,
        cancel: CancellationToken,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let process: Arc<ProcessFn<E>> =
            Arc::new(move || -> BoxFuture<'static, Result<(), E>> { Box::pin(process()) });
        Self {
            inner: Arc::new(Inner {
                process,
                config,
                idle,
                cancel,
                state: Mutex::new(State {
                    pending: None,
                    running: false,
                    last_run_start: None,
                    next_batch_id: 0,
                    executions: 0,
                }),
                run_slot: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Configuration this scheduler was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Whether the bound token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Number of times `process` has been invoked.
    pub fn executions(&self) -> u64 {
        self.inner.state.lock().executions
    }

    /// Phase of the pending batch, or of the execution when none waits.
    pub fn phase(&self) -> SchedulerPhase {
        let state = self.inner.state.lock();
        match (&state.pending, state.running) {
            (Some(batch), _) => batch.phase,
            (None, true) => SchedulerPhase::Running,
            (None, false) => SchedulerPhase::Idle,
        }
    }

    /// Request a run when convenient.
    ///
    /// Calls made while a previous request has not started yet join it and
    /// settle with the same outcome.
    pub fn schedule(&self) -> BoxFuture<'static, ProcessResult<E>> {
        if self.is_cancelled() {
            return Box::pin(async { Err(SchedulerError::Cancelled) });
        }

        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.state.lock();
        match state.pending.as_mut() {
            Some(batch) => batch.waiters.push(tx),
            None => {
                let id = state.next_batch_id;
                state.next_batch_id += 1;
                let stolen = self.inner.cancel.child_token();
                state.pending = Some(Batch {
                    id,
                    phase: SchedulerPhase::Debouncing,
                    waiters: vec![tx],
                    stolen: stolen.clone(),
                });
                tokio::spawn(drive_batch(Arc::clone(&self.inner), id, stolen));
            }
        }
        drop(state);

        self.settled(rx)
    }

    /// Request an immediate run, serialized after any in-flight execution.
    ///
    /// A batch still waiting on throttle or idle is folded into this run.
    pub fn run(&self) -> BoxFuture<'static, ProcessResult<E>> {
        if self.is_cancelled() {
            return Box::pin(async { Err(SchedulerError::Cancelled) });
        }

        let (tx, rx) = oneshot::channel();
        let mut waiters = vec![tx];
        let stolen = self.inner.state.lock().pending.take();
        if let Some(batch) = stolen {
            tracing::trace!(
                scheduler = %self.inner.config.name,
                batch = batch.id,
                waiters = batch.waiters.len(),
                "run takes over scheduled batch"
            );
            batch.stolen.cancel();
            waiters.extend(batch.waiters);
        }
        tokio::spawn(execute(Arc::clone(&self.inner), waiters));

        self.settled(rx)
    }

    fn settled(&self, rx: oneshot::Receiver<ProcessResult<E>>) -> BoxFuture<'static, ProcessResult<E>> {
        let cancel = self.inner.cancel.clone();
        Box::pin(async move {
            tokio::select! {
                biased;
                outcome = rx => outcome.unwrap_or(Err(SchedulerError::Cancelled)),
                _ = cancel.cancelled() => Err(SchedulerError::Cancelled),
            }
        })
    }
}

impl<E> Inner<E> {
    fn set_phase(&self, batch_id: u64, phase: SchedulerPhase) {
        let mut state = self.state.lock();
        if let Some(batch) = state.pending.as_mut() {
            if batch.id == batch_id {
                batch.phase = phase;
            }
        }
    }

    fn throttle_deadline(&self) -> Option<Instant> {
        self.state
            .lock()
            .last_run_start
            .map(|start| start + self.config.throttle())
    }

    fn take_batch(&self, batch_id: u64) -> Option<Batch<E>> {
        let mut state = self.state.lock();
        match &state.pending {
            Some(batch) if batch.id == batch_id => state.pending.take(),
            _ => None,
        }
    }
}

async fn drive_batch<E: Send + Sync + 'static>(
    inner: Arc<Inner<E>>,
    batch_id: u64,
    stolen: CancellationToken,
) {
    // Resolves holding the run slot with the throttle window elapsed.
    let wait = async {
        // Debouncing: let the in-flight execution (if any) finish. Its
        // outcome belongs to its own callers and is ignored here.
        drop(inner.run_slot.lock().await);

        loop {
            inner.set_phase(batch_id, SchedulerPhase::Throttling);
            if let Some(deadline) = inner.throttle_deadline() {
                tokio::time::sleep_until(deadline).await;
            }

            inner.set_phase(batch_id, SchedulerPhase::AwaitingIdle);
            inner.idle.request_idle(inner.config.idle_timeout()).await;

            let slot = inner.run_slot.lock().await;
            // A run() may have started while this batch waited.
            match inner.throttle_deadline() {
                Some(deadline) if deadline > Instant::now() => drop(slot),
                _ => return slot,
            }
        }
    };

    tokio::select! {
        _ = stolen.cancelled() => {
            if inner.cancel.is_cancelled() {
                // Dropping the senders settles any remaining receivers.
                drop(inner.take_batch(batch_id));
                tracing::debug!(scheduler = %inner.config.name, batch = batch_id, "scheduled batch cancelled");
            }
        }
        slot = wait => {
            if let Some(batch) = inner.take_batch(batch_id) {
                let outcome = invoke(&inner).await;
                drop(slot);
                settle(batch.waiters, outcome);
            }
        }
    }
}

async fn execute<E: Send + Sync + 'static>(inner: Arc<Inner<E>>, waiters: Vec<Waiter<E>>) {
    let slot = inner.run_slot.lock().await;
    let outcome = invoke(&inner).await;
    drop(slot);
    settle(waiters, outcome);
}

// Caller holds the run slot.
async fn invoke<E: Send + Sync + 'static>(inner: &Inner<E>) -> ProcessResult<E> {
    if inner.cancel.is_cancelled() {
        return Err(SchedulerError::Cancelled);
    }

    let execution = {
        let mut state = inner.state.lock();
        state.running = true;
        state.last_run_start = Some(Instant::now());
        state.executions += 1;
        state.executions
    };
    let _running = RunningGuard(&inner.state);

    tracing::debug!(scheduler = %inner.config.name, execution, "process started");
    let result = (inner.process)().await;
    match &result {
        Ok(()) => tracing::debug!(scheduler = %inner.config.name, execution, "process finished"),
        Err(_) => tracing::debug!(scheduler = %inner.config.name, execution, "process failed"),
    }
    result.map_err(|e| SchedulerError::Process(Arc::new(e)))
}

fn settle<E>(waiters: Vec<Waiter<E>>, outcome: ProcessResult<E>) {
    for waiter in waiters {
        // The caller may have stopped waiting; nothing to do then.
        let _ = waiter.send(outcome.clone());
    }
}

// Clears `running` even if the process panics.
struct RunningGuard<'a, E>(&'a Mutex<State<E>>);

impl<E> Drop for RunningGuard<'_, E> {
    fn drop(&mut self) {
        self.0.lock().running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfigBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    fn counting(
        counter: Arc<AtomicUsize>,
        config: SchedulerConfig,
        idle: TimerIdle,
        cancel: CancellationToken,
    ) -> ProcessScheduler<Boom> {
        ProcessScheduler::with_idle_source(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                }
            },
            config,
            Arc::new(idle),
            cancel,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_transitions() {
        let counter = Arc::new(AtomicUsize::new(0));
        let config = SchedulerConfigBuilder::new()
            .throttle(1000)
            .idle_timeout(100)
            .build();
        let scheduler = counting(
            counter.clone(),
            config,
            TimerIdle::new(Duration::MAX),
            CancellationToken::new(),
        );
        assert_eq!(scheduler.phase(), SchedulerPhase::Idle);

        scheduler.run().await.unwrap();
        assert_eq!(scheduler.phase(), SchedulerPhase::Idle);

        let pending = tokio::spawn(scheduler.schedule());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(scheduler.phase(), SchedulerPhase::Throttling);

        // Throttle ends 1000ms after the first start, idle wait caps at 100ms.
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(scheduler.phase(), SchedulerPhase::AwaitingIdle);

        pending.await.unwrap().unwrap();
        assert_eq!(scheduler.phase(), SchedulerPhase::Idle);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_run_rechecks_throttle_under_run_slot() {
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::default();
        let gate = CancellationToken::new();
        let idle: Arc<dyn IdleYield> = {
            let gate = gate.clone();
            Arc::new(move |_: Duration| -> BoxFuture<'static, ()> {
                let gate = gate.clone();
                Box::pin(async move { gate.cancelled().await })
            })
        };
        let scheduler = {
            let starts = starts.clone();
            ProcessScheduler::<Boom>::with_idle_source(
                move || {
                    starts.lock().push(Instant::now());
                    async { Ok(()) }
                },
                SchedulerConfigBuilder::new()
                    .throttle(1000)
                    .idle_timeout(60_000)
                    .build(),
                idle,
                CancellationToken::new(),
            )
        };

        let pending = tokio::spawn(scheduler.schedule());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.phase(), SchedulerPhase::AwaitingIdle);

        // Another execution starts after the batch passed its throttle wait.
        let slot = scheduler.inner.run_slot.lock().await;
        let other_start = Instant::now();
        scheduler.inner.state.lock().last_run_start = Some(other_start);
        gate.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(slot);

        pending.await.unwrap().unwrap();
        let starts = starts.lock().clone();
        assert_eq!(starts.len(), 1);
        assert!(starts[0] - other_start >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_disable_scheduler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = {
            let calls = calls.clone();
            ProcessScheduler::new(
                move || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(Boom)
                        } else {
                            Ok(())
                        }
                    }
                },
                SchedulerConfig::default(),
                CancellationToken::new(),
            )
        };

        let err = scheduler.schedule().await.unwrap_err();
        assert!(err.process_error().is_some());
        assert!(scheduler.schedule().await.is_ok());
        assert!(scheduler.run().await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_after_cancel_fail_fast() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let scheduler = counting(
            counter.clone(),
            SchedulerConfig::default(),
            TimerIdle::default(),
            cancel.clone(),
        );
        cancel.cancel();

        assert!(scheduler.schedule().await.unwrap_err().is_cancelled());
        assert!(scheduler.run().await.unwrap_err().is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.executions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rejects_running_callers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let scheduler = ProcessScheduler::<Boom>::new(
            {
                let counter = counter.clone();
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    }
                }
            },
            SchedulerConfig::default(),
            cancel.clone(),
        );

        let running = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.phase(), SchedulerPhase::Running);

        cancel.cancel();
        assert!(running.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
