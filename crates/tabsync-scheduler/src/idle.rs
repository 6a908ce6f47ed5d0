//! Idle-yield primitive.
//!
//! A scheduler asks its [`IdleYield`] for a slot before starting a
//! scheduled run. The returned future resolves when the host reports idle
//! or when `timeout` elapses, whichever comes first.

use futures::future::BoxFuture;
use std::time::Duration;

pub trait IdleYield: Send + Sync {
    fn request_idle(&self, timeout: Duration) -> BoxFuture<'static, ()>;
}

impl<F> IdleYield for F
where
    F: Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync,
{
    fn request_idle(&self, timeout: Duration) -> BoxFuture<'static, ()> {
        self(timeout)
    }
}

/// Timer fallback for hosts without a native idle facility.
///
/// The host is assumed idle `delay` after the request; the timeout still
/// caps the wait. `TimerIdle::new(Duration::MAX)` models a host that never
/// reports idle, so every wait runs to its timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerIdle {
    delay: Duration,
}

impl TimerIdle {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Default for TimerIdle {
    fn default() -> Self {
        Self::immediate()
    }
}

impl IdleYield for TimerIdle {
    fn request_idle(&self, timeout: Duration) -> BoxFuture<'static, ()> {
        let wait = self.delay.min(timeout);
        Box::pin(async move {
            if wait.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(wait).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_timer_idle_capped_by_timeout() {
        let idle = TimerIdle::new(Duration::MAX);
        let start = Instant::now();
        idle.request_idle(Duration::from_millis(300)).await;
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_idle_short_delay() {
        let idle = TimerIdle::new(Duration::from_millis(5));
        let start = Instant::now();
        idle.request_idle(Duration::from_secs(10)).await;
        assert_eq!(start.elapsed(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_closure_as_idle() {
        let idle = |_timeout: Duration| -> BoxFuture<'static, ()> { Box::pin(async {}) };
        idle.request_idle(Duration::from_secs(1)).await;
    }
}
