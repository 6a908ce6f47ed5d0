//! # tabsync-scheduler
//!
//! Reusable scheduling primitive for tabsync background loops.
//!
//! This crate provides:
//! - [`ProcessScheduler`]: mutual exclusion, start-anchored throttling,
//!   idle preference, debounce and cancellation around one async process
//! - [`IdleYield`]: the injectable "wait for an idle slot" primitive, with a
//!   timer fallback ([`TimerIdle`])
//! - [`SchedulerConfig`] and its builder
//!
//! Heartbeat, garbage collection and mutation recovery in `tabsync-client`
//! are all driven through this type.

mod config;
mod error;
mod idle;
mod scheduler;

pub use config::{SchedulerConfig, SchedulerConfigBuilder};
pub use error::{ProcessResult, SchedulerError};
pub use idle::{IdleYield, TimerIdle};
pub use scheduler::{ProcessScheduler, SchedulerPhase};

pub use tokio_util::sync::CancellationToken;
