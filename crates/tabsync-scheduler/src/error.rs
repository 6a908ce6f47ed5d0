//! Scheduler error type.

use std::sync::Arc;

/// Outcome delivered to every caller waiting on one execution.
pub type ProcessResult<E> = Result<(), SchedulerError<E>>;

/// Why a scheduled or immediate run did not complete successfully.
///
/// The process error is shared behind an [`Arc`] because a single execution
/// settles every debounced caller with the same value.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError<E> {
    /// The scheduler's cancellation token fired before this call settled.
    #[error("scheduler cancelled")]
    Cancelled,

    #[error("process failed: {0}")]
    Process(Arc<E>),
}

impl<E> SchedulerError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SchedulerError::Cancelled)
    }

    /// The process error, unless the call was cancelled.
    pub fn process_error(&self) -> Option<&E> {
        match self {
            SchedulerError::Process(e) => Some(e),
            SchedulerError::Cancelled => None,
        }
    }
}

impl<E> Clone for SchedulerError<E> {
    fn clone(&self) -> Self {
        match self {
            SchedulerError::Cancelled => SchedulerError::Cancelled,
            SchedulerError::Process(e) => SchedulerError::Process(Arc::clone(e)),
        }
    }
}

impl<E> PartialEq for SchedulerError<E> {
    /// Process errors compare by identity: equal only when produced by the
    /// same execution.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SchedulerError::Cancelled, SchedulerError::Cancelled) => true,
            (SchedulerError::Process(a), SchedulerError::Process(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
