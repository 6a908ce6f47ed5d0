//! Error types for client and client-group state.

use crate::client_group::ClientGroupId;
use tabsync_dag::{ClientId, DagError, StoreError};
use thiserror::Error;

/// Errors raised by the registries and the loops built on them.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The client's record is gone, usually removed by a concurrent GC in
    /// another tab. Terminal: the client has to register again.
    #[error("client state not found: {0}")]
    ClientStateNotFound(ClientId),

    #[error("client group state not found: {0}")]
    ClientGroupStateNotFound(ClientGroupId),

    #[error("client group {0} is disabled")]
    ClientGroupDisabled(ClientGroupId),

    #[error("client {0} is already registered")]
    AlreadyRegistered(ClientId),

    #[error("invalid update of client group {0}: {1}")]
    InvalidUpdate(ClientGroupId, String),

    /// The owning loop was cancelled while this pass waited on the store.
    /// Nothing was written.
    #[error("cancelled before writing")]
    Cancelled,

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ClientError {
    /// Whether the pass was abandoned by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    /// Whether this is one of the "state not found" conditions that loops
    /// translate into a terminal callback.
    pub fn is_state_not_found(&self) -> bool {
        matches!(
            self,
            ClientError::ClientStateNotFound(_) | ClientError::ClientGroupStateNotFound(_)
        )
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
