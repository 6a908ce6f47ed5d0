//! # tabsync-client
//!
//! Per-client coordination on top of a shared [`tabsync_dag::Store`].
//!
//! Every tab registers a [`Client`] in a [`ClientGroup`], keeps its record
//! alive with a [`HeartbeatLoop`], and helps reclaim what abandoned tabs
//! left behind:
//!
//! - [`ClientGc`] deletes clients whose heartbeat is too old
//! - [`ClientGroupGc`] deletes groups nobody references, keeping those with
//!   unacknowledged mutations unless told otherwise
//! - [`MutationRecovery`] pushes other groups' pending mutations through a
//!   [`MutationPusher`] and records the acks
//!
//! All loops are driven by a [`tabsync_scheduler::ProcessScheduler`] and
//! stop when their [`CancellationToken`](tabsync_scheduler::CancellationToken)
//! fires.
//!
//! ## Example
//!
//! ```rust
//! use tabsync_client::{pending_mutations_for_api, register_client, commit_local_mutation, IndexDefinitions};
//! use tabsync_dag::{with_write, ClientId, MemoryStore};
//!
//! # tokio_test::block_on(async {
//! let store = MemoryStore::new();
//! let me = ClientId::new("tab-1");
//!
//! let group = with_write(&store, |tx| {
//!     let reg = register_client(tx, &me, ["add"], IndexDefinitions::new(), 0)?;
//!     commit_local_mutation(tx, &me, "add", serde_json::json!({ "n": 1 }), 0)?;
//!     Ok::<_, tabsync_client::ClientError>(reg.client.client_group_id)
//! })
//! .await
//! .unwrap();
//!
//! let pending = pending_mutations_for_api(&store, &group).await.unwrap();
//! assert_eq!(pending.len(), 1);
//! # });
//! ```

mod client;
mod client_gc;
mod client_group;
mod clock;
mod error;
mod gc;
mod heartbeat;
mod pending;
mod periodic;
mod recovery;
mod register;
mod registry;

pub use client::{
    assert_client, delete_client, get_client, get_clients, has_client_state, set_client,
    set_clients, touch_client, Client, ClientMap, ClientRefs, CLIENTS_HEAD,
};
pub use client_gc::{
    gc_clients, ClientGc, ClientGcConfig, ClientsDeletedCallback, CLIENT_GC_INTERVAL_MS,
    CLIENT_MAX_INACTIVE_MS,
};
pub use client_group::{
    assert_client_group, delete_client_group, disable_client_group, get_client_group,
    get_client_groups, has_client_group, normalize_mutator_names, set_client_group,
    set_client_groups, ClientGroup, ClientGroupId, ClientGroupMap, IndexDefinition,
    IndexDefinitions, CLIENT_GROUPS_HEAD,
};
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use error::{ClientError, Result};
pub use gc::{
    collect_client_groups, gc_client_groups, should_retain, ClientGroupGc, GcConfig, GcOutcome,
    GC_INTERVAL_MS,
};
pub use heartbeat::{
    write_heartbeat, HeartbeatConfig, HeartbeatEvent, HeartbeatLoop, StateNotFoundCallback,
    HEARTBEAT_INTERVAL_MS,
};
pub use pending::{
    apply_server_ack, commit_local_mutation, pending_mutations, pending_mutations_for_api,
    AckOutcome, LocalCommit, PendingMutation,
};
pub use recovery::{
    record_acks, recover_mutations, MutationPusher, MutationRecovery, PushError, PushRequest,
    PushResponse, RecoveryConfig, RecoveryOutcome,
};
pub use register::{register_client, unregister_client, Registration};
