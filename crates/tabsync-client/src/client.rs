//! Client registry.
//!
//! Every live tab owns one [`Client`] record. Records are stored as a
//! single map behind the [`CLIENTS_HEAD`] head and are removed either by
//! explicit unregistration or by client GC in any tab.

use crate::client_group::ClientGroupId;
use crate::error::{ClientError, Result};
use crate::registry::{read_map, write_map};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tabsync_dag::{ClientId, Hash, Read, Write};

/// Head under which the client map is stored.
pub const CLIENTS_HEAD: &str = "clients";

/// Commit references a client keeps alive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientRefs {
    /// Refresh-capable client: a list of heads plus an optional persisted hash.
    #[serde(rename_all = "camelCase")]
    Refresh {
        refresh_hashes: Vec<Hash>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persist_hash: Option<Hash>,
    },
    /// Single-head client.
    #[serde(rename_all = "camelCase")]
    Head {
        head_hash: Hash,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_refresh_hash: Option<Hash>,
    },
}

impl ClientRefs {
    pub fn head(head_hash: Hash) -> Self {
        ClientRefs::Head {
            head_hash,
            temp_refresh_hash: None,
        }
    }

    /// Every commit hash referenced.
    pub fn hashes(&self) -> Vec<Hash> {
        match self {
            ClientRefs::Refresh {
                refresh_hashes,
                persist_hash,
            } => refresh_hashes.iter().copied().chain(*persist_hash).collect(),
            ClientRefs::Head {
                head_hash,
                temp_refresh_hash,
            } => std::iter::once(*head_hash).chain(*temp_refresh_hash).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    /// Wall-clock time of the latest heartbeat, in ms since the epoch.
    pub heartbeat_timestamp_ms: u64,
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
    #[serde(flatten)]
    pub refs: ClientRefs,
}

impl Client {
    pub fn new(client_group_id: ClientGroupId, head_hash: Hash, now_ms: u64) -> Self {
        Self {
            heartbeat_timestamp_ms: now_ms,
            client_group_id,
            refs: ClientRefs::head(head_hash),
        }
    }

    /// Point a single-head client at a new head. Refresh clients are left as is.
    pub fn advance_head(&mut self, hash: Hash) {
        if let ClientRefs::Head { head_hash, .. } = &mut self.refs {
            *head_hash = hash;
        }
    }
}

pub type ClientMap = BTreeMap<ClientId, Client>;

/// All client records. An absent map reads as empty.
pub fn get_clients<R: Read>(tx: &R) -> Result<ClientMap> {
    read_map(tx, CLIENTS_HEAD)
}

/// Replace the whole client map.
pub fn set_clients<W: Write>(tx: &mut W, clients: &ClientMap) -> Result<()> {
    write_map(tx, CLIENTS_HEAD, clients)
}

/// One client record, if present.
pub fn get_client<R: Read>(tx: &R, id: &ClientId) -> Result<Option<Client>> {
    Ok(get_clients(tx)?.remove(id))
}

/// Like [`get_client`], but a missing record is [`ClientError::ClientStateNotFound`].
pub fn assert_client<R: Read>(tx: &R, id: &ClientId) -> Result<Client> {
    get_client(tx, id)?.ok_or_else(|| ClientError::ClientStateNotFound(id.clone()))
}

/// Whether a record for `id` exists.
pub fn has_client_state<R: Read>(tx: &R, id: &ClientId) -> Result<bool> {
    Ok(get_clients(tx)?.contains_key(id))
}

/// Insert or overwrite one record.
pub fn set_client<W: Write>(tx: &mut W, id: &ClientId, client: Client) -> Result<()> {
    let mut clients = get_clients(tx)?;
    clients.insert(id.clone(), client);
    set_clients(tx, &clients)
}

/// Remove and return the record, if present.
pub fn delete_client<W: Write>(tx: &mut W, id: &ClientId) -> Result<Option<Client>> {
    let mut clients = get_clients(tx)?;
    let removed = clients.remove(id);
    if removed.is_some() {
        set_clients(tx, &clients)?;
    }
    Ok(removed)
}

/// Update the heartbeat of an existing client. Never creates a record.
pub fn touch_client<W: Write>(tx: &mut W, id: &ClientId, now_ms: u64) -> Result<Client> {
    let mut clients = get_clients(tx)?;
    let client = clients
        .get_mut(id)
        .ok_or_else(|| ClientError::ClientStateNotFound(id.clone()))?;
    client.heartbeat_timestamp_ms = now_ms;
    let updated = client.clone();
    set_clients(tx, &clients)?;
    Ok(updated)
}
