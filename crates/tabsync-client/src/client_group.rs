//! Client-group registry.
//!
//! A client group is the set of clients that share one commit history and
//! one mutator/index schema. All groups are stored as a single map behind
//! the [`CLIENT_GROUPS_HEAD`] head. Updates are validated against the
//! stored record: the schema never changes and the per-client counters
//! never move backwards.

use crate::error::{ClientError, Result};
use crate::registry::{read_map, write_map};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tabsync_dag::{ClientId, Hash, Read, Write};
use tracing::debug;

/// Head under which the client-group map is stored.
pub const CLIENT_GROUPS_HEAD: &str = "client-groups";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientGroupId(pub String);

impl ClientGroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh group id, unique across tabs.
    pub fn random() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientGroupId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    pub prefix: String,
    pub json_pointer: String,
    #[serde(default)]
    pub allow_empty: bool,
}

impl IndexDefinition {
    pub fn new(prefix: impl Into<String>, json_pointer: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            json_pointer: json_pointer.into(),
            allow_empty: false,
        }
    }
}

pub type IndexDefinitions = BTreeMap<String, IndexDefinition>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientGroup {
    /// Newest commit of the group's history.
    pub head_hash: Hash,
    /// Sorted and deduplicated.
    pub mutator_names: Vec<String>,
    pub indexes: IndexDefinitions,
    /// Highest mutation id each client has issued.
    #[serde(rename = "mutationIDs")]
    pub mutation_ids: BTreeMap<ClientId, u64>,
    /// Highest mutation id the server has acknowledged for each client.
    #[serde(rename = "lastServerAckdMutationIDs")]
    pub last_server_ackd_mutation_ids: BTreeMap<ClientId, u64>,
    #[serde(default)]
    pub disabled: bool,
}

impl ClientGroup {
    pub fn new<I, S>(head_hash: Hash, mutator_names: I, indexes: IndexDefinitions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            head_hash,
            mutator_names: normalize_mutator_names(mutator_names),
            indexes,
            mutation_ids: BTreeMap::new(),
            last_server_ackd_mutation_ids: BTreeMap::new(),
            disabled: false,
        }
    }

    /// Ack for `client`; a missing entry counts as zero.
    pub fn last_server_ackd(&self, client: &ClientId) -> u64 {
        self.last_server_ackd_mutation_ids
            .get(client)
            .copied()
            .unwrap_or(0)
    }

    /// Whether any client has issued mutations the server never acked.
    pub fn has_pending_mutations(&self) -> bool {
        self.mutation_ids
            .iter()
            .any(|(client, issued)| *issued != self.last_server_ackd(client))
    }

    /// Whether a client with this schema may join the group.
    pub fn accepts(&self, mutator_names: &[String], indexes: &IndexDefinitions) -> bool {
        !self.disabled && self.mutator_names == mutator_names && &self.indexes == indexes
    }
}

/// Sorted, deduplicated mutator names; the form stored on a group.
pub fn normalize_mutator_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names
        .into_iter()
        .map(Into::into)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub type ClientGroupMap = BTreeMap<ClientGroupId, ClientGroup>;

/// All client groups. An absent map reads as empty.
pub fn get_client_groups<R: Read>(tx: &R) -> Result<ClientGroupMap> {
    read_map(tx, CLIENT_GROUPS_HEAD)
}

/// Replace the whole map. Every group still present is validated against
/// its stored predecessor; groups missing from `groups` are deleted.
pub fn set_client_groups<W: Write>(tx: &mut W, groups: &ClientGroupMap) -> Result<()> {
    let previous = get_client_groups(tx)?;
    for (id, group) in groups {
        if let Some(old) = previous.get(id) {
            validate_update(id, old, group)?;
        }
    }
    write_map(tx, CLIENT_GROUPS_HEAD, groups)
}

/// One group, if present.
pub fn get_client_group<R: Read>(tx: &R, id: &ClientGroupId) -> Result<Option<ClientGroup>> {
    Ok(get_client_groups(tx)?.remove(id))
}

/// Like [`get_client_group`], but a missing group is an error.
pub fn assert_client_group<R: Read>(tx: &R, id: &ClientGroupId) -> Result<ClientGroup> {
    get_client_group(tx, id)?.ok_or_else(|| ClientError::ClientGroupStateNotFound(id.clone()))
}

/// Whether group `id` exists.
pub fn has_client_group<R: Read>(tx: &R, id: &ClientGroupId) -> Result<bool> {
    Ok(get_client_groups(tx)?.contains_key(id))
}

/// Insert a group, or update it after checking the change is allowed.
pub fn set_client_group<W: Write>(tx: &mut W, id: &ClientGroupId, group: ClientGroup) -> Result<()> {
    let mut groups = get_client_groups(tx)?;
    if let Some(old) = groups.get(id) {
        validate_update(id, old, &group)?;
    }
    groups.insert(id.clone(), group);
    write_map(tx, CLIENT_GROUPS_HEAD, &groups)
}

/// Returns whether the group existed.
pub fn delete_client_group<W: Write>(tx: &mut W, id: &ClientGroupId) -> Result<bool> {
    let mut groups = get_client_groups(tx)?;
    if groups.remove(id).is_none() {
        return Ok(false);
    }
    write_map(tx, CLIENT_GROUPS_HEAD, &groups)?;
    debug!(client_group_id = %id, "deleted client group");
    Ok(true)
}

/// Mark a group as unusable for new clients and local mutations. Its
/// pending mutations stay recoverable.
pub fn disable_client_group<W: Write>(tx: &mut W, id: &ClientGroupId) -> Result<()> {
    let mut group = assert_client_group(tx, id)?;
    if group.disabled {
        return Ok(());
    }
    group.disabled = true;
    set_client_group(tx, id, group)?;
    debug!(client_group_id = %id, "disabled client group");
    Ok(())
}

fn validate_update(id: &ClientGroupId, old: &ClientGroup, new: &ClientGroup) -> Result<()> {
    let invalid = |reason: String| Err(ClientError::InvalidUpdate(id.clone(), reason));

    if old.mutator_names != new.mutator_names {
        return invalid("mutator names changed".to_string());
    }
    if old.indexes != new.indexes {
        return invalid("index definitions changed".to_string());
    }
    for (client, issued) in &old.mutation_ids {
        let next = new.mutation_ids.get(client).copied().unwrap_or(0);
        if next < *issued {
            return invalid(format!("mutation id of {client} went from {issued} to {next}"));
        }
    }
    for (client, acked) in &old.last_server_ackd_mutation_ids {
        let next = new.last_server_ackd(client);
        if next < *acked {
            return invalid(format!("acked mutation id of {client} went from {acked} to {next}"));
        }
    }
    if old.disabled && !new.disabled {
        return invalid("a disabled group cannot be re-enabled".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_dag::{MemoryStore, Store};

    fn group() -> ClientGroup {
        ClientGroup::new(Hash::of(b"head"), ["put", "del", "put"], IndexDefinitions::new())
    }

    #[test]
    fn test_mutator_names_are_normalized() {
        assert_eq!(group().mutator_names, vec!["del", "put"]);
    }

    #[test]
    fn test_pending_compares_issued_with_acked() {
        let mut g = group();
        assert!(!g.has_pending_mutations());

        g.mutation_ids.insert(ClientId::new("c1"), 10);
        assert!(g.has_pending_mutations());

        g.last_server_ackd_mutation_ids.insert(ClientId::new("c1"), 10);
        assert!(!g.has_pending_mutations());

        // Acks for clients that never issued anything do not matter.
        g.last_server_ackd_mutation_ids.insert(ClientId::new("c2"), 3);
        assert!(!g.has_pending_mutations());
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new();
        let id = ClientGroupId::new("g1");
        let mut tx = store.write().await.unwrap();

        assert!(get_client_group(&tx, &id).unwrap().is_none());
        assert!(matches!(
            assert_client_group(&tx, &id),
            Err(ClientError::ClientGroupStateNotFound(_))
        ));

        set_client_group(&mut tx, &id, group()).unwrap();
        assert_eq!(assert_client_group(&tx, &id).unwrap(), group());
        assert!(has_client_group(&tx, &id).unwrap());

        assert!(delete_client_group(&mut tx, &id).unwrap());
        assert!(!delete_client_group(&mut tx, &id).unwrap());
    }

    #[tokio::test]
    async fn test_rejects_invalid_updates() {
        let store = MemoryStore::new();
        let id = ClientGroupId::new("g1");
        let mut tx = store.write().await.unwrap();

        let mut g = group();
        g.mutation_ids.insert(ClientId::new("c1"), 5);
        g.last_server_ackd_mutation_ids.insert(ClientId::new("c1"), 2);
        set_client_group(&mut tx, &id, g.clone()).unwrap();

        let mut renamed = g.clone();
        renamed.mutator_names.push("extra".to_string());
        assert!(matches!(
            set_client_group(&mut tx, &id, renamed),
            Err(ClientError::InvalidUpdate(..))
        ));

        let mut reindexed = g.clone();
        reindexed
            .indexes
            .insert("by-name".to_string(), IndexDefinition::new("user/", "/name"));
        assert!(set_client_group(&mut tx, &id, reindexed).is_err());

        let mut rewound = g.clone();
        rewound.mutation_ids.insert(ClientId::new("c1"), 4);
        assert!(set_client_group(&mut tx, &id, rewound).is_err());

        let mut unacked = g.clone();
        unacked.last_server_ackd_mutation_ids.clear();
        assert!(set_client_group(&mut tx, &id, unacked).is_err());

        // Whole-map writes go through the same checks.
        let mut map = get_client_groups(&tx).unwrap();
        map.get_mut(&id).unwrap().mutation_ids.clear();
        assert!(set_client_groups(&mut tx, &map).is_err());

        let mut advanced = g;
        advanced.mutation_ids.insert(ClientId::new("c1"), 6);
        advanced.head_hash = Hash::of(b"newer");
        set_client_group(&mut tx, &id, advanced).unwrap();
    }

    #[tokio::test]
    async fn test_disable_is_sticky() {
        let store = MemoryStore::new();
        let id = ClientGroupId::new("g1");
        let mut tx = store.write().await.unwrap();
        set_client_group(&mut tx, &id, group()).unwrap();

        disable_client_group(&mut tx, &id).unwrap();
        let disabled = assert_client_group(&tx, &id).unwrap();
        assert!(disabled.disabled);
        assert!(!disabled.accepts(&disabled.mutator_names, &disabled.indexes));

        let mut enabled = disabled;
        enabled.disabled = false;
        assert!(set_client_group(&mut tx, &id, enabled).is_err());
    }
}
