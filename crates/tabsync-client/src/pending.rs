//! Pending-mutation tracking.
//!
//! A mutation is pending while it sits on a group's local chain with an id
//! greater than the server's ack for its client. [`apply_server_ack`] moves
//! the ack forward and rebases whatever is still pending onto a new
//! snapshot.

use crate::client::{get_clients, set_clients};
use crate::client_group::{assert_client_group, set_client_group, ClientGroup, ClientGroupId};
use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tabsync_dag::{
    base_snapshot, local_mutations, put_commit, with_read, ClientId, CommitBuilder, Hash, LocalMeta,
    Read, Store, Write,
};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub id: u64,
    pub name: String,
    pub args: serde_json::Value,
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
}

impl From<&LocalMeta> for PendingMutation {
    fn from(meta: &LocalMeta) -> Self {
        Self {
            id: meta.mutation_id,
            name: meta.mutator_name.clone(),
            args: meta.mutator_args_json.clone(),
            client_id: meta.client_id.clone(),
        }
    }
}

/// Unacknowledged mutations of `group`, oldest first.
pub fn pending_mutations<R: Read>(tx: &R, group: &ClientGroup) -> Result<Vec<PendingMutation>> {
    let mut pending: Vec<PendingMutation> = local_mutations(tx, &group.head_hash)?
        .iter()
        .filter_map(|commit| commit.local())
        .filter(|meta| meta.mutation_id > group.last_server_ackd(&meta.client_id))
        .map(PendingMutation::from)
        .collect();
    pending.reverse();
    Ok(pending)
}

/// [`pending_mutations`] for a group looked up by id in its own read
/// transaction.
pub async fn pending_mutations_for_api<S>(
    store: &S,
    client_group_id: &ClientGroupId,
) -> Result<Vec<PendingMutation>>
where
    S: Store + ?Sized,
{
    with_read(store, |tx| {
        let group = assert_client_group(tx, client_group_id)?;
        pending_mutations(tx, &group)
    })
    .await
}

/// A local mutation as committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalCommit {
    pub mutation_id: u64,
    pub hash: Hash,
}

/// Append a local mutation by `client_id` to its group's chain.
pub fn commit_local_mutation<W: Write>(
    tx: &mut W,
    client_id: &ClientId,
    mutator_name: &str,
    args: serde_json::Value,
    now_ms: u64,
) -> Result<LocalCommit> {
    let mut clients = get_clients(tx)?;
    let client = clients
        .get_mut(client_id)
        .ok_or_else(|| ClientError::ClientStateNotFound(client_id.clone()))?;
    let group_id = client.client_group_id.clone();
    let mut group = assert_client_group(tx, &group_id)?;
    if group.disabled {
        return Err(ClientError::ClientGroupDisabled(group_id));
    }

    let mutation_id = group.mutation_ids.get(client_id).copied().unwrap_or(0) + 1;
    let commit = CommitBuilder::local(LocalMeta {
        client_id: client_id.clone(),
        mutation_id,
        mutator_name: mutator_name.to_string(),
        mutator_args_json: args,
        original_hash: None,
        timestamp_ms: now_ms,
    })
    .with_basis(group.head_hash)
    .build();
    let hash = put_commit(tx, &commit)?;

    group.head_hash = hash;
    group.mutation_ids.insert(client_id.clone(), mutation_id);
    set_client_group(tx, &group_id, group)?;

    client.advance_head(hash);
    set_clients(tx, &clients)?;

    debug!(
        client_id = %client_id,
        client_group_id = %group_id,
        mutation_id,
        mutator = mutator_name,
        "committed local mutation"
    );
    Ok(LocalCommit { mutation_id, hash })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckOutcome {
    /// New head of the group.
    pub head: Hash,
    /// Mutations rebased onto the new snapshot, oldest first.
    pub rebased: Vec<PendingMutation>,
}

/// Record the server's acknowledgements for `client_group_id`.
///
/// Acks only move forward: each entry becomes the max of the stored and
/// the reported value. A new snapshot carrying the merged acks becomes the
/// base of the chain and every still-pending local commit is replayed onto
/// it, keeping a link to the commit it was first written as.
pub fn apply_server_ack<W: Write>(
    tx: &mut W,
    client_group_id: &ClientGroupId,
    last_mutation_ids: &BTreeMap<ClientId, u64>,
    cookie: serde_json::Value,
) -> Result<AckOutcome> {
    let mut group = assert_client_group(tx, client_group_id)?;

    let mut acked = group.last_server_ackd_mutation_ids.clone();
    for (client, id) in last_mutation_ids {
        let entry = acked.entry(client.clone()).or_insert(0);
        *entry = (*entry).max(*id);
    }

    let locals = local_mutations(tx, &group.head_hash)?;
    let base = base_snapshot(tx, &group.head_hash)?;
    let snapshot = CommitBuilder::snapshot(acked.clone(), cookie)
        .with_basis(base.hash())
        .with_value_hash(base.value_hash())
        .build();
    let mut head = put_commit(tx, &snapshot)?;

    let mut rebased = Vec::new();
    for commit in locals.iter().rev() {
        let Some(meta) = commit.local() else { continue };
        let ack = acked.get(&meta.client_id).copied().unwrap_or(0);
        if meta.mutation_id <= ack {
            continue;
        }
        let replayed = CommitBuilder::local(LocalMeta {
            original_hash: Some(meta.original_hash.unwrap_or_else(|| commit.hash())),
            ..meta.clone()
        })
        .with_basis(head)
        .with_value_hash(commit.value_hash())
        .build();
        head = put_commit(tx, &replayed)?;
        rebased.push(PendingMutation::from(meta));
    }

    let previous_head = group.head_hash;
    group.head_hash = head;
    group.last_server_ackd_mutation_ids = acked;
    set_client_group(tx, client_group_id, group)?;

    let mut clients = get_clients(tx)?;
    let mut moved = false;
    for client in clients.values_mut() {
        if client.client_group_id == *client_group_id && client.refs.hashes().contains(&previous_head)
        {
            client.advance_head(head);
            moved = true;
        }
    }
    if moved {
        set_clients(tx, &clients)?;
    }

    debug!(
        client_group_id = %client_group_id,
        rebased = rebased.len(),
        "applied server ack"
    );
    Ok(AckOutcome { head, rebased })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::assert_client;
    use crate::client_group::IndexDefinitions;
    use crate::register::register_client;
    use serde_json::json;
    use tabsync_dag::{read_commit, MemoryStore};

    async fn setup(store: &MemoryStore) -> ClientGroupId {
        let mut tx = store.write().await.unwrap();
        let reg = register_client(&mut tx, &"c1".into(), ["inc"], IndexDefinitions::new(), 0).unwrap();
        register_client(&mut tx, &"c2".into(), ["inc"], IndexDefinitions::new(), 0).unwrap();
        tx.commit().await.unwrap();
        reg.client.client_group_id
    }

    #[tokio::test]
    async fn test_pending_is_oldest_first() {
        let store = MemoryStore::new();
        let group_id = setup(&store).await;

        let mut tx = store.write().await.unwrap();
        for (client, n) in [("c1", 1), ("c2", 2), ("c1", 3)] {
            commit_local_mutation(&mut tx, &client.into(), "inc", json!(n), n).unwrap();
        }
        tx.commit().await.unwrap();

        let pending = pending_mutations_for_api(&store, &group_id).await.unwrap();
        let seen: Vec<_> = pending
            .iter()
            .map(|m| (m.client_id.as_str(), m.id, m.args.clone()))
            .collect();
        assert_eq!(
            seen,
            vec![("c1", 1, json!(1)), ("c2", 1, json!(2)), ("c1", 2, json!(3))]
        );
    }

    #[tokio::test]
    async fn test_local_commit_advances_group_and_client() {
        let store = MemoryStore::new();
        let group_id = setup(&store).await;

        let mut tx = store.write().await.unwrap();
        let first = commit_local_mutation(&mut tx, &"c1".into(), "inc", json!(1), 5).unwrap();
        let second = commit_local_mutation(&mut tx, &"c1".into(), "inc", json!(2), 6).unwrap();
        assert_eq!((first.mutation_id, second.mutation_id), (1, 2));

        let group = assert_client_group(&tx, &group_id).unwrap();
        assert_eq!(group.head_hash, second.hash);
        assert_eq!(group.mutation_ids[&ClientId::new("c1")], 2);
        let client = assert_client(&tx, &"c1".into()).unwrap();
        assert_eq!(client.refs.hashes(), vec![second.hash]);
        assert_eq!(read_commit(&tx, &second.hash).unwrap().basis(), Some(first.hash));
    }

    #[tokio::test]
    async fn test_unknown_client_cannot_commit() {
        let store = MemoryStore::new();
        setup(&store).await;
        let mut tx = store.write().await.unwrap();
        assert!(matches!(
            commit_local_mutation(&mut tx, &"ghost".into(), "inc", json!(0), 0),
            Err(ClientError::ClientStateNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ack_rebases_remaining_mutations() {
        let store = MemoryStore::new();
        let group_id = setup(&store).await;

        let mut tx = store.write().await.unwrap();
        let c1: ClientId = "c1".into();
        commit_local_mutation(&mut tx, &c1, "inc", json!(1), 1).unwrap();
        let second = commit_local_mutation(&mut tx, &c1, "inc", json!(2), 2).unwrap();

        let acks = BTreeMap::from([(c1.clone(), 1)]);
        let outcome = apply_server_ack(&mut tx, &group_id, &acks, json!("cookie-1")).unwrap();
        assert_eq!(outcome.rebased.len(), 1);
        assert_eq!(outcome.rebased[0].id, 2);

        let head = read_commit(&tx, &outcome.head).unwrap();
        let meta = head.local().unwrap();
        assert_eq!(meta.mutation_id, 2);
        assert_eq!(meta.original_hash, Some(second.hash));
        assert_ne!(outcome.head, second.hash);
        let base = read_commit(&tx, &head.basis().unwrap()).unwrap();
        assert!(base.is_snapshot());

        let group = assert_client_group(&tx, &group_id).unwrap();
        assert_eq!(group.last_server_ackd(&c1), 1);
        assert!(group.has_pending_mutations());
        let pending = pending_mutations(&tx, &group).unwrap();
        assert_eq!(pending.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(assert_client(&tx, &c1).unwrap().refs.hashes(), vec![outcome.head]);

        // A stale ack does not move anything backwards.
        let stale = BTreeMap::from([(c1.clone(), 0)]);
        let outcome = apply_server_ack(&mut tx, &group_id, &stale, json!(null)).unwrap();
        assert_eq!(outcome.rebased.len(), 1);
        let rebased_twice = read_commit(&tx, &outcome.head).unwrap();
        assert_eq!(rebased_twice.local().unwrap().original_hash, Some(second.hash));

        let full = BTreeMap::from([(c1.clone(), 2)]);
        let outcome = apply_server_ack(&mut tx, &group_id, &full, json!(null)).unwrap();
        assert!(outcome.rebased.is_empty());
        let group = assert_client_group(&tx, &group_id).unwrap();
        assert!(!group.has_pending_mutations());
        assert!(pending_mutations(&tx, &group).unwrap().is_empty());
    }
}
