//! Pending mutations, server acks and mutation recovery.

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tabsync_client::{
    apply_server_ack, collect_client_groups, commit_local_mutation, pending_mutations_for_api,
    recover_mutations, register_client, unregister_client, ClientGroupId, IndexDefinitions,
    MutationPusher, MutationRecovery, PushError, PushRequest, PushResponse, RecoveryConfig,
};
use tabsync_dag::{with_write, ClientId, MemoryStore};
use tabsync_scheduler::CancellationToken;

async fn register(store: &MemoryStore, id: &str, mutators: &[&str]) -> ClientGroupId {
    let id = ClientId::new(id);
    with_write(store, |tx| {
        register_client(tx, &id, mutators.iter().copied(), IndexDefinitions::new(), 0)
    })
    .await
    .unwrap()
    .client
    .client_group_id
}

async fn mutate(store: &MemoryStore, client: &str, name: &str, args: serde_json::Value) -> u64 {
    let client = ClientId::new(client);
    with_write(store, |tx| commit_local_mutation(tx, &client, name, args, 0))
        .await
        .unwrap()
        .mutation_id
}

#[tokio::test]
async fn test_pending_mutations_are_ascending() {
    let store = MemoryStore::new();
    let group = register(&store, "c1", &["add", "remove"]).await;

    mutate(&store, "c1", "add", json!({ "key": "a" })).await;
    mutate(&store, "c1", "add", json!({ "key": "b" })).await;
    mutate(&store, "c1", "remove", json!({ "key": "a" })).await;
    mutate(&store, "c1", "add", json!({ "key": "c" })).await;

    let pending = pending_mutations_for_api(&store, &group).await.unwrap();
    let ids: Vec<_> = pending.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(pending[2].name, "remove");
    assert_eq!(pending[2].args, json!({ "key": "a" }));
    assert!(pending.iter().all(|m| m.client_id == ClientId::new("c1")));
}

#[tokio::test]
async fn test_unknown_group_is_state_not_found() {
    let store = MemoryStore::new();
    let err = pending_mutations_for_api(&store, &ClientGroupId::new("nope"))
        .await
        .unwrap_err();
    assert!(err.is_state_not_found());
}

proptest! {
    #[test]
    fn prop_pending_follows_commit_order_above_ack(
        writers in proptest::collection::vec(0usize..3, 1..12),
        ack in 0u64..6,
    ) {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let clients = ["a", "b", "c"];
            let mut group = None;
            for name in clients {
                group = Some(register(&store, name, &["m"]).await);
            }
            let group = group.unwrap();

            let mut expected = Vec::new();
            for (n, writer) in writers.iter().enumerate() {
                let id = mutate(&store, clients[*writer], "m", json!(n)).await;
                expected.push((ClientId::new(clients[*writer]), id, json!(n)));
            }

            let acks: BTreeMap<ClientId, u64> =
                clients.iter().map(|c| (ClientId::new(*c), ack)).collect();
            with_write(&store, |tx| apply_server_ack(tx, &group, &acks, json!(null)))
                .await
                .unwrap();
            expected.retain(|(_, id, _)| *id > ack);

            let pending = pending_mutations_for_api(&store, &group).await.unwrap();
            let seen: Vec<_> = pending
                .into_iter()
                .map(|m| (m.client_id, m.id, m.args))
                .collect();
            assert_eq!(seen, expected);
        });
    }
}

/// Acks everything it receives, or fails every push.
#[derive(Default)]
struct FakeServer {
    offline: bool,
    pushes: Mutex<Vec<PushRequest>>,
}

#[async_trait]
impl MutationPusher for FakeServer {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, PushError> {
        self.pushes.lock().push(request.clone());
        if self.offline {
            return Err(PushError::Unreachable("offline".to_string()));
        }
        let mut last_mutation_ids = BTreeMap::new();
        for m in &request.mutations {
            let entry = last_mutation_ids.entry(m.client_id.clone()).or_insert(0);
            *entry = m.id.max(*entry);
        }
        Ok(PushResponse { last_mutation_ids })
    }
}

/// A closed tab "old" left two unpushed mutations in its own group; the
/// surviving tab "new" uses a different schema and therefore another group.
async fn abandoned_group(store: &MemoryStore) -> (ClientGroupId, ClientGroupId) {
    let old_group = register(store, "old", &["add"]).await;
    mutate(store, "old", "add", json!(1)).await;
    mutate(store, "old", "add", json!(2)).await;
    with_write(store, |tx| unregister_client(tx, &ClientId::new("old")))
        .await
        .unwrap();
    let own_group = register(store, "new", &["add", "clear"]).await;
    (old_group, own_group)
}

#[tokio::test]
async fn test_recovery_pushes_other_groups_then_gc_reclaims() {
    let store = MemoryStore::new();
    let (old_group, own_group) = abandoned_group(&store).await;
    let server = FakeServer::default();

    // Pending mutations keep the orphaned group alive.
    let outcome = collect_client_groups(&store, true).await.unwrap();
    assert!(outcome.retained.contains(&old_group));

    let recovered = recover_mutations(&store, Some(&own_group), &server).await.unwrap();
    assert_eq!(recovered.recovered, vec![old_group.clone()]);
    assert!(recovered.failed.is_empty());

    let pushes = server.pushes.lock().clone();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].client_group_id, old_group);
    assert_eq!(pushes[0].mutations.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);

    assert!(pending_mutations_for_api(&store, &old_group).await.unwrap().is_empty());
    let outcome = collect_client_groups(&store, true).await.unwrap();
    assert_eq!(outcome.removed, vec![old_group]);
    assert_eq!(outcome.retained, vec![own_group]);
}

#[tokio::test]
async fn test_failed_push_keeps_mutations() {
    let store = MemoryStore::new();
    let (old_group, own_group) = abandoned_group(&store).await;
    let server = FakeServer {
        offline: true,
        ..FakeServer::default()
    };

    let outcome = recover_mutations(&store, Some(&own_group), &server).await.unwrap();
    assert!(outcome.recovered.is_empty());
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, old_group);

    assert_eq!(pending_mutations_for_api(&store, &old_group).await.unwrap().len(), 2);
    let gc = collect_client_groups(&store, true).await.unwrap();
    assert!(gc.retained.contains(&old_group));
}

#[tokio::test]
async fn test_own_group_is_not_recovered() {
    let store = MemoryStore::new();
    let own_group = register(&store, "me", &["add"]).await;
    mutate(&store, "me", "add", json!(1)).await;
    let server = FakeServer::default();

    let outcome = recover_mutations(&store, Some(&own_group), &server).await.unwrap();
    assert!(outcome.recovered.is_empty());
    assert!(server.pushes.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_background_recovery_on_demand() {
    let store = Arc::new(MemoryStore::new());
    let (old_group, own_group) = abandoned_group(&store).await;
    let server = Arc::new(FakeServer::default());

    let recovery = MutationRecovery::start(
        Arc::clone(&store),
        Some(own_group),
        Arc::clone(&server),
        RecoveryConfig::default(),
        CancellationToken::new(),
    );
    let mut outcomes = recovery.subscribe();

    let (a, b) = tokio::join!(recovery.recover(), recovery.recover());
    a.unwrap();
    b.unwrap();
    assert_eq!(server.pushes.lock().len(), 1);

    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.recovered, vec![old_group]);
}
