use async_stream::stream;
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabsync_client::{
    apply_server_ack, collect_client_groups, commit_local_mutation, get_client_groups,
    get_clients, pending_mutations_for_api, register_client, unregister_client, ClientError,
    ClientGc, ClientGcConfig, ClientGroupGc, ClientGroupId, Clock, GcConfig, HeartbeatConfig,
    HeartbeatLoop, IndexDefinitions, MutationPusher, MutationRecovery, PushError, PushRequest,
    PushResponse, RecoveryConfig, SystemClock,
};
use tabsync_dag::{with_read, with_write, ClientId, MemoryStore, MemoryStoreStats};
use tabsync_scheduler::CancellationToken;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tracing::{debug, info};

/// Two schemas, so tabs spread over more than one client group.
const SCHEMAS: [&[&str]; 2] = [&["addTodo", "removeTodo"], &["addTodo", "removeTodo", "archive"]];

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub tabs: usize,
    pub events: usize,
    pub step: Duration,
    pub heartbeat_ms: u64,
    pub max_inactive_ms: u64,
    pub gc_interval_ms: u64,
    pub crash_ratio: f64,
    pub enable_mutation_recovery: bool,
    pub seed: u64,
}

/// Statistics collected during a simulation run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub tabs_opened: usize,
    pub tabs_closed: usize,
    pub tabs_crashed: usize,
    pub mutations: usize,
    pub mutations_acked: usize,
    pub mutations_recovered: usize,
    pub groups_recovered: usize,
    pub clients_deleted: usize,
    pub groups_removed: usize,
    pub state_lost: usize,
    pub final_clients: usize,
    pub final_groups: usize,
    pub store: MemoryStoreStats,
    pub total_time: Duration,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Simulation Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Tabs opened:               {:>30} ║", self.tabs_opened);
        println!("║  Tabs closed / crashed:     {:>30} ║", format!("{} / {}", self.tabs_closed, self.tabs_crashed));
        println!("║  Local mutations:           {:>30} ║", self.mutations);
        println!("║  Acked by own tab:          {:>30} ║", self.mutations_acked);
        println!("║  Recovered from other tabs: {:>30} ║", format!("{} in {} groups", self.mutations_recovered, self.groups_recovered));
        println!("║  Clients deleted by GC:     {:>30} ║", self.clients_deleted);
        println!("║  Client groups removed:     {:>30} ║", self.groups_removed);
        println!("║  Tabs that lost state:      {:>30} ║", self.state_lost);
        println!("║  Remaining clients/groups:  {:>30} ║", format!("{} / {}", self.final_clients, self.final_groups));
        println!("║  Chunks / heads / bytes:    {:>30} ║", format!("{} / {} / {}", self.store.chunk_count, self.store.head_count, self.store.total_bytes));
        println!("║  Total time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    crashed: AtomicUsize,
    mutations: AtomicUsize,
    acked: AtomicUsize,
    recovered: AtomicUsize,
    clients_deleted: AtomicUsize,
    groups_removed: AtomicUsize,
    state_lost: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize, by: usize) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Stand-in server that accepts every pushed mutation.
#[derive(Default)]
struct AcceptAllServer {
    pushed: AtomicUsize,
}

#[async_trait]
impl MutationPusher for AcceptAllServer {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, PushError> {
        self.pushed.fetch_add(request.mutations.len(), Ordering::Relaxed);
        let mut response = PushResponse::default();
        for m in &request.mutations {
            let entry = response.last_mutation_ids.entry(m.client_id.clone()).or_insert(0);
            *entry = (*entry).max(m.id);
        }
        Ok(response)
    }
}

#[derive(Clone, Copy, Debug)]
enum TabEvent {
    Mutate(usize),
    Ack(usize),
    Close { slot: usize, crash: bool },
}

/// Generator of random tab activity over `slots` tab positions
fn tab_events(slots: usize, count: usize, crash_ratio: f64, seed: u64) -> impl Stream<Item = TabEvent> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..count {
            let slot = rng.gen_range(0..slots);
            let roll: f64 = rng.gen();
            yield if roll < 0.7 {
                TabEvent::Mutate(slot)
            } else if roll < 0.85 {
                TabEvent::Ack(slot)
            } else {
                TabEvent::Close { slot, crash: rng.gen_bool(crash_ratio) }
            };
        }
    }
}

struct Shared {
    store: Arc<MemoryStore>,
    clock: Arc<dyn Clock>,
    server: Arc<AcceptAllServer>,
    counters: Arc<Counters>,
    config: SimulationConfig,
}

/// One simulated tab with all of its background loops.
struct Tab {
    id: ClientId,
    group: ClientGroupId,
    cancel: CancellationToken,
    _heartbeat: HeartbeatLoop,
    _client_gc: ClientGc,
    _group_gc: ClientGroupGc,
    _recovery: MutationRecovery,
}

impl Tab {
    async fn open(shared: &Shared, slot: usize) -> Result<Tab, ClientError> {
        let id = ClientId::random();
        let now = shared.clock.now_ms();
        let schema = SCHEMAS[slot % SCHEMAS.len()];
        let registration = with_write(shared.store.as_ref(), |tx| {
            register_client(tx, &id, schema.iter().copied(), IndexDefinitions::new(), now)
        })
        .await?;
        let group = registration.client.client_group_id;
        let cancel = CancellationToken::new();
        let counters = &shared.counters;
        let config = &shared.config;

        let heartbeat = {
            let counters = Arc::clone(counters);
            HeartbeatLoop::start(
                id.clone(),
                Arc::clone(&shared.store),
                Arc::clone(&shared.clock),
                HeartbeatConfig::default().with_interval(config.heartbeat_ms),
                Arc::new(move |_: &ClientId| Counters::bump(&counters.state_lost, 1)),
                cancel.clone(),
            )
        };

        let client_gc = {
            let counters = Arc::clone(counters);
            ClientGc::start(
                id.clone(),
                Arc::clone(&shared.store),
                Arc::clone(&shared.clock),
                ClientGcConfig::default()
                    .with_interval(config.gc_interval_ms)
                    .with_max_inactive(config.max_inactive_ms),
                Arc::new(move |ids: &[ClientId]| Counters::bump(&counters.clients_deleted, ids.len())),
                cancel.clone(),
            )
        };

        let group_gc = ClientGroupGc::start(
            Arc::clone(&shared.store),
            GcConfig::default()
                .with_interval(config.gc_interval_ms)
                .with_idle_timeout(config.gc_interval_ms / 4)
                .with_mutation_recovery(config.enable_mutation_recovery),
            cancel.clone(),
        );
        let mut outcomes = group_gc.subscribe();
        let removed = Arc::clone(counters);
        tokio::spawn(async move {
            loop {
                match outcomes.recv().await {
                    Ok(outcome) => Counters::bump(&removed.groups_removed, outcome.removed.len()),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let recovery = MutationRecovery::start(
            Arc::clone(&shared.store),
            Some(group.clone()),
            Arc::clone(&shared.server),
            RecoveryConfig::default()
                .with_throttle(config.gc_interval_ms)
                .with_interval(config.gc_interval_ms),
            cancel.clone(),
        );
        let mut outcomes = recovery.subscribe();
        let recovered = Arc::clone(counters);
        tokio::spawn(async move {
            loop {
                match outcomes.recv().await {
                    Ok(outcome) => Counters::bump(&recovered.recovered, outcome.recovered.len()),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
        // A fresh tab looks for leftovers right away.
        tokio::spawn(recovery.recover());

        Counters::bump(&counters.opened, 1);
        debug!(client_id = %id, client_group_id = %group, slot, "tab opened");
        Ok(Tab {
            id,
            group,
            cancel,
            _heartbeat: heartbeat,
            _client_gc: client_gc,
            _group_gc: group_gc,
            _recovery: recovery,
        })
    }

    async fn mutate(&self, shared: &Shared, n: usize) -> Result<(), ClientError> {
        let now = shared.clock.now_ms();
        let args = serde_json::json!({ "id": n, "title": format!("todo {n}") });
        with_write(shared.store.as_ref(), |tx| {
            commit_local_mutation(tx, &self.id, "addTodo", args, now)
        })
        .await?;
        Counters::bump(&shared.counters.mutations, 1);
        Ok(())
    }

    /// Push this tab's own pending mutations and apply the response.
    async fn push(&self, shared: &Shared) -> Result<(), ClientError> {
        let mutations = pending_mutations_for_api(shared.store.as_ref(), &self.group).await?;
        if mutations.is_empty() {
            return Ok(());
        }
        let count = mutations.len();
        let request = PushRequest {
            client_group_id: self.group.clone(),
            mutations,
        };
        let Ok(response) = shared.server.push(request).await else {
            return Ok(());
        };
        with_write(shared.store.as_ref(), |tx| {
            apply_server_ack(
                tx,
                &self.group,
                &response.last_mutation_ids,
                serde_json::Value::Null,
            )
        })
        .await?;
        Counters::bump(&shared.counters.acked, count);
        Ok(())
    }

    /// A crash leaves the client record behind for client GC to find.
    async fn close(self, shared: &Shared, crash: bool) -> Result<(), ClientError> {
        self.cancel.cancel();
        if crash {
            Counters::bump(&shared.counters.crashed, 1);
        } else {
            with_write(shared.store.as_ref(), |tx| unregister_client(tx, &self.id)).await?;
            Counters::bump(&shared.counters.closed, 1);
        }
        debug!(client_id = %self.id, crash, "tab closed");
        Ok(())
    }
}

/// Drive random tab activity against one shared store, then let the
/// background loops converge.
pub async fn run_simulation(config: SimulationConfig) -> Result<SimulationStats, ClientError> {
    info!(
        tabs = config.tabs,
        events = config.events,
        seed = config.seed,
        mutation_recovery = config.enable_mutation_recovery,
        "starting simulation"
    );
    let start = Instant::now();
    let shared = Shared {
        store: Arc::new(MemoryStore::new()),
        clock: Arc::new(SystemClock),
        server: Arc::new(AcceptAllServer::default()),
        counters: Arc::new(Counters::default()),
        config: config.clone(),
    };

    let mut slots: Vec<Option<Tab>> = (0..config.tabs).map(|_| None).collect();
    let mut events = Box::pin(tab_events(
        config.tabs,
        config.events,
        config.crash_ratio,
        config.seed,
    ));

    let mut n = 0;
    while let Some(event) = events.next().await {
        n += 1;
        match event {
            TabEvent::Mutate(slot) => {
                if slots[slot].is_none() {
                    slots[slot] = Some(Tab::open(&shared, slot).await?);
                }
                if let Some(tab) = &slots[slot] {
                    match tab.mutate(&shared, n).await {
                        Ok(()) => {}
                        // Client GC in another tab got here first.
                        Err(err) if err.is_state_not_found() => {
                            if let Some(tab) = slots[slot].take() {
                                tab.close(&shared, true).await?;
                            }
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            TabEvent::Ack(slot) => {
                if let Some(tab) = &slots[slot] {
                    tab.push(&shared).await?;
                }
            }
            TabEvent::Close { slot, crash } => {
                if let Some(tab) = slots[slot].take() {
                    tab.close(&shared, crash).await?;
                }
            }
        }

        if n % 50 == 0 {
            println!("  Events processed: {}/{}", n, config.events);
        }
        sleep(config.step).await;
    }

    // Long enough for crashed clients to age out and be collected, then
    // for their groups to be recovered and reclaimed.
    let settle = Duration::from_millis(config.max_inactive_ms + 3 * config.gc_interval_ms);
    println!("  Settling for {:.1}s...", settle.as_secs_f64());
    sleep(settle).await;

    for tab in slots.into_iter().flatten() {
        tab.close(&shared, false).await?;
    }
    let last_pass =
        collect_client_groups(shared.store.as_ref(), config.enable_mutation_recovery).await?;
    Counters::bump(&shared.counters.groups_removed, last_pass.removed.len());

    let (final_clients, final_groups) = with_read(shared.store.as_ref(), |tx| {
        Ok::<_, ClientError>((get_clients(tx)?.len(), get_client_groups(tx)?.len()))
    })
    .await?;

    let counters = &shared.counters;
    let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
    Ok(SimulationStats {
        tabs_opened: load(&counters.opened),
        tabs_closed: load(&counters.closed),
        tabs_crashed: load(&counters.crashed),
        mutations: load(&counters.mutations),
        mutations_acked: load(&counters.acked),
        mutations_recovered: shared
            .server
            .pushed
            .load(Ordering::Relaxed)
            .saturating_sub(load(&counters.acked)),
        groups_recovered: load(&counters.recovered),
        clients_deleted: load(&counters.clients_deleted),
        groups_removed: load(&counters.groups_removed),
        state_lost: load(&counters.state_lost),
        final_clients,
        final_groups,
        store: shared.store.stats().await,
        total_time: start.elapsed(),
    })
}
