//! # tabsync
//!
//! Command-line driver for the tabsync workspace.
//!
//! - `simulate` opens, mutates and closes (or crashes) random tabs against
//!   one shared in-memory store while every tab runs its heartbeat, client
//!   GC, client-group GC and mutation recovery loops.
//! - `scenarios` walks through the heartbeat and client-group GC rules
//!   step by step.
//!
//! Log output is controlled with `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use colored::*;
use simulation::{run_simulation, SimulationConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tabsync_client::{
    collect_client_groups, register_client, set_client_group, write_heartbeat, ClientError,
    ClientGroup, ClientGroupId, IndexDefinitions, ManualClock,
};
use tabsync_dag::{with_write, ClientId, Hash, MemoryStore};
use tracing_subscriber::EnvFilter;

mod simulation;

#[derive(Parser)]
#[command(name = "tabsync")]
#[command(about = "Multi-tab client coordination: heartbeat, GC and mutation recovery")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Random multi-tab activity with crashes, then report what GC reclaimed
    Simulate {
        /// Number of tab slots
        #[arg(long, default_value_t = 6)]
        tabs: usize,
        /// Number of random tab events
        #[arg(long, default_value_t = 300)]
        events: usize,
        /// Pause between events (ms)
        #[arg(long, default_value_t = 10)]
        step_ms: u64,
        #[arg(long, default_value_t = 200)]
        heartbeat_ms: u64,
        /// Heartbeat age after which a client is collected (ms)
        #[arg(long, default_value_t = 1_000)]
        max_inactive_ms: u64,
        #[arg(long, default_value_t = 500)]
        gc_interval_ms: u64,
        /// Share of closes that are crashes (no unregister)
        #[arg(long, default_value_t = 0.5)]
        crash_ratio: f64,
        /// Collect client groups on liveness alone, dropping unpushed mutations
        #[arg(long)]
        no_mutation_recovery: bool,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Step through the heartbeat and client-group GC rules
    Scenarios,
}

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match Cli::parse().command {
        Commands::Simulate {
            tabs,
            events,
            step_ms,
            heartbeat_ms,
            max_inactive_ms,
            gc_interval_ms,
            crash_ratio,
            no_mutation_recovery,
            seed,
        } => {
            let seed = seed.unwrap_or_else(rand::random);
            println!("\n╔════════════════════════════════════════════════════════════╗");
            println!("║            MULTI-TAB SIMULATION                            ║");
            println!("╚════════════════════════════════════════════════════════════╝");
            println!(
                "  started {} | tabs: {} | events: {} | seed: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                tabs,
                events,
                seed
            );

            let stats = run_simulation(SimulationConfig {
                tabs: tabs.max(1),
                events,
                step: Duration::from_millis(step_ms),
                heartbeat_ms,
                max_inactive_ms,
                gc_interval_ms,
                crash_ratio: crash_ratio.clamp(0.0, 1.0),
                enable_mutation_recovery: !no_mutation_recovery,
                seed,
            })
            .await?;
            stats.print();
            println!("\n{}", "✓ Simulation completed".green());
        }
        Commands::Scenarios => {
            heartbeat_scenario().await?;
            gc_scenario().await?;
            println!("\n{}", "✓ All scenarios behaved as expected".green());
        }
    }
    Ok(())
}

fn check(label: &str, ok: bool) {
    if ok {
        println!("  {} {}", "✓".green(), label);
    } else {
        println!("  {} {}", "✗".red().bold(), label);
    }
}

async fn heartbeat_scenario() -> Result<(), ClientError> {
    println!("\n{}", "Heartbeat".bold());
    let store = MemoryStore::new();
    let clock = Arc::new(ManualClock::new(1_000));
    let client1 = ClientId::new("client1");

    let registered = with_write(&store, |tx| {
        register_client(tx, &client1, ["put"], IndexDefinitions::new(), 1_000)
    })
    .await?;
    check(
        "client1 registered at 1000",
        registered.client.heartbeat_timestamp_ms == 1_000,
    );

    clock.advance(Duration::from_millis(60_000));
    let beat = write_heartbeat(&store, &client1, clock.as_ref()).await?;
    check(&format!("one interval later the heartbeat is {beat}"), beat == 61_000);

    let missing = write_heartbeat(&store, &ClientId::new("ghost"), clock.as_ref()).await;
    check(
        "an unknown client gets ClientStateNotFound",
        matches!(missing, Err(ClientError::ClientStateNotFound(_))),
    );
    Ok(())
}

async fn gc_scenario() -> Result<(), ClientError> {
    println!("\n{}", "Client-group GC".bold());
    let store = MemoryStore::new();
    let id = ClientGroupId::new("clientGroup1");
    let client1 = ClientId::new("client1");

    let mut group = ClientGroup::new(Hash::empty(), ["put"], IndexDefinitions::new());
    group.mutation_ids = BTreeMap::from([(client1.clone(), 10)]);
    with_write(&store, |tx| set_client_group(tx, &id, group.clone())).await?;

    let first = collect_client_groups(&store, true).await?;
    check(
        "unreferenced group with unacked mutations survives",
        first.retained.contains(&id),
    );

    group.last_server_ackd_mutation_ids = BTreeMap::from([(client1, 10)]);
    with_write(&store, |tx| set_client_group(tx, &id, group)).await?;
    let second = collect_client_groups(&store, true).await?;
    check(
        "once everything is acked the next pass removes it",
        second.removed.contains(&id),
    );
    Ok(())
}
