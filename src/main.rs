//! realtime-sync CLI entry point
//!
//! # Usage
//!
//! ```bash
//! realtime-sync simulate --table jobs:jobs-list:high --duration-secs 60
//! realtime-sync --config ./realtime.toml config
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

use realtime_sync::cli::{Cli, Command, SimulateArgs};
use realtime_sync::{ChangeKind, InMemoryFeed, RealtimeConfig, RealtimeManager, RecordingCache};

const SIMULATED_ROUTE: &str = "/simulate";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RealtimeConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RealtimeConfig::load()?,
    };

    // Logs go to stderr so stdout only carries snapshots
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("realtime_sync={}", config.logging.level).parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Simulate(args) => simulate(config, args).await,
    }
}

async fn simulate(config: RealtimeConfig, args: SimulateArgs) -> anyhow::Result<()> {
    let feed = Arc::new(InMemoryFeed::new());
    let cache = Arc::new(RecordingCache::new());
    let manager = RealtimeManager::start(config, feed.clone(), cache.clone())?;
    let signals = manager.signals();

    let specs = args.specs();
    let tables: Vec<String> = specs
        .iter()
        .map(|s| s.table.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let composite = manager.subscribe_many(specs).await?;
    for handle in composite.handles() {
        manager.register_for_route(SIMULATED_ROUTE, handle);
    }
    tracing::info!(
        "Simulating {} subscriptions over {} tables",
        composite.len(),
        tables.len()
    );

    let mut changes = interval(Duration::from_millis(args.change_every_ms.max(1)));
    let mut reports = interval(Duration::from_secs(args.report_every_secs.max(1)));
    let mut flaps = interval(Duration::from_secs(args.flap_every_secs.max(1)));
    for ticker in [&mut changes, &mut reports, &mut flaps] {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }
    // First tick of an interval is immediate
    flaps.tick().await;

    let deadline = sleep(if args.duration_secs == 0 {
        Duration::MAX
    } else {
        Duration::from_secs(args.duration_secs)
    });
    tokio::pin!(deadline);

    let mut sequence: u64 = 0;
    let mut injected: u64 = 0;
    let mut outages: Vec<JoinHandle<()>> = Vec::new();
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            _ = changes.tick() => {
                let table = &tables[(sequence as usize) % tables.len()];
                let kind = match sequence % 3 {
                    0 => ChangeKind::Insert,
                    1 => ChangeKind::Update,
                    _ => ChangeKind::Delete,
                };
                feed.emit_change(table, kind, serde_json::json!({ "seq": sequence }));
                if sequence % 5 == 0 {
                    signals.on_user_activity();
                }
                sequence += 1;
            }
            _ = reports.tick() => print_snapshot(&manager, &cache)?,
            _ = flaps.tick(), if args.flap_every_secs > 0 => {
                injected += 1;
                if injected % 2 == 1 {
                    let broken = feed.break_all("simulated socket reset");
                    tracing::info!("Injected bind error on {} channels", broken);
                } else {
                    tracing::info!("Injecting a one second network outage");
                    let feed = feed.clone();
                    let signals = signals.clone();
                    outages.push(tokio::spawn(async move {
                        feed.set_reachable(false);
                        signals.on_network_down();
                        sleep(Duration::from_secs(1)).await;
                        feed.set_reachable(true);
                        signals.on_network_up();
                    }));
                }
            }
        }
    }

    for outcome in futures_util::future::join_all(outages).await {
        if let Err(e) = outcome {
            tracing::warn!("Outage task failed: {}", e);
        }
    }

    let removed = manager.teardown_route(SIMULATED_ROUTE).await;
    tracing::info!("Route teardown removed {} subscriptions", removed);
    print_snapshot(&manager, &cache)?;
    manager.shutdown().await;
    Ok(())
}

fn print_snapshot(manager: &RealtimeManager, cache: &RecordingCache) -> anyhow::Result<()> {
    let snapshot = serde_json::json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "stats": manager.stats(),
        "cache_calls": cache.calls().len(),
        "subscriptions": manager.registry().statuses(),
    });
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
