//! Runs a small in-process cluster: several workers joined through a relay,
//! an event fanned out across them and an interval entry building history.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use switchboard_core::{CallContext, EventPayload, Payload, QueueEntry, WorkerId};
use switchboard_runtime::{
    init_tracing, service_fn, ClusterRelay, CoreConfig, EntryFilter, LocalManager, LogFormat,
    Manager, MemoryQueueStore, SubscribeTarget, Switchboard,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(clap::Parser, Debug)]
#[command(name = "switchboard-demo")]
#[command(about = "In-process switchboard cluster demo")]
struct DemoArgs {
    /// Number of workers joined to the relay
    #[arg(short, long, env = "SWITCHBOARD_WORKERS", default_value_t = 3)]
    workers: usize,

    /// Seconds between runs of the demo interval entry
    #[arg(short, long, env = "SWITCHBOARD_INTERVAL", default_value_t = 1)]
    interval: u64,

    /// Executions of the interval entry to wait for
    #[arg(short, long, env = "SWITCHBOARD_RUNS", default_value_t = 3)]
    runs: u64,

    #[arg(long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "SWITCHBOARD_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

struct Worker {
    board: Arc<Switchboard>,
    events: mpsc::UnboundedReceiver<EventPayload>,
}

async fn start_worker(relay: &ClusterRelay, index: usize) -> Result<Worker> {
    let node_id = format!("worker-{index}");
    let board = Switchboard::new(CoreConfig::default().with_node_id(node_id.clone()));

    let manager = LocalManager::new(format!("{node_id}-local"));
    let tag = node_id.clone();
    manager.register_service(
        "heartbeat",
        service_fn(move |request: Payload, ctx: CallContext| {
            let tag = tag.clone();
            async move { Ok(json!({ "worker": tag, "trace": ctx.trace_id, "request": request })) }
        }),
    );
    board.add_manager(Arc::new(manager) as Arc<dyn Manager>).await?;
    board.join_relay(relay, WorkerId::new(node_id));

    let (tx, events) = mpsc::unbounded_channel();
    board
        .subscribe("demo.tick", Arc::new(tx), SubscribeTarget::Data(None), &CallContext::default())
        .await?;
    Ok(Worker { board, events })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = DemoArgs::parse();
    init_tracing(&args.log_level, args.log_format)?;

    let relay = ClusterRelay::start(CoreConfig::default().relay_channel_capacity);
    let mut workers = Vec::with_capacity(args.workers);
    for index in 0..args.workers.max(1) {
        workers.push(start_worker(&relay, index).await?);
    }
    info!(workers = workers.len(), "cluster ready");

    let origin = Arc::clone(&workers[0].board);
    origin
        .emit(&json!({ "hello": "cluster" }), "demo.tick", &CallContext::for_node(origin.node_id()), true)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    for worker in &mut workers {
        while let Ok(event) = worker.events.try_recv() {
            println!("{} received {} {}", worker.board.node_id(), event.name, event.event);
        }
    }

    origin
        .add_queue(Arc::new(MemoryQueueStore::new("demo-queue")))
        .await
        .context("failed to add demo queue")?;
    origin
        .enqueue(
            QueueEntry::new("heartbeat", json!({ "beat": true }))
                .with_group("demo")
                .every(args.interval.max(1)),
        )
        .await?;

    let wait = Duration::from_secs(args.interval.max(1) * args.runs.saturating_sub(1)) + Duration::from_millis(500);
    tokio::select! {
        () = tokio::time::sleep(wait) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for ctrl-c");
            }
        }
    }

    let group = EntryFilter::by_group("demo");
    origin.cancel(&group).await?;
    for entry in origin.get_entries(&group).await? {
        println!(
            "{} {:<8} start={} response={}",
            entry.id.unwrap_or_default(),
            entry.state,
            entry.start_date.map(|d| d.to_rfc3339()).unwrap_or_default(),
            entry.response.unwrap_or(Payload::Null),
        );
    }

    for worker in workers.iter().rev() {
        worker.board.shutdown().await;
    }
    relay.shutdown().await;
    Ok(())
}
