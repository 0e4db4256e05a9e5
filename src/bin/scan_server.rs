//! `scan_server` binary: guard, queue, scan-class registry, device
//! registry, worker, and bundler wired around a shared broker. CLI surface
//! per the library's service conventions — `start|stop|restart [--config
//! <path>]` — grounded on the teacher's `rust-daq` CLI (`clap` derive,
//! `anyhow::Result` at the edge, `tokio::signal::ctrl_c` for graceful
//! shutdown).

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::stream;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use beamline_fabric::alarm::AlarmHandler;
use beamline_fabric::broker::memory::MemoryBroker;
use beamline_fabric::broker::Broker;
use beamline_fabric::bundler::SegmentBundler;
use beamline_fabric::config::Settings;
use beamline_fabric::device::registry::DeviceRegistry;
use beamline_fabric::guard::ScanGuard;
use beamline_fabric::queue::{QueueItem, ScanQueueManager};
use beamline_fabric::scan::plan::DeviceTarget;
use beamline_fabric::scan::worker::InterruptController;
use beamline_fabric::scan::{
    Action, GridScan, Instruction, InstructionMetadata, LineScan, ListScan, PlanStream,
    RoundScanFly, ScanClassRegistry, ScanWorker,
};
use beamline_fabric::pidfile;
use beamline_fabric::supervisor::ServiceSupervisor;

const QUEUE_NAME: &str = "primary";
const SERVICE_NAME: &str = "scan_server";

#[derive(Parser)]
#[command(name = "scan_server")]
#[command(about = "Scan-coordination service: guard, queue, worker, bundler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service in the foreground until interrupted.
    Start {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Send a graceful-shutdown signal to a running instance.
    Stop,
    /// Stop a running instance, then start a new one.
    Restart {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Start { config } => start(config.as_deref()).await,
        Command::Stop => pidfile::stop(SERVICE_NAME),
        Command::Restart { config } => {
            let _ = pidfile::stop(SERVICE_NAME);
            start(config.as_deref()).await
        }
    }
}

async fn start(config: Option<&std::path::Path>) -> anyhow::Result<()> {
    let settings = Settings::load(config).context("loading configuration")?;
    pidfile::write(SERVICE_NAME)?;

    info!(
        redis_host = %settings.broker.redis_host,
        redis_port = settings.broker.redis_port,
        "scan_server connecting to broker"
    );
    // This reference binary ships only the in-process `MemoryBroker`
    // (`broker::memory`); `Settings::broker` is still read and logged so a
    // Redis-backed `Broker` impl can be swapped in behind the trait without
    // touching any caller (see broker/mod.rs).
    let broker = Arc::new(MemoryBroker::new());

    let devices = Arc::new(DeviceRegistry::new(broker.clone()));
    let scan_classes = Arc::new(ScanClassRegistry::new(broker.clone()));
    // Scan classes a beamline plugs in at this exact call site (spec
    // §4.3); these four cover the scan shapes spec §8's scenarios drive.
    scan_classes.register(Arc::new(GridScan)).await.context("registering grid_scan")?;
    scan_classes.register(Arc::new(LineScan)).await.context("registering line_scan")?;
    scan_classes.register(Arc::new(ListScan)).await.context("registering list_scan")?;
    scan_classes
        .register(Arc::new(RoundScanFly))
        .await
        .context("registering round_scan_fly")?;
    let guard = Arc::new(ScanGuard::new(scan_classes.clone(), devices.clone()));
    let queue = Arc::new(ScanQueueManager::new(broker.clone(), settings.queue.history_depth));
    let alarms = Arc::new(AlarmHandler::new(broker.clone()));
    let bundler = Arc::new(SegmentBundler::new(broker.clone(), devices.clone()));
    let interrupt = Arc::new(InterruptController::new(Duration::from_secs(
        settings.worker.interrupt_escalation_secs,
    )));
    let worker = Arc::new(ScanWorker::new(
        broker.clone(),
        devices.clone(),
        alarms.clone(),
        Arc::new(AtomicU64::new(0)),
        Duration::from_millis(settings.worker.wait_poll_interval_ms),
        Duration::from_secs(settings.worker.pubsub_timeout_secs),
    ));
    let supervisor = Arc::new(ServiceSupervisor::new(
        broker.clone(),
        SERVICE_NAME,
        Duration::from_secs(5),
        interrupt.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let supervisor_handle = tokio::spawn(supervisor.clone().run(shutdown_rx));

    let escalation = Duration::from_secs(settings.worker.interrupt_escalation_secs);
    let dispatch_handle = tokio::spawn(dispatch_loop(
        queue.clone(),
        scan_classes.clone(),
        worker.clone(),
        bundler.clone(),
        escalation,
    ));
    let readback_handle = tokio::spawn(readback_feed_loop(broker.clone(), bundler.clone()));

    tokio::signal::ctrl_c().await.context("waiting for ctrl_c")?;
    supervisor.signal_interrupt();
    let _ = shutdown_tx.send(());
    dispatch_handle.abort();
    readback_handle.abort();
    let _ = supervisor_handle.await;
    pidfile::remove(SERVICE_NAME);
    Ok(())
}

/// Feed every device readback into the segment bundler (component J),
/// keyed by the scanID the scan class stamped into the readback's
/// metadata (spec §4.7). Device servers are out of scope for this crate;
/// this loop is the consumer side of whatever conformant device server
/// publishes to `internal/devices/readback/<dev>` carrying the `scanID`
/// and `pointID` copied from the instruction it answered.
async fn readback_feed_loop(broker: Arc<MemoryBroker>, bundler: Arc<SegmentBundler<MemoryBroker>>) {
    let mut subscription = match broker.psubscribe("internal/devices/readback/*").await {
        Ok(sub) => sub,
        Err(e) => {
            error!(error = %e, "failed to subscribe to device readbacks");
            return;
        }
    };
    while let Some(delivery) = subscription.recv().await {
        let Some(device) = delivery
            .topic
            .strip_prefix("internal/devices/readback/")
            .and_then(|rest| rest.strip_suffix(":sub"))
        else {
            continue;
        };
        let Some(scan_id) = delivery
            .envelope
            .metadata
            .get("scanID")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<uuid::Uuid>().ok())
        else {
            continue;
        };
        let point_id = delivery.envelope.metadata.get("pointID").and_then(|v| v.as_u64()).unwrap_or(0);
        if let Err(e) = bundler.record(scan_id, point_id, device, delivery.envelope.content.clone()).await {
            warn!(scan_id = %scan_id, device, error = %e, "failed to record device readback into bundler");
        }
    }
}

/// Pop one queue item at a time and drive it through the worker. Each item
/// gets its own [`InterruptController`] — pause/abort is per-scan (spec
/// §4.5), never carried over to the next queued scan — distinct from the
/// process-lifetime controller `ServiceSupervisor` owns for `ctrl_c`.
/// Plain scans resolve through the scan-class registry; `device_rpc`
/// requests (not a registered scan class, spec §4.9) get a single
/// forwarded `Rpc` instruction built on the fly.
async fn dispatch_loop(
    queue: Arc<ScanQueueManager<MemoryBroker>>,
    scan_classes: Arc<ScanClassRegistry<MemoryBroker>>,
    worker: Arc<ScanWorker<MemoryBroker>>,
    bundler: Arc<SegmentBundler<MemoryBroker>>,
    escalation: Duration,
) {
    loop {
        let Some(item) = queue.start_next(QUEUE_NAME) else {
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        };
        let interrupt = Arc::new(InterruptController::new(escalation));
        run_item(&queue, &scan_classes, &worker, &bundler, &interrupt, item).await;
    }
}

async fn run_item(
    queue: &Arc<ScanQueueManager<MemoryBroker>>,
    scan_classes: &Arc<ScanClassRegistry<MemoryBroker>>,
    worker: &Arc<ScanWorker<MemoryBroker>>,
    bundler: &Arc<SegmentBundler<MemoryBroker>>,
    interrupt: &Arc<InterruptController>,
    item: QueueItem,
) {
    for block in &item.request_blocks {
        let stream = if block.scan_type == "device_rpc" {
            device_rpc_stream(block.rid, &block.args, &block.kwargs)
        } else {
            match scan_classes.get(&block.scan_type) {
                Some(class) => match class.run(block.rid, &block.args, &block.kwargs) {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(scan_type = %block.scan_type, error = %e, "scan class rejected its own args at dispatch");
                        continue;
                    }
                },
                None => {
                    error!(scan_type = %block.scan_type, "no scan class registered for queued request");
                    continue;
                }
            }
        };
        if block.scan_type != "device_rpc" {
            bundler.open_scan(block.rid);
        }
        if let Err(e) = worker.run(stream, interrupt.clone()).await {
            error!(rid = %block.rid, error = %e, "scan worker reported a failure");
        }
        bundler.close_scan(block.rid);
    }
    if let Err(e) = queue.complete_running(QUEUE_NAME) {
        warn!(error = %e, "queue item was not in a completable state");
    }
    let _ = queue.publish_status(QUEUE_NAME).await;
}

fn device_rpc_stream(
    rid: uuid::Uuid,
    args: &[serde_json::Value],
    kwargs: &serde_json::Map<String, serde_json::Value>,
) -> PlanStream<'static> {
    let device = args
        .first()
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let parameter = serde_json::json!({
        "rpc_id": kwargs.get("rpc_id"),
        "func": kwargs.get("func"),
        "args": kwargs.get("args"),
        "kwargs": kwargs.get("kwargs"),
    });
    let instruction = Instruction::new(DeviceTarget::One(device), Action::Rpc, parameter)
        .with_metadata(InstructionMetadata {
            rid,
            ..Default::default()
        });
    Box::pin(stream::once(async { Ok(instruction) }))
}
