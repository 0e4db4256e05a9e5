//! `file_writer` binary: subscribes to scan status/segment broadcasts and
//! drives a [`FileWriterSink`] to commit each scan's master file once it's
//! ready, grounded on `file_writer/file_writer_manager.py`'s event-driven
//! commit loop (spec §4.7, §6.4). Same CLI surface as `scan_server`
//! (spec §6.3).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use uuid::Uuid;

use beamline_fabric::broker::memory::MemoryBroker;
use beamline_fabric::broker::Broker;
use beamline_fabric::config::Settings;
use beamline_fabric::endpoints;
use beamline_fabric::pidfile;
use beamline_fabric::scan::worker::InterruptController;
use beamline_fabric::storage::writer::JsonMasterFileWriter;
use beamline_fabric::storage::FileWriterSink;
use beamline_fabric::supervisor::ServiceSupervisor;

const SERVICE_NAME: &str = "file_writer";

#[derive(Parser)]
#[command(name = "file_writer")]
#[command(about = "Commits completed scans to a master file once every readback has landed")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Start {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    Stop,
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
        base_path = %settings.storage.base_path.display(),
        "file_writer connecting to broker"
    );
    let broker = Arc::new(MemoryBroker::new());
    let sink = Arc::new(FileWriterSink::new(
        broker.clone(),
        Box::new(JsonMasterFileWriter {
            base_path: settings.storage.base_path.clone(),
        }),
    ));
    let interrupt = Arc::new(InterruptController::new(Duration::from_secs(
        settings.worker.interrupt_escalation_secs,
    )));
    let supervisor = Arc::new(ServiceSupervisor::new(
        broker.clone(),
        SERVICE_NAME,
        Duration::from_secs(5),
        interrupt.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let supervisor_handle = tokio::spawn(supervisor.clone().run(shutdown_rx));

    let status_task = tokio::spawn(watch_status(broker.clone(), sink.clone()));
    let segment_task = tokio::spawn(watch_segments(broker.clone(), sink.clone()));

    tokio::signal::ctrl_c().await.context("waiting for ctrl_c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(());
    status_task.abort();
    segment_task.abort();
    let _ = supervisor_handle.await;
    pidfile::remove(SERVICE_NAME);
    Ok(())
}

async fn watch_status(broker: Arc<MemoryBroker>, sink: Arc<FileWriterSink<MemoryBroker>>) {
    let mut subscription = match broker.subscribe(&endpoints::scans::status()).await {
        Ok(sub) => sub,
        Err(e) => {
            error!(error = %e, "failed to subscribe to scan status");
            return;
        }
    };
    while let Some(delivery) = subscription.recv().await {
        let Some(scan_id) = parse_scan_id(&delivery.envelope.content) else {
            continue;
        };
        match delivery.envelope.content["status"].as_str() {
            Some("open") => {
                let num_points = delivery.envelope.content["num_points"].as_u64();
                let enforce_sync = delivery.envelope.content["enforce_sync"].as_bool().unwrap_or(true);
                sink.open_scan(scan_id, enforce_sync, num_points);
            }
            Some("closed") => {
                sink.mark_finished(scan_id);
                if let Err(e) = sink.try_commit(scan_id).await {
                    warn!(scan_id = %scan_id, error = %e, "master file commit failed at scan close");
                }
            }
            _ => {}
        }
    }
}

async fn watch_segments(broker: Arc<MemoryBroker>, sink: Arc<FileWriterSink<MemoryBroker>>) {
    let mut subscription = match broker.subscribe(&endpoints::scans::segment()).await {
        Ok(sub) => sub,
        Err(e) => {
            error!(error = %e, "failed to subscribe to scan segments");
            return;
        }
    };
    while let Some(delivery) = subscription.recv().await {
        let Some(scan_id) = parse_scan_id(&delivery.envelope.content) else {
            continue;
        };
        let Some(point_id) = delivery.envelope.content["pointID"].as_u64() else {
            continue;
        };
        let Some(row) = delivery.envelope.content["data"].as_object() else {
            continue;
        };
        let row = row.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        sink.record_segment(scan_id, point_id, row);
        if let Err(e) = sink.try_commit(scan_id).await {
            warn!(scan_id = %scan_id, error = %e, "master file commit failed after segment");
        }
    }
}

fn parse_scan_id(content: &serde_json::Value) -> Option<Uuid> {
    content["scanID"].as_str().and_then(|s| Uuid::parse_str(s).ok())
}
