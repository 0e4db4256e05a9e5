//! Scan worker (component H), grounded on the teacher's
//! `experiment::run_engine::RunEngine` (stream-driven dispatch loop,
//! per-message `process_message` match, `auto_checkpoint`/pause poll)
//! generalized from the teacher's 9-variant `Message` table to the full
//! instruction action table of spec §4.4, and from the teacher's
//! `sleep(100ms)` pause-poll to the wait-group poll model of spec §5.

use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use super::plan::{Action, DeviceTarget, Instruction, PlanStream, WaitKind};
use crate::alarm::{Alarm, AlarmHandler, Severity};
use crate::broker::Broker;
use crate::codec::{Envelope, EnvelopeKind, Metadata};
use crate::device::registry::DeviceRegistry;
use crate::endpoints;
use crate::error::WorkerError;

/// Public record of one scan (spec §3 "Scan"). Populated as the worker
/// drives `open_scan` -> segments -> `close_scan`.
#[derive(Debug, Clone, Default)]
pub struct Scan {
    pub scan_id: Uuid,
    pub scan_number: u64,
    pub open: bool,
    pub num_points: Option<u64>,
    pub scan_motors: Vec<String>,
    pub enforce_sync: bool,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Cooperative interrupt flag with escalation timing (spec §5, REDESIGN
/// FLAGS §9: replace SIGINT double-tap with an explicit controller). Two
/// signals within `escalation_window` escalate a deferred-pause request to
/// an immediate abort.
pub struct InterruptController {
    stopped: AtomicBool,
    last_signal: SyncMutex<Option<Instant>>,
    escalation_window: Duration,
}

impl InterruptController {
    pub fn new(escalation_window: Duration) -> Self {
        Self {
            stopped: AtomicBool::new(false),
            last_signal: SyncMutex::new(None),
            escalation_window,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Record one interrupt signal (e.g. a deferred-pause request) and
    /// report whether it should escalate to an immediate abort because a
    /// prior signal landed within the escalation window.
    pub fn signal(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_signal.lock();
        let escalate = matches!(*last, Some(prev) if now.duration_since(prev) <= self.escalation_window);
        *last = Some(now);
        if escalate {
            self.stop();
        }
        escalate
    }
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[derive(Default)]
struct WorkerState {
    scan: Option<Scan>,
    /// wait_group tag -> device -> DIID still outstanding.
    groups: HashMap<String, HashMap<String, u64>>,
    staged_devices: HashSet<String>,
    max_point_id: u64,
    diid_counter: u64,
    scan_report_hints: Vec<serde_json::Value>,
}

/// Drives one queue's instruction stream end to end. Single-flight per
/// queue by construction: callers are expected to hold one `ScanWorker`
/// per running queue (spec §5: "single-flight per queue").
pub struct ScanWorker<B: Broker> {
    broker: Arc<B>,
    devices: Arc<DeviceRegistry<B>>,
    alarms: Arc<AlarmHandler<B>>,
    state: tokio::sync::Mutex<WorkerState>,
    wait_poll_interval: Duration,
    pubsub_timeout: Duration,
    scan_number_counter: Arc<AtomicU64>,
}

impl<B: Broker> ScanWorker<B> {
    pub fn new(
        broker: Arc<B>,
        devices: Arc<DeviceRegistry<B>>,
        alarms: Arc<AlarmHandler<B>>,
        scan_number_counter: Arc<AtomicU64>,
        wait_poll_interval: Duration,
        pubsub_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            devices,
            alarms,
            state: tokio::sync::Mutex::new(WorkerState::default()),
            wait_poll_interval,
            pubsub_timeout,
            scan_number_counter,
        }
    }

    /// Drive `stream` to completion, checking `interrupt` between every
    /// instruction (spec §5).
    pub async fn run(
        &self,
        mut stream: PlanStream<'static>,
        interrupt: Arc<InterruptController>,
    ) -> Result<(), WorkerError> {
        while let Some(next) = stream.next().await {
            if interrupt.is_stopped() {
                let scan_id = self.current_scan_id().await.unwrap_or_else(Uuid::nil);
                warn!(scan_id = %scan_id, "interrupt stopped the scan, unstaging and aborting");
                self.abort_cleanup().await?;
                return Err(WorkerError::ScanAbortion { scan_id });
            }
            let instruction = next.map_err(|e| WorkerError::DeviceConfig(e.to_string()))?;
            self.dispatch(instruction, &interrupt).await?;
        }
        Ok(())
    }

    async fn current_scan_id(&self) -> Option<Uuid> {
        self.state.lock().await.scan.as_ref().map(|s| s.scan_id)
    }

    async fn dispatch(
        &self,
        instruction: Instruction,
        interrupt: &Arc<InterruptController>,
    ) -> Result<(), WorkerError> {
        match instruction.action {
            Action::OpenScan => self.open_scan(instruction).await,
            Action::CloseScan => self.close_scan(instruction).await,
            Action::Stage => self.stage(instruction, true).await,
            Action::Unstage => self.stage(instruction, false).await,
            Action::BaselineReading | Action::PreScan => {
                self.forward(&instruction).await.map_err(transport_err)
            }
            Action::Set => self.set(instruction).await,
            Action::Wait => self.wait(instruction, interrupt).await,
            Action::Trigger => self.trigger(instruction).await,
            Action::Read => self.read(instruction).await,
            Action::Rpc => self.forward(&instruction).await.map_err(transport_err),
            Action::Kickoff => self.forward(&instruction).await.map_err(transport_err),
            Action::Complete => self.complete(instruction, interrupt).await,
            Action::PublishDataAsRead => self.publish_data_as_read(instruction).await,
            Action::ScanReportInstruction => {
                self.state.lock().await.scan_report_hints.push(instruction.parameter);
                Ok(())
            }
        }
    }

    async fn forward(&self, instruction: &Instruction) -> Result<(), crate::error::TransportError> {
        let envelope = Envelope::new(
            EnvelopeKind::DeviceInstruction,
            json!({
                "device": instruction.device.names(),
                "action": instruction.action,
                "parameter": instruction.parameter,
            }),
            instruction_metadata_map(instruction),
        );
        self.broker.publish(&endpoints::devices::instructions(), envelope).await
    }

    async fn open_scan(&self, instruction: Instruction) -> Result<(), WorkerError> {
        let mut state = self.state.lock().await;
        let scan_id = instruction.metadata.scan_id.unwrap_or_else(Uuid::new_v4);
        let scan_number = self.scan_number_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let num_points = instruction
            .parameter
            .get("num_points")
            .and_then(|v| v.as_u64());
        let scan_motors = instruction
            .parameter
            .get("scan_motors")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let enforce_sync = instruction
            .parameter
            .get("enforce_sync")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let scan = Scan {
            scan_id,
            scan_number,
            open: true,
            num_points,
            scan_motors,
            enforce_sync,
            start_time: Some(chrono::Utc::now()),
            end_time: None,
        };
        let content = json!({
            "scanID": scan.scan_id,
            "scan_number": scan.scan_number,
            "status": "open",
            "num_points": scan.num_points,
            "scan_motors": scan.scan_motors,
            "enforce_sync": scan.enforce_sync,
        });
        state.scan = Some(scan);
        state.max_point_id = 0;
        state.diid_counter = 0;
        drop(state);

        info!(scan_id = %scan_id, scan_number, num_points = ?num_points, "scan opened");
        self.broker
            .set_and_publish(
                &endpoints::scans::status(),
                Envelope::new(EnvelopeKind::ScanStatus, content, Metadata::new()),
            )
            .await
            .map_err(|e| WorkerError::DeviceConfig(e.to_string()))
    }

    /// Idempotent: a second `close_scan` for the same scanID is a no-op
    /// (spec §8 item 6).
    async fn close_scan(&self, instruction: Instruction) -> Result<(), WorkerError> {
        let mut state = self.state.lock().await;
        let Some(scan) = state.scan.as_mut() else {
            return Ok(());
        };
        if !scan.open {
            return Ok(());
        }
        if let Some(target) = instruction.metadata.scan_id {
            if target != scan.scan_id {
                return Ok(());
            }
        }
        scan.open = false;
        scan.end_time = Some(chrono::Utc::now());
        if scan.num_points.is_none() {
            scan.num_points = Some(state.max_point_id + 1);
        }
        let content = json!({
            "scanID": scan.scan_id,
            "scan_number": scan.scan_number,
            "status": "closed",
        });
        let scan_id = scan.scan_id;
        drop(state);
        info!(scan_id = %scan_id, "scan closed");
        self.broker
            .set_and_publish(
                &endpoints::scans::status(),
                Envelope::new(EnvelopeKind::ScanStatus, content, Metadata::new()),
            )
            .await
            .map_err(|e| WorkerError::DeviceConfig(e.to_string()))
    }

    async fn stage(&self, instruction: Instruction, staging: bool) -> Result<(), WorkerError> {
        self.forward(&instruction).await.map_err(transport_err)?;
        let mut state = self.state.lock().await;
        for device in instruction.device.names() {
            if staging {
                state.staged_devices.insert(device);
            } else {
                state.staged_devices.remove(&device);
            }
        }
        Ok(())
    }

    async fn set(&self, instruction: Instruction) -> Result<(), WorkerError> {
        let Some(tag) = instruction.wait_group.clone() else {
            return self.forward(&instruction).await.map_err(transport_err);
        };
        let diid = {
            let mut state = self.state.lock().await;
            state.diid_counter += 1;
            let diid = state.diid_counter;
            let group = state.groups.entry(tag).or_default();
            for device in instruction.device.names() {
                group.insert(device, diid);
            }
            diid
        };
        let mut instruction = instruction;
        instruction.metadata.diid = Some(diid);
        self.forward(&instruction).await.map_err(transport_err)
    }

    /// For each `(device, DIID)` still outstanding in the referenced
    /// wait-group, poll `device_req_status/<dev>` until a matching-or-newer
    /// DIID arrives (spec §4.4 `wait` row, §8 item 4: only clear entries
    /// whose recorded DIID <= the waiting DIID).
    async fn wait(
        &self,
        instruction: Instruction,
        interrupt: &Arc<InterruptController>,
    ) -> Result<(), WorkerError> {
        let Some(tag) = instruction.wait_group.clone() else {
            return Ok(());
        };
        let waiting_diid = instruction.metadata.diid.unwrap_or(u64::MAX);
        let kind = instruction.wait_kind.unwrap_or(WaitKind::Move);

        let outstanding: Vec<(String, u64)> = {
            let state = self.state.lock().await;
            state
                .groups
                .get(&tag)
                .map(|g| {
                    g.iter()
                        .filter(|(_, diid)| **diid <= waiting_diid)
                        .map(|(dev, diid)| (dev.clone(), *diid))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (device, diid) in outstanding {
            self.wait_for_diid(&device, diid, kind, interrupt).await?;
            let mut state = self.state.lock().await;
            if let Some(group) = state.groups.get_mut(&tag) {
                if group.get(&device).copied() == Some(diid) {
                    group.remove(&device);
                }
            }
        }
        Ok(())
    }

    async fn wait_for_diid(
        &self,
        device: &str,
        diid: u64,
        _kind: WaitKind,
        interrupt: &Arc<InterruptController>,
    ) -> Result<(), WorkerError> {
        let deadline = Instant::now() + self.pubsub_timeout;
        loop {
            if interrupt.is_stopped() {
                return Err(WorkerError::ScanAbortion {
                    scan_id: self.current_scan_id().await.unwrap_or_else(Uuid::nil),
                });
            }
            let entries = self
                .broker
                .lrange(&endpoints::devices::req_status(device), 0, -1)
                .await
                .map_err(|e| WorkerError::DeviceConfig(e.to_string()))?;
            if let Some(status) = entries.iter().find_map(|e| status_for_diid(e, diid)) {
                if status.success {
                    return Ok(());
                }
                return self.reconcile_failed_movement(device, diid).await;
            }
            if Instant::now() >= deadline {
                return Err(WorkerError::Timeout {
                    group: device.to_string(),
                    elapsed_ms: self.pubsub_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.wait_poll_interval).await;
        }
    }

    /// On `success=false`, re-read the current readback; if within the
    /// device's tolerance of the last setpoint, treat as success, otherwise
    /// raise a MAJOR alarm and abort (spec §4.4 `wait` row, §7).
    async fn reconcile_failed_movement(&self, device: &str, diid: u64) -> Result<(), WorkerError> {
        let readback = self
            .broker
            .get(&endpoints::devices::readback(device))
            .await
            .map_err(|e| WorkerError::DeviceConfig(e.to_string()))?;
        let setpoint = self
            .broker
            .get(&endpoints::devices::read(device))
            .await
            .map_err(|e| WorkerError::DeviceConfig(e.to_string()))?;

        if let (Some(readback), Some(setpoint)) = (
            readback.and_then(|e| e.content.get("value").and_then(|v| v.as_f64())),
            setpoint.and_then(|e| e.content.get("value").and_then(|v| v.as_f64())),
        ) {
            let tolerance = self
                .devices
                .get(device)
                .and_then(|d| d.device_config.tolerance)
                .unwrap_or(0.0);
            if (readback - setpoint).abs() <= tolerance {
                return Ok(());
            }
        }

        warn!(device, diid, "movement tolerance exceeded, raising failed_movement alarm");
        self.alarms
            .raise(Alarm::new(
                Severity::Major,
                "failed_movement",
                device,
                json!({"diid": diid}),
                Metadata::new(),
            ))
            .await
            .map_err(|e| WorkerError::DeviceConfig(e.to_string()))?;
        Err(WorkerError::FailedMovement {
            device: device.to_string(),
            diid,
        })
    }

    async fn trigger(&self, mut instruction: Instruction) -> Result<(), WorkerError> {
        if instruction.device.is_empty() {
            instruction.device = DeviceTarget::Many(self.devices.detector_names());
        }
        self.forward(&instruction).await.map_err(transport_err)
    }

    async fn read(&self, mut instruction: Instruction) -> Result<(), WorkerError> {
        if instruction.device.is_empty() {
            let mut names = self.devices.monitored_names();
            let scan_motors = self
                .state
                .lock()
                .await
                .scan
                .as_ref()
                .map(|s| s.scan_motors.clone())
                .unwrap_or_default();
            for motor in scan_motors {
                if !names.contains(&motor) {
                    names.push(motor);
                }
            }
            instruction.device = DeviceTarget::Many(names);
        }
        if let Some(point_id) = instruction.metadata.point_id {
            let mut state = self.state.lock().await;
            state.max_point_id = state.max_point_id.max(point_id);
        }
        self.forward(&instruction).await.map_err(transport_err)
    }

    /// Forward the `complete` instruction, then bounded long-poll every
    /// targeted device's `device_req_status` the same way a `wait`
    /// instruction would, so a fly scan's `close_scan` can't run ahead of
    /// the flyer actually finishing (spec §4.4 `complete` row).
    async fn complete(
        &self,
        mut instruction: Instruction,
        interrupt: &Arc<InterruptController>,
    ) -> Result<(), WorkerError> {
        let diid = {
            let mut state = self.state.lock().await;
            state.diid_counter += 1;
            state.diid_counter
        };
        instruction.metadata.diid = Some(diid);
        self.forward(&instruction).await.map_err(transport_err)?;

        for device in instruction.device.names() {
            self.wait_for_diid(&device, diid, WaitKind::Move, interrupt).await?;
        }
        Ok(())
    }

    async fn publish_data_as_read(&self, instruction: Instruction) -> Result<(), WorkerError> {
        for device in instruction.device.names() {
            let envelope = Envelope::new(
                EnvelopeKind::DeviceReadback,
                instruction.parameter.clone(),
                instruction_metadata_map(&instruction),
            );
            self.broker
                .set_and_publish(&endpoints::devices::read(&device), envelope)
                .await
                .map_err(|e| WorkerError::DeviceConfig(e.to_string()))?;
        }
        Ok(())
    }

    /// Unstage every currently-staged device with `cleanup=true` and no
    /// wait, the way an `abort` is required to (spec §4.4 item 4, §8 item
    /// 8).
    async fn abort_cleanup(&self) -> Result<(), WorkerError> {
        let staged: Vec<String> = {
            let mut state = self.state.lock().await;
            state.staged_devices.drain().collect()
        };
        for device in &staged {
            let instruction = Instruction::new(
                DeviceTarget::One(device.clone()),
                Action::Unstage,
                json!({"cleanup": true}),
            );
            self.forward(&instruction).await.map_err(transport_err)?;
        }
        Ok(())
    }

    #[cfg(test)]
    async fn staged_devices_for_test(&self) -> HashSet<String> {
        self.state.lock().await.staged_devices.clone()
    }
}

fn transport_err(e: crate::error::TransportError) -> WorkerError {
    WorkerError::DeviceConfig(e.to_string())
}

fn instruction_metadata_map(instruction: &Instruction) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("RID".into(), json!(instruction.metadata.rid));
    if let Some(scan_id) = instruction.metadata.scan_id {
        metadata.insert("scanID".into(), json!(scan_id));
    }
    if let Some(diid) = instruction.metadata.diid {
        metadata.insert("DIID".into(), json!(diid));
    }
    if let Some(point_id) = instruction.metadata.point_id {
        metadata.insert("pointID".into(), json!(point_id));
    }
    metadata
}

struct DeviceReqStatus {
    success: bool,
}

fn status_for_diid(envelope: &Envelope, diid: u64) -> Option<DeviceReqStatus> {
    let got_diid = envelope.metadata.get("DIID").and_then(|v| v.as_u64())?;
    if got_diid != diid {
        return None;
    }
    let success = envelope.content.get("success").and_then(|v| v.as_bool()).unwrap_or(true);
    Some(DeviceReqStatus { success })
}
