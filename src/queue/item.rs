//! The `QueueItem` state machine (spec §4.5), grounded on the teacher's
//! `experiment::state::ExperimentState` (`can_begin`/`can_pause`/... guard
//! methods via `matches!`, plus a `Display` impl for logging).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A queue item's position in its lifecycle.
///
/// ```text
/// PENDING --start--> RUNNING --close--> COMPLETED
///    |                  |
///    | abort            | deferred_pause
///    v                  v
///  STOPPED        DEFERRED_PAUSE --pause--> PAUSED --continue--> RUNNING
///                                              | abort
///                                              v
///                                           STOPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueItemStatus {
    Pending,
    Running,
    DeferredPause,
    Paused,
    Stopped,
    Completed,
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueItemStatus::Pending => "PENDING",
            QueueItemStatus::Running => "RUNNING",
            QueueItemStatus::DeferredPause => "DEFERRED_PAUSE",
            QueueItemStatus::Paused => "PAUSED",
            QueueItemStatus::Stopped => "STOPPED",
            QueueItemStatus::Completed => "COMPLETED",
        };
        write!(f, "{s}")
    }
}

impl QueueItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueItemStatus::Stopped | QueueItemStatus::Completed)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, QueueItemStatus::Pending)
    }

    pub fn can_close(&self) -> bool {
        matches!(self, QueueItemStatus::Running)
    }

    pub fn can_deferred_pause(&self) -> bool {
        matches!(self, QueueItemStatus::Running)
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, QueueItemStatus::DeferredPause | QueueItemStatus::Running)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, QueueItemStatus::Paused)
    }

    pub fn can_abort(&self) -> bool {
        matches!(
            self,
            QueueItemStatus::Pending
                | QueueItemStatus::Running
                | QueueItemStatus::DeferredPause
                | QueueItemStatus::Paused
        )
    }
}

/// Error returned by an illegal transition attempt.
#[derive(Debug, thiserror::Error)]
#[error("cannot transition queue item from {from} via {action}")]
pub struct IllegalTransition {
    pub from: QueueItemStatus,
    pub action: &'static str,
}

/// One request folded into a queue item. Scan-group merges append
/// additional blocks into the currently-building item instead of creating
/// a new one (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBlock {
    pub rid: Uuid,
    pub scan_type: String,
    pub is_scan: bool,
    pub scan_number: Option<u64>,
    /// Hints for the client UI, pushed by `scan_report_instruction` (spec §4.4).
    pub scan_report_instructions: Vec<serde_json::Value>,
    /// Human-readable device names this block reports progress against —
    /// supplemental, grounded on `queue_items.py`/`request_items.py`'s
    /// `scan_report_devices` (Part 3 item 7 of the expanded spec).
    pub scan_report_devices: Vec<String>,
    pub decision_pending: bool,
    /// The guard-validated call this block replays into a `ScanClass::run`
    /// (or a `device_rpc` dispatch) once the worker pops it off the queue —
    /// not carried by the original queue-item shape, added so the request's
    /// parameters survive the hop from guard to worker.
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl RequestBlock {
    pub fn new(rid: Uuid, scan_type: impl Into<String>, is_scan: bool) -> Self {
        Self {
            rid,
            scan_type: scan_type.into(),
            is_scan,
            scan_number: None,
            scan_report_instructions: Vec::new(),
            scan_report_devices: Vec::new(),
            decision_pending: true,
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
        }
    }

    pub fn with_args(
        mut self,
        args: Vec<serde_json::Value>,
        kwargs: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.args = args;
        self.kwargs = kwargs;
        self
    }
}

/// One entry in a scan queue's FIFO (spec §3 "QueueItem").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: Uuid,
    pub request_blocks: Vec<RequestBlock>,
    pub status: QueueItemStatus,
    pub active_request_block: Option<usize>,
    pub scan_ids: Vec<Uuid>,
    /// Request-blocks this item was restarted from (spec §4.5 `restart`;
    /// supplemental scan_def_id/queue_group merge bookkeeping lives on the
    /// blocks themselves, carried via their metadata upstream).
    pub queue_group: Option<String>,
}

impl QueueItem {
    pub fn new(request_blocks: Vec<RequestBlock>) -> Self {
        Self {
            queue_id: Uuid::new_v4(),
            request_blocks,
            status: QueueItemStatus::Pending,
            active_request_block: None,
            scan_ids: Vec::new(),
            queue_group: None,
        }
    }

    /// Build a fresh item reusing `self`'s request-blocks, for the
    /// `restart` action (spec §4.5): same blocks, a new `queueID`, no
    /// scan history carried over.
    pub fn restarted(&self) -> Self {
        Self::new(self.request_blocks.clone())
    }

    pub fn request_ids(&self) -> Vec<Uuid> {
        self.request_blocks.iter().map(|b| b.rid).collect()
    }

    pub fn start(&mut self) -> Result<(), IllegalTransition> {
        if !self.status.can_start() {
            return Err(IllegalTransition {
                from: self.status,
                action: "start",
            });
        }
        self.status = QueueItemStatus::Running;
        self.active_request_block = Some(0);
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), IllegalTransition> {
        if !self.status.can_close() {
            return Err(IllegalTransition {
                from: self.status,
                action: "close",
            });
        }
        self.status = QueueItemStatus::Completed;
        Ok(())
    }

    pub fn deferred_pause(&mut self) -> Result<(), IllegalTransition> {
        if !self.status.can_deferred_pause() {
            return Err(IllegalTransition {
                from: self.status,
                action: "deferred_pause",
            });
        }
        self.status = QueueItemStatus::DeferredPause;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), IllegalTransition> {
        if !self.status.can_pause() {
            return Err(IllegalTransition {
                from: self.status,
                action: "pause",
            });
        }
        self.status = QueueItemStatus::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), IllegalTransition> {
        if !self.status.can_resume() {
            return Err(IllegalTransition {
                from: self.status,
                action: "resume",
            });
        }
        self.status = QueueItemStatus::Running;
        Ok(())
    }

    /// `abort` and `halt` both land in STOPPED; the distinction (whether
    /// the worker performs unstage cleanup) is the worker's concern, not
    /// the state machine's (spec §4.5).
    pub fn abort(&mut self) -> Result<(), IllegalTransition> {
        if !self.status.can_abort() {
            return Err(IllegalTransition {
                from: self.status,
                action: "abort",
            });
        }
        self.status = QueueItemStatus::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> QueueItem {
        QueueItem::new(vec![RequestBlock::new(Uuid::new_v4(), "line_scan", true)])
    }

    #[test]
    fn full_happy_path_transitions() {
        let mut item = item();
        item.start().unwrap();
        assert_eq!(item.status, QueueItemStatus::Running);
        item.close().unwrap();
        assert_eq!(item.status, QueueItemStatus::Completed);
    }

    #[test]
    fn deferred_pause_then_pause_then_abort() {
        let mut item = item();
        item.start().unwrap();
        item.deferred_pause().unwrap();
        assert_eq!(item.status, QueueItemStatus::DeferredPause);
        item.pause().unwrap();
        assert_eq!(item.status, QueueItemStatus::Paused);
        item.abort().unwrap();
        assert_eq!(item.status, QueueItemStatus::Stopped);
    }

    #[test]
    fn cannot_close_before_start() {
        let mut item = item();
        let err = item.close().unwrap_err();
        assert_eq!(err.from, QueueItemStatus::Pending);
    }

    #[test]
    fn cannot_resume_a_completed_item() {
        let mut item = item();
        item.start().unwrap();
        item.close().unwrap();
        assert!(item.resume().is_err());
    }

    #[test]
    fn restart_reuses_blocks_but_gets_a_new_queue_id() {
        let mut item = item();
        item.start().unwrap();
        item.abort().unwrap();
        let restarted = item.restarted();
        assert_ne!(restarted.queue_id, item.queue_id);
        assert_eq!(restarted.request_ids(), item.request_ids());
        assert_eq!(restarted.status, QueueItemStatus::Pending);
    }
}
