//! Request/response correlator (component E).
//!
//! Ties a client's RID to the guard's accept/reject decision, to the queue
//! item it was bound into, and to the scan it eventually opened. Grounded
//! on the teacher's oneshot request/response idiom in `src/messages.rs`,
//! generalized from single-shot commands to a long-lived, lazily-created
//! entry per RID that multiple writers update over a request's lifetime —
//! because unlike the teacher's in-process actor, here `request` and
//! `response` can each arrive first over a lossy broker (spec §4.6, §8
//! item 7).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// The guard's accept/reject decision for one request.
#[derive(Debug, Clone)]
pub struct Response {
    pub accepted: bool,
    pub message: Option<String>,
}

/// Everything known about one RID's lifetime so far. Any field may be
/// absent; the entry itself is created lazily by whichever writer touches
/// the RID first.
#[derive(Debug, Clone, Default)]
pub struct CorrelationEntry {
    pub request_seen: bool,
    pub response: Option<Response>,
    pub decision_pending: bool,
    pub accepted_blocks: Vec<Uuid>,
    pub queue_id: Option<Uuid>,
    pub scan_id: Option<Uuid>,
}

impl CorrelationEntry {
    fn new_with_request() -> Self {
        Self {
            request_seen: true,
            decision_pending: true,
            ..Default::default()
        }
    }
}

/// Shared correlation table. Every method is safe to call from any
/// component (guard, queue, worker) and from any order relative to the
/// others, per spec §4.6.
#[derive(Default)]
pub struct RequestCorrelator {
    entries: RwLock<HashMap<Uuid, CorrelationEntry>>,
    notify: Notify,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a request for `rid` was submitted. Safe to call even if
    /// a response already arrived for this RID.
    pub fn record_request(&self, rid: Uuid) {
        let mut entries = self.entries.write();
        entries
            .entry(rid)
            .and_modify(|e| {
                e.request_seen = true;
            })
            .or_insert_with(CorrelationEntry::new_with_request);
        drop(entries);
        self.notify.notify_waiters();
    }

    /// Record the guard's decision for `rid`. Safe to call before the
    /// request itself has been recorded (spec §8 item 7).
    pub fn record_response(&self, rid: Uuid, response: Response) {
        let mut entries = self.entries.write();
        let entry = entries.entry(rid).or_default();
        entry.response = Some(response);
        entry.decision_pending = false;
        drop(entries);
        self.notify.notify_waiters();
    }

    pub fn record_queue(&self, rid: Uuid, queue_id: Uuid) {
        let mut entries = self.entries.write();
        entries.entry(rid).or_default().queue_id = Some(queue_id);
        drop(entries);
        self.notify.notify_waiters();
    }

    pub fn record_scan(&self, rid: Uuid, scan_id: Uuid) {
        let mut entries = self.entries.write();
        entries.entry(rid).or_default().scan_id = Some(scan_id);
        drop(entries);
        self.notify.notify_waiters();
    }

    pub fn snapshot(&self, rid: Uuid) -> Option<CorrelationEntry> {
        self.entries.read().get(&rid).cloned()
    }

    /// Block until `predicate` is satisfied by the RID's current entry, or
    /// `timeout` elapses. Used by the client RPC facade (L) and tests
    /// standing in for a polling client.
    pub async fn wait_for(
        &self,
        rid: Uuid,
        timeout: std::time::Duration,
        predicate: impl Fn(&CorrelationEntry) -> bool,
    ) -> Option<CorrelationEntry> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(entry) = self.snapshot(rid) {
                if predicate(&entry) {
                    return Some(entry);
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return None,
            }
        }
    }
}

pub type SharedCorrelator = Arc<RequestCorrelator>;
