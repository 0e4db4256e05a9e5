//! Alarm handler (component C): a severity-ranked, deferred error surface.
//!
//! Severity levels and ordering are grounded on
//! `bec_utils/redis_connector.py::Alarms` (not spelled out in full by the
//! distilled spec, which only names MAJOR/MINOR informally). Alarms
//! `>= Severity::Major` are meant to block a polling client at its next
//! check; alarms below that accumulate silently in a bounded ring
//! (spec §7), mirrored here by [`AlarmRing`], sized the way the teacher's
//! `log_capture::LogBuffer` bounds its own in-memory ring.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::broker::Broker;
use crate::codec::{Envelope, EnvelopeKind, Metadata};
use crate::endpoints;
use crate::error::TransportError;

/// Alarm severity, ranked low to high. `Ord` derives the ranking so
/// `severity >= Severity::Major` reads naturally at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Severity {
    Warning = 0,
    Minor = 1,
    Major = 2,
}

/// One raised alarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub severity: Severity,
    pub alarm_type: String,
    pub source: String,
    pub content: serde_json::Value,
    pub metadata: Metadata,
}

impl Alarm {
    pub fn new(
        severity: Severity,
        alarm_type: impl Into<String>,
        source: impl Into<String>,
        content: serde_json::Value,
        metadata: Metadata,
    ) -> Self {
        Self {
            severity,
            alarm_type: alarm_type.into(),
            source: source.into(),
            content,
            metadata,
        }
    }
}

/// Bounded ring of alarms below `Major`, matching spec §7's "100-deep ring".
pub struct AlarmRing {
    capacity: usize,
    items: VecDeque<Alarm>,
}

impl AlarmRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, alarm: Alarm) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(alarm);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Alarm> {
        self.items.iter()
    }
}

impl Default for AlarmRing {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Raises alarms onto the broker and keeps a local ring of sub-`Major`
/// alarms for any component to inspect without round-tripping through the
/// broker. Every raise is a dual-write (`set_and_publish`) so a client
/// polling `internal/alarms` after the fact still observes the last alarm.
pub struct AlarmHandler<B: Broker> {
    broker: std::sync::Arc<B>,
    ring: parking_lot::Mutex<AlarmRing>,
}

impl<B: Broker> AlarmHandler<B> {
    pub fn new(broker: std::sync::Arc<B>) -> Self {
        Self {
            broker,
            ring: parking_lot::Mutex::new(AlarmRing::default()),
        }
    }

    /// Raise an alarm. `>= Severity::Major` alarms are always published;
    /// lower severities are buffered in the ring as well as published, so a
    /// live subscriber still sees them in real time.
    pub async fn raise(&self, alarm: Alarm) -> Result<(), TransportError> {
        tracing::warn!(
            severity = ?alarm.severity,
            alarm_type = %alarm.alarm_type,
            source = %alarm.source,
            "alarm raised"
        );
        if alarm.severity < Severity::Major {
            self.ring.lock().push(alarm.clone());
        }
        let envelope = Envelope::new(
            EnvelopeKind::Alarm,
            serde_json::json!({
                "severity": alarm.severity,
                "alarm_type": alarm.alarm_type,
                "source": alarm.source,
                "content": alarm.content,
            }),
            alarm.metadata,
        );
        self.broker.set_and_publish(&endpoints::alarms(), envelope).await
    }

    /// Every alarm below `Major` currently buffered, oldest first.
    pub fn buffered(&self) -> Vec<Alarm> {
        self.ring.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use std::sync::Arc;

    #[test]
    fn severity_ranking_treats_major_as_highest() {
        assert!(Severity::Major > Severity::Minor);
        assert!(Severity::Minor > Severity::Warning);
    }

    #[tokio::test]
    async fn minor_alarm_lands_in_ring_but_major_does_not() {
        let handler = AlarmHandler::new(Arc::new(MemoryBroker::new()));
        handler
            .raise(Alarm::new(
                Severity::Minor,
                "writer_error",
                "file_writer",
                serde_json::json!({"reason": "disk full"}),
                Metadata::new(),
            ))
            .await
            .unwrap();
        handler
            .raise(Alarm::new(
                Severity::Major,
                "failed_movement",
                "scan_worker",
                serde_json::json!({}),
                Metadata::new(),
            ))
            .await
            .unwrap();
        let buffered = handler.buffered();
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].alarm_type, "writer_error");
    }

    #[test]
    fn ring_evicts_oldest_when_full() {
        let mut ring = AlarmRing::new(2);
        for i in 0..3 {
            ring.push(Alarm::new(
                Severity::Warning,
                format!("a{i}"),
                "src",
                serde_json::json!({}),
                Metadata::new(),
            ));
        }
        assert_eq!(ring.len(), 2);
        let types: Vec<_> = ring.iter().map(|a| a.alarm_type.clone()).collect();
        assert_eq!(types, vec!["a1", "a2"]);
    }
}
