//! Segment bundler (component J), grounded on `scan_bundler/bec_emitter.py`'s
//! per-point aggregation shape and spec §4.7: reassembles per-device
//! readbacks into point-indexed rows, emitting a row once every monitored,
//! synchronously-scheduled device has delivered its pointID.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::broker::Broker;
use crate::codec::{Envelope, EnvelopeKind, Metadata};
use crate::device::registry::DeviceRegistry;
use crate::device::Schedule;
use crate::endpoints;
use crate::error::TransportError;

type Row = HashMap<String, serde_json::Value>;

struct ScanSegments {
    rows: HashMap<u64, Row>,
    required: Vec<String>,
}

/// Aggregates per-device readbacks into point-indexed rows and publishes a
/// row as soon as it completes.
pub struct SegmentBundler<B: Broker> {
    broker: Arc<B>,
    devices: Arc<DeviceRegistry<B>>,
    scans: RwLock<HashMap<Uuid, ScanSegments>>,
}

impl<B: Broker> SegmentBundler<B> {
    pub fn new(broker: Arc<B>, devices: Arc<DeviceRegistry<B>>) -> Self {
        Self {
            broker,
            devices,
            scans: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking a new scan, snapshotting which devices must deliver
    /// each row (spec §4.7: "every monitored device (minus async devices)").
    pub fn open_scan(&self, scan_id: Uuid) {
        let required = self
            .devices
            .monitored_names()
            .into_iter()
            .filter(|name| {
                self.devices
                    .get(name)
                    .map(|d| d.acquisition_config.schedule == Schedule::Sync)
                    .unwrap_or(false)
            })
            .collect();
        self.scans.write().insert(
            scan_id,
            ScanSegments {
                rows: HashMap::new(),
                required,
            },
        );
    }

    pub fn close_scan(&self, scan_id: Uuid) {
        self.scans.write().remove(&scan_id);
    }

    /// Record one device's readback for `point_id`. Returns `true` if this
    /// completed the row (every required device has now delivered).
    pub async fn record(
        &self,
        scan_id: Uuid,
        point_id: u64,
        device: &str,
        signals: serde_json::Value,
    ) -> Result<bool, TransportError> {
        let complete_row = {
            let mut scans = self.scans.write();
            let Some(scan) = scans.get_mut(&scan_id) else {
                return Ok(false);
            };
            let row = scan.rows.entry(point_id).or_default();
            row.insert(device.to_string(), signals);
            scan.required.iter().all(|dev| row.contains_key(dev)).then(|| row.clone())
        };

        let Some(row) = complete_row else {
            return Ok(false);
        };

        let mut metadata = Metadata::new();
        metadata.insert("scanID".into(), serde_json::json!(scan_id));
        metadata.insert("pointID".into(), serde_json::json!(point_id));

        let content = serde_json::json!({
            "scanID": scan_id,
            "pointID": point_id,
            "data": row,
        });

        self.broker
            .publish(
                &endpoints::scans::segment(),
                Envelope::new(EnvelopeKind::ScanSegment, content.clone(), metadata.clone()),
            )
            .await?;

        self.broker
            .publish(
                &format!("public_scan_segment/{scan_id}/{point_id}"),
                Envelope::new(EnvelopeKind::ScanSegment, content, metadata),
            )
            .await?;

        Ok(true)
    }

    pub fn segment_count(&self, scan_id: Uuid) -> usize {
        self.scans
            .read()
            .get(&scan_id)
            .map(|s| s.rows.values().filter(|row| {
                s.required.iter().all(|dev| row.contains_key(dev))
            }).count())
            .unwrap_or(0)
    }

    pub fn completed_segments(&self, scan_id: Uuid) -> HashMap<u64, Row> {
        let scans = self.scans.read();
        let Some(scan) = scans.get(&scan_id) else {
            return HashMap::new();
        };
        scan.rows
            .iter()
            .filter(|(_, row)| scan.required.iter().all(|dev| row.contains_key(dev)))
            .map(|(point, row)| (*point, row.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::device::{AcquisitionConfig, Device, ReadoutPriority};
    use serde_json::json;

    fn bundler_with_two_monitored_devices() -> (SegmentBundler<MemoryBroker>, Uuid) {
        let broker = Arc::new(MemoryBroker::new());
        let devices = Arc::new(DeviceRegistry::new(broker.clone()));
        for name in ["samx", "diode"] {
            let mut device = Device::new(name, "generic");
            device.acquisition_config = AcquisitionConfig {
                readout_priority: ReadoutPriority::Monitored,
                schedule: Schedule::Sync,
                async_update: crate::device::AsyncUpdatePolicy::Replace,
            };
            devices.upsert(device);
        }
        let bundler = SegmentBundler::new(broker, devices);
        let scan_id = Uuid::new_v4();
        bundler.open_scan(scan_id);
        (bundler, scan_id)
    }

    #[tokio::test]
    async fn row_is_incomplete_until_every_monitored_device_reports() {
        let (bundler, scan_id) = bundler_with_two_monitored_devices();
        let completed = bundler.record(scan_id, 0, "samx", json!({"value": 1.0})).await.unwrap();
        assert!(!completed);
        let completed = bundler.record(scan_id, 0, "diode", json!({"value": 2.0})).await.unwrap();
        assert!(completed);
        assert_eq!(bundler.segment_count(scan_id), 1);
    }

    #[tokio::test]
    async fn rows_are_independent_per_point_id() {
        let (bundler, scan_id) = bundler_with_two_monitored_devices();
        bundler.record(scan_id, 0, "samx", json!(1)).await.unwrap();
        bundler.record(scan_id, 1, "samx", json!(2)).await.unwrap();
        bundler.record(scan_id, 0, "diode", json!(3)).await.unwrap();
        assert_eq!(bundler.segment_count(scan_id), 1);
        bundler.record(scan_id, 1, "diode", json!(4)).await.unwrap();
        assert_eq!(bundler.segment_count(scan_id), 2);
    }

    #[tokio::test]
    async fn close_scan_drops_tracked_state() {
        let (bundler, scan_id) = bundler_with_two_monitored_devices();
        bundler.record(scan_id, 0, "samx", json!(1)).await.unwrap();
        bundler.close_scan(scan_id);
        assert_eq!(bundler.segment_count(scan_id), 0);
    }
}
