//! File-writer sink, grounded on `file_writer/file_writer_manager.py`'s
//! readiness check and announce-before-publish sequencing (spec §4.7,
//! §6.4), and on the teacher's `#[async_trait] StorageWriter` idiom in
//! `src/data/storage.rs` for the actual write step.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::plugin::{FileFormatPlugin, NoopPlugin};
use crate::broker::Broker;
use crate::codec::{Envelope, EnvelopeKind, Metadata};
use crate::device::AsyncUpdatePolicy;
use crate::endpoints;
use crate::error::{TransportError, WriterError};

/// Per-scan accumulated storage (spec §3 "Scan" storage fields, §4.7).
#[derive(Debug, Clone)]
pub struct ScanStorage {
    pub scan_id: Uuid,
    pub enforce_sync: bool,
    pub num_points: Option<u64>,
    /// pointID -> device -> signal map.
    pub scan_segments: HashMap<u64, HashMap<String, serde_json::Value>>,
    pub baseline: Option<serde_json::Value>,
    pub async_data: HashMap<String, serde_json::Value>,
    pub file_references: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub scan_finished: bool,
}

impl ScanStorage {
    pub fn new(scan_id: Uuid, enforce_sync: bool) -> Self {
        Self {
            scan_id,
            enforce_sync,
            num_points: None,
            scan_segments: HashMap::new(),
            baseline: None,
            async_data: HashMap::new(),
            file_references: Vec::new(),
            metadata: HashMap::new(),
            start_time: None,
            end_time: None,
            scan_finished: false,
        }
    }

    /// Whether the sink is ready to commit (spec §4.7).
    pub fn is_ready(&self) -> bool {
        if self.enforce_sync {
            self.scan_finished
                && self.num_points.map(|n| n as usize == self.scan_segments.len()).unwrap_or(false)
        } else {
            self.scan_finished
        }
    }
}

/// Merge an incoming async reading into `current` per `policy` (spec §4.7,
/// §8 item 9: the async merge laws), grounded on
/// `file_writer_manager.py::_process_async_data` (`file_writer_manager.py:258-276`),
/// which keys `async_data` by signal name and concatenates per key rather
/// than nesting one reading inside another.
pub fn merge_async(
    current: Option<serde_json::Value>,
    incoming: serde_json::Value,
    policy: AsyncUpdatePolicy,
) -> serde_json::Value {
    match policy {
        AsyncUpdatePolicy::Replace => incoming,
        AsyncUpdatePolicy::Append | AsyncUpdatePolicy::Extend => concat_by_signal(current, incoming),
    }
}

/// Flat concatenation, recursing per signal name when both sides are
/// objects (`extend({k:[1,2]},{k:[3]})=={k:[1,2,3]}`), otherwise splicing
/// arrays flat and pushing scalars as one element
/// (`append([a],[b])==[a,b]`, `append(["a"],"b")==["a","b"]`).
fn concat_by_signal(current: Option<serde_json::Value>, incoming: serde_json::Value) -> serde_json::Value {
    if let (Some(serde_json::Value::Object(mut cur)), serde_json::Value::Object(inc)) =
        (current.clone(), incoming.clone())
    {
        for (key, value) in inc {
            let merged = concat_by_signal(cur.remove(&key), value);
            cur.insert(key, merged);
        }
        return serde_json::Value::Object(cur);
    }

    let mut list = match current {
        Some(serde_json::Value::Array(arr)) => arr,
        Some(other) => vec![other],
        None => Vec::new(),
    };
    match incoming {
        serde_json::Value::Array(more) => list.extend(more),
        other => list.push(other),
    }
    serde_json::Value::Array(list)
}

/// The actual master-file write step. A trait so tests and alternate
/// storage backends can swap it out, the way the teacher's
/// `#[async_trait] StorageWriter` lets CSV/HDF5/Arrow backends share one
/// call site.
#[async_trait]
pub trait MasterFileWriter: Send + Sync {
    async fn write(&self, storage: &ScanStorage) -> Result<PathBuf, std::io::Error>;
}

/// Writes one JSON sidecar per scan under `base_path`. NeXus/HDF5 layout
/// specifics are out of scope (spec §1); this is the implementation-defined
/// hierarchy the wire contract (§6.4) promises nothing about beyond the
/// `public/<scanID>/file/master` announcement.
pub struct JsonMasterFileWriter {
    pub base_path: PathBuf,
}

#[async_trait]
impl MasterFileWriter for JsonMasterFileWriter {
    async fn write(&self, storage: &ScanStorage) -> Result<PathBuf, std::io::Error> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        let path = self.base_path.join(format!("{}.json", storage.scan_id));
        let body = serde_json::to_vec_pretty(&serde_json::json!({
            "scanID": storage.scan_id,
            "num_points": storage.num_points,
            "scan_segments": storage.scan_segments,
            "baseline": storage.baseline,
            "async_data": storage.async_data,
            "file_references": storage.file_references,
            "metadata": storage.metadata,
        }))?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

/// Owns one [`ScanStorage`] per open scan and commits it once ready.
pub struct FileWriterSink<B: Broker> {
    broker: Arc<B>,
    storage: RwLock<HashMap<Uuid, ScanStorage>>,
    writer: Box<dyn MasterFileWriter>,
    plugin: Box<dyn FileFormatPlugin>,
}

impl<B: Broker> FileWriterSink<B> {
    pub fn new(broker: Arc<B>, writer: Box<dyn MasterFileWriter>) -> Self {
        Self {
            broker,
            storage: RwLock::new(HashMap::new()),
            writer,
            plugin: Box::new(NoopPlugin),
        }
    }

    pub fn with_plugin(mut self, plugin: Box<dyn FileFormatPlugin>) -> Self {
        self.plugin = plugin;
        self
    }

    pub fn open_scan(&self, scan_id: Uuid, enforce_sync: bool, num_points: Option<u64>) {
        let mut storage = ScanStorage::new(scan_id, enforce_sync);
        storage.num_points = num_points;
        storage.start_time = Some(chrono::Utc::now());
        self.storage.write().insert(scan_id, storage);
    }

    pub fn record_segment(
        &self,
        scan_id: Uuid,
        point_id: u64,
        row: HashMap<String, serde_json::Value>,
    ) {
        if let Some(storage) = self.storage.write().get_mut(&scan_id) {
            storage.scan_segments.insert(point_id, row);
        }
    }

    pub fn mark_finished(&self, scan_id: Uuid) {
        if let Some(storage) = self.storage.write().get_mut(&scan_id) {
            storage.scan_finished = true;
            storage.end_time = Some(chrono::Utc::now());
        }
    }

    fn is_ready(&self, scan_id: Uuid) -> bool {
        self.storage
            .read()
            .get(&scan_id)
            .map(|s| s.is_ready())
            .unwrap_or(false)
    }

    /// Edge-triggered commit attempt: call after recording a new segment or
    /// a terminal status (spec §5). No-ops if not yet ready.
    pub async fn try_commit(&self, scan_id: Uuid) -> Result<bool, WriterError> {
        if !self.is_ready(scan_id) {
            return Ok(false);
        }

        self.pull_baseline(scan_id).await.map_err(to_writer_err(scan_id))?;
        self.pull_file_references(scan_id).await.map_err(to_writer_err(scan_id))?;
        self.pull_async_readbacks(scan_id).await.map_err(to_writer_err(scan_id))?;

        self.announce(scan_id, false, None).await.map_err(to_writer_err(scan_id))?;

        let mut storage = self
            .storage
            .write()
            .remove(&scan_id)
            .ok_or(WriterError::NoStorage { scan_id })?;
        self.plugin.before_write(&mut storage);

        match self.writer.write(&storage).await {
            Ok(path) => {
                info!(scan_id = %scan_id, path = %path.display(), "master file committed");
                self.announce(scan_id, true, Some(true)).await.map_err(to_writer_err(scan_id))?;
                Ok(true)
            }
            Err(e) => {
                // WriterError is a MINOR alarm at the caller; the
                // announcement still carries successful=false and the
                // storage is released regardless (spec §7).
                warn!(scan_id = %scan_id, error = %e, "master file write failed");
                self.announce(scan_id, true, Some(false)).await.map_err(to_writer_err(scan_id))?;
                Err(WriterError::Write {
                    scan_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn pull_baseline(&self, scan_id: Uuid) -> Result<(), TransportError> {
        let baseline = self
            .broker
            .get(&endpoints::public::baseline(&scan_id.to_string()))
            .await?;
        if let Some(envelope) = baseline {
            if let Some(storage) = self.storage.write().get_mut(&scan_id) {
                storage.baseline = Some(envelope.content);
            }
        }
        Ok(())
    }

    async fn pull_file_references(&self, scan_id: Uuid) -> Result<(), TransportError> {
        let keys = self
            .broker
            .keys_matching(&endpoints::public::file_pattern(&scan_id.to_string()))
            .await?;
        if let Some(storage) = self.storage.write().get_mut(&scan_id) {
            storage.file_references = keys;
        }
        Ok(())
    }

    async fn pull_async_readbacks(&self, scan_id: Uuid) -> Result<(), TransportError> {
        // Devices aren't threaded through here directly; callers that know
        // the device set for this scan should have already primed
        // `async_data` via `merge_async_reading`. This pass only re-reads
        // any stream keys already known from prior async_data entries so a
        // late-arriving reading before `try_commit` is still picked up.
        let device_names: Vec<String> = self
            .storage
            .read()
            .get(&scan_id)
            .map(|s| s.async_data.keys().cloned().collect())
            .unwrap_or_default();
        for device in device_names {
            let stream_key = endpoints::device_async_readback(&scan_id.to_string(), &device);
            let entries = self.broker.stream_range(&stream_key).await?;
            if entries.is_empty() {
                continue;
            }
            // Policy isn't known to the sink directly; entries already
            // carry the merged value produced by `merge_async_reading`, so
            // this just takes the most recent snapshot.
            if let Some(last) = entries.last() {
                if let Some(storage) = self.storage.write().get_mut(&scan_id) {
                    storage.async_data.insert(device.clone(), last.content.clone());
                }
            }
        }
        Ok(())
    }

    /// Apply one async reading for `device` under `policy`, merging it into
    /// the scan's `async_data` bucket (spec §4.7, §8 item 9) and appending
    /// it to the device's stream key so `pull_async_readbacks` can recover
    /// it even across a restart.
    pub async fn merge_async_reading(
        &self,
        scan_id: Uuid,
        device: &str,
        reading: serde_json::Value,
        policy: AsyncUpdatePolicy,
    ) -> Result<(), TransportError> {
        let merged = {
            let mut storage = self.storage.write();
            let Some(storage) = storage.get_mut(&scan_id) else {
                return Ok(());
            };
            let current = storage.async_data.remove(device);
            let merged = merge_async(current, reading, policy);
            storage.async_data.insert(device.to_string(), merged.clone());
            merged
        };

        self.broker
            .stream_append(
                &endpoints::device_async_readback(&scan_id.to_string(), device),
                Envelope::new(EnvelopeKind::DeviceReadback, merged, Metadata::new()),
            )
            .await
    }

    /// Announce-before-publish (spec §4.7): the writer sets `done=false`
    /// before writing, then `done=true, successful=..` after.
    async fn announce(
        &self,
        scan_id: Uuid,
        done: bool,
        successful: Option<bool>,
    ) -> Result<(), TransportError> {
        let content = serde_json::json!({
            "file_path": format!("{}", scan_id),
            "done": done,
            "successful": successful,
        });
        self.broker
            .set_and_publish(
                &endpoints::public::file(&scan_id.to_string(), "master"),
                Envelope::new(EnvelopeKind::File, content, Metadata::new()),
            )
            .await
    }
}

fn to_writer_err(scan_id: Uuid) -> impl Fn(TransportError) -> WriterError {
    move |e| WriterError::Write {
        scan_id,
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use serde_json::json;

    #[test]
    fn append_law() {
        let result = merge_async(
            Some(json!([1])),
            json!([2]),
            AsyncUpdatePolicy::Append,
        );
        assert_eq!(result, json!([1, 2]));
    }

    #[test]
    fn append_law_with_scalar_elements() {
        let result = merge_async(Some(json!(["a"])), json!("b"), AsyncUpdatePolicy::Append);
        assert_eq!(result, json!(["a", "b"]));
    }

    #[test]
    fn extend_law() {
        let result = merge_async(Some(json!([1, 2])), json!([3]), AsyncUpdatePolicy::Extend);
        assert_eq!(result, json!([1, 2, 3]));
    }

    #[test]
    fn extend_law_merges_per_signal_name() {
        let result = merge_async(
            Some(json!({"mon": [1, 2]})),
            json!({"mon": [3]}),
            AsyncUpdatePolicy::Extend,
        );
        assert_eq!(result, json!({"mon": [1, 2, 3]}));
    }

    #[test]
    fn replace_law() {
        let result = merge_async(Some(json!("x")), json!("y"), AsyncUpdatePolicy::Replace);
        assert_eq!(result, json!("y"));
    }

    #[tokio::test]
    async fn step_scan_requires_segment_count_to_equal_num_points() {
        let broker = Arc::new(MemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let sink = FileWriterSink::new(
            broker,
            Box::new(JsonMasterFileWriter {
                base_path: dir.path().to_path_buf(),
            }),
        );
        let scan_id = Uuid::new_v4();
        sink.open_scan(scan_id, true, Some(2));
        sink.record_segment(scan_id, 0, HashMap::new());
        sink.mark_finished(scan_id);
        assert!(!sink.try_commit(scan_id).await.unwrap());

        sink.record_segment(scan_id, 1, HashMap::new());
        assert!(sink.try_commit(scan_id).await.unwrap());
    }

    #[tokio::test]
    async fn fly_scan_only_needs_scan_finished() {
        let broker = Arc::new(MemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let sink = FileWriterSink::new(
            broker,
            Box::new(JsonMasterFileWriter {
                base_path: dir.path().to_path_buf(),
            }),
        );
        let scan_id = Uuid::new_v4();
        sink.open_scan(scan_id, false, None);
        assert!(!sink.try_commit(scan_id).await.unwrap());
        sink.mark_finished(scan_id);
        assert!(sink.try_commit(scan_id).await.unwrap());
    }

    #[tokio::test]
    async fn commit_announces_done_false_then_done_true_successful() {
        let broker = Arc::new(MemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let sink = FileWriterSink::new(
            broker.clone(),
            Box::new(JsonMasterFileWriter {
                base_path: dir.path().to_path_buf(),
            }),
        );
        let scan_id = Uuid::new_v4();
        let mut sub = broker
            .subscribe(&endpoints::public::file(&scan_id.to_string(), "master"))
            .await
            .unwrap();
        sink.open_scan(scan_id, false, None);
        sink.mark_finished(scan_id);
        sink.try_commit(scan_id).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.envelope.content["done"], json!(false));
        let second = sub.recv().await.unwrap();
        assert_eq!(second.envelope.content["done"], json!(true));
        assert_eq!(second.envelope.content["successful"], json!(true));
    }
}
