//! Crate-wide error taxonomy.
//!
//! Each component gets its own [`thiserror`] enum (mirrors the spec's error
//! taxonomy in full), and [`FabricError`] composes them for callers that
//! cross component boundaries. Binaries and tests work in terms of
//! [`anyhow::Result`]; library code returns [`FabricResult`] or a
//! component-specific result so callers can match on variant.

use thiserror::Error;
use uuid::Uuid;

/// Convenience alias for the crate's top-level error type.
pub type FabricResult<T> = Result<T, FabricError>;

/// Errors raised while encoding or decoding a broker envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("buffer too short: need at least {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("invalid envelope tag: {0}")]
    UnknownTag(u8),

    #[error("invalid utf-8 in field {field}")]
    InvalidUtf8 {
        field: &'static str,
        #[source]
        source: std::str::Utf8Error,
    },

    #[error("malformed json payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the broker transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("get/set on key {key} failed: {reason}")]
    KeyValue { key: String, reason: String },

    #[error("subscription to {topic} dropped")]
    SubscriptionClosed { topic: String },

    #[error("operation on {key} timed out after retry backoff")]
    RetriesExhausted { key: String },
}

/// Rejections raised by the scan guard. Always pre-enqueue and never fatal
/// to the server.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("unknown scan type '{0}'")]
    UnknownScanType(String),

    #[error("device '{0}' does not exist")]
    UnknownDevice(String),

    #[error("device '{device}' is disabled")]
    DeviceDisabled { device: String },

    #[error("target {value} for device '{device}' is outside limits [{lo}, {hi}]")]
    OutOfLimits {
        device: String,
        value: f64,
        lo: f64,
        hi: f64,
    },

    #[error("{scan_type}: {reason}")]
    InvalidArgs { scan_type: String, reason: String },
}

impl GuardError {
    /// Human-readable rejection message, the way a traceback would read on
    /// the client side.
    pub fn as_traceback(&self) -> String {
        format!("ScanRejection: {self}")
    }
}

/// Errors raised while the worker is driving a scan's instruction stream.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("scan {scan_id} aborted")]
    ScanAbortion { scan_id: Uuid },

    #[error("device '{device}' reported failed movement (diid {diid})")]
    FailedMovement { device: String, diid: u64 },

    #[error("wait-group '{group}' timed out after {elapsed_ms}ms")]
    Timeout { group: String, elapsed_ms: u64 },

    #[error("device config update rejected: {0}")]
    DeviceConfig(String),
}

/// Errors raised by the file-writer sink.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("failed to write master file for scan {scan_id}: {reason}")]
    Write { scan_id: Uuid, reason: String },

    #[error("scan {scan_id} has no storage entry")]
    NoStorage { scan_id: Uuid },
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level error type composing every component's error domain.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
