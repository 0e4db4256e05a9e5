//! Instruction model and the scan-class `Plan` abstraction (components G).
//!
//! Grounded on the teacher's `experiment::plan::{Message, Plan, PlanStream}`
//! — generalized from the teacher's fixed six-variant `Message` enum to the
//! full `Instruction` action table of spec §4.4, and from the teacher's
//! `validate()`/`metadata()` pair to the scan-class contract of spec §4.3
//! (`arg_input`, `arg_bundle_size`, scan-report hint).

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::ReadoutPriority;
use crate::error::GuardError;

/// `{device: name | [names] | ∅}` from spec §3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceTarget {
    None,
    One(String),
    Many(Vec<String>),
}

impl DeviceTarget {
    pub fn names(&self) -> Vec<String> {
        match self {
            DeviceTarget::None => Vec::new(),
            DeviceTarget::One(name) => vec![name.clone()],
            DeviceTarget::Many(names) => names.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, DeviceTarget::None)
    }
}

/// The full instruction action table (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    OpenScan,
    CloseScan,
    Stage,
    Unstage,
    Set,
    Read,
    Trigger,
    Kickoff,
    Complete,
    Wait,
    Rpc,
    BaselineReading,
    PublishDataAsRead,
    ScanReportInstruction,
    PreScan,
}

/// What a `wait` instruction waits on (spec §4.4 row for `wait`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Move,
    Read,
    Trigger,
}

/// Per-instruction metadata (spec §3 "Instruction").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstructionMetadata {
    pub rid: Uuid,
    pub scan_id: Option<Uuid>,
    pub diid: Option<u64>,
    pub point_id: Option<u64>,
    pub readout_priority: Option<ReadoutPriority>,
}

/// One instruction in a scan's lazy sequence (spec §3 "Instruction").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub device: DeviceTarget,
    pub action: Action,
    pub parameter: serde_json::Value,
    pub metadata: InstructionMetadata,
    /// Present when this instruction's completion must gate a later `wait`
    /// (spec glossary: "wait-group").
    pub wait_group: Option<String>,
    /// Only meaningful for `Action::Wait`.
    pub wait_kind: Option<WaitKind>,
}

impl Instruction {
    pub fn new(device: DeviceTarget, action: Action, parameter: serde_json::Value) -> Self {
        Self {
            device,
            action,
            parameter,
            metadata: InstructionMetadata::default(),
            wait_group: None,
            wait_kind: None,
        }
    }

    pub fn with_metadata(mut self, metadata: InstructionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_wait_group(mut self, tag: impl Into<String>) -> Self {
        self.wait_group = Some(tag.into());
        self
    }

    pub fn wait(kind: WaitKind, wait_group: impl Into<String>, metadata: InstructionMetadata) -> Self {
        Self {
            device: DeviceTarget::None,
            action: Action::Wait,
            parameter: serde_json::Value::Null,
            metadata,
            wait_group: Some(wait_group.into()),
            wait_kind: Some(kind),
        }
    }
}

/// A scan's lazily-produced instruction stream (restartable: each call to
/// [`ScanClass::run`] builds a fresh stream from scratch).
pub type PlanStream<'a> = BoxStream<'a, Result<Instruction, GuardError>>;

/// How a scan class wants the client UI to follow progress (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ScanReportHint {
    Readback { device: String },
    Table { devices: Vec<String> },
    ScanProgress { device: String },
}

/// One positional-argument bundle: element 0 is always a device name, the
/// rest are parameters (spec §4.3 bundle arithmetic).
#[derive(Debug, Clone)]
pub struct ArgBundle {
    pub device: String,
    pub params: Vec<serde_json::Value>,
}

/// Split flat positional args into bundles of `bundle_size`, validating the
/// length invariant from spec §4.3.
pub fn bundle_args(
    args: &[serde_json::Value],
    bundle_size: usize,
) -> Result<Vec<ArgBundle>, GuardError> {
    if bundle_size == 0 || args.len() % bundle_size != 0 {
        return Err(GuardError::InvalidArgs {
            scan_type: "unknown".into(),
            reason: format!(
                "args length {} is not a multiple of bundle size {}",
                args.len(),
                bundle_size
            ),
        });
    }
    args.chunks(bundle_size)
        .map(|chunk| {
            let device = chunk[0]
                .as_str()
                .ok_or_else(|| GuardError::InvalidArgs {
                    scan_type: "unknown".into(),
                    reason: "bundle's first element must be a device name".into(),
                })?
                .to_string();
            Ok(ArgBundle {
                device,
                params: chunk[1..].to_vec(),
            })
        })
        .collect()
}

/// A registered scan type (spec §4.3).
pub trait ScanClass: Send + Sync {
    fn name(&self) -> &str;
    fn arg_bundle_size(&self) -> usize;
    fn required_kwargs(&self) -> &[&str] {
        &[]
    }
    fn scan_report_hint(&self) -> ScanReportHint;
    /// Human-readable description surfaced in a `GuardError::InvalidArgs`
    /// rejection message (spec §4.3: "carrying the scan's doc string").
    fn doc(&self) -> &str {
        ""
    }

    /// Build the restartable lazy instruction sequence for one invocation.
    fn run(
        &self,
        rid: Uuid,
        args: &[serde_json::Value],
        kwargs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<PlanStream<'static>, GuardError>;

    /// Validate args/kwargs shape without building the stream (used by the
    /// guard and by the assembler before enqueue).
    fn validate(
        &self,
        args: &[serde_json::Value],
        kwargs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), GuardError> {
        bundle_args(args, self.arg_bundle_size())?;
        for required in self.required_kwargs() {
            if !kwargs.contains_key(*required) {
                return Err(GuardError::InvalidArgs {
                    scan_type: self.name().to_string(),
                    reason: format!("missing required kwarg '{required}': {}", self.doc()),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bundle_args_splits_device_and_params() {
        let args = vec![json!("samx"), json!(-5.0), json!(5.0), json!(10)];
        let bundles = bundle_args(&args, 4).unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].device, "samx");
        assert_eq!(bundles[0].params, vec![json!(-5.0), json!(5.0), json!(10)]);
    }

    #[test]
    fn bundle_args_rejects_non_multiple_length() {
        let args = vec![json!("samx"), json!(-5.0)];
        let err = bundle_args(&args, 3).unwrap_err();
        assert!(matches!(err, GuardError::InvalidArgs { .. }));
    }

    #[test]
    fn device_target_names_covers_all_three_shapes() {
        assert!(DeviceTarget::None.names().is_empty());
        assert_eq!(DeviceTarget::One("samx".into()).names(), vec!["samx"]);
        assert_eq!(
            DeviceTarget::Many(vec!["samx".into(), "samy".into()]).names(),
            vec!["samx", "samy"]
        );
    }
}
