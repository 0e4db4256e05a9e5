//! Device registry (component D): the in-memory device catalog, mutated
//! only through the broker's config-update round trip (spec §3 invariant:
//! "deviceConfig mutations are always round-tripped ... never written
//! locally without acknowledgment").

pub mod registry;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Per-device role in a scan (spec glossary: "readout priority").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutPriority {
    Monitored,
    Baseline,
    Async,
    Ignored,
}

/// Whether a device's file commit waits for `num_points` segments (step
/// scan) or only for `close_scan` (fly scan) — carried per-device on
/// `acquisitionConfig.schedule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    Sync,
    Async,
}

/// What a device driver does when it can't satisfy an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Raise,
    Buffer,
    Retry,
}

/// Merge policy for a device's async readback buckets (spec §4.7, §8 item 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncUpdatePolicy {
    Append,
    Extend,
    Replace,
}

/// Well-known fields of a device's free `deviceConfig` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// `[lo, hi]`; only enforced when `lo < hi` (spec §4.8 item 4).
    pub limits: Option<[f64; 2]>,
    pub tolerance: Option<f64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl DeviceConfig {
    pub fn limits_enforced(&self) -> Option<[f64; 2]> {
        self.limits.filter(|[lo, hi]| lo < hi)
    }
}

/// Acquisition-time behavior for a device within a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    pub readout_priority: ReadoutPriority,
    pub schedule: Schedule,
    pub async_update: AsyncUpdatePolicy,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            readout_priority: ReadoutPriority::Monitored,
            schedule: Schedule::Sync,
            async_update: AsyncUpdatePolicy::Replace,
        }
    }
}

/// One entry in the device registry (spec §3 "Device").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub class_tag: String,
    pub enabled: bool,
    pub enabled_set: bool,
    pub device_config: DeviceConfig,
    pub acquisition_config: AcquisitionConfig,
    pub device_tags: HashSet<String>,
    pub on_failure: OnFailure,
    pub user_parameter: HashMap<String, serde_json::Value>,
}

impl Device {
    pub fn new(name: impl Into<String>, class_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_tag: class_tag.into(),
            enabled: true,
            enabled_set: true,
            device_config: DeviceConfig::default(),
            acquisition_config: AcquisitionConfig::default(),
            device_tags: HashSet::new(),
            on_failure: OnFailure::Raise,
            user_parameter: HashMap::new(),
        }
    }

    /// Whether `value` lies within this device's enforced limits, per spec
    /// §4.8 item 4. A device with no limits, or with `lo >= hi`, always
    /// passes.
    pub fn within_limits(&self, value: f64) -> bool {
        match self.device_config.limits_enforced() {
            Some([lo, hi]) => value >= lo && value <= hi,
            None => true,
        }
    }

    pub fn is_detector(&self) -> bool {
        self.device_tags.contains("detector")
    }
}

/// Result of applying a device config mutation, distinguishing "rejected,
/// unchanged" from "applied" (supplemental behavior, grounded on
/// `device_server/devicemanager.py`'s config versioning/rollback: a
/// rejected request never touches the in-memory registry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigUpdateOutcome {
    Applied,
    Rejected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_only_enforced_when_lo_less_than_hi() {
        let mut device = Device::new("samx", "motor");
        device.device_config.limits = Some([5.0, 5.0]);
        assert!(device.within_limits(1000.0));

        device.device_config.limits = Some([-1.0, 1.0]);
        assert!(device.within_limits(0.5));
        assert!(!device.within_limits(2.0));
    }

    #[test]
    fn no_limits_always_passes() {
        let device = Device::new("samx", "motor");
        assert!(device.within_limits(1e9));
    }
}
