//! Scan guard (component I), grounded on
//! `scan_server/scan_server/scan_guard.py::ScanGuard._is_valid_scan_request`
//! — the check ordering and the `device_rpc`-as-scan-type special case are
//! carried over verbatim (Part 3 items 2-3 of the expanded spec); the
//! baton and soft-limits checks are reserved no-ops in the original and
//! stay no-ops here.

use std::sync::Arc;

use crate::broker::Broker;
use crate::device::registry::DeviceRegistry;
use crate::error::GuardError;
use crate::scan::ScanClassRegistry;

/// A validated scan request, ready for the assembler. Produced only by
/// [`ScanGuard::check`] succeeding.
pub struct ValidatedRequest {
    pub scan_type: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

/// Synchronous checks run on every accepted request before it may be
/// enqueued (spec §4.8).
pub struct ScanGuard<B: Broker> {
    scan_classes: Arc<ScanClassRegistry<B>>,
    devices: Arc<DeviceRegistry<B>>,
}

const DEVICE_RPC: &str = "device_rpc";

impl<B: Broker> ScanGuard<B> {
    pub fn new(scan_classes: Arc<ScanClassRegistry<B>>, devices: Arc<DeviceRegistry<B>>) -> Self {
        Self {
            scan_classes,
            devices,
        }
    }

    /// Run every check in order; the first failure is returned as the
    /// rejection (spec §4.8: "emit ... a human-readable message carrying
    /// the originating traceback").
    pub fn check(
        &self,
        scan_type: &str,
        args: &[serde_json::Value],
        kwargs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ValidatedRequest, GuardError> {
        // 1. Scan type is in the published registry.
        if scan_type == DEVICE_RPC {
            self.check_device_rpc(args)?;
        } else if !self.scan_classes.contains(scan_type) {
            return Err(GuardError::UnknownScanType(scan_type.to_string()));
        } else {
            let class = self.scan_classes.get(scan_type).expect("checked contains above");
            class.validate(args, kwargs)?;
            self.check_motors_movable(args, class.arg_bundle_size())?;
        }

        // 5. Baton (reserved; currently always passes).
        self.check_baton();
        // Soft limits (reserved; currently always passes, per original).
        self.check_soft_limits();

        Ok(ValidatedRequest {
            scan_type: scan_type.to_string(),
            args: args.to_vec(),
            kwargs: kwargs.clone(),
        })
    }

    /// `device_rpc` requests are a `scan_type` like any other (Part 3 item
    /// 3): target device must exist and be enabled, with no further ACL.
    fn check_device_rpc(&self, args: &[serde_json::Value]) -> Result<(), GuardError> {
        let device = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| GuardError::InvalidArgs {
                scan_type: DEVICE_RPC.to_string(),
                reason: "device_rpc requires a target device as its first argument".into(),
            })?;
        self.require_enabled_device(device)
    }

    /// 2. For `device_rpc`: handled above. 3-4. For regular scans: every
    /// positional device exists, is enabled, and lies within its declared
    /// limits (spec §4.8 items 3-4).
    fn check_motors_movable(
        &self,
        args: &[serde_json::Value],
        bundle_size: usize,
    ) -> Result<(), GuardError> {
        if bundle_size == 0 {
            return Ok(());
        }
        for bundle in args.chunks(bundle_size) {
            let Some(device_name) = bundle.first().and_then(|v| v.as_str()) else {
                continue;
            };
            let device = self.require_enabled_device(device_name)?;
            if let Some(target) = bundle.get(1).and_then(|v| v.as_f64()) {
                if let Some([lo, hi]) = device.device_config.limits_enforced() {
                    if !device.within_limits(target) {
                        return Err(GuardError::OutOfLimits {
                            device: device_name.to_string(),
                            value: target,
                            lo,
                            hi,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn require_enabled_device(&self, name: &str) -> Result<crate::device::Device, GuardError> {
        let device = self
            .devices
            .get(name)
            .ok_or_else(|| GuardError::UnknownDevice(name.to_string()))?;
        if !device.enabled {
            return Err(GuardError::DeviceDisabled {
                device: name.to_string(),
            });
        }
        Ok(device)
    }

    fn check_baton(&self) {}
    fn check_soft_limits(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::device::Device;
    use crate::scan::plan::{PlanStream, ScanClass, ScanReportHint};
    use futures::stream;
    use serde_json::json;
    use uuid::Uuid;

    struct LineScan;
    impl ScanClass for LineScan {
        fn name(&self) -> &str {
            "line_scan"
        }
        fn arg_bundle_size(&self) -> usize {
            3
        }
        fn scan_report_hint(&self) -> ScanReportHint {
            ScanReportHint::Readback {
                device: "samx".into(),
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

    async fn guard() -> ScanGuard<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new());
        let scan_classes = Arc::new(ScanClassRegistry::new(broker.clone()));
        scan_classes.register(Arc::new(LineScan)).await.unwrap();
        let devices = Arc::new(DeviceRegistry::new(broker));
        let mut samx = Device::new("samx", "motor");
        samx.device_config.limits = Some([-10.0, 10.0]);
        devices.upsert(samx);
        ScanGuard::new(scan_classes, devices)
    }

    #[tokio::test]
    async fn rejects_unknown_scan_type() {
        let guard = guard().await;
        let err = guard
            .check("line_scam", &[], &serde_json::Map::new())
            .unwrap_err();
        assert!(matches!(err, GuardError::UnknownScanType(_)));
    }

    #[tokio::test]
    async fn rejects_target_outside_limits() {
        let guard = guard().await;
        let args = vec![json!("samx"), json!(1000.0), json!(10)];
        let err = guard.check("line_scan", &args, &serde_json::Map::new()).unwrap_err();
        assert!(matches!(err, GuardError::OutOfLimits { .. }));
    }

    #[tokio::test]
    async fn accepts_valid_line_scan() {
        let guard = guard().await;
        let args = vec![json!("samx"), json!(5.0), json!(10)];
        let result = guard.check("line_scan", &args, &serde_json::Map::new());
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn device_rpc_flows_through_the_same_gate_as_a_scan() {
        let guard = guard().await;
        let args = vec![json!("samx")];
        assert!(guard.check("device_rpc", &args, &serde_json::Map::new()).is_ok());
    }

    #[tokio::test]
    async fn device_rpc_on_disabled_device_is_rejected() {
        let broker = Arc::new(MemoryBroker::new());
        let scan_classes = Arc::new(ScanClassRegistry::new(broker.clone()));
        let devices = Arc::new(DeviceRegistry::new(broker));
        let mut samx = Device::new("samx", "motor");
        samx.enabled = false;
        devices.upsert(samx);
        let guard = ScanGuard::new(scan_classes, devices);

        let err = guard
            .check("device_rpc", &[json!("samx")], &serde_json::Map::new())
            .unwrap_err();
        assert!(matches!(err, GuardError::DeviceDisabled { .. }));
    }
}
