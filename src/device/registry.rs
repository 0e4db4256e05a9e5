//! In-memory device catalog with config mutations routed through the
//! broker, grounded on the teacher's factory-registry shape
//! (`modules::ModuleRegistry`) generalized from "plugin factories" to "live
//! device catalog", and on `device_server/devicemanager.py`'s config
//! request/update round trip.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{ConfigUpdateOutcome, Device};
use crate::broker::Broker;
use crate::codec::{Envelope, EnvelopeKind, Metadata};
use crate::endpoints;
use crate::error::TransportError;

/// The device catalog. Devices are added via [`DeviceRegistry::upsert`]
/// (e.g. at startup, from a session file) and mutated afterward only
/// through [`DeviceRegistry::request_config_update`], never written
/// locally without the device-server's acknowledgment (spec §3 invariant).
pub struct DeviceRegistry<B: Broker> {
    broker: Arc<B>,
    devices: RwLock<HashMap<String, Device>>,
}

impl<B: Broker> DeviceRegistry<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self {
            broker,
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn upsert(&self, device: Device) {
        self.devices.write().insert(device.name.clone(), device);
    }

    pub fn get(&self, name: &str) -> Option<Device> {
        self.devices.read().get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.devices.read().contains_key(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.devices
            .read()
            .get(name)
            .map(|d| d.enabled)
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    pub fn detector_names(&self) -> Vec<String> {
        self.devices
            .read()
            .values()
            .filter(|d| d.is_detector())
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn monitored_names(&self) -> Vec<String> {
        self.devices
            .read()
            .values()
            .filter(|d| d.acquisition_config.readout_priority == super::ReadoutPriority::Monitored)
            .map(|d| d.name.clone())
            .collect()
    }

    /// Request a config mutation and wait for the device-server's
    /// `device_config_update` acknowledgment. On rejection, the registry's
    /// in-memory entry is left untouched (it was never applied locally).
    pub async fn request_config_update(
        &self,
        device: &str,
        patch: serde_json::Value,
        timeout: Duration,
    ) -> Result<ConfigUpdateOutcome, TransportError> {
        let mut metadata = Metadata::new();
        metadata.insert("device".into(), serde_json::json!(device));

        let request = Envelope::new(
            EnvelopeKind::DeviceConfigUpdate,
            serde_json::json!({"device": device, "patch": patch}),
            metadata,
        );
        self.broker
            .publish(&endpoints::devices::config_request(), request)
            .await?;

        let mut sub = self.broker.subscribe(&endpoints::devices::config_update()).await?;
        let wait = async {
            loop {
                let Some(delivery) = sub.recv().await else {
                    return ConfigUpdateOutcome::Rejected {
                        reason: "config_update subscription closed".into(),
                    };
                };
                let content = &delivery.envelope.content;
                if content.get("device").and_then(|v| v.as_str()) != Some(device) {
                    continue;
                }
                let accepted = content.get("accepted").and_then(|v| v.as_bool()).unwrap_or(false);
                if accepted {
                    let mut devices = self.devices.write();
                    if let Some(d) = devices.get_mut(device) {
                        if let Some(patch_obj) = content.get("applied") {
                            apply_patch(d, patch_obj);
                        }
                    }
                    drop(devices);
                    info!(device, "config update applied");
                    return ConfigUpdateOutcome::Applied;
                }
                let reason = content
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("rejected")
                    .to_string();
                warn!(device, reason = %reason, "config update rejected");
                return ConfigUpdateOutcome::Rejected { reason };
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                warn!(device, "config update timed out waiting for device-server ack");
                Ok(ConfigUpdateOutcome::Rejected {
                    reason: "device-server did not acknowledge within timeout".into(),
                })
            }
        }
    }
}

fn apply_patch(device: &mut Device, patch: &serde_json::Value) {
    if let Some(limits) = patch.get("limits").and_then(|v| v.as_array()) {
        if limits.len() == 2 {
            if let (Some(lo), Some(hi)) = (limits[0].as_f64(), limits[1].as_f64()) {
                device.device_config.limits = Some([lo, hi]);
            }
        }
    }
    if let Some(tolerance) = patch.get("tolerance").and_then(|v| v.as_f64()) {
        device.device_config.tolerance = Some(tolerance);
    }
    if let Some(enabled) = patch.get("enabled").and_then(|v| v.as_bool()) {
        device.enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    #[tokio::test]
    async fn rejected_update_leaves_registry_unchanged() {
        let broker = Arc::new(MemoryBroker::new());
        let registry = DeviceRegistry::new(broker.clone());
        registry.upsert(Device::new("samx", "motor"));

        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let mut sub = broker
                    .subscribe(&endpoints::devices::config_request())
                    .await
                    .unwrap();
                let delivery = sub.recv().await.unwrap();
                let device = delivery.envelope.content["device"].as_str().unwrap().to_string();
                broker
                    .publish(
                        &endpoints::devices::config_update(),
                        Envelope::new(
                            EnvelopeKind::DeviceConfigUpdate,
                            serde_json::json!({"device": device, "accepted": false, "reason": "bad shape"}),
                            Metadata::new(),
                        ),
                    )
                    .await
                    .unwrap();
            })
        };

        let outcome = registry
            .request_config_update("samx", serde_json::json!({"limits": [1, 2]}), Duration::from_secs(1))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(
            outcome,
            ConfigUpdateOutcome::Rejected {
                reason: "bad shape".into()
            }
        );
        assert!(registry.get("samx").unwrap().device_config.limits.is_none());
    }

    #[tokio::test]
    async fn accepted_update_applies_patch() {
        let broker = Arc::new(MemoryBroker::new());
        let registry = DeviceRegistry::new(broker.clone());
        registry.upsert(Device::new("samx", "motor"));

        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let mut sub = broker
                    .subscribe(&endpoints::devices::config_request())
                    .await
                    .unwrap();
                let delivery = sub.recv().await.unwrap();
                let device = delivery.envelope.content["device"].as_str().unwrap().to_string();
                broker
                    .publish(
                        &endpoints::devices::config_update(),
                        Envelope::new(
                            EnvelopeKind::DeviceConfigUpdate,
                            serde_json::json!({
                                "device": device,
                                "accepted": true,
                                "applied": {"limits": [-5.0, 5.0]},
                            }),
                            Metadata::new(),
                        ),
                    )
                    .await
                    .unwrap();
            })
        };

        let outcome = registry
            .request_config_update("samx", serde_json::json!({"limits": [-5.0, 5.0]}), Duration::from_secs(1))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(outcome, ConfigUpdateOutcome::Applied);
        assert_eq!(registry.get("samx").unwrap().device_config.limits, Some([-5.0, 5.0]));
    }
}
