//! Dotted-path device proxy (spec §4.9), grounded on the teacher's
//! `messages::Command` + oneshot-reply idiom, generalized here from a fixed
//! command set to an open-ended `field().call()` builder (REDESIGN FLAGS §9:
//! "Dynamic attribute trees").

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::ClientContext;
use crate::broker::Broker;
use crate::endpoints;
use crate::error::{GuardError, TransportError};
use crate::queue::MergeKey;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);
const RPC_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A composable path into a remote device's attribute tree. `field` appends
/// a path segment; `call` issues the RPC built from the accumulated path
/// plus a terminal function name.
#[derive(Clone)]
pub struct DeviceHandle<B: Broker> {
    ctx: Arc<ClientContext<B>>,
    root_device: String,
    path: Vec<String>,
}

/// Error surfaced by a device RPC call: either the guard rejected it before
/// it reached the device-server, the broker round trip failed, or the
/// device-server never replied inside the deadline.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Rejected(#[from] GuardError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("device_rpc {rpc_id} on '{device}' did not answer within {timeout_ms}ms")]
    Timeout {
        device: String,
        rpc_id: String,
        timeout_ms: u64,
    },
}

impl<B: Broker> DeviceHandle<B> {
    pub(crate) fn new(ctx: Arc<ClientContext<B>>, root_device: String) -> Self {
        Self {
            ctx,
            root_device,
            path: Vec::new(),
        }
    }

    /// Descend one level into the device's attribute tree (e.g.
    /// `dev.samx.field("controller").field("feedback_enable")`).
    pub fn field(&self, name: impl Into<String>) -> Self {
        let mut path = self.path.clone();
        path.push(name.into());
        Self {
            ctx: self.ctx.clone(),
            root_device: self.root_device.clone(),
            path,
        }
    }

    fn dotted_func(&self, func: &str) -> String {
        if self.path.is_empty() {
            func.to_string()
        } else {
            format!("{}.{}", self.path.join("."), func)
        }
    }

    /// Package `{device, rpc_id, func, args, kwargs}` into a `device_rpc`
    /// scan request, enqueue it, then poll `device_rpc/<rpc_id>` for the
    /// return value (spec §4.9).
    pub async fn call(
        &self,
        func: &str,
        args: Vec<serde_json::Value>,
        kwargs: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, RpcError> {
        let rpc_id = Uuid::new_v4();
        let mut request_kwargs = serde_json::Map::new();
        request_kwargs.insert("rpc_id".into(), serde_json::json!(rpc_id));
        request_kwargs.insert("func".into(), serde_json::json!(self.dotted_func(func)));
        request_kwargs.insert("args".into(), serde_json::json!(args));
        request_kwargs.insert("kwargs".into(), serde_json::json!(kwargs));

        self.ctx.submit(
            "device_rpc",
            vec![serde_json::json!(self.root_device)],
            request_kwargs,
            None,
            MergeKey::default(),
        )?;

        let result = self
            .ctx
            .poll_rpc_result(&rpc_id.to_string(), DEFAULT_RPC_TIMEOUT, RPC_POLL_INTERVAL)
            .await?;

        result.ok_or_else(|| RpcError::Timeout {
            device: self.root_device.clone(),
            rpc_id: rpc_id.to_string(),
            timeout_ms: DEFAULT_RPC_TIMEOUT.as_millis() as u64,
        })
    }

    /// Read the device's current value. `cached = true` short-circuits
    /// through the last-published readback key rather than issuing an RPC
    /// (spec §4.9).
    pub async fn read(&self, cached: bool) -> Result<Option<serde_json::Value>, RpcError> {
        if cached {
            let key = if self.path.is_empty() {
                endpoints::devices::readback(&self.root_device)
            } else {
                endpoints::devices::readback(&format!("{}.{}", self.root_device, self.path.join(".")))
            };
            let envelope = self.ctx.broker().get(&key).await?;
            return Ok(envelope.map(|e| e.content));
        }
        self.call("read", Vec::new(), serde_json::Map::new())
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::codec::{Envelope, EnvelopeKind, Metadata};
    use crate::correlator::SharedCorrelator;
    use crate::device::registry::DeviceRegistry;
    use crate::device::Device;
    use crate::guard::ScanGuard;
    use crate::queue::ScanQueueManager;
    use crate::scan::ScanClassRegistry;
    use std::sync::Arc;

    fn context() -> Arc<ClientContext<MemoryBroker>> {
        let broker = Arc::new(MemoryBroker::new());
        let scan_classes = Arc::new(ScanClassRegistry::new(broker.clone()));
        let devices = Arc::new(DeviceRegistry::new(broker.clone()));
        devices.upsert(Device::new("samx", "motor"));
        let guard = Arc::new(ScanGuard::new(scan_classes, devices.clone()));
        let queue = Arc::new(ScanQueueManager::new(broker.clone(), 50));
        let correlator: SharedCorrelator = Arc::new(crate::correlator::RequestCorrelator::new());
        Arc::new(ClientContext::new(broker, guard, queue, correlator, devices))
    }

    #[tokio::test]
    async fn field_composes_a_dotted_path() {
        let ctx = context();
        let handle = ctx.device("samx").field("controller").field("feedback_enable");
        assert_eq!(handle.dotted_func("set"), "controller.feedback_enable.set");
    }

    #[tokio::test]
    async fn cached_read_short_circuits_through_the_broker_key() {
        let ctx = context();
        ctx.broker()
            .set(
                &endpoints::devices::readback("samx"),
                Envelope::new(EnvelopeKind::DeviceReadback, serde_json::json!({"value": 1.5}), Metadata::new()),
            )
            .await
            .unwrap();

        let handle = ctx.device("samx");
        let value = handle.read(true).await.unwrap().unwrap();
        assert_eq!(value["value"], serde_json::json!(1.5));
    }

    #[tokio::test]
    async fn call_on_unregistered_device_is_rejected_by_the_guard_before_any_rpc_wait() {
        let ctx = context();
        let handle = ctx.device("does_not_exist");
        let err = handle
            .call("get_feedback", Vec::new(), serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Rejected(GuardError::UnknownDevice(_))));
    }
}
