//! Abstract remote-procedure transport.
//!
//! The coordinator never talks to a bus directly; it drives one of these.
//! An implementation wraps whatever IPC the platform provides and must
//! uphold three contracts:
//!
//! - **Serial delivery** — signals for a given device are pushed into the
//!   sink one at a time, in arrival order. The coordinator applies them
//!   on a single loop and needs no further locking.
//! - **Timeout synthesis** — an async call that receives no reply within
//!   `timeout` resolves to [`RpcError::TimedOut`]. The caller never
//!   arms its own timer.
//! - **Cancellation resolves** — a call whose token fires still resolves
//!   (to [`RpcError::Cancelled`]); it never silently disappears, so the
//!   operation slot sees exactly one completion per begun call.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Signal name used for property-change notifications, whichever
/// mechanism the underlying bus uses to deliver them.
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

/// One push-notification from the backend service.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub path: String,
    pub interface: String,
    pub signal: String,
    pub args: Value,
}

impl SignalEvent {
    pub fn new(
        path: impl Into<String>,
        interface: impl Into<String>,
        signal: impl Into<String>,
        args: Value,
    ) -> Self {
        SignalEvent {
            path: path.into(),
            interface: interface.into(),
            signal: signal.into(),
            args,
        }
    }

    /// Whether this is a property-change notification for `interface`.
    pub fn is_property_change(&self, interface: &str) -> bool {
        self.signal == PROPERTIES_CHANGED && self.interface == interface
    }
}

/// A fully-resolved method invocation, ready to dispatch.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub path: String,
    pub interface: String,
    pub method: String,
    pub args: Value,
}

impl PreparedCall {
    pub fn new(
        path: impl Into<String>,
        interface: impl Into<String>,
        method: impl Into<String>,
        args: Value,
    ) -> Self {
        PreparedCall {
            path: path.into(),
            interface: interface.into(),
            method: method.into(),
            args,
        }
    }
}

/// Transport-level failure taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("call timed out")]
    TimedOut,
    #[error("call cancelled")]
    Cancelled,
    #[error("connection to service lost")]
    ConnectionLost,
    #[error("{name}: {message}")]
    Remote { name: String, message: String },
    #[error("malformed reply: {0}")]
    InvalidReply(String),
}

impl RpcError {
    /// Remote error helper.
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Remote {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Handle to a signal subscription, for deterministic teardown.
pub type SubscriptionId = u64;

/// Sink half of the signal queue; given to the channel implementation.
pub type SignalSink = mpsc::UnboundedSender<SignalEvent>;
/// Source half of the signal queue; given to the coordinator.
pub type SignalSource = mpsc::UnboundedReceiver<SignalEvent>;

/// Create the queue connecting a channel implementation to the
/// coordinator loop.
pub fn signal_bus() -> (SignalSink, SignalSource) {
    mpsc::unbounded_channel()
}

/// The transport operations the coordinator consumes.
///
/// Synchronous calls block the calling context and are reserved for
/// short property reads and queries; the six mutating operations go
/// through [`RpcChannel::call_async`] with a cancellation token and a
/// per-operation timeout.
pub trait RpcChannel: Send + Sync {
    /// Invoke a method and wait for the reply.
    fn call_sync(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError>;

    /// Invoke a method asynchronously. The returned future resolves to
    /// the reply, to `TimedOut` after `timeout`, or to `Cancelled` once
    /// `cancel` fires — whichever happens first.
    fn call_async(
        &self,
        call: PreparedCall,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Value, RpcError>>;

    /// Read a cached property; `None` when the property is absent.
    fn get_property(&self, path: &str, interface: &str, name: &str) -> Option<Value>;

    /// Subscribe to the signals of one interface. Delivery goes to the
    /// sink the implementation was constructed with.
    fn subscribe(&self, path: &str, interface: &str) -> SubscriptionId;

    /// Subscribe to property changes of one interface, delivered as
    /// [`PROPERTIES_CHANGED`] signals.
    fn subscribe_properties(&self, path: &str, interface: &str) -> SubscriptionId;

    /// Drop a subscription. Safe to call with an already-removed id.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Introspect which interfaces an object implements.
    fn list_interfaces(&self, path: &str) -> BTreeSet<String>;
}

// ── Value helpers ───────────────────────────────────────────────────

/// Read a string member of a dictionary value, `None` when missing or
/// not a string.
pub fn str_member<'v>(value: &'v Value, key: &str) -> Option<&'v str> {
    value.get(key).and_then(Value::as_str)
}

/// Read an unsigned member of a dictionary value.
pub fn uint_member(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}

/// Read a boolean member of a dictionary value.
pub fn bool_member(value: &Value, key: &str) -> Option<bool> {
    value.get(key).and_then(Value::as_bool)
}

/// Read the n-th element of a tuple-shaped reply.
pub fn tuple_member(value: &Value, index: usize) -> Option<&Value> {
    value.get(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn property_change_detection() {
        let ev = SignalEvent::new(
            "/m/0",
            "org.test.Net",
            PROPERTIES_CHANGED,
            json!({"Strength": 60}),
        );
        assert!(ev.is_property_change("org.test.Net"));
        assert!(!ev.is_property_change("org.test.Modem"));
    }

    #[test]
    fn value_member_helpers() {
        let v = json!({"number": "+4917012345", "index": 3, "read": true});
        assert_eq!(str_member(&v, "number"), Some("+4917012345"));
        assert_eq!(uint_member(&v, "index"), Some(3));
        assert_eq!(bool_member(&v, "read"), Some(true));
        assert_eq!(str_member(&v, "missing"), None);
        assert_eq!(uint_member(&v, "number"), None);
    }

    #[test]
    fn tuple_member_access() {
        let v = json!([40, 60, 2]);
        assert_eq!(tuple_member(&v, 1).and_then(Value::as_u64), Some(60));
        assert_eq!(tuple_member(&v, 5), None);
    }
}
