//! Shared test fixture: a scripted in-memory RPC channel.
//!
//! The channel upholds the three `RpcChannel` contracts: signals go
//! through one queue in order, a hung call resolves to `TimedOut` after
//! its timeout, and a cancelled call resolves to `Cancelled`.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tether_common::events::CoreEvent;
use tether_core::rpc::{
    PreparedCall, RpcChannel, RpcError, SignalEvent, SignalSink, SubscriptionId,
};

/// Scripted behavior for one method call.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Value),
    Err(RpcError),
    /// Never answers; the call resolves through timeout or cancellation.
    Hang,
}

/// One recorded method invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub path: String,
    pub interface: String,
    pub method: String,
    pub args: Value,
}

#[derive(Default)]
struct Inner {
    properties: HashMap<(String, String, String), Value>,
    scripted: HashMap<(String, String), VecDeque<Reply>>,
    defaults: HashMap<(String, String), Reply>,
    interfaces: HashMap<String, BTreeSet<String>>,
    calls: Vec<RecordedCall>,
    next_subscription: SubscriptionId,
}

pub struct MockChannel {
    sink: SignalSink,
    inner: Mutex<Inner>,
}

impl MockChannel {
    pub fn new(sink: SignalSink) -> Self {
        MockChannel {
            sink,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Queue one reply for the next call of `method` on `interface`.
    pub fn script(&self, interface: &str, method: &str, reply: Reply) {
        self.inner
            .lock()
            .unwrap()
            .scripted
            .entry((interface.to_owned(), method.to_owned()))
            .or_default()
            .push_back(reply);
    }

    /// Standing reply used whenever no queued reply is left.
    pub fn script_default(&self, interface: &str, method: &str, reply: Reply) {
        self.inner
            .lock()
            .unwrap()
            .defaults
            .insert((interface.to_owned(), method.to_owned()), reply);
    }

    pub fn set_property(&self, path: &str, interface: &str, name: &str, value: Value) {
        self.inner.lock().unwrap().properties.insert(
            (path.to_owned(), interface.to_owned(), name.to_owned()),
            value,
        );
    }

    pub fn set_interfaces(&self, path: &str, interfaces: &[&str]) {
        self.inner.lock().unwrap().interfaces.insert(
            path.to_owned(),
            interfaces.iter().map(|s| (*s).to_owned()).collect(),
        );
    }

    /// Push one backend signal into the coordinator's queue.
    pub fn emit(&self, ev: SignalEvent) {
        self.sink.send(ev).expect("signal queue open");
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn calls_of(&self, method: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == method)
            .collect()
    }

    fn next_reply(&self, interface: &str, method: &str) -> Reply {
        let mut inner = self.inner.lock().unwrap();
        let key = (interface.to_owned(), method.to_owned());
        if let Some(queue) = inner.scripted.get_mut(&key) {
            if let Some(reply) = queue.pop_front() {
                return reply;
            }
        }
        inner
            .defaults
            .get(&key)
            .cloned()
            .unwrap_or(Reply::Ok(Value::Array(Vec::new())))
    }

    fn record(&self, path: &str, interface: &str, method: &str, args: &Value) {
        self.inner.lock().unwrap().calls.push(RecordedCall {
            path: path.to_owned(),
            interface: interface.to_owned(),
            method: method.to_owned(),
            args: args.clone(),
        });
    }
}

impl RpcChannel for MockChannel {
    fn call_sync(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Value,
        _timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.record(path, interface, method, &args);
        match self.next_reply(interface, method) {
            Reply::Ok(value) => Ok(value),
            Reply::Err(err) => Err(err),
            Reply::Hang => Err(RpcError::TimedOut),
        }
    }

    fn call_async(
        &self,
        call: PreparedCall,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Value, RpcError>> {
        self.record(&call.path, &call.interface, &call.method, &call.args);
        let reply = self.next_reply(&call.interface, &call.method);
        Box::pin(async move {
            match reply {
                Reply::Ok(value) => Ok(value),
                Reply::Err(err) => Err(err),
                Reply::Hang => {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(RpcError::Cancelled),
                        _ = tokio::time::sleep(timeout) => Err(RpcError::TimedOut),
                    }
                }
            }
        })
    }

    fn get_property(&self, path: &str, interface: &str, name: &str) -> Option<Value> {
        self.inner
            .lock()
            .unwrap()
            .properties
            .get(&(path.to_owned(), interface.to_owned(), name.to_owned()))
            .cloned()
    }

    fn subscribe(&self, _path: &str, _interface: &str) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_subscription += 1;
        inner.next_subscription
    }

    fn subscribe_properties(&self, _path: &str, _interface: &str) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_subscription += 1;
        inner.next_subscription
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}

    fn list_interfaces(&self, path: &str) -> BTreeSet<String> {
        self.inner
            .lock()
            .unwrap()
            .interfaces
            .get(path)
            .cloned()
            .unwrap_or_default()
    }
}

/// Collect everything currently queued on the consumer stream.
pub fn drain_events(rx: &mut tokio::sync::mpsc::UnboundedReceiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
