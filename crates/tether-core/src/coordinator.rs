//! The coordinator: device map, discovery relay, operation dispatch.
//!
//! Everything funnels through one loop. Backend signals, async-call
//! completions and poll ticks all arrive on queues this loop drains one
//! message at a time, so session state is only ever touched from here
//! and the sessions need no locking of their own.
//!
//! ```text
//!   RpcChannel ──signals──▶ ┌──────────────┐ ──events──▶ consumer
//!   spawned calls ──done──▶ │ run loop     │
//!   poll tasks ────ticks──▶ └──────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_common::events::CoreEvent;
use tether_common::models::{
    Contact, Device, OperationKind, SmsMessage, UssdEncoding, UssdSessionState, UssdValidation,
};

use crate::backend::{Backend, BackendError, Discovery, OperationRequest};
use crate::config::CoreConfig;
use crate::rpc::{RpcChannel, RpcError, SignalEvent, SignalSource};
use crate::session::{DeviceSession, OperationError};
use crate::slot::AdmissionError;

/// Longest destination number networks accept.
const MAX_NUMBER_LENGTH: usize = 20;

enum LoopMsg {
    Completed {
        id: u32,
        kind: OperationKind,
        result: Result<Value, RpcError>,
    },
    PollTick {
        id: u32,
    },
}

struct PollTask {
    stop: CancellationToken,
    seen: HashSet<u32>,
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Owns the device sessions of one backend and exposes the uniform
/// operation surface to callers.
pub struct Coordinator {
    channel: Arc<dyn RpcChannel>,
    backend: Box<dyn Backend>,
    config: CoreConfig,
    known: HashMap<u32, Device>,
    sessions: HashMap<u32, DeviceSession>,
    events: mpsc::UnboundedSender<CoreEvent>,
    signals: SignalSource,
    loop_tx: mpsc::UnboundedSender<LoopMsg>,
    loop_rx: mpsc::UnboundedReceiver<LoopMsg>,
    polls: HashMap<u32, PollTask>,
}

impl Coordinator {
    /// Wire a coordinator to a backend and its signal queue. The
    /// returned receiver is the consumer-facing event stream.
    pub fn new(
        channel: Arc<dyn RpcChannel>,
        backend: Box<dyn Backend>,
        config: CoreConfig,
        signals: SignalSource,
    ) -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (events, consumer) = mpsc::unbounded_channel();
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            channel,
            backend,
            config,
            known: HashMap::new(),
            sessions: HashMap::new(),
            events,
            signals,
            loop_tx,
            loop_rx,
            polls: HashMap::new(),
        };
        (coordinator, consumer)
    }

    /// Attach discovery and enumerate what is already present.
    pub fn start(&mut self) -> Result<(), BackendError> {
        self.backend.attach()?;
        let devices = self.backend.enumerate()?;
        info!(backend = %self.backend.kind(), count = devices.len(), "devices enumerated");
        for device in devices {
            self.known.insert(device.id, device.clone());
            self.emit(CoreEvent::DeviceAdded { device });
        }
        Ok(())
    }

    /// Detach discovery and close every open session.
    pub fn stop(&mut self) {
        let open: Vec<u32> = self.sessions.keys().copied().collect();
        for id in open {
            self.close_session(id);
        }
        self.backend.detach();
    }

    /// Present devices; open sessions report their live state.
    pub fn devices(&self) -> Vec<Device> {
        self.known
            .values()
            .map(|device| {
                self.sessions
                    .get(&device.id)
                    .map(|session| session.device().clone())
                    .unwrap_or_else(|| device.clone())
            })
            .collect()
    }

    pub fn device(&self, id: u32) -> Option<Device> {
        self.sessions
            .get(&id)
            .map(|session| session.device().clone())
            .or_else(|| self.known.get(&id).cloned())
    }

    // ─── Session lifecycle ──────────────────────────────────────────────

    /// Open a session on a known device: probe its interfaces, subscribe
    /// its signals, start the message poll when the backend needs it.
    pub fn open_device(&mut self, id: u32) -> Result<(), OperationError> {
        if self.sessions.contains_key(&id) {
            return Ok(());
        }
        let mut device = self
            .known
            .get(&id)
            .cloned()
            .ok_or(AdmissionError::NoSession(id))?;
        device.ussd_encoding = ussd_encoding_for(&device.manufacturer);
        let handle = self.backend.open(&device)?;
        let mut session = DeviceSession::new(device, handle);

        if session.backend_mut().needs_sms_polling() {
            self.start_poll(&mut session);
        }
        self.known.insert(id, session.device().clone());
        self.sessions.insert(id, session);
        self.emit(CoreEvent::DeviceOpened { id });
        Ok(())
    }

    pub fn close_device(&mut self, id: u32) -> bool {
        if self.sessions.contains_key(&id) {
            self.close_session(id);
            true
        } else {
            false
        }
    }

    fn close_session(&mut self, id: u32) {
        self.emit(CoreEvent::DeviceClosing { id });
        self.polls.remove(&id);
        if let Some(mut session) = self.sessions.remove(&id) {
            self.known.insert(id, session.device().clone());
            session.cancel();
            session.close();
        }
    }

    fn start_poll(&mut self, session: &mut DeviceSession) {
        let id = session.id();
        // Seed with what is already stored so only new arrivals announce
        let seen: HashSet<u32> = session
            .backend_mut()
            .list_messages()
            .map(|messages| messages.iter().map(|m| m.id).collect())
            .unwrap_or_default();

        let stop = CancellationToken::new();
        let child = stop.clone();
        let tx = self.loop_tx.clone();
        let interval = Duration::from_millis(self.config.sms_poll.interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick is harmless: the seen set absorbs it
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(LoopMsg::PollTick { id }).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        debug!(device = id, ?interval, "message polling started");
        self.polls.insert(id, PollTask { stop, seen });
    }

    // ─── Operation API ──────────────────────────────────────────────────

    pub fn enable(&mut self, id: u32, on: bool) -> Result<(), OperationError> {
        self.dispatch(id, OperationRequest::Power { on })
    }

    pub fn unlock_with_pin(&mut self, id: u32, pin: &str) -> Result<(), OperationError> {
        if pin.is_empty() || pin.len() > 8 || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AdmissionError::InvalidArgument("pin".into()).into());
        }
        self.dispatch(
            id,
            OperationRequest::Unlock {
                pin: pin.to_owned(),
            },
        )
    }

    pub fn send_sms(
        &mut self,
        id: u32,
        number: &str,
        text: &str,
        validity: i32,
        report: bool,
    ) -> Result<(), OperationError> {
        if !valid_number(number) {
            return Err(AdmissionError::InvalidArgument("number".into()).into());
        }
        if text.is_empty() {
            return Err(AdmissionError::InvalidArgument("text".into()).into());
        }
        if !(-1..=255).contains(&validity) {
            return Err(AdmissionError::InvalidArgument("validity".into()).into());
        }
        self.dispatch(
            id,
            OperationRequest::SendSms {
                number: number.to_owned(),
                text: text.to_owned(),
                validity,
                report,
            },
        )
    }

    pub fn send_ussd(&mut self, id: u32, request: &str) -> Result<(), OperationError> {
        let validation = UssdValidation::classify(request);
        if validation == UssdValidation::Invalid {
            return Err(AdmissionError::InvalidArgument("ussd request".into()).into());
        }
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(AdmissionError::NoSession(id))?;
        let operation = session.prepare_ussd(request.to_owned(), validation)?;
        self.dispatch(id, operation)
    }

    pub fn cancel_ussd(&mut self, id: u32) -> Result<(), OperationError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(AdmissionError::NoSession(id))?;
        session.backend_mut().cancel_ussd()?;
        Ok(())
    }

    pub fn ussd_state(&mut self, id: u32) -> UssdSessionState {
        self.sessions
            .get_mut(&id)
            .map(|session| session.ussd_state())
            .unwrap_or(UssdSessionState::Unknown)
    }

    pub fn scan_networks(&mut self, id: u32) -> Result<(), OperationError> {
        self.dispatch(id, OperationRequest::Scan)
    }

    /// Cancel whatever operation is in flight. Returns whether a
    /// cancellation was actually delivered.
    pub fn interrupt(&mut self, id: u32) -> bool {
        self.sessions
            .get_mut(&id)
            .map(|session| session.cancel())
            .unwrap_or(false)
    }

    pub fn current_operation(&self, id: u32) -> Option<OperationKind> {
        self.sessions.get(&id)?.current_operation()
    }

    pub fn last_error(&self, id: u32) -> Option<String> {
        self.sessions
            .get(&id)
            .and_then(|session| session.last_error().map(str::to_owned))
    }

    pub fn timeout(&self, kind: OperationKind) -> Duration {
        self.config.timeouts.duration(kind)
    }

    pub fn set_timeout(&mut self, kind: OperationKind, timeout: Duration) {
        self.config.timeouts.set(kind, timeout);
    }

    // ─── Messages and contacts (synchronous queries) ────────────────────

    pub fn list_sms(&mut self, id: u32) -> Result<Vec<SmsMessage>, OperationError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(AdmissionError::NoSession(id))?;
        Ok(session.backend_mut().list_messages()?)
    }

    pub fn get_sms(&mut self, id: u32, message_id: u32) -> Option<SmsMessage> {
        self.sessions
            .get_mut(&id)
            .and_then(|session| session.backend_mut().get_message(message_id))
    }

    pub fn delete_sms(&mut self, id: u32, message_id: u32) -> Result<(), OperationError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(AdmissionError::NoSession(id))?;
        session.backend_mut().delete_message(message_id)?;
        Ok(())
    }

    pub fn list_contacts(&mut self, id: u32) -> Result<Vec<Contact>, OperationError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(AdmissionError::NoSession(id))?;
        Ok(session.backend_mut().list_contacts()?)
    }

    pub fn add_contact(&mut self, id: u32, contact: &Contact) -> Result<u32, OperationError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(AdmissionError::NoSession(id))?;
        Ok(session.backend_mut().add_contact(contact)?)
    }

    pub fn delete_contact(&mut self, id: u32, contact_id: u32) -> Result<(), OperationError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(AdmissionError::NoSession(id))?;
        session.backend_mut().delete_contact(contact_id)?;
        Ok(())
    }

    // ─── Dispatch and loop ──────────────────────────────────────────────

    fn dispatch(&mut self, id: u32, request: OperationRequest) -> Result<(), OperationError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(AdmissionError::NoSession(id))?;
        let kind = request.kind();
        let (call, token) = session.begin(request)?;
        let timeout = self.config.timeouts.duration(kind);
        let future = self.channel.call_async(call, token, timeout);
        let tx = self.loop_tx.clone();
        tokio::spawn(async move {
            let result = future.await;
            let _ = tx.send(LoopMsg::Completed { id, kind, result });
        });
        Ok(())
    }

    /// Process loop input until both queues are exhausted and idle.
    /// Long-running variant of [`Coordinator::step`].
    pub async fn run(&mut self) {
        while self.step().await {}
    }

    /// Wait for and process exactly one loop message. Returns false only
    /// when both queues are closed.
    pub async fn step(&mut self) -> bool {
        tokio::select! {
            Some(ev) = self.signals.recv() => {
                self.handle_signal(&ev);
                true
            }
            Some(msg) = self.loop_rx.recv() => {
                self.handle_loop_msg(msg);
                true
            }
            else => false,
        }
    }

    /// Drain everything already queued without waiting.
    pub fn drain(&mut self) {
        loop {
            match self.signals.try_recv() {
                Ok(ev) => self.handle_signal(&ev),
                Err(_) => break,
            }
        }
        loop {
            match self.loop_rx.try_recv() {
                Ok(msg) => self.handle_loop_msg(msg),
                Err(_) => break,
            }
        }
    }

    fn handle_signal(&mut self, ev: &SignalEvent) {
        if let Some(discovery) = self.backend.translate_discovery(ev) {
            match discovery {
                Discovery::Added(device) => {
                    debug!(device = device.id, path = %device.object_path, "device added");
                    self.known.insert(device.id, device.clone());
                    self.emit(CoreEvent::DeviceAdded { device });
                }
                Discovery::Removed(id) => {
                    debug!(device = id, "device removed");
                    if self.sessions.contains_key(&id) {
                        self.close_session(id);
                    }
                    self.known.remove(&id);
                    self.emit(CoreEvent::DeviceRemoved { id });
                }
            }
            return;
        }
        let mut emitted = Vec::new();
        for session in self.sessions.values_mut() {
            emitted.extend(session.handle_signal(ev));
        }
        for event in emitted {
            self.emit(event);
        }
    }

    fn handle_loop_msg(&mut self, msg: LoopMsg) {
        match msg {
            LoopMsg::Completed { id, kind, result } => {
                let Some(session) = self.sessions.get_mut(&id) else {
                    debug!(device = id, %kind, "completion for closed session dropped");
                    return;
                };
                let events = session.operation_finished(kind, result);
                for event in events {
                    self.emit(event);
                }
            }
            LoopMsg::PollTick { id } => self.poll_messages(id),
        }
    }

    fn poll_messages(&mut self, id: u32) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let Some(poll) = self.polls.get_mut(&id) else {
            return;
        };
        match session.backend_mut().list_messages() {
            Ok(messages) => {
                let mut fresh = Vec::new();
                for message in &messages {
                    if poll.seen.insert(message.id) {
                        fresh.push(message.id);
                    }
                }
                if !fresh.is_empty() {
                    for message_id in fresh {
                        self.emit(CoreEvent::MessageReceived { id, message_id });
                    }
                    self.emit(CoreEvent::MessageListReady { id });
                }
            }
            Err(err) => warn!(device = id, error = %err, "message poll failed"),
        }
    }

    fn emit(&self, event: CoreEvent) {
        // A gone consumer is not an error; the loop keeps the sessions
        // coherent regardless.
        let _ = self.events.send(event);
    }
}

/// Destination numbers: optional leading `+`, digits only, sane length.
fn valid_number(number: &str) -> bool {
    let digits = number.strip_prefix('+').unwrap_or(number);
    (2..=MAX_NUMBER_LENGTH).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Firmware of some vendors answers USSD in UCS-2 hex regardless of the
/// requested coding scheme.
fn ussd_encoding_for(manufacturer: &str) -> UssdEncoding {
    if manufacturer.to_ascii_lowercase().contains("huawei") {
        UssdEncoding::Ucs2
    } else {
        UssdEncoding::Gsm7
    }
}
