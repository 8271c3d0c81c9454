//! Per-device session: canonical state, operation lifecycle, event emission.
//!
//! The session consumes canonical [`Notice`]s produced by its backend handle
//! and turns them into consumer events. The delicate part is attribution:
//! a state flip that matches the in-flight operation's expected effect
//! completes that operation (one `OperationResult`, no `*Changed` event);
//! a flip with no matching operation is unsolicited and emits exactly one
//! `*Changed` event. Both firing for the same flip would show callers
//! duplicate, contradictory notifications.
//!
//! ```text
//!   begin ──▶ [slot: Active(kind)] ──rpc reply──▶ Done ──▶ result event
//!                      │                  │
//!                      │               Deferred (enable/unlock acks)
//!                      │                  │
//!                      └──state flip──────┴──▶ result event, slot idle
//! ```

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_common::events::{CoreEvent, OperationResponse};
use tether_common::ids::decode_ucs2_hex;
use tether_common::models::{
    Caps, Device, OperationKind, OperationStatus, SmsCaps, UssdEncoding, UssdSessionState,
    UssdValidation,
};

use crate::backend::{
    BackendError, Completion, DeviceBackend, Notice, OperationRequest, UssdCommand,
};
use crate::rpc::{PreparedCall, RpcError, SignalEvent};
use crate::slot::{AdmissionError, OperationSlot};

/// Failure to start a mutating operation, reported synchronously.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// One device's stateful coordinator.
pub struct DeviceSession {
    device: Device,
    slot: OperationSlot,
    backend: Box<dyn DeviceBackend>,
    last_error: Option<String>,
    closed: bool,
}

impl DeviceSession {
    /// Wrap a freshly-opened backend handle. Applies the probed capability
    /// picture and the cached state snapshot to the device.
    pub fn new(mut device: Device, mut backend: Box<dyn DeviceBackend>) -> Self {
        backend.capabilities().apply(&mut device);
        let snapshot = backend.state_snapshot();
        if let Some(enabled) = snapshot.enabled {
            device.enabled = enabled;
        }
        if let Some(blocked) = snapshot.blocked {
            device.blocked = blocked;
        }
        if let Some(lock) = snapshot.lock_type {
            device.lock_type = lock;
        }
        if let Some(registered) = snapshot.registered {
            device.registered = registered;
        }
        if let Some(connected) = snapshot.connected {
            device.connected = connected;
        }
        if let Some(prepared) = snapshot.prepared {
            device.prepared = prepared;
        }
        DeviceSession {
            device,
            slot: OperationSlot::new(),
            backend,
            last_error: None,
            closed: false,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn id(&self) -> u32 {
        self.device.id
    }

    /// Most recent transport or remote error, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn current_operation(&self) -> Option<OperationKind> {
        self.slot.current()
    }

    pub fn backend_mut(&mut self) -> &mut dyn DeviceBackend {
        self.backend.as_mut()
    }

    // ─── Operation admission ────────────────────────────────────────────

    /// Admit and prepare a mutating operation. On success the returned
    /// call is ready to dispatch through the RPC channel with the token;
    /// all preconditions are checked synchronously here and no event is
    /// emitted for a rejection.
    pub fn begin(
        &mut self,
        request: OperationRequest,
    ) -> Result<(PreparedCall, CancellationToken), OperationError> {
        self.check_preconditions(&request)?;
        let kind = request.kind();
        let token = self.slot.begin(kind)?;
        match self.backend.prepare_operation(&request) {
            Ok(call) => {
                debug!(device = self.device.id, %kind, "operation admitted");
                Ok((call, token))
            }
            Err(err) => {
                // Preparation failed before anything was dispatched; the
                // slot must not stay occupied.
                self.slot.complete();
                Err(err.into())
            }
        }
    }

    fn check_preconditions(&self, request: &OperationRequest) -> Result<(), AdmissionError> {
        match request {
            OperationRequest::Power { on } => {
                if self.device.enabled == *on {
                    return Err(AdmissionError::AlreadyInState);
                }
            }
            OperationRequest::Unlock { .. } => {
                if self.device.lock_type != tether_common::models::LockType::Pin {
                    return Err(AdmissionError::NotPinLocked);
                }
            }
            OperationRequest::SendSms { .. } => {
                if !self.device.enabled {
                    return Err(AdmissionError::NotEnabled);
                }
                if !self.device.caps.contains(Caps::SMS)
                    || !self.device.sms_caps.contains(SmsCaps::SEND)
                {
                    return Err(AdmissionError::Unsupported("sms"));
                }
            }
            OperationRequest::SendUssd { .. } => {
                if !self.device.enabled {
                    return Err(AdmissionError::NotEnabled);
                }
                if !self.device.caps.contains(Caps::USSD) {
                    return Err(AdmissionError::Unsupported("ussd"));
                }
            }
            OperationRequest::Scan => {
                if !self.device.enabled {
                    return Err(AdmissionError::NotEnabled);
                }
                if !self.device.caps.contains(Caps::SCAN) {
                    return Err(AdmissionError::Unsupported("scan"));
                }
            }
        }
        Ok(())
    }

    /// Decide how an outgoing USSD string reaches the network and build
    /// the operation request for it.
    ///
    /// A fresh request while the network waits for a menu answer first
    /// cancels the stale session, then initiates; an unknown or active
    /// session is cancelled up front so the network accepts the call.
    pub fn prepare_ussd(
        &mut self,
        request: String,
        validation: UssdValidation,
    ) -> Result<OperationRequest, OperationError> {
        // A rejected call must have no side effects, so admission comes
        // before the session dance below.
        if !self.device.enabled {
            return Err(AdmissionError::NotEnabled.into());
        }
        if !self.device.caps.contains(Caps::USSD) {
            return Err(AdmissionError::Unsupported("ussd").into());
        }
        let state = self.backend.ussd_state();
        if matches!(state, UssdSessionState::Unknown | UssdSessionState::Active) {
            if let Err(err) = self.backend.cancel_ussd() {
                debug!(device = self.device.id, error = %err, "ussd pre-cancel failed");
            }
        }
        let command = match state {
            UssdSessionState::UserResponse => {
                if validation == UssdValidation::Request {
                    self.backend.cancel_ussd().ok();
                    UssdCommand::Initiate
                } else {
                    UssdCommand::Respond
                }
            }
            _ => UssdCommand::Initiate,
        };
        Ok(OperationRequest::SendUssd { request, command })
    }

    /// Signal the in-flight operation's token. No-op when idle.
    pub fn cancel(&mut self) -> bool {
        self.slot.cancel()
    }

    pub fn ussd_state(&mut self) -> UssdSessionState {
        self.backend.ussd_state()
    }

    // ─── Async completion ───────────────────────────────────────────────

    /// Digest the RPC result of a dispatched operation.
    ///
    /// Called exactly once per dispatch by the coordinator loop. A reply
    /// for an operation the slot no longer holds is stale (a state flip
    /// already completed it) and is dropped without a second event.
    pub fn operation_finished(
        &mut self,
        kind: OperationKind,
        result: Result<Value, RpcError>,
    ) -> Vec<CoreEvent> {
        if self.slot.current() != Some(kind) {
            debug!(device = self.device.id, %kind, "stale completion dropped");
            // Housekeeping (e.g. deleting a sent message object) must
            // still run even when the flip beat the reply.
            let _ = self.backend.complete_operation(kind, result.as_ref());
            return Vec::new();
        }

        match result {
            Ok(value) => match self.backend.complete_operation(kind, Ok(&value)) {
                Ok(Completion::Deferred) => {
                    // The reply only acknowledged the request; the state
                    // flip will complete the slot.
                    Vec::new()
                }
                Ok(Completion::Done(response)) => {
                    self.slot.complete();
                    let response = self.decode_response(response);
                    vec![self.result_event(kind, OperationStatus::Succeeded, response)]
                }
                Err(err) => {
                    self.slot.complete();
                    self.record_error(err.to_string());
                    vec![self.result_event(kind, OperationStatus::Failed, None)]
                }
            },
            Err(RpcError::Cancelled) => {
                // Caller-initiated: distinct outcome, and last-error must
                // not be overwritten with a misleading message.
                let _ = self
                    .backend
                    .complete_operation(kind, Err(&RpcError::Cancelled));
                self.slot.complete();
                vec![self.result_event(kind, OperationStatus::Cancelled, None)]
            }
            Err(err) => {
                if kind == OperationKind::SendUssd {
                    // Observed service behavior: the supplementary-services
                    // interface is unusable after a timeout. Restart it once
                    // and report the original error.
                    if self.backend.restart_ussd() {
                        self.backend.capabilities().apply(&mut self.device);
                        debug!(device = self.device.id, "ussd interface restarted");
                    } else {
                        warn!(device = self.device.id, "ussd interface restart failed");
                    }
                }
                let _ = self.backend.complete_operation(kind, Err(&err));
                self.slot.complete();
                self.record_error(err.to_string());
                vec![self.result_event(kind, OperationStatus::Failed, None)]
            }
        }
    }

    fn decode_response(&self, response: Option<OperationResponse>) -> Option<OperationResponse> {
        // Some firmware answers USSD in UCS-2 hex no matter what was
        // requested; devices flagged at open get the answer re-decoded.
        match response {
            Some(OperationResponse::UssdReply(text))
                if self.device.ussd_encoding == UssdEncoding::Ucs2 =>
            {
                let decoded = decode_ucs2_hex(&text).unwrap_or(text);
                Some(OperationResponse::UssdReply(decoded))
            }
            other => other,
        }
    }

    fn result_event(
        &self,
        kind: OperationKind,
        status: OperationStatus,
        response: Option<OperationResponse>,
    ) -> CoreEvent {
        CoreEvent::OperationResult {
            id: self.device.id,
            kind,
            status,
            response,
        }
    }

    fn record_error(&mut self, message: String) {
        warn!(device = self.device.id, error = %message, "operation failed");
        self.last_error = Some(message);
    }

    // ─── Signal handling ────────────────────────────────────────────────

    /// Feed one raw backend signal through the adapter and apply every
    /// canonical notice it yields.
    pub fn handle_signal(&mut self, ev: &SignalEvent) -> Vec<CoreEvent> {
        if self.closed {
            return Vec::new();
        }
        let mut events = Vec::new();
        for notice in self.backend.translate_signal(ev) {
            self.apply_notice(notice, &mut events);
        }
        events
    }

    fn apply_notice(&mut self, notice: Notice, events: &mut Vec<CoreEvent>) {
        match notice {
            Notice::State(snapshot) => self.apply_state(snapshot, events),
            Notice::Registration(info) => {
                let changed = self.device.registration != info.status
                    || (info.operator_code != 0 && self.device.operator_code != info.operator_code)
                    || (info.operator_name.is_some()
                        && self.device.operator_name != info.operator_name);
                self.device.registration = info.status;
                self.device.registered = info.status.is_registered();
                if info.operator_code != 0 {
                    self.device.operator_code = info.operator_code;
                }
                if info.operator_name.is_some() {
                    self.device.operator_name = info.operator_name;
                }
                if changed {
                    events.push(CoreEvent::RegistrationChanged {
                        id: self.device.id,
                        status: self.device.registration,
                        operator_code: self.device.operator_code,
                        operator_name: self.device.operator_name.clone(),
                    });
                }
            }
            Notice::SignalLevel(percent) => {
                if self.device.signal_level != percent {
                    self.device.signal_level = percent;
                    events.push(CoreEvent::SignalLevelChanged {
                        id: self.device.id,
                        percent,
                    });
                }
            }
            Notice::Mode(mode) => {
                if self.device.mode != mode {
                    self.device.mode = mode;
                    events.push(CoreEvent::NetworkModeChanged {
                        id: self.device.id,
                        mode,
                    });
                }
            }
            Notice::Location(location) => {
                if self.device.location != location {
                    self.device.location = location;
                    events.push(CoreEvent::LocationChanged {
                        id: self.device.id,
                        location,
                    });
                }
            }
            Notice::CapabilityExtended(capability) => {
                self.backend.capabilities().apply(&mut self.device);
                events.push(CoreEvent::CapabilityExtended {
                    id: self.device.id,
                    capability,
                });
            }
            Notice::MessageArrived { message_id } => {
                events.push(CoreEvent::MessageReceived {
                    id: self.device.id,
                    message_id,
                });
            }
            Notice::MessageListChanged => {
                events.push(CoreEvent::MessageListReady { id: self.device.id });
            }
        }
    }

    /// Apply a composite state report, attributing each boolean flip to
    /// the in-flight operation or emitting the unsolicited change event.
    fn apply_state(&mut self, snapshot: crate::backend::StateSnapshot, events: &mut Vec<CoreEvent>) {
        if let Some(lock) = snapshot.lock_type {
            self.device.lock_type = lock;
        }

        if let Some(enabled) = snapshot.enabled {
            if enabled != self.device.enabled {
                self.device.enabled = enabled;
                let solicited = match self.slot.current() {
                    Some(kind @ OperationKind::Enable) if enabled => Some(kind),
                    Some(kind @ OperationKind::Disable) if !enabled => Some(kind),
                    _ => None,
                };
                if let Some(kind) = solicited {
                    self.slot.complete();
                    events.push(self.result_event(kind, OperationStatus::Succeeded, None));
                } else {
                    events.push(CoreEvent::EnabledChanged {
                        id: self.device.id,
                        enabled,
                    });
                }
                if enabled {
                    self.enabled_follow_up(events);
                }
            }
        }

        if let Some(blocked) = snapshot.blocked {
            if blocked != self.device.blocked {
                self.device.blocked = blocked;
                if !blocked {
                    self.device.lock_type = tether_common::models::LockType::None;
                }
                if self.slot.current() == Some(OperationKind::Unlock) && !blocked {
                    self.slot.complete();
                    events.push(self.result_event(
                        OperationKind::Unlock,
                        OperationStatus::Succeeded,
                        None,
                    ));
                } else {
                    events.push(CoreEvent::BlockedChanged {
                        id: self.device.id,
                        blocked,
                    });
                }
            }
        }

        if let Some(registered) = snapshot.registered {
            if registered != self.device.registered {
                self.device.registered = registered;
                if registered {
                    // The signal payload does not carry operator details
                    // in every service; fetch them now.
                    let info = self.backend.read_registration_info();
                    self.device.registration = info.status;
                    if info.operator_code != 0 {
                        self.device.operator_code = info.operator_code;
                    }
                    if info.operator_name.is_some() {
                        self.device.operator_name = info.operator_name;
                    }
                }
                events.push(CoreEvent::RegistrationChanged {
                    id: self.device.id,
                    status: self.device.registration,
                    operator_code: self.device.operator_code,
                    operator_name: self.device.operator_name.clone(),
                });
            }
        }

        if let Some(connected) = snapshot.connected {
            if connected != self.device.connected {
                self.device.connected = connected;
                events.push(CoreEvent::ConnectionChanged {
                    id: self.device.id,
                    connected,
                });
            }
        }

        if let Some(prepared) = snapshot.prepared {
            if prepared != self.device.prepared {
                self.device.prepared = prepared;
                events.push(CoreEvent::PreparedChanged {
                    id: self.device.id,
                    prepared,
                });
            }
        }
    }

    /// Hardware identifiers only answer once the radio is powered, and
    /// location reporting can only be switched on then.
    fn enabled_follow_up(&mut self, events: &mut Vec<CoreEvent>) {
        let identity = self.backend.read_identity();
        if identity.imei.is_some() {
            self.device.imei = identity.imei;
        }
        if identity.imsi.is_some() {
            self.device.imsi = identity.imsi;
        }
        if let Some(location) = self.backend.enable_location() {
            self.backend.capabilities().apply(&mut self.device);
            if self.device.location != location {
                self.device.location = location;
                events.push(CoreEvent::LocationChanged {
                    id: self.device.id,
                    location,
                });
            }
        }
    }

    // ─── Teardown ───────────────────────────────────────────────────────

    /// Tear the session down: abort any in-flight operation, then let the
    /// backend unsubscribe its signals before handles are released.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.slot.cancel();
        self.backend.close();
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}
