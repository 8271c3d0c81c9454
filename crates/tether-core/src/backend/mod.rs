//! Backend adapters for the supported management services.
//!
//! Three services are supported, each behind the same two traits:
//!
//! - [`legacy`] — ModemManager ≤ 0.6 and Wader: statically-known
//!   interface paths, no object discovery, message-list polling when the
//!   service cannot confirm delivery
//! - [`modern`] — ModemManager ≥ 0.7: object-manager discovery, messages
//!   as first-class objects
//! - [`ofono`] — oFono ≥ 1.9: interfaces appear dynamically as
//!   capability negotiation completes
//!
//! Everything backend-specific — interface names, status vocabularies,
//! object-model conventions — is absorbed here. Neither the session nor
//! the coordinator ever branches on which service is active.

pub mod legacy;
pub mod modern;
pub mod ofono;

use serde_json::Value;
use tether_common::models::{
    Caps, CellLocation, Contact, ContactsCaps, Device, LocationCaps, LockType, OperationKind,
    RegistrationStatus, ScanCaps, SmsCaps, SmsMessage, UssdCaps, UssdSessionState,
};

use crate::rpc::{PreparedCall, RpcError, SignalEvent};

/// Which management service an adapter drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// ModemManager ≤ 0.6 / Wader (flat proxies).
    Legacy,
    /// ModemManager ≥ 0.7 (object manager).
    Modern,
    /// oFono ≥ 1.9 (dynamic interfaces).
    Ofono,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::Legacy => "ModemManager <= 0.6/Wader",
            BackendKind::Modern => "ModemManager >= 0.7",
            BackendKind::Ofono => "oFono >= 1.9",
        };
        write!(f, "{name}")
    }
}

/// Adapter-level failure.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("device is not open")]
    NotOpen,
    #[error("not supported by this backend")]
    NotSupported,
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// Full capability picture of an open device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    pub caps: Caps,
    pub sms: SmsCaps,
    pub ussd: UssdCaps,
    pub location: LocationCaps,
    pub scan: ScanCaps,
    pub contacts: ContactsCaps,
}

impl CapabilitySet {
    /// Copy this picture into the canonical device snapshot.
    pub fn apply(&self, device: &mut Device) {
        device.caps = self.caps;
        device.sms_caps = self.sms;
        device.ussd_caps = self.ussd;
        device.location_caps = self.location;
        device.scan_caps = self.scan;
        device.contacts_caps = self.contacts;
    }
}

/// Boolean state derived from one backend state report. `None` means
/// the report carries no information about that axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub enabled: Option<bool>,
    pub blocked: Option<bool>,
    pub lock_type: Option<LockType>,
    pub registered: Option<bool>,
    pub connected: Option<bool>,
    pub prepared: Option<bool>,
}

/// Registration details fetched after a device registers; fields the
/// backend cannot provide stay at their conservative defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationInfo {
    pub status: RegistrationStatus,
    pub operator_code: u32,
    pub operator_name: Option<String>,
}

/// Hardware identifiers fetched once a device is powered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityInfo {
    pub imei: Option<String>,
    pub imsi: Option<String>,
}

/// Canonical notification produced by translating one raw backend
/// signal. The session applies these without knowing which service
/// produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// The modem's composite state changed.
    State(StateSnapshot),
    /// Registration details changed (carried by the signal payload).
    Registration(RegistrationInfo),
    /// Signal strength changed (percent).
    SignalLevel(u32),
    /// Access technology changed.
    Mode(tether_common::models::AccessMode),
    /// 3GPP cell location changed.
    Location(CellLocation),
    /// A capability became available after open; the session re-reads
    /// the full capability set when it sees this.
    CapabilityExtended(Caps),
    /// A message finished arriving.
    MessageArrived { message_id: u32 },
    /// The message list changed in a way that warrants a re-read.
    MessageListChanged,
}

/// Direction the session chose for an outgoing USSD string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UssdCommand {
    Initiate,
    Respond,
}

/// A mutating operation, fully parameterized.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationRequest {
    Power { on: bool },
    Unlock { pin: String },
    SendSms {
        number: String,
        text: String,
        validity: i32,
        report: bool,
    },
    SendUssd {
        request: String,
        command: UssdCommand,
    },
    Scan,
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::Power { on: true } => OperationKind::Enable,
            OperationRequest::Power { on: false } => OperationKind::Disable,
            OperationRequest::Unlock { .. } => OperationKind::Unlock,
            OperationRequest::SendSms { .. } => OperationKind::SendSms,
            OperationRequest::SendUssd { .. } => OperationKind::SendUssd,
            OperationRequest::Scan => OperationKind::Scan,
        }
    }
}

/// What `complete_operation` concluded from an RPC result.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The reply only acknowledged the request; the real result arrives
    /// later as a state-change flip (enable, unlock).
    Deferred,
    /// The operation is done; payload for USSD answers and scan lists.
    Done(Option<tether_common::events::OperationResponse>),
}

/// Per-process adapter: discovery and device-session construction.
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Subscribe manager-level discovery signals.
    fn attach(&mut self) -> Result<(), BackendError>;

    /// Unsubscribe discovery signals.
    fn detach(&mut self);

    /// Enumerate present devices with descriptive fields and cached
    /// state filled in.
    fn enumerate(&mut self) -> Result<Vec<Device>, BackendError>;

    /// Interpret a manager-level signal as a discovery change.
    fn translate_discovery(&mut self, ev: &SignalEvent) -> Option<Discovery>;

    /// Open one device: subscribe its interfaces, probe capabilities.
    fn open(&mut self, device: &Device) -> Result<Box<dyn DeviceBackend>, BackendError>;
}

/// A discovery change relayed by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum Discovery {
    Added(Device),
    Removed(u32),
}

/// Per-open-device adapter handle. Owns the device's subscriptions and
/// sub-interface bookkeeping; dropped (after [`DeviceBackend::close`])
/// when the session ends.
pub trait DeviceBackend: Send {
    /// Current capability picture (can only grow after open).
    fn capabilities(&self) -> CapabilitySet;

    /// Booleans from the service's cached state, for session setup.
    fn state_snapshot(&mut self) -> StateSnapshot;

    /// Translate one raw signal into canonical notices. Signals for
    /// other devices or unknown vocabulary produce an empty vector.
    fn translate_signal(&mut self, ev: &SignalEvent) -> Vec<Notice>;

    /// Resolve an admitted operation into the call to dispatch. Any
    /// synchronous preparation (object creation, interface lookups)
    /// happens here; failures surface to the caller synchronously.
    fn prepare_operation(&mut self, request: &OperationRequest)
        -> Result<PreparedCall, BackendError>;

    /// Digest the RPC result of an operation: parse payloads and do
    /// any post-call housekeeping. Called exactly once per dispatch.
    fn complete_operation(
        &mut self,
        kind: OperationKind,
        result: Result<&Value, &RpcError>,
    ) -> Result<Completion, BackendError>;

    /// Follow-up read after registration becomes true.
    fn read_registration_info(&mut self) -> RegistrationInfo;

    /// Follow-up read after the device becomes enabled.
    fn read_identity(&mut self) -> IdentityInfo;

    /// Opportunistically enable location reporting; idempotent, `None`
    /// when unsupported or no fix is cached yet.
    fn enable_location(&mut self) -> Option<CellLocation>;

    /// Current USSD session state as the service reports it.
    fn ussd_state(&mut self) -> UssdSessionState;

    /// Abort the network's USSD session.
    fn cancel_ussd(&mut self) -> Result<(), BackendError>;

    /// Re-acquire the USSD sub-interface after a timeout left it
    /// unusable. Returns whether the capability was recovered.
    fn restart_ussd(&mut self) -> bool;

    fn list_messages(&mut self) -> Result<Vec<SmsMessage>, BackendError>;
    fn get_message(&mut self, id: u32) -> Option<SmsMessage>;
    fn delete_message(&mut self, id: u32) -> Result<(), BackendError>;

    fn list_contacts(&mut self) -> Result<Vec<Contact>, BackendError>;
    fn add_contact(&mut self, contact: &Contact) -> Result<u32, BackendError>;
    fn delete_contact(&mut self, id: u32) -> Result<(), BackendError>;

    /// Whether the coordinator must poll the message list instead of
    /// waiting for completion signals.
    fn needs_sms_polling(&self) -> bool {
        false
    }

    /// Tear down: unsubscribe every signal first, then release
    /// interface handles, so no callback can land on a dying session.
    fn close(&mut self);
}
