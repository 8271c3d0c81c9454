//! The ordered event stream emitted to consumers.
//!
//! Every state change a consumer can observe arrives through exactly one
//! of these variants, in delivery order for a given device. Solicited
//! changes (the completion of a caller-initiated operation) surface as
//! `OperationResult`; unsolicited backend-driven changes surface as the
//! corresponding `*Changed` variant — never both for the same flip.

use crate::models::{
    AccessMode, Caps, CellLocation, Device, OperationKind, OperationStatus, RegistrationStatus,
    ScannedNetwork,
};

/// Payload delivered with a successful operation, where one exists.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResponse {
    /// Network answer to a USSD request, already decoded.
    UssdReply(String),
    /// Networks found by a scan.
    Networks(Vec<ScannedNetwork>),
}

/// Events emitted by the coordinator to its consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// A modem appeared on the backend.
    DeviceAdded { device: Device },
    /// A modem disappeared from the backend.
    DeviceRemoved { id: u32 },
    /// A device session was opened and its sub-interfaces probed.
    DeviceOpened { id: u32 },
    /// A device session is about to be torn down.
    DeviceClosing { id: u32 },

    /// Unsolicited power-state flip.
    EnabledChanged { id: u32, enabled: bool },
    /// Unsolicited SIM-lock flip.
    BlockedChanged { id: u32, blocked: bool },
    /// Unsolicited connection-prepared flip.
    PreparedChanged { id: u32, prepared: bool },
    /// Packet-data connection state flip.
    ConnectionChanged { id: u32, connected: bool },

    /// Registration status, operator code or operator name changed.
    RegistrationChanged {
        id: u32,
        status: RegistrationStatus,
        operator_code: u32,
        operator_name: Option<String>,
    },
    /// Access technology changed.
    NetworkModeChanged { id: u32, mode: AccessMode },
    /// Signal strength changed (percent, 0–100).
    SignalLevelChanged { id: u32, percent: u32 },
    /// 3GPP cell location changed.
    LocationChanged { id: u32, location: CellLocation },

    /// A capability became available after open (dynamic-discovery
    /// backends only).
    CapabilityExtended { id: u32, capability: Caps },

    /// A caller-initiated operation finished.
    OperationResult {
        id: u32,
        kind: OperationKind,
        status: OperationStatus,
        response: Option<OperationResponse>,
    },

    /// A new message finished arriving.
    MessageReceived { id: u32, message_id: u32 },
    /// The message list changed and should be re-read (polling backends).
    MessageListReady { id: u32 },
}

impl CoreEvent {
    /// The device this event concerns.
    pub fn device_id(&self) -> u32 {
        match self {
            CoreEvent::DeviceAdded { device } => device.id,
            CoreEvent::DeviceRemoved { id }
            | CoreEvent::DeviceOpened { id }
            | CoreEvent::DeviceClosing { id }
            | CoreEvent::EnabledChanged { id, .. }
            | CoreEvent::BlockedChanged { id, .. }
            | CoreEvent::PreparedChanged { id, .. }
            | CoreEvent::ConnectionChanged { id, .. }
            | CoreEvent::RegistrationChanged { id, .. }
            | CoreEvent::NetworkModeChanged { id, .. }
            | CoreEvent::SignalLevelChanged { id, .. }
            | CoreEvent::LocationChanged { id, .. }
            | CoreEvent::CapabilityExtended { id, .. }
            | CoreEvent::OperationResult { id, .. }
            | CoreEvent::MessageReceived { id, .. }
            | CoreEvent::MessageListReady { id } => *id,
        }
    }
}
