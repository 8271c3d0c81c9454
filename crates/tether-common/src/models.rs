//! Canonical data models for the Tether mediation layer.
//!
//! Every supported management service speaks its own status vocabulary;
//! these types are the single representation the rest of the system (and
//! any consumer) sees. Translation into these types happens inside the
//! backend adapters and is total: unrecognized native values map to the
//! designated `Unknown`/`Other` member, never to an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Capabilities ────────────────────────────────────────────────────

bitflags::bitflags! {
    /// Top-level feature set a device advertises once opened.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Caps: u32 {
        const SMS      = 1 << 1;
        const USSD     = 1 << 2;
        const LOCATION = 1 << 3;
        const SCAN     = 1 << 4;
        const CONTACTS = 1 << 5;
    }

    /// Messaging sub-capabilities.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SmsCaps: u32 {
        const RECEIVE = 1 << 1;
        const SEND    = 1 << 2;
    }

    /// Supplementary-services sub-capabilities.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct UssdCaps: u32 {
        const SEND = 1 << 1;
    }

    /// Location sub-capabilities.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct LocationCaps: u32 {
        const GPP = 1 << 1;
        const GPS = 1 << 2;
    }

    /// Network-scan sub-capabilities.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ScanCaps: u32 {
        const OBSERVE = 1 << 1;
    }

    /// Phonebook sub-capabilities.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ContactsCaps: u32 {
        const EXPORT = 1 << 1;
        const EDIT   = 1 << 2;
    }
}

// ── Status enums ────────────────────────────────────────────────────

/// Network registration state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Idle,
    Home,
    Searching,
    Denied,
    #[default]
    Unknown,
    Roaming,
}

impl RegistrationStatus {
    /// Whether this state counts as registered on a network.
    pub fn is_registered(self) -> bool {
        matches!(self, RegistrationStatus::Home | RegistrationStatus::Roaming)
    }
}

/// SIM lock flavor currently blocking a device, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    #[default]
    None,
    Pin,
    Puk,
    Other,
}

/// Radio access technology currently in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    Unknown,
    Gsm,
    GsmCompact,
    Gprs,
    Edge,
    Umts,
    Hsdpa,
    Hsupa,
    Hspa,
    HspaPlus,
    OneXrtt,
    Evdo0,
    EvdoA,
    EvdoB,
    Lte,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AccessMode::Unknown => "unknown",
            AccessMode::Gsm => "GSM",
            AccessMode::GsmCompact => "GSM Compact",
            AccessMode::Gprs => "GPRS",
            AccessMode::Edge => "EDGE",
            AccessMode::Umts => "UMTS",
            AccessMode::Hsdpa => "HSDPA",
            AccessMode::Hsupa => "HSUPA",
            AccessMode::Hspa => "HSPA",
            AccessMode::HspaPlus => "HSPA+",
            AccessMode::OneXrtt => "1xRTT",
            AccessMode::Evdo0 => "EV-DO rev. 0",
            AccessMode::EvdoA => "EV-DO rev. A",
            AccessMode::EvdoB => "EV-DO rev. B",
            AccessMode::Lte => "LTE",
        };
        write!(f, "{name}")
    }
}

/// Availability of a network found during a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAvailability {
    #[default]
    Unknown,
    Available,
    Current,
    Forbidden,
}

/// State of the interactive USSD session on a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UssdSessionState {
    #[default]
    Unknown,
    Idle,
    Active,
    UserResponse,
}

/// Classification of an outgoing USSD string.
///
/// A `*`/`#`-framed all-digit string starts a fresh session; anything
/// else is a reply to a network prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UssdValidation {
    Invalid,
    Request,
    Response,
}

/// Longest USSD string networks accept.
pub const MAX_USSD_REQUEST_LENGTH: usize = 160;

impl UssdValidation {
    /// Classify an outgoing USSD string.
    pub fn classify(request: &str) -> Self {
        if request.is_empty() || request.len() > MAX_USSD_REQUEST_LENGTH {
            return UssdValidation::Invalid;
        }
        let bytes = request.as_bytes();
        let framed = (bytes[0] == b'*' || bytes[0] == b'#')
            && bytes[bytes.len() - 1] == b'#'
            && request.len() > 2;
        if framed
            && bytes
                .iter()
                .all(|b| b.is_ascii_digit() || *b == b'*' || *b == b'#')
        {
            UssdValidation::Request
        } else {
            UssdValidation::Response
        }
    }
}

/// Encoding quirk applied to USSD answers.
///
/// Some firmware returns answers as UCS-2 hex regardless of what was
/// requested; devices from such vendors get `Ucs2` at open time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UssdEncoding {
    #[default]
    Gsm7,
    Ucs2,
}

/// Radio family of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Gsm,
    Cdma,
}

// ── Operations ──────────────────────────────────────────────────────

/// The mutating operations that go through the per-device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Enable,
    Disable,
    Unlock,
    SendSms,
    SendUssd,
    Scan,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::Enable => "enable",
            OperationKind::Disable => "disable",
            OperationKind::Unlock => "unlock",
            OperationKind::SendSms => "send-sms",
            OperationKind::SendUssd => "send-ussd",
            OperationKind::Scan => "scan",
        };
        write!(f, "{name}")
    }
}

/// How a begun operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Succeeded,
    Failed,
    Cancelled,
}

// ── Device ──────────────────────────────────────────────────────────

/// 3GPP cell location, assembled from country code, network code,
/// location area code and cell id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellLocation {
    pub mcc: u32,
    pub mnc: u32,
    pub lac: u32,
    pub cell_id: u32,
}

/// Canonical snapshot of one modem.
///
/// `id` is stable only within one process session; `persistent_id` is a
/// fingerprint of manufacturer+model+firmware and survives reconnection
/// of the same physical hardware.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Device {
    pub id: u32,
    pub object_path: String,
    pub device_type: DeviceType,

    // Descriptive
    pub manufacturer: String,
    pub model: String,
    pub version: String,
    pub port: String,
    pub persistent_id: String,
    pub imei: Option<String>,
    pub imsi: Option<String>,

    // Capabilities
    pub caps: Caps,
    pub sms_caps: SmsCaps,
    pub ussd_caps: UssdCaps,
    pub location_caps: LocationCaps,
    pub scan_caps: ScanCaps,
    pub contacts_caps: ContactsCaps,

    // Mutable status
    pub enabled: bool,
    pub blocked: bool,
    pub registered: bool,
    pub connected: bool,
    pub prepared: bool,
    pub lock_type: LockType,
    pub registration: RegistrationStatus,
    pub operator_code: u32,
    pub operator_name: Option<String>,
    pub signal_level: u32,
    pub mode: AccessMode,
    pub location: CellLocation,
    pub ussd_encoding: UssdEncoding,
}

impl Device {
    pub fn new(id: u32, object_path: impl Into<String>) -> Self {
        Device {
            id,
            object_path: object_path.into(),
            ..Default::default()
        }
    }
}

// ── Messages, networks, contacts ────────────────────────────────────

/// A received (or stored) text message surfaced by a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmsMessage {
    pub id: u32,
    pub number: String,
    pub service_number: Option<String>,
    pub text: String,
    pub binary: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub read: bool,
    /// Backend object path for message-object backends.
    pub object_path: Option<String>,
}

/// One network found by a scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScannedNetwork {
    pub availability: NetworkAvailability,
    pub access_tech: AccessMode,
    pub operator_code: u32,
    pub operator_long: Option<String>,
    pub operator_short: Option<String>,
}

/// Phonebook storage a contact lives in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStorage {
    #[default]
    Unknown,
    Device,
    Sim,
    Combined,
}

/// One phonebook entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contact {
    pub id: u32,
    pub name: String,
    pub number: String,
    pub email: Option<String>,
    pub group: Option<String>,
    pub name2: Option<String>,
    pub number2: Option<String>,
    pub hidden: bool,
    pub storage: ContactStorage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_predicate() {
        assert!(RegistrationStatus::Home.is_registered());
        assert!(RegistrationStatus::Roaming.is_registered());
        assert!(!RegistrationStatus::Searching.is_registered());
        assert!(!RegistrationStatus::Unknown.is_registered());
    }

    #[test]
    fn caps_compose() {
        let caps = Caps::SMS | Caps::USSD;
        assert!(caps.contains(Caps::SMS));
        assert!(!caps.contains(Caps::SCAN));
    }

    #[test]
    fn device_defaults_are_conservative() {
        let dev = Device::new(3, "/org/test/Modem/3");
        assert!(!dev.enabled);
        assert_eq!(dev.lock_type, LockType::None);
        assert_eq!(dev.registration, RegistrationStatus::Unknown);
        assert_eq!(dev.caps, Caps::empty());
    }

    #[test]
    fn operation_kind_display() {
        assert_eq!(OperationKind::SendUssd.to_string(), "send-ussd");
        assert_eq!(OperationKind::Enable.to_string(), "enable");
    }

    #[test]
    fn ussd_classification() {
        assert_eq!(UssdValidation::classify("*100#"), UssdValidation::Request);
        assert_eq!(UssdValidation::classify("#102#"), UssdValidation::Request);
        assert_eq!(UssdValidation::classify("*101*2#"), UssdValidation::Request);
        // Menu answers are responses, not fresh requests
        assert_eq!(UssdValidation::classify("1"), UssdValidation::Response);
        assert_eq!(UssdValidation::classify("*10a#"), UssdValidation::Response);
        assert_eq!(UssdValidation::classify(""), UssdValidation::Invalid);
    }
}
