//! ModemManager ≥ 0.7 adapter.
//!
//! Devices and their sub-interfaces are discovered through an
//! object-manager subscription rather than static paths, and messages are
//! first-class objects with their own path and state. Sending a message
//! is a three-step dance: create the message object, send it, then delete
//! it from storage regardless of outcome so the modem store does not fill
//! up with sent copies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use tether_common::events::OperationResponse;
use tether_common::ids::{operator_code, path_index, persistent_id};
use tether_common::models::{
    AccessMode, Caps, CellLocation, Contact, ContactsCaps, Device, DeviceType, LocationCaps,
    LockType, NetworkAvailability, OperationKind, RegistrationStatus, ScanCaps, ScannedNetwork,
    SmsCaps, SmsMessage, UssdCaps, UssdSessionState,
};

use super::{
    Backend, BackendError, BackendKind, CapabilitySet, Completion, DeviceBackend, Discovery,
    IdentityInfo, Notice, OperationRequest, RegistrationInfo, StateSnapshot, UssdCommand,
};
use crate::rpc::{
    str_member, tuple_member, uint_member, PreparedCall, RpcChannel, RpcError, SignalEvent,
    SubscriptionId, PROPERTIES_CHANGED,
};

pub const MANAGER_PATH: &str = "/org/freedesktop/ModemManager1";
pub const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";
pub const MODEM_IFACE: &str = "org.freedesktop.ModemManager1.Modem";
pub const SIM_IFACE: &str = "org.freedesktop.ModemManager1.Sim";
pub const NET3GPP_IFACE: &str = "org.freedesktop.ModemManager1.Modem.Modem3gpp";
pub const CDMA_IFACE: &str = "org.freedesktop.ModemManager1.Modem.ModemCdma";
pub const MESSAGING_IFACE: &str = "org.freedesktop.ModemManager1.Modem.Messaging";
pub const SMS_IFACE: &str = "org.freedesktop.ModemManager1.Sms";
pub const USSD_IFACE: &str = "org.freedesktop.ModemManager1.Modem.Modem3gpp.Ussd";
pub const LOCATION_IFACE: &str = "org.freedesktop.ModemManager1.Modem.Location";
pub const CONTACTS_IFACE: &str = "org.freedesktop.ModemManager1.Modem.Contacts";

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Status translation ─────────────────────────────────────────────────

// Modem states; the enumeration is signed, Failed is −1.
mod state {
    pub const LOCKED: i64 = 2;
    pub const DISABLED: i64 = 3;
    pub const ENABLED: i64 = 6;
    pub const REGISTERED: i64 = 8;
    pub const DISCONNECTING: i64 = 9;
    pub const CONNECTED: i64 = 11;
}

fn enabled_from_state(value: i64) -> bool {
    (state::ENABLED..=state::CONNECTED).contains(&value)
}

fn locked_from_state(value: i64) -> bool {
    value == state::LOCKED
}

fn registered_from_state(value: i64) -> bool {
    (state::REGISTERED..=state::CONNECTED).contains(&value)
}

fn connected_from_state(value: i64) -> bool {
    matches!(value, state::DISCONNECTING | state::CONNECTED)
}

fn prepared_from_state(value: i64) -> bool {
    value == state::LOCKED
        || value == state::DISABLED
        || (state::ENABLED..=state::CONNECTED).contains(&value)
}

// Unlock-requirement enumeration; 1 is "none", everything the adapter
// cannot clear maps to Other.
fn lock_type_from_lock(value: u64) -> LockType {
    match value {
        1 => LockType::None,
        2 => LockType::Pin,
        4 => LockType::Puk,
        _ => LockType::Other,
    }
}

fn registration_status(value: u64) -> RegistrationStatus {
    match value {
        0 => RegistrationStatus::Idle,
        1 => RegistrationStatus::Home,
        2 => RegistrationStatus::Searching,
        3 => RegistrationStatus::Denied,
        5 => RegistrationStatus::Roaming,
        _ => RegistrationStatus::Unknown,
    }
}

fn cdma_registration_status(value: u64) -> RegistrationStatus {
    match value {
        1 | 2 => RegistrationStatus::Home,
        3 => RegistrationStatus::Roaming,
        _ => RegistrationStatus::Unknown,
    }
}

/// Access technologies arrive as a bitmask; the fastest set bit wins.
fn access_mode(mask: u64) -> AccessMode {
    const TABLE: &[(u64, AccessMode)] = &[
        (1 << 14, AccessMode::Lte),
        (1 << 13, AccessMode::EvdoB),
        (1 << 12, AccessMode::EvdoA),
        (1 << 11, AccessMode::Evdo0),
        (1 << 10, AccessMode::OneXrtt),
        (1 << 9, AccessMode::HspaPlus),
        (1 << 8, AccessMode::Hspa),
        (1 << 7, AccessMode::Hsupa),
        (1 << 6, AccessMode::Hsdpa),
        (1 << 5, AccessMode::Umts),
        (1 << 4, AccessMode::Edge),
        (1 << 3, AccessMode::Gprs),
        (1 << 2, AccessMode::GsmCompact),
        (1 << 1, AccessMode::Gsm),
    ];
    TABLE
        .iter()
        .find(|(bit, _)| mask & bit != 0)
        .map(|(_, mode)| *mode)
        .unwrap_or(AccessMode::Unknown)
}

fn network_availability(value: u64) -> NetworkAvailability {
    match value {
        1 => NetworkAvailability::Available,
        2 => NetworkAvailability::Current,
        3 => NetworkAvailability::Forbidden,
        _ => NetworkAvailability::Unknown,
    }
}

fn ussd_state_from_int(value: u64) -> UssdSessionState {
    match value {
        1 => UssdSessionState::Idle,
        2 => UssdSessionState::Active,
        3 => UssdSessionState::UserResponse,
        _ => UssdSessionState::Unknown,
    }
}

// Message object state and PDU type.
const SMS_STATE_RECEIVED: u64 = 3;
const SMS_PDU_SUBMIT: u64 = 2;

// Modem capability bits.
const CAPABILITY_CDMA_EVDO: u64 = 1 << 1;
const CAPABILITY_GSM_UMTS: u64 = 1 << 2;

// Location source bits.
const LOCATION_SOURCE_3GPP_LAC_CI: u64 = 1 << 0;
const LOCATION_SOURCE_GPS_RAW: u64 = 1 << 1;

/// The 3GPP entry of a location dictionary: `MCC,MNC,LAC,CI` with LAC
/// and CI in hex.
fn parse_location(reply: &Value) -> Option<CellLocation> {
    let text = tuple_member(reply, 0)?.get("1")?.as_str()?;
    let mut parts = text.split(',');
    let mcc = parts.next()?.parse().ok()?;
    let mnc = parts.next()?.parse().ok()?;
    let lac = u32::from_str_radix(parts.next()?, 16).ok()?;
    let cell_id = u32::from_str_radix(parts.next()?, 16).ok()?;
    Some(CellLocation {
        mcc,
        mnc,
        lac,
        cell_id,
    })
}

/// One entry of a `Scan` reply; entries without an availability status
/// are dropped.
fn parse_network(entry: &Value) -> Option<ScannedNetwork> {
    let status = uint_member(entry, "status")?;
    Some(ScannedNetwork {
        availability: network_availability(status),
        access_tech: uint_member(entry, "access-technology")
            .map(access_mode)
            .unwrap_or(AccessMode::Unknown),
        operator_code: str_member(entry, "operator-code")
            .map(operator_code)
            .unwrap_or(0),
        operator_long: str_member(entry, "operator-long").map(str::to_owned),
        operator_short: str_member(entry, "operator-short").map(str::to_owned),
    })
}

fn parse_contact(entry: &Value) -> Option<Contact> {
    Some(Contact {
        id: uint_member(entry, "index")? as u32,
        name: str_member(entry, "name").unwrap_or("Unknown").to_owned(),
        number: str_member(entry, "number").unwrap_or("Unknown").to_owned(),
        email: str_member(entry, "email").map(str::to_owned),
        group: str_member(entry, "group").map(str::to_owned),
        name2: str_member(entry, "name2").map(str::to_owned),
        number2: str_member(entry, "number2").map(str::to_owned),
        hidden: entry.get("hidden").and_then(Value::as_bool).unwrap_or(false),
        storage: match uint_member(entry, "storage") {
            Some(1) => tether_common::models::ContactStorage::Device,
            Some(2) => tether_common::models::ContactStorage::Sim,
            Some(3) => tether_common::models::ContactStorage::Combined,
            _ => tether_common::models::ContactStorage::Unknown,
        },
    })
}

// ─── Manager-level adapter ──────────────────────────────────────────────

pub struct ModernBackend {
    channel: Arc<dyn RpcChannel>,
    manager_sub: Option<SubscriptionId>,
}

impl ModernBackend {
    pub fn new(channel: Arc<dyn RpcChannel>) -> Self {
        ModernBackend {
            channel,
            manager_sub: None,
        }
    }

    fn device_from_path(&self, path: &str) -> Device {
        let mut device = Device::new(path_index(path), path);
        let prop = |name: &str| self.channel.get_property(path, MODEM_IFACE, name);
        let string_prop = |name: &str| {
            prop(name)
                .and_then(|v| v.as_str().map(str::to_owned))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Unknown".to_owned())
        };

        device.manufacturer = string_prop("Manufacturer");
        device.model = string_prop("Model");
        device.version = string_prop("Revision");
        device.port = string_prop("PrimaryPort");
        device.persistent_id = persistent_id(&device.manufacturer, &device.model, &device.version);

        if let Some(mask) = prop("CurrentCapabilities").and_then(|v| v.as_u64()) {
            if mask & CAPABILITY_CDMA_EVDO != 0 && mask & CAPABILITY_GSM_UMTS == 0 {
                device.device_type = DeviceType::Cdma;
            }
        }
        if let Some(value) = prop("State").and_then(|v| v.as_i64()) {
            device.enabled = enabled_from_state(value);
            device.blocked = locked_from_state(value);
            device.registered = registered_from_state(value);
            device.connected = connected_from_state(value);
            device.prepared = prepared_from_state(value);
        }
        if device.blocked {
            device.lock_type = prop("UnlockRequired")
                .and_then(|v| v.as_u64())
                .map(lock_type_from_lock)
                .unwrap_or(LockType::Other);
        }
        if let Some(quality) = prop("SignalQuality") {
            // (percent, recent) tuple
            device.signal_level = tuple_member(&quality, 0)
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
        }
        if let Some(mask) = prop("AccessTechnologies").and_then(|v| v.as_u64()) {
            device.mode = access_mode(mask);
        }
        device
    }
}

impl Backend for ModernBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Modern
    }

    fn attach(&mut self) -> Result<(), BackendError> {
        if self.manager_sub.is_none() {
            self.manager_sub = Some(self.channel.subscribe(MANAGER_PATH, OBJECT_MANAGER_IFACE));
        }
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(id) = self.manager_sub.take() {
            self.channel.unsubscribe(id);
        }
    }

    fn enumerate(&mut self) -> Result<Vec<Device>, BackendError> {
        let reply = self.channel.call_sync(
            MANAGER_PATH,
            OBJECT_MANAGER_IFACE,
            "GetManagedObjects",
            json!([]),
            QUERY_TIMEOUT,
        )?;
        let objects = tuple_member(&reply, 0)
            .and_then(Value::as_object)
            .ok_or_else(|| BackendError::Malformed("managed object dictionary".into()))?;
        Ok(objects
            .iter()
            .filter(|(_, interfaces)| interfaces.get(MODEM_IFACE).is_some())
            .map(|(path, _)| self.device_from_path(path))
            .collect())
    }

    fn translate_discovery(&mut self, ev: &SignalEvent) -> Option<Discovery> {
        if ev.interface != OBJECT_MANAGER_IFACE {
            return None;
        }
        let path = tuple_member(&ev.args, 0).and_then(Value::as_str)?;
        match ev.signal.as_str() {
            "InterfacesAdded" => {
                let interfaces = tuple_member(&ev.args, 1)?.as_object()?;
                interfaces
                    .contains_key(MODEM_IFACE)
                    .then(|| Discovery::Added(self.device_from_path(path)))
            }
            "InterfacesRemoved" => {
                let interfaces = tuple_member(&ev.args, 1)?.as_array()?;
                interfaces
                    .iter()
                    .any(|v| v.as_str() == Some(MODEM_IFACE))
                    .then(|| Discovery::Removed(path_index(path)))
            }
            _ => None,
        }
    }

    fn open(&mut self, device: &Device) -> Result<Box<dyn DeviceBackend>, BackendError> {
        let path = device.object_path.clone();
        let channel = self.channel.clone();
        let mut subs = Vec::new();

        subs.push(channel.subscribe(&path, MODEM_IFACE));
        subs.push(channel.subscribe_properties(&path, MODEM_IFACE));
        subs.push(channel.subscribe(&path, MESSAGING_IFACE));

        let mut caps = CapabilitySet {
            caps: Caps::SMS,
            sms: SmsCaps::RECEIVE | SmsCaps::SEND,
            ..Default::default()
        };

        match device.device_type {
            DeviceType::Gsm => {
                subs.push(channel.subscribe_properties(&path, NET3GPP_IFACE));
                caps.caps |= Caps::SCAN;
                caps.scan = ScanCaps::OBSERVE;
            }
            DeviceType::Cdma => {
                subs.push(channel.subscribe_properties(&path, CDMA_IFACE));
            }
        }

        let interfaces = channel.list_interfaces(&path);
        let mut ussd_sub = None;
        if device.device_type == DeviceType::Gsm && interfaces.contains(USSD_IFACE) {
            ussd_sub = Some(channel.subscribe_properties(&path, USSD_IFACE));
            caps.caps |= Caps::USSD;
            caps.ussd = UssdCaps::SEND;
        }
        if interfaces.contains(CONTACTS_IFACE) {
            caps.caps |= Caps::CONTACTS;
            caps.contacts = ContactsCaps::EXPORT | ContactsCaps::EDIT;
        }

        let sim_path = channel
            .get_property(&path, MODEM_IFACE, "Sim")
            .and_then(|v| v.as_str().map(str::to_owned));

        Ok(Box::new(ModernDevice {
            channel,
            path,
            sim_path,
            device_type: device.device_type,
            caps,
            subs,
            ussd_sub,
            location_enabled: false,
            location_sub: None,
            pending_send: None,
            incoming: HashMap::new(),
            message_paths: HashMap::new(),
        }))
    }
}

// ─── Per-device adapter handle ──────────────────────────────────────────

pub struct ModernDevice {
    channel: Arc<dyn RpcChannel>,
    path: String,
    sim_path: Option<String>,
    device_type: DeviceType,
    caps: CapabilitySet,
    subs: Vec<SubscriptionId>,
    ussd_sub: Option<SubscriptionId>,
    location_enabled: bool,
    location_sub: Option<SubscriptionId>,
    /// Message object created for an outgoing send; deleted from storage
    /// once the send resolves, success or not.
    pending_send: Option<String>,
    /// Message objects still receiving, watched until complete.
    incoming: HashMap<String, SubscriptionId>,
    /// Known message object paths by numeric id.
    message_paths: HashMap<u32, String>,
}

impl ModernDevice {
    fn read_message(&self, path: &str) -> Option<SmsMessage> {
        let prop = |name: &str| self.channel.get_property(path, SMS_IFACE, name);
        let state = prop("State").and_then(|v| v.as_u64()).unwrap_or(0);
        let pdu = prop("PduType").and_then(|v| v.as_u64()).unwrap_or(0);
        if state != SMS_STATE_RECEIVED || pdu == SMS_PDU_SUBMIT {
            return None;
        }
        let text = prop("Text")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        let binary = text.is_empty() && prop("Data").is_some();
        Some(SmsMessage {
            id: path_index(path),
            number: prop("Number")
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_else(|| "Unknown".to_owned()),
            service_number: prop("SMSC").and_then(|v| v.as_str().map(str::to_owned)),
            text,
            binary,
            timestamp: prop("Timestamp")
                .and_then(|v| v.as_str().map(str::to_owned))
                .and_then(|raw| chrono::DateTime::parse_from_rfc3339(&raw).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
            read: false,
            object_path: Some(path.to_owned()),
        })
    }

    fn delete_message_object(&self, message_path: &str) {
        if let Err(err) = self.channel.call_sync(
            &self.path,
            MESSAGING_IFACE,
            "Delete",
            json!([message_path]),
            QUERY_TIMEOUT,
        ) {
            debug!(path = %message_path, error = %err, "message delete failed");
        }
    }

    fn read_location(&self) -> Option<CellLocation> {
        let reply = self
            .channel
            .call_sync(
                &self.path,
                LOCATION_IFACE,
                "GetLocation",
                json!([]),
                QUERY_TIMEOUT,
            )
            .ok()?;
        parse_location(&reply)
    }
}

impl DeviceBackend for ModernDevice {
    fn capabilities(&self) -> CapabilitySet {
        self.caps
    }

    fn state_snapshot(&mut self) -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();
        if let Some(value) = self
            .channel
            .get_property(&self.path, MODEM_IFACE, "State")
            .and_then(|v| v.as_i64())
        {
            snapshot.enabled = Some(enabled_from_state(value));
            snapshot.blocked = Some(locked_from_state(value));
            snapshot.registered = Some(registered_from_state(value));
            snapshot.connected = Some(connected_from_state(value));
            snapshot.prepared = Some(prepared_from_state(value));
            if locked_from_state(value) {
                snapshot.lock_type = Some(
                    self.channel
                        .get_property(&self.path, MODEM_IFACE, "UnlockRequired")
                        .and_then(|v| v.as_u64())
                        .map(lock_type_from_lock)
                        .unwrap_or(LockType::Other),
                );
            }
        }
        snapshot
    }

    fn translate_signal(&mut self, ev: &SignalEvent) -> Vec<Notice> {
        match (ev.interface.as_str(), ev.signal.as_str()) {
            (MODEM_IFACE, "StateChanged") if ev.path == self.path => {
                // (old, new, reason)
                let Some(new_state) = tuple_member(&ev.args, 1).and_then(Value::as_i64) else {
                    return Vec::new();
                };
                let blocked = locked_from_state(new_state);
                let lock_type = if blocked {
                    self.channel
                        .get_property(&self.path, MODEM_IFACE, "UnlockRequired")
                        .and_then(|v| v.as_u64())
                        .map(lock_type_from_lock)
                } else {
                    Some(LockType::None)
                };
                vec![Notice::State(StateSnapshot {
                    enabled: Some(enabled_from_state(new_state)),
                    blocked: Some(blocked),
                    lock_type,
                    registered: Some(registered_from_state(new_state)),
                    connected: Some(connected_from_state(new_state)),
                    prepared: Some(prepared_from_state(new_state)),
                })]
            }
            (MESSAGING_IFACE, "Added") if ev.path == self.path => {
                // (message path, received from network)
                let Some(message_path) = tuple_member(&ev.args, 0).and_then(Value::as_str) else {
                    return Vec::new();
                };
                if tuple_member(&ev.args, 1).and_then(Value::as_bool) != Some(true) {
                    return Vec::new();
                }
                let id = path_index(message_path);
                self.message_paths.insert(id, message_path.to_owned());
                let state = self
                    .channel
                    .get_property(message_path, SMS_IFACE, "State")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                if state == SMS_STATE_RECEIVED {
                    vec![Notice::MessageArrived { message_id: id }]
                } else {
                    // Still receiving; watch the object until it completes
                    let sub = self.channel.subscribe_properties(message_path, SMS_IFACE);
                    self.incoming.insert(message_path.to_owned(), sub);
                    Vec::new()
                }
            }
            (SMS_IFACE, PROPERTIES_CHANGED) => {
                let Some(sub) = self.incoming.get(&ev.path).copied() else {
                    return Vec::new();
                };
                if uint_member(&ev.args, "State") == Some(SMS_STATE_RECEIVED) {
                    self.channel.unsubscribe(sub);
                    self.incoming.remove(&ev.path);
                    vec![Notice::MessageArrived {
                        message_id: path_index(&ev.path),
                    }]
                } else {
                    Vec::new()
                }
            }
            (MODEM_IFACE, PROPERTIES_CHANGED) if ev.path == self.path => {
                let mut notices = Vec::new();
                if let Some(quality) = ev.args.get("SignalQuality") {
                    if let Some(percent) = tuple_member(quality, 0).and_then(Value::as_u64) {
                        notices.push(Notice::SignalLevel(percent as u32));
                    }
                }
                if let Some(mask) = uint_member(&ev.args, "AccessTechnologies") {
                    notices.push(Notice::Mode(access_mode(mask)));
                }
                notices
            }
            (LOCATION_IFACE, PROPERTIES_CHANGED) if ev.path == self.path => {
                if ev.args.get("Location").is_some() {
                    match self.read_location() {
                        Some(location) => vec![Notice::Location(location)],
                        None => Vec::new(),
                    }
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn prepare_operation(
        &mut self,
        request: &OperationRequest,
    ) -> Result<PreparedCall, BackendError> {
        match request {
            OperationRequest::Power { on } => Ok(PreparedCall::new(
                &self.path,
                MODEM_IFACE,
                "Enable",
                json!([on]),
            )),
            OperationRequest::Unlock { pin } => {
                let sim = self.sim_path.as_deref().ok_or(BackendError::NotSupported)?;
                Ok(PreparedCall::new(sim, SIM_IFACE, "SendPin", json!([pin])))
            }
            OperationRequest::SendSms {
                number,
                text,
                validity,
                report,
            } => {
                // The message exists as an object before it is sent.
                let mut properties = json!({ "number": number, "text": text });
                if *validity >= 0 {
                    properties["validity"] = json!(validity);
                }
                if *report {
                    properties["delivery-report-request"] = json!(true);
                }
                let reply = self.channel.call_sync(
                    &self.path,
                    MESSAGING_IFACE,
                    "Create",
                    json!([properties]),
                    QUERY_TIMEOUT,
                )?;
                let message_path = tuple_member(&reply, 0)
                    .and_then(Value::as_str)
                    .ok_or_else(|| BackendError::Malformed("created message path".into()))?
                    .to_owned();
                let call = PreparedCall::new(&message_path, SMS_IFACE, "Send", json!([]));
                self.pending_send = Some(message_path);
                Ok(call)
            }
            OperationRequest::SendUssd { request, command } => {
                let method = match command {
                    UssdCommand::Initiate => "Initiate",
                    UssdCommand::Respond => "Respond",
                };
                Ok(PreparedCall::new(
                    &self.path,
                    USSD_IFACE,
                    method,
                    json!([request]),
                ))
            }
            OperationRequest::Scan => Ok(PreparedCall::new(
                &self.path,
                NET3GPP_IFACE,
                "Scan",
                json!([]),
            )),
        }
    }

    fn complete_operation(
        &mut self,
        kind: OperationKind,
        result: Result<&Value, &RpcError>,
    ) -> Result<Completion, BackendError> {
        if kind == OperationKind::SendSms {
            // Sent copies are not kept in the modem store, success or not
            if let Some(message_path) = self.pending_send.take() {
                self.delete_message_object(&message_path);
            }
        }
        let Ok(reply) = result else {
            return Ok(Completion::Done(None));
        };
        match kind {
            OperationKind::Enable | OperationKind::Disable | OperationKind::Unlock => {
                Ok(Completion::Deferred)
            }
            OperationKind::SendSms => Ok(Completion::Done(None)),
            OperationKind::SendUssd => {
                let answer = tuple_member(reply, 0)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                Ok(Completion::Done(Some(OperationResponse::UssdReply(answer))))
            }
            OperationKind::Scan => {
                let networks = tuple_member(reply, 0)
                    .and_then(Value::as_array)
                    .map(|entries| entries.iter().filter_map(parse_network).collect())
                    .unwrap_or_default();
                Ok(Completion::Done(Some(OperationResponse::Networks(networks))))
            }
        }
    }

    fn read_registration_info(&mut self) -> RegistrationInfo {
        match self.device_type {
            DeviceType::Gsm => RegistrationInfo {
                status: self
                    .channel
                    .get_property(&self.path, NET3GPP_IFACE, "RegistrationState")
                    .and_then(|v| v.as_u64())
                    .map(registration_status)
                    .unwrap_or(RegistrationStatus::Unknown),
                operator_code: self
                    .channel
                    .get_property(&self.path, NET3GPP_IFACE, "OperatorCode")
                    .and_then(|v| v.as_str().map(operator_code))
                    .unwrap_or(0),
                operator_name: self
                    .channel
                    .get_property(&self.path, NET3GPP_IFACE, "OperatorName")
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .filter(|s| !s.is_empty()),
            },
            DeviceType::Cdma => {
                let status = self
                    .channel
                    .get_property(&self.path, CDMA_IFACE, "Cdma1xRegistrationState")
                    .or_else(|| {
                        self.channel
                            .get_property(&self.path, CDMA_IFACE, "EvdoRegistrationState")
                    })
                    .and_then(|v| v.as_u64())
                    .map(cdma_registration_status)
                    .unwrap_or(RegistrationStatus::Unknown);
                RegistrationInfo {
                    status,
                    // The serving system id stands in for the operator code
                    operator_code: self
                        .channel
                        .get_property(&self.path, CDMA_IFACE, "Sid")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0) as u32,
                    operator_name: None,
                }
            }
        }
    }

    fn read_identity(&mut self) -> IdentityInfo {
        let mut identity = IdentityInfo::default();
        identity.imei = self
            .channel
            .get_property(&self.path, MODEM_IFACE, "EquipmentIdentifier")
            .and_then(|v| v.as_str().map(str::to_owned))
            .filter(|s| !s.is_empty());
        match self.device_type {
            DeviceType::Gsm => {
                if let Some(sim) = self.sim_path.as_deref() {
                    identity.imsi = self
                        .channel
                        .get_property(sim, SIM_IFACE, "Imsi")
                        .and_then(|v| v.as_str().map(str::to_owned))
                        .filter(|s| !s.is_empty());
                }
            }
            DeviceType::Cdma => {
                if identity.imei.is_none() {
                    identity.imei = self
                        .channel
                        .get_property(&self.path, CDMA_IFACE, "Esn")
                        .and_then(|v| v.as_str().map(str::to_owned))
                        .filter(|s| !s.is_empty());
                }
            }
        }
        identity
    }

    fn enable_location(&mut self) -> Option<CellLocation> {
        if !self.location_enabled {
            let sources = self
                .channel
                .get_property(&self.path, LOCATION_IFACE, "Capabilities")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let wanted =
                sources & (LOCATION_SOURCE_3GPP_LAC_CI | LOCATION_SOURCE_GPS_RAW);
            if wanted == 0 {
                return None;
            }
            if let Err(err) = self.channel.call_sync(
                &self.path,
                LOCATION_IFACE,
                "Setup",
                json!([wanted, true]),
                QUERY_TIMEOUT,
            ) {
                debug!(path = %self.path, error = %err, "location setup failed");
                return None;
            }
            self.location_sub = Some(self.channel.subscribe_properties(&self.path, LOCATION_IFACE));
            self.location_enabled = true;
            self.caps.caps |= Caps::LOCATION;
            if wanted & LOCATION_SOURCE_3GPP_LAC_CI != 0 {
                self.caps.location |= LocationCaps::GPP;
            }
            if wanted & LOCATION_SOURCE_GPS_RAW != 0 {
                self.caps.location |= LocationCaps::GPS;
            }
        }
        self.read_location()
    }

    fn ussd_state(&mut self) -> UssdSessionState {
        if !self.caps.ussd.contains(UssdCaps::SEND) {
            return UssdSessionState::Unknown;
        }
        self.channel
            .get_property(&self.path, USSD_IFACE, "State")
            .and_then(|v| v.as_u64())
            .map(ussd_state_from_int)
            .unwrap_or(UssdSessionState::Unknown)
    }

    fn cancel_ussd(&mut self) -> Result<(), BackendError> {
        self.channel
            .call_sync(&self.path, USSD_IFACE, "Cancel", json!([]), QUERY_TIMEOUT)?;
        Ok(())
    }

    fn restart_ussd(&mut self) -> bool {
        if let Some(sub) = self.ussd_sub.take() {
            self.channel.unsubscribe(sub);
        }
        if self.channel.list_interfaces(&self.path).contains(USSD_IFACE) {
            self.ussd_sub = Some(self.channel.subscribe_properties(&self.path, USSD_IFACE));
            self.caps.caps |= Caps::USSD;
            self.caps.ussd = UssdCaps::SEND;
            true
        } else {
            warn!(path = %self.path, "ussd interface gone after restart");
            self.caps.caps.remove(Caps::USSD);
            self.caps.ussd = UssdCaps::empty();
            false
        }
    }

    fn list_messages(&mut self) -> Result<Vec<SmsMessage>, BackendError> {
        let reply = self.channel.call_sync(
            &self.path,
            MESSAGING_IFACE,
            "List",
            json!([]),
            QUERY_TIMEOUT,
        )?;
        let paths = tuple_member(&reply, 0)
            .and_then(Value::as_array)
            .ok_or_else(|| BackendError::Malformed("message path list".into()))?;
        let mut messages = Vec::new();
        for path in paths.iter().filter_map(Value::as_str) {
            if let Some(message) = self.read_message(path) {
                self.message_paths.insert(message.id, path.to_owned());
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn get_message(&mut self, id: u32) -> Option<SmsMessage> {
        let path = self.message_paths.get(&id)?.clone();
        self.read_message(&path)
    }

    fn delete_message(&mut self, id: u32) -> Result<(), BackendError> {
        let path = self
            .message_paths
            .remove(&id)
            .ok_or_else(|| BackendError::Malformed(format!("unknown message {id}")))?;
        self.channel.call_sync(
            &self.path,
            MESSAGING_IFACE,
            "Delete",
            json!([path]),
            QUERY_TIMEOUT,
        )?;
        Ok(())
    }

    fn list_contacts(&mut self) -> Result<Vec<Contact>, BackendError> {
        if !self.caps.caps.contains(Caps::CONTACTS) {
            return Err(BackendError::NotSupported);
        }
        let reply =
            self.channel
                .call_sync(&self.path, CONTACTS_IFACE, "List", json!([]), QUERY_TIMEOUT)?;
        Ok(tuple_member(&reply, 0)
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(parse_contact).collect())
            .unwrap_or_default())
    }

    fn add_contact(&mut self, contact: &Contact) -> Result<u32, BackendError> {
        if !self.caps.contacts.contains(ContactsCaps::EDIT) {
            return Err(BackendError::NotSupported);
        }
        let reply = self.channel.call_sync(
            &self.path,
            CONTACTS_IFACE,
            "Add",
            json!([{ "name": contact.name, "number": contact.number }]),
            QUERY_TIMEOUT,
        )?;
        tuple_member(&reply, 0)
            .and_then(Value::as_u64)
            .map(|id| id as u32)
            .ok_or_else(|| BackendError::Malformed("contact index".into()))
    }

    fn delete_contact(&mut self, id: u32) -> Result<(), BackendError> {
        if !self.caps.contacts.contains(ContactsCaps::EDIT) {
            return Err(BackendError::NotSupported);
        }
        self.channel
            .call_sync(&self.path, CONTACTS_IFACE, "Delete", json!([id]), QUERY_TIMEOUT)?;
        Ok(())
    }

    fn close(&mut self) {
        for (_, sub) in self.incoming.drain() {
            self.channel.unsubscribe(sub);
        }
        if let Some(sub) = self.location_sub.take() {
            self.channel.unsubscribe(sub);
        }
        if let Some(sub) = self.ussd_sub.take() {
            self.channel.unsubscribe(sub);
        }
        for id in self.subs.drain(..).rev() {
            self.channel.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Predicate totality ─────────────────────────────────────────────

    #[test]
    fn state_predicates_are_total() {
        for value in (-5..=30).chain([i64::MIN, i64::MAX]) {
            let _ = enabled_from_state(value);
            let _ = locked_from_state(value);
            let _ = registered_from_state(value);
            let _ = connected_from_state(value);
            let _ = prepared_from_state(value);
        }
        assert!(!enabled_from_state(-1));
        assert!(!enabled_from_state(5));
        assert!(enabled_from_state(6));
        assert!(enabled_from_state(11));
        assert!(locked_from_state(2));
        assert!(!locked_from_state(3));
        assert!(registered_from_state(8));
        assert!(!registered_from_state(7));
        assert!(connected_from_state(9));
        assert!(connected_from_state(11));
        assert!(!connected_from_state(10));
        assert!(prepared_from_state(2));
        assert!(prepared_from_state(3));
        assert!(!prepared_from_state(4));
        assert!(!prepared_from_state(-1));
    }

    #[test]
    fn lock_enum_translation_is_total() {
        for value in (0..=30).chain([u64::MAX]) {
            let _ = lock_type_from_lock(value);
        }
        assert_eq!(lock_type_from_lock(1), LockType::None);
        assert_eq!(lock_type_from_lock(2), LockType::Pin);
        assert_eq!(lock_type_from_lock(4), LockType::Puk);
        assert_eq!(lock_type_from_lock(0), LockType::Other);
        assert_eq!(lock_type_from_lock(16), LockType::Other);
    }

    #[test]
    fn access_mode_picks_fastest_bit() {
        assert_eq!(access_mode(0), AccessMode::Unknown);
        assert_eq!(access_mode(1 << 1), AccessMode::Gsm);
        assert_eq!(access_mode((1 << 1) | (1 << 5)), AccessMode::Umts);
        assert_eq!(access_mode((1 << 5) | (1 << 14)), AccessMode::Lte);
        assert_eq!(access_mode(u64::MAX), AccessMode::Lte);
    }

    #[test]
    fn registration_status_is_total() {
        for value in (0..=20).chain([u64::MAX]) {
            let _ = registration_status(value);
            let _ = cdma_registration_status(value);
        }
        assert_eq!(registration_status(5), RegistrationStatus::Roaming);
        assert_eq!(registration_status(4), RegistrationStatus::Unknown);
        assert_eq!(registration_status(9), RegistrationStatus::Unknown);
    }

    #[test]
    fn ussd_state_translation_is_total() {
        for value in (0..=10).chain([u64::MAX]) {
            let _ = ussd_state_from_int(value);
        }
        assert_eq!(ussd_state_from_int(1), UssdSessionState::Idle);
        assert_eq!(ussd_state_from_int(3), UssdSessionState::UserResponse);
        assert_eq!(ussd_state_from_int(7), UssdSessionState::Unknown);
    }

    // ─── Value parsing ──────────────────────────────────────────────────

    #[test]
    fn scan_entry_parses_typed_fields() {
        let network = parse_network(&json!({
            "operator-code": "310260",
            "access-technology": (1u64 << 14),
            "operator-long": "Test Mobile",
            "operator-short": "TM",
            "status": 1,
        }))
        .unwrap();
        assert_eq!(network.availability, NetworkAvailability::Available);
        assert_eq!(network.access_tech, AccessMode::Lte);
        assert_eq!(network.operator_code, (310 << 16) | 260);
    }

    #[test]
    fn scan_entry_without_status_is_dropped() {
        assert!(parse_network(&json!({ "operator-code": "25001" })).is_none());
    }

    #[test]
    fn location_reply_parses_hex_fields() {
        let reply = json!([{ "1": "310,260,1F00,BC614E" }]);
        let loc = parse_location(&reply).unwrap();
        assert_eq!(loc.mcc, 310);
        assert_eq!(loc.mnc, 260);
        assert_eq!(loc.lac, 0x1F00);
        assert_eq!(loc.cell_id, 0xBC614E);
    }

    #[test]
    fn contact_entry_requires_index() {
        assert!(parse_contact(&json!({ "name": "A", "number": "1" })).is_none());
        let contact = parse_contact(&json!({
            "index": 7,
            "name": "Alice",
            "number": "+4917012345",
            "storage": 2,
        }))
        .unwrap();
        assert_eq!(contact.id, 7);
        assert_eq!(
            contact.storage,
            tether_common::models::ContactStorage::Sim
        );
    }
}
