//! ModemManager ≤ 0.6 / Wader adapter.
//!
//! The oldest service: every sub-interface lives at a statically-known
//! suffix of the modem object path, there is no object discovery, and the
//! message store cannot always confirm delivery. When the optional time
//! sub-interface is missing the adapter switches message listing to a
//! poll driven by the coordinator and drops the send capability, since
//! the service cannot confirm delivery without it.
//!
//! The Wader flavor speaks the same interfaces with three quirks: the
//! modem must be explicitly enabled at open before any other interface
//! answers, the supplementary-services interface is unusable, and it is
//! the only flavor with a phonebook API.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use tether_common::ids::{operator_code, path_index, persistent_id};
use tether_common::models::{
    AccessMode, Caps, CellLocation, Contact, ContactsCaps, Device, DeviceType, LockType,
    NetworkAvailability, OperationKind, RegistrationStatus, ScanCaps, ScannedNetwork, SmsCaps,
    SmsMessage, UssdCaps, UssdSessionState,
};

use super::{
    Backend, BackendError, BackendKind, CapabilitySet, Completion, DeviceBackend, Discovery,
    IdentityInfo, Notice, OperationRequest, RegistrationInfo, StateSnapshot, UssdCommand,
};
use crate::rpc::{
    str_member, tuple_member, uint_member, PreparedCall, RpcChannel, RpcError, SignalEvent,
    SubscriptionId, PROPERTIES_CHANGED,
};
use tether_common::events::OperationResponse;

pub const MANAGER_PATH: &str = "/org/freedesktop/ModemManager";
pub const MANAGER_IFACE: &str = "org.freedesktop.ModemManager";
pub const MODEM_IFACE: &str = "org.freedesktop.ModemManager.Modem";
pub const CARD_IFACE: &str = "org.freedesktop.ModemManager.Modem.Gsm.Card";
pub const NETWORK_IFACE: &str = "org.freedesktop.ModemManager.Modem.Gsm.Network";
pub const SMS_IFACE: &str = "org.freedesktop.ModemManager.Modem.Gsm.SMS";
pub const USSD_IFACE: &str = "org.freedesktop.ModemManager.Modem.Gsm.Ussd";
pub const CDMA_IFACE: &str = "org.freedesktop.ModemManager.Modem.Cdma";
pub const LOCATION_IFACE: &str = "org.freedesktop.ModemManager.Modem.Location";
pub const TIME_IFACE: &str = "org.freedesktop.ModemManager.Modem.Time";
pub const CONTACTS_IFACE: &str = "org.freedesktop.ModemManager.Modem.Gsm.Contacts";

/// Budget for synchronous property reads and short queries.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Which service implementation answers on the legacy interface names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyFlavor {
    ModemManager,
    Wader,
}

// ─── Status translation ─────────────────────────────────────────────────

// Modem states, in decades.
mod state {
    pub const ENABLED: u64 = 40;
    pub const REGISTERED: u64 = 60;
    pub const DISCONNECTING: u64 = 70;
    pub const CONNECTED: u64 = 90;
}

fn enabled_from_state(value: u64) -> bool {
    (state::ENABLED..=state::CONNECTED).contains(&value)
}

fn registered_from_state(value: u64) -> bool {
    (state::REGISTERED..=state::CONNECTED).contains(&value)
}

fn connected_from_state(value: u64) -> bool {
    matches!(value, state::DISCONNECTING | state::CONNECTED)
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

fn lock_type_from_unlock_string(unlock: &str) -> LockType {
    match unlock {
        "" => LockType::None,
        "sim-pin" => LockType::Pin,
        "sim-puk" => LockType::Puk,
        _ => LockType::Other,
    }
}

fn access_mode(value: u64) -> AccessMode {
    match value {
        1 => AccessMode::Gsm,
        2 => AccessMode::GsmCompact,
        3 => AccessMode::Gprs,
        4 => AccessMode::Edge,
        5 => AccessMode::Umts,
        6 => AccessMode::Hsdpa,
        7 => AccessMode::Hsupa,
        8 => AccessMode::Hspa,
        _ => AccessMode::Unknown,
    }
}

fn network_availability(value: u64) -> NetworkAvailability {
    match value {
        1 => NetworkAvailability::Available,
        2 => NetworkAvailability::Current,
        3 => NetworkAvailability::Forbidden,
        _ => NetworkAvailability::Unknown,
    }
}

fn ussd_state_from_str(value: &str) -> UssdSessionState {
    match value {
        "idle" => UssdSessionState::Idle,
        "active" => UssdSessionState::Active,
        "user-response" => UssdSessionState::UserResponse,
        _ => UssdSessionState::Unknown,
    }
}

/// Parse the `a{uv}` location dictionary's 3GPP entry: a comma-separated
/// `MCC,MNC,LAC,CI` string with LAC and CI in hex.
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

/// One entry of a `Scan` reply. Every field arrives as a string; entries
/// without an availability status are dropped, the rest degrade missing
/// fields to defaults.
fn parse_network(entry: &Value) -> Option<ScannedNetwork> {
    let status = str_member(entry, "status")?.parse::<u64>().ok()?;
    let code = str_member(entry, "operator-num").map(operator_code).unwrap_or(0);
    let tech = str_member(entry, "access-tech")
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(access_mode)
        .unwrap_or(AccessMode::Gsm);
    Some(ScannedNetwork {
        availability: network_availability(status),
        access_tech: tech,
        operator_code: code,
        operator_long: str_member(entry, "operator-long").map(str::to_owned),
        operator_short: str_member(entry, "operator-short").map(str::to_owned),
    })
}

fn parse_message(entry: &Value) -> SmsMessage {
    let id = uint_member(entry, "index")
        .or_else(|| entry.get("index").and_then(Value::as_i64).map(|v| v as u64))
        .unwrap_or(0) as u32;
    let timestamp = match entry.get("timestamp") {
        Some(Value::String(raw)) => chrono::DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc)),
        Some(Value::Number(raw)) => raw
            .as_f64()
            .and_then(|secs| chrono::DateTime::from_timestamp(secs as i64, 0)),
        _ => None,
    };
    SmsMessage {
        id,
        number: str_member(entry, "number").unwrap_or("Unknown").to_owned(),
        service_number: str_member(entry, "smsc").map(str::to_owned),
        text: str_member(entry, "text").unwrap_or_default().to_owned(),
        binary: false,
        timestamp,
        read: false,
        object_path: None,
    }
}

// ─── Manager-level adapter ──────────────────────────────────────────────

pub struct LegacyBackend {
    channel: Arc<dyn RpcChannel>,
    flavor: LegacyFlavor,
    manager_sub: Option<SubscriptionId>,
}

impl LegacyBackend {
    pub fn new(channel: Arc<dyn RpcChannel>, flavor: LegacyFlavor) -> Self {
        LegacyBackend {
            channel,
            flavor,
            manager_sub: None,
        }
    }

    /// Build a device snapshot from the service's cached state.
    fn device_from_path(&self, path: &str) -> Device {
        let mut device = Device::new(path_index(path), path);

        // Descriptive info; conservative defaults when the read fails.
        match self
            .channel
            .call_sync(path, MODEM_IFACE, "GetInfo", json!([]), QUERY_TIMEOUT)
        {
            Ok(reply) => {
                let info = tuple_member(&reply, 0).cloned().unwrap_or(Value::Null);
                device.manufacturer = info
                    .get(0)
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_owned();
                device.model = info
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_owned();
                device.version = info
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_owned();
            }
            Err(err) => {
                debug!(%path, error = %err, "device info read failed");
                device.manufacturer = "Unknown".to_owned();
                device.model = "Unknown".to_owned();
                device.version = "Unknown".to_owned();
            }
        }
        device.port = self
            .channel
            .get_property(path, MODEM_IFACE, "Device")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "Unknown".to_owned());
        device.persistent_id = persistent_id(&device.manufacturer, &device.model, &device.version);

        device.device_type = match self
            .channel
            .get_property(path, MODEM_IFACE, "Type")
            .and_then(|v| v.as_u64())
        {
            Some(2) => DeviceType::Cdma,
            _ => DeviceType::Gsm,
        };

        if let Some(state) = self
            .channel
            .get_property(path, MODEM_IFACE, "State")
            .and_then(|v| v.as_u64())
        {
            device.enabled = enabled_from_state(state);
            device.registered = registered_from_state(state);
            device.connected = connected_from_state(state);
        }
        if let Some(unlock) = self
            .channel
            .get_property(path, MODEM_IFACE, "UnlockRequired")
            .and_then(|v| v.as_str().map(str::to_owned))
        {
            device.lock_type = lock_type_from_unlock_string(&unlock);
            device.blocked = device.lock_type != LockType::None;
        }
        device
    }
}

impl Backend for LegacyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Legacy
    }

    fn attach(&mut self) -> Result<(), BackendError> {
        if self.manager_sub.is_none() {
            self.manager_sub = Some(self.channel.subscribe(MANAGER_PATH, MANAGER_IFACE));
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
            MANAGER_IFACE,
            "EnumerateDevices",
            json!([]),
            QUERY_TIMEOUT,
        )?;
        let paths = tuple_member(&reply, 0)
            .and_then(Value::as_array)
            .ok_or_else(|| BackendError::Malformed("device list".into()))?;
        Ok(paths
            .iter()
            .filter_map(Value::as_str)
            .map(|path| self.device_from_path(path))
            .collect())
    }

    fn translate_discovery(&mut self, ev: &SignalEvent) -> Option<Discovery> {
        if ev.interface != MANAGER_IFACE {
            return None;
        }
        let path = tuple_member(&ev.args, 0).and_then(Value::as_str)?;
        match ev.signal.as_str() {
            "DeviceAdded" => Some(Discovery::Added(self.device_from_path(path))),
            "DeviceRemoved" => Some(Discovery::Removed(path_index(path))),
            _ => None,
        }
    }

    fn open(&mut self, device: &Device) -> Result<Box<dyn DeviceBackend>, BackendError> {
        let path = device.object_path.clone();
        let channel = self.channel.clone();
        let mut subs = Vec::new();

        // Wader answers nothing until the modem is explicitly enabled.
        if self.flavor == LegacyFlavor::Wader && !device.enabled {
            channel.call_sync(&path, MODEM_IFACE, "Enable", json!([true]), QUERY_TIMEOUT)?;
        }

        subs.push(channel.subscribe(&path, MODEM_IFACE));

        let mut caps = CapabilitySet {
            caps: Caps::SMS,
            sms: SmsCaps::RECEIVE | SmsCaps::SEND,
            ..Default::default()
        };

        match device.device_type {
            DeviceType::Gsm => {
                subs.push(channel.subscribe(&path, NETWORK_IFACE));
                subs.push(channel.subscribe_properties(&path, NETWORK_IFACE));
                subs.push(channel.subscribe(&path, SMS_IFACE));
                caps.caps |= Caps::SCAN;
                caps.scan = ScanCaps::OBSERVE;
            }
            DeviceType::Cdma => {
                subs.push(channel.subscribe(&path, CDMA_IFACE));
            }
        }

        let mut needs_polling = false;
        let mut location_enabled = false;

        match self.flavor {
            LegacyFlavor::ModemManager => {
                if device.device_type == DeviceType::Gsm {
                    caps.caps |= Caps::USSD;
                    caps.ussd = UssdCaps::SEND;
                }

                match channel.call_sync(
                    &path,
                    LOCATION_IFACE,
                    "Enable",
                    json!([true, true]),
                    QUERY_TIMEOUT,
                ) {
                    Ok(_) => {
                        subs.push(channel.subscribe_properties(&path, LOCATION_IFACE));
                        caps.caps |= Caps::LOCATION;
                        caps.location = tether_common::models::LocationCaps::GPP;
                        location_enabled = true;
                    }
                    Err(err) => debug!(%path, error = %err, "location reporting unavailable"),
                }

                // Without the time interface the service cannot confirm
                // delivery; fall back to listing on a poll and drop the
                // send capability.
                if !channel.list_interfaces(&path).contains(TIME_IFACE) {
                    debug!(%path, "time interface absent, message polling enabled");
                    needs_polling = true;
                    caps.sms.remove(SmsCaps::SEND);
                }
            }
            LegacyFlavor::Wader => {
                caps.caps |= Caps::CONTACTS;
                caps.contacts = ContactsCaps::EXPORT | ContactsCaps::EDIT;
            }
        }

        Ok(Box::new(LegacyDevice {
            channel,
            flavor: self.flavor,
            path,
            device_type: device.device_type,
            caps,
            needs_polling,
            location_enabled,
            subs,
        }))
    }
}

// ─── Per-device adapter handle ──────────────────────────────────────────

pub struct LegacyDevice {
    channel: Arc<dyn RpcChannel>,
    flavor: LegacyFlavor,
    path: String,
    device_type: DeviceType,
    caps: CapabilitySet,
    needs_polling: bool,
    location_enabled: bool,
    subs: Vec<SubscriptionId>,
}

impl DeviceBackend for LegacyDevice {
    fn capabilities(&self) -> CapabilitySet {
        self.caps
    }

    fn state_snapshot(&mut self) -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();
        if let Some(state) = self
            .channel
            .get_property(&self.path, MODEM_IFACE, "State")
            .and_then(|v| v.as_u64())
        {
            snapshot.enabled = Some(enabled_from_state(state));
            snapshot.registered = Some(registered_from_state(state));
            snapshot.connected = Some(connected_from_state(state));
        }
        if let Some(unlock) = self
            .channel
            .get_property(&self.path, MODEM_IFACE, "UnlockRequired")
            .and_then(|v| v.as_str().map(str::to_owned))
        {
            let lock = lock_type_from_unlock_string(&unlock);
            snapshot.blocked = Some(lock != LockType::None);
            snapshot.lock_type = Some(lock);
        }
        snapshot
    }

    fn translate_signal(&mut self, ev: &SignalEvent) -> Vec<Notice> {
        if ev.path != self.path {
            return Vec::new();
        }
        match (ev.interface.as_str(), ev.signal.as_str()) {
            (MODEM_IFACE, "StateChanged") => {
                // (old, new, reason); only the new state matters here
                let Some(new_state) = tuple_member(&ev.args, 1).and_then(Value::as_u64) else {
                    return Vec::new();
                };
                vec![Notice::State(StateSnapshot {
                    enabled: Some(enabled_from_state(new_state)),
                    registered: Some(registered_from_state(new_state)),
                    connected: Some(connected_from_state(new_state)),
                    ..Default::default()
                })]
            }
            (NETWORK_IFACE, "SignalQuality") => {
                match tuple_member(&ev.args, 0).and_then(Value::as_u64) {
                    Some(level) => vec![Notice::SignalLevel(level as u32)],
                    None => Vec::new(),
                }
            }
            (NETWORK_IFACE, "RegistrationInfo") => {
                // (status, operator code, operator name)
                let Some(status) = tuple_member(&ev.args, 0).and_then(Value::as_u64) else {
                    return Vec::new();
                };
                let code = tuple_member(&ev.args, 1)
                    .and_then(Value::as_str)
                    .map(operator_code)
                    .unwrap_or(0);
                let name = tuple_member(&ev.args, 2)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned);
                vec![Notice::Registration(RegistrationInfo {
                    status: registration_status(status),
                    operator_code: code,
                    operator_name: name,
                })]
            }
            (CDMA_IFACE, "RegistrationStateChanged") => {
                // (cdma1x state, evdo state); prefer whichever is known
                let first = tuple_member(&ev.args, 0)
                    .and_then(Value::as_u64)
                    .map(cdma_registration_status)
                    .unwrap_or(RegistrationStatus::Unknown);
                let status = if first == RegistrationStatus::Unknown {
                    tuple_member(&ev.args, 1)
                        .and_then(Value::as_u64)
                        .map(cdma_registration_status)
                        .unwrap_or(RegistrationStatus::Unknown)
                } else {
                    first
                };
                vec![Notice::Registration(RegistrationInfo {
                    status,
                    ..Default::default()
                })]
            }
            (SMS_IFACE, "Completed") => {
                // (index, completed); completion signals are unreliable in
                // polling mode and ignored there
                let index = tuple_member(&ev.args, 0).and_then(Value::as_u64);
                let complete = tuple_member(&ev.args, 1).and_then(Value::as_bool);
                match (index, complete) {
                    (Some(index), Some(true)) if !self.needs_polling => {
                        vec![Notice::MessageArrived {
                            message_id: index as u32,
                        }]
                    }
                    _ => Vec::new(),
                }
            }
            (NETWORK_IFACE, PROPERTIES_CHANGED) => {
                let mut notices = Vec::new();
                if let Some(tech) = uint_member(&ev.args, "AccessTechnology") {
                    notices.push(Notice::Mode(access_mode(tech)));
                }
                notices
            }
            (LOCATION_IFACE, PROPERTIES_CHANGED) => {
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
            OperationRequest::Unlock { pin } => Ok(PreparedCall::new(
                &self.path,
                CARD_IFACE,
                "SendPin",
                json!([pin]),
            )),
            OperationRequest::SendSms {
                number,
                text,
                validity,
                ..
            } => {
                let mut properties = json!({ "number": number, "text": text });
                if *validity >= 0 {
                    properties["validity"] = json!(validity);
                }
                Ok(PreparedCall::new(
                    &self.path,
                    SMS_IFACE,
                    "Send",
                    json!([properties]),
                ))
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
                NETWORK_IFACE,
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
            DeviceType::Gsm => {
                match self.channel.call_sync(
                    &self.path,
                    NETWORK_IFACE,
                    "GetRegistrationInfo",
                    json!([]),
                    QUERY_TIMEOUT,
                ) {
                    Ok(reply) => RegistrationInfo {
                        status: tuple_member(&reply, 0)
                            .and_then(Value::as_u64)
                            .map(registration_status)
                            .unwrap_or(RegistrationStatus::Unknown),
                        operator_code: tuple_member(&reply, 1)
                            .and_then(Value::as_str)
                            .map(operator_code)
                            .unwrap_or(0),
                        operator_name: tuple_member(&reply, 2)
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .map(str::to_owned),
                    },
                    Err(err) => {
                        debug!(path = %self.path, error = %err, "registration read failed");
                        RegistrationInfo::default()
                    }
                }
            }
            DeviceType::Cdma => {
                // (band class, band, system id); the system id stands in
                // for the operator code
                match self.channel.call_sync(
                    &self.path,
                    CDMA_IFACE,
                    "GetServingSystem",
                    json!([]),
                    QUERY_TIMEOUT,
                ) {
                    Ok(reply) => RegistrationInfo {
                        status: RegistrationStatus::Home,
                        operator_code: tuple_member(&reply, 2)
                            .and_then(Value::as_u64)
                            .unwrap_or(0) as u32,
                        operator_name: None,
                    },
                    Err(err) => {
                        debug!(path = %self.path, error = %err, "serving system read failed");
                        RegistrationInfo::default()
                    }
                }
            }
        }
    }

    fn read_identity(&mut self) -> IdentityInfo {
        let mut identity = IdentityInfo::default();
        match self.device_type {
            DeviceType::Gsm => {
                identity.imei = self
                    .call_for_string(CARD_IFACE, "GetImei")
                    .filter(|s| !s.is_empty());
                identity.imsi = self
                    .call_for_string(CARD_IFACE, "GetImsi")
                    .filter(|s| !s.is_empty());
            }
            DeviceType::Cdma => {
                identity.imei = self
                    .call_for_string(CDMA_IFACE, "GetEsn")
                    .filter(|s| !s.is_empty());
            }
        }
        identity
    }

    fn enable_location(&mut self) -> Option<CellLocation> {
        if !self.location_enabled {
            return None;
        }
        self.read_location()
    }

    fn ussd_state(&mut self) -> UssdSessionState {
        if !self.caps.ussd.contains(UssdCaps::SEND) {
            return UssdSessionState::Unknown;
        }
        self.channel
            .get_property(&self.path, USSD_IFACE, "State")
            .and_then(|v| v.as_str().map(ussd_state_from_str))
            .unwrap_or(UssdSessionState::Unknown)
    }

    fn cancel_ussd(&mut self) -> Result<(), BackendError> {
        self.channel
            .call_sync(&self.path, USSD_IFACE, "Cancel", json!([]), QUERY_TIMEOUT)?;
        Ok(())
    }

    fn restart_ussd(&mut self) -> bool {
        if self.flavor == LegacyFlavor::Wader {
            return false;
        }
        // Re-acquire the interface; when the service still exposes it the
        // send capability comes back.
        if self.channel.list_interfaces(&self.path).contains(USSD_IFACE) {
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
        let reply = self
            .channel
            .call_sync(&self.path, SMS_IFACE, "List", json!([]), QUERY_TIMEOUT)?;
        Ok(tuple_member(&reply, 0)
            .and_then(Value::as_array)
            .map(|entries| entries.iter().map(parse_message).collect())
            .unwrap_or_default())
    }

    fn get_message(&mut self, id: u32) -> Option<SmsMessage> {
        let reply = self
            .channel
            .call_sync(&self.path, SMS_IFACE, "Get", json!([id]), QUERY_TIMEOUT)
            .ok()?;
        tuple_member(&reply, 0).map(parse_message)
    }

    fn delete_message(&mut self, id: u32) -> Result<(), BackendError> {
        self.channel
            .call_sync(&self.path, SMS_IFACE, "Delete", json!([id]), QUERY_TIMEOUT)?;
        Ok(())
    }

    fn list_contacts(&mut self) -> Result<Vec<Contact>, BackendError> {
        if !self.caps.caps.contains(Caps::CONTACTS) {
            return Err(BackendError::NotSupported);
        }
        let reply =
            self.channel
                .call_sync(&self.path, CONTACTS_IFACE, "List", json!([]), QUERY_TIMEOUT)?;
        // Entries are (index, name, number) triples
        Ok(tuple_member(&reply, 0)
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        Some(Contact {
                            id: entry.get(0)?.as_u64()? as u32,
                            name: entry.get(1)?.as_str()?.to_owned(),
                            number: entry.get(2)?.as_str()?.to_owned(),
                            ..Default::default()
                        })
                    })
                    .collect()
            })
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
            json!([contact.name, contact.number]),
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

    fn needs_sms_polling(&self) -> bool {
        self.needs_polling
    }

    fn close(&mut self) {
        if self.location_enabled {
            let _ = self.channel.call_sync(
                &self.path,
                LOCATION_IFACE,
                "Enable",
                json!([false, false]),
                QUERY_TIMEOUT,
            );
            self.location_enabled = false;
        }
        // Unsubscribe before releasing anything else so no callback can
        // land on a dying session.
        for id in self.subs.drain(..).rev() {
            self.channel.unsubscribe(id);
        }
    }
}

impl LegacyDevice {
    fn call_for_string(&self, interface: &str, method: &str) -> Option<String> {
        match self
            .channel
            .call_sync(&self.path, interface, method, json!([]), QUERY_TIMEOUT)
        {
            Ok(reply) => tuple_member(&reply, 0)
                .and_then(Value::as_str)
                .map(str::to_owned),
            Err(err) => {
                debug!(path = %self.path, method, error = %err, "identity read failed");
                None
            }
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

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Predicate totality ─────────────────────────────────────────────

    #[test]
    fn state_predicates_are_total() {
        // Every value, including out-of-range ones, yields a defined answer
        for value in (0..=200).chain([u64::MAX]) {
            let _ = enabled_from_state(value);
            let _ = registered_from_state(value);
            let _ = connected_from_state(value);
        }
        assert!(enabled_from_state(40));
        assert!(enabled_from_state(90));
        assert!(!enabled_from_state(30));
        assert!(registered_from_state(60));
        assert!(!registered_from_state(50));
        assert!(connected_from_state(90));
        assert!(!connected_from_state(80));
    }

    #[test]
    fn registration_status_is_total() {
        for value in (0..=20).chain([u64::MAX]) {
            let _ = registration_status(value);
            let _ = cdma_registration_status(value);
        }
        assert_eq!(registration_status(1), RegistrationStatus::Home);
        assert_eq!(registration_status(5), RegistrationStatus::Roaming);
        assert_eq!(registration_status(17), RegistrationStatus::Unknown);
        assert_eq!(cdma_registration_status(2), RegistrationStatus::Home);
        assert_eq!(cdma_registration_status(0), RegistrationStatus::Unknown);
    }

    #[test]
    fn lock_type_from_strings() {
        assert_eq!(lock_type_from_unlock_string(""), LockType::None);
        assert_eq!(lock_type_from_unlock_string("sim-pin"), LockType::Pin);
        assert_eq!(lock_type_from_unlock_string("sim-puk"), LockType::Puk);
        assert_eq!(lock_type_from_unlock_string("ph-net-pin"), LockType::Other);
    }

    #[test]
    fn access_mode_is_total() {
        for value in (0..=20).chain([u64::MAX]) {
            let _ = access_mode(value);
        }
        assert_eq!(access_mode(5), AccessMode::Umts);
        assert_eq!(access_mode(8), AccessMode::Hspa);
        assert_eq!(access_mode(19), AccessMode::Unknown);
    }

    // ─── Value parsing ──────────────────────────────────────────────────

    #[test]
    fn location_reply_parses_hex_fields() {
        let reply = json!([{ "1": "250,01,139F,2A4D" }]);
        let loc = parse_location(&reply).unwrap();
        assert_eq!(loc.mcc, 250);
        assert_eq!(loc.mnc, 1);
        assert_eq!(loc.lac, 0x139F);
        assert_eq!(loc.cell_id, 0x2A4D);
    }

    #[test]
    fn location_reply_without_gpp_entry_is_absent() {
        assert_eq!(parse_location(&json!([{ "2": "nmea" }])), None);
        assert_eq!(parse_location(&json!([{}])), None);
        assert_eq!(parse_location(&json!([{ "1": "250,01" }])), None);
    }

    #[test]
    fn scan_entry_without_status_is_dropped() {
        assert!(parse_network(&json!({ "operator-num": "25001" })).is_none());
    }

    #[test]
    fn scan_entry_parses_string_fields() {
        let network = parse_network(&json!({
            "operator-num": "25001",
            "access-tech": "5",
            "operator-long": "Test Network",
            "operator-short": "TEST",
            "status": "2",
        }))
        .unwrap();
        assert_eq!(network.availability, NetworkAvailability::Current);
        assert_eq!(network.access_tech, AccessMode::Umts);
        assert_eq!(network.operator_code, (250 << 16) | 1);
        assert_eq!(network.operator_long.as_deref(), Some("Test Network"));
    }

    #[test]
    fn message_entry_degrades_missing_fields() {
        let message = parse_message(&json!({ "index": 4, "text": "hello" }));
        assert_eq!(message.id, 4);
        assert_eq!(message.number, "Unknown");
        assert_eq!(message.text, "hello");
        assert!(message.timestamp.is_none());
    }

    #[test]
    fn message_timestamp_accepts_both_shapes() {
        let iso = parse_message(&json!({
            "index": 1,
            "number": "+491701234",
            "text": "a",
            "timestamp": "2013-05-01T10:00:00+02:00",
        }));
        assert!(iso.timestamp.is_some());

        let epoch = parse_message(&json!({
            "index": 2,
            "number": "+491701234",
            "text": "b",
            "timestamp": 1367402400.0,
        }));
        assert!(epoch.timestamp.is_some());
    }

    #[test]
    fn ussd_state_strings() {
        assert_eq!(ussd_state_from_str("idle"), UssdSessionState::Idle);
        assert_eq!(ussd_state_from_str("active"), UssdSessionState::Active);
        assert_eq!(
            ussd_state_from_str("user-response"),
            UssdSessionState::UserResponse
        );
        assert_eq!(ussd_state_from_str("garbage"), UssdSessionState::Unknown);
    }
}
