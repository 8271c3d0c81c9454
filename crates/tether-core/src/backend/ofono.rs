//! oFono ≥ 1.9 adapter.
//!
//! Sub-interfaces appear dynamically as the daemon finishes capability
//! negotiation: the modem's `Interfaces` property grows, and the adapter
//! must re-probe and lazily open interfaces on every change, not only at
//! device-open. Two further quirks shape this adapter:
//!
//! - 3GPP cell location arrives as four independent property updates
//!   (country code, network code, area code, cell id) that are
//!   accumulated behind a bitmask; the composite location only becomes
//!   available, exactly once, when the last field lands.
//! - The daemon does not retain delivered messages, so listing is served
//!   from a persistent external history store instead of live queries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use tether_common::events::OperationResponse;
use tether_common::ids::persistent_id;
use tether_common::models::{
    AccessMode, Caps, CellLocation, Contact, Device, DeviceType, LockType, NetworkAvailability,
    OperationKind, RegistrationStatus, ScanCaps, ScannedNetwork, SmsCaps, SmsMessage, UssdCaps,
    UssdSessionState,
};

use super::{
    Backend, BackendError, BackendKind, CapabilitySet, Completion, DeviceBackend, Discovery,
    IdentityInfo, Notice, OperationRequest, RegistrationInfo, StateSnapshot, UssdCommand,
};
use crate::rpc::{
    tuple_member, PreparedCall, RpcChannel, RpcError, SignalEvent, SubscriptionId,
};

pub const MANAGER_PATH: &str = "/";
pub const MANAGER_IFACE: &str = "org.ofono.Manager";
pub const MODEM_IFACE: &str = "org.ofono.Modem";
pub const NETWORK_IFACE: &str = "org.ofono.NetworkRegistration";
pub const CDMA_NETWORK_IFACE: &str = "org.ofono.cdma.NetworkRegistration";
pub const SIM_IFACE: &str = "org.ofono.SimManager";
pub const MESSAGES_IFACE: &str = "org.ofono.MessageManager";
pub const CDMA_MESSAGES_IFACE: &str = "org.ofono.cdma.MessageManager";
pub const USSD_IFACE: &str = "org.ofono.SupplementaryServices";
pub const CONNECTION_IFACE: &str = "org.ofono.ConnectionManager";

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Property-changed signal name on every oFono interface.
const PROPERTY_CHANGED: &str = "PropertyChanged";

// ─── History store ──────────────────────────────────────────────────────

/// Persistent store of delivered messages, filled by an external
/// collaborator watching the daemon. The daemon itself forgets a message
/// once delivered, so listing and deletion go through this store.
pub trait MessageHistory: Send {
    fn open_device(&mut self, object_path: &str);
    fn close_device(&mut self);
    fn messages(&mut self) -> Vec<SmsMessage>;
    /// Remove one stored message; false when the id is unknown.
    fn remove(&mut self, id: u32) -> bool;
}

/// Shared handle to the history store.
pub type HistoryHandle = Arc<Mutex<dyn MessageHistory>>;

// ─── Status translation ─────────────────────────────────────────────────

fn registration_status(value: &str) -> RegistrationStatus {
    match value {
        "unregistered" => RegistrationStatus::Idle,
        "registered" => RegistrationStatus::Home,
        "searching" => RegistrationStatus::Searching,
        "denied" => RegistrationStatus::Denied,
        "roaming" => RegistrationStatus::Roaming,
        _ => RegistrationStatus::Unknown,
    }
}

fn access_mode(value: &str) -> AccessMode {
    match value {
        "gsm" => AccessMode::Gsm,
        "gprs" => AccessMode::Gprs,
        "edge" => AccessMode::Edge,
        "umts" => AccessMode::Umts,
        "hsdpa" => AccessMode::Hsdpa,
        "hsupa" => AccessMode::Hsupa,
        "hspa" => AccessMode::Hspa,
        "lte" => AccessMode::Lte,
        _ => AccessMode::Unknown,
    }
}

fn network_availability(value: &str) -> NetworkAvailability {
    match value {
        "available" => NetworkAvailability::Available,
        "current" => NetworkAvailability::Current,
        "forbidden" => NetworkAvailability::Forbidden,
        _ => NetworkAvailability::Unknown,
    }
}

fn lock_type_from_pin_required(value: &str) -> LockType {
    match value {
        "none" => LockType::None,
        "pin" => LockType::Pin,
        "puk" => LockType::Puk,
        _ => LockType::Other,
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

/// Numeric index from paths shaped like `/ril_0` or `/hfp_1`: trailing
/// decimal digits of the last segment, 0 when there are none.
fn modem_index(object_path: &str) -> u32 {
    let segment = object_path.rsplit('/').next().unwrap_or("");
    let digits: String = segment
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(0)
}

// Location accumulation bits; the composite fix exists once all four
// sub-fields have arrived.
const LOC_MCC: u8 = 0x01;
const LOC_MNC: u8 = 0x02;
const LOC_LAC: u8 = 0x04;
const LOC_CID: u8 = 0x08;
const LOC_ALL: u8 = 0x0f;

/// One `(name, value)` pair from a `PropertyChanged` signal.
fn property_pair(args: &Value) -> Option<(&str, &Value)> {
    let name = tuple_member(args, 0)?.as_str()?;
    let value = tuple_member(args, 1)?;
    Some((name, value))
}

/// One entry of a `Scan` reply: an `(object path, properties)` pair.
/// Entries without an availability status are dropped.
fn parse_operator(entry: &Value) -> Option<ScannedNetwork> {
    let props = tuple_member(entry, 1)?;
    let status = props.get("Status")?.as_str()?;
    let name = props.get("Name").and_then(Value::as_str).map(str::to_owned);
    let mcc = props
        .get("MobileCountryCode")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    let mnc = props
        .get("MobileNetworkCode")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    let tech = props
        .get("Technologies")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .and_then(Value::as_str)
        .map(access_mode)
        .unwrap_or(AccessMode::Unknown);
    Some(ScannedNetwork {
        availability: network_availability(status),
        access_tech: tech,
        operator_code: ((mcc & 0xffff) << 16) | (mnc & 0xffff),
        operator_long: name.clone(),
        operator_short: name,
    })
}

// ─── Manager-level adapter ──────────────────────────────────────────────

pub struct OfonoBackend {
    channel: Arc<dyn RpcChannel>,
    history: HistoryHandle,
    manager_sub: Option<SubscriptionId>,
}

impl OfonoBackend {
    pub fn new(channel: Arc<dyn RpcChannel>, history: HistoryHandle) -> Self {
        OfonoBackend {
            channel,
            history,
            manager_sub: None,
        }
    }

    fn device_from_properties(&self, path: &str, props: &Value) -> Device {
        let mut device = Device::new(modem_index(path), path);
        let string_prop = |name: &str| {
            props
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or("Unknown")
                .to_owned()
        };
        device.manufacturer = string_prop("Manufacturer");
        device.model = string_prop("Model");
        device.version = string_prop("Revision");
        device.port = string_prop("Serial");
        device.persistent_id = persistent_id(&device.manufacturer, &device.model, &device.version);
        device.enabled = props
            .get("Online")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        device.prepared = props
            .get("Powered")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if let Some(interfaces) = props.get("Interfaces").and_then(Value::as_array) {
            if interfaces
                .iter()
                .filter_map(Value::as_str)
                .any(|name| name.starts_with("org.ofono.cdma"))
            {
                device.device_type = DeviceType::Cdma;
            }
        }
        device
    }

    fn device_from_path(&self, path: &str) -> Device {
        let props = self
            .channel
            .call_sync(path, MODEM_IFACE, "GetProperties", json!([]), QUERY_TIMEOUT)
            .ok()
            .and_then(|reply| tuple_member(&reply, 0).cloned())
            .unwrap_or(Value::Null);
        self.device_from_properties(path, &props)
    }
}

impl Backend for OfonoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ofono
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
            "GetModems",
            json!([]),
            QUERY_TIMEOUT,
        )?;
        let entries = tuple_member(&reply, 0)
            .and_then(Value::as_array)
            .ok_or_else(|| BackendError::Malformed("modem list".into()))?;
        Ok(entries
            .iter()
            .filter_map(|entry| {
                let path = tuple_member(entry, 0)?.as_str()?;
                let props = tuple_member(entry, 1)?;
                Some(self.device_from_properties(path, props))
            })
            .collect())
    }

    fn translate_discovery(&mut self, ev: &SignalEvent) -> Option<Discovery> {
        if ev.interface != MANAGER_IFACE {
            return None;
        }
        let path = tuple_member(&ev.args, 0).and_then(Value::as_str)?;
        match ev.signal.as_str() {
            "ModemAdded" => {
                let props = tuple_member(&ev.args, 1).cloned().unwrap_or(Value::Null);
                Some(Discovery::Added(self.device_from_properties(path, &props)))
            }
            "ModemRemoved" => Some(Discovery::Removed(modem_index(path))),
            _ => None,
        }
    }

    fn open(&mut self, device: &Device) -> Result<Box<dyn DeviceBackend>, BackendError> {
        let path = device.object_path.clone();
        let channel = self.channel.clone();

        // The modem must be powered before capability negotiation starts.
        if !device.prepared {
            channel.call_sync(
                &path,
                MODEM_IFACE,
                "SetProperty",
                json!(["Powered", true]),
                QUERY_TIMEOUT,
            )?;
        }

        let modem_sub = channel.subscribe(&path, MODEM_IFACE);

        self.history.lock().unwrap().open_device(&path);

        let mut handle = OfonoDevice {
            channel,
            history: self.history.clone(),
            path,
            device_type: device.device_type,
            caps: CapabilitySet::default(),
            modem_sub: Some(modem_sub),
            open_ifaces: HashMap::new(),
            reg: RegistrationInfo::default(),
            location: CellLocation::default(),
            location_mask: 0,
        };

        // Whatever negotiation already finished is open from the start;
        // the rest arrives through Interfaces property changes.
        let interfaces: Vec<String> = handle
            .channel
            .get_property(&handle.path, MODEM_IFACE, "Interfaces")
            .and_then(|v| {
                v.as_array().map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
            })
            .unwrap_or_default();
        handle.probe_interfaces(&interfaces);

        Ok(Box::new(handle))
    }
}

// ─── Per-device adapter handle ──────────────────────────────────────────

pub struct OfonoDevice {
    channel: Arc<dyn RpcChannel>,
    history: HistoryHandle,
    path: String,
    device_type: DeviceType,
    caps: CapabilitySet,
    modem_sub: Option<SubscriptionId>,
    /// Interfaces opened so far; opening is guarded and idempotent.
    open_ifaces: HashMap<String, SubscriptionId>,
    /// Accumulated registration details, updated one property at a time.
    reg: RegistrationInfo,
    location: CellLocation,
    location_mask: u8,
}

impl OfonoDevice {
    /// Open every known interface in `names` that is not open yet. The
    /// capability set only grows; each growth yields one notice.
    fn probe_interfaces(&mut self, names: &[String]) -> Vec<Notice> {
        let mut notices = Vec::new();
        for name in names {
            if self.open_ifaces.contains_key(name) {
                continue;
            }
            let grown = match name.as_str() {
                NETWORK_IFACE | CDMA_NETWORK_IFACE => {
                    self.caps.caps |= Caps::SCAN;
                    self.caps.scan = ScanCaps::OBSERVE;
                    Some(Caps::SCAN)
                }
                MESSAGES_IFACE | CDMA_MESSAGES_IFACE => {
                    self.caps.caps |= Caps::SMS;
                    self.caps.sms = SmsCaps::RECEIVE | SmsCaps::SEND;
                    Some(Caps::SMS)
                }
                USSD_IFACE => {
                    self.caps.caps |= Caps::USSD;
                    self.caps.ussd = UssdCaps::SEND;
                    Some(Caps::USSD)
                }
                SIM_IFACE | CONNECTION_IFACE => None,
                _ => continue,
            };
            let sub = self.channel.subscribe(&self.path, name);
            self.open_ifaces.insert(name.clone(), sub);
            debug!(path = %self.path, interface = %name, "interface opened");
            if let Some(capability) = grown {
                notices.push(Notice::CapabilityExtended(capability));
            }
        }
        notices
    }

    /// Fold one network-registration property into the accumulated
    /// registration details and location mask.
    fn network_property(&mut self, name: &str, value: &Value) -> Vec<Notice> {
        match name {
            "Strength" => value
                .as_u64()
                .map(|level| vec![Notice::SignalLevel(level as u32)])
                .unwrap_or_default(),
            "Status" => {
                let Some(raw) = value.as_str() else {
                    return Vec::new();
                };
                self.reg.status = registration_status(raw);
                vec![Notice::Registration(self.reg.clone())]
            }
            "Name" => {
                let Some(raw) = value.as_str() else {
                    return Vec::new();
                };
                if raw.is_empty() {
                    return Vec::new();
                }
                self.reg.operator_name = Some(raw.to_owned());
                vec![Notice::Registration(self.reg.clone())]
            }
            "Technology" => value
                .as_str()
                .map(|raw| vec![Notice::Mode(access_mode(raw))])
                .unwrap_or_default(),
            "MobileCountryCode" => {
                let Some(mcc) = value.as_str().and_then(|s| s.parse::<u32>().ok()) else {
                    return Vec::new();
                };
                self.reg.operator_code =
                    (self.reg.operator_code & 0xffff) | ((mcc & 0xffff) << 16);
                self.location.mcc = mcc;
                let mut notices = self.location_bit(LOC_MCC);
                if self.location_mask & LOC_MNC != 0 {
                    notices.push(Notice::Registration(self.reg.clone()));
                }
                notices
            }
            "MobileNetworkCode" => {
                let Some(mnc) = value.as_str().and_then(|s| s.parse::<u32>().ok()) else {
                    return Vec::new();
                };
                self.reg.operator_code =
                    (self.reg.operator_code & 0xffff_0000) | (mnc & 0xffff);
                self.location.mnc = mnc;
                let mut notices = self.location_bit(LOC_MNC);
                if self.location_mask & LOC_MCC != 0 {
                    notices.push(Notice::Registration(self.reg.clone()));
                }
                notices
            }
            "LocationAreaCode" => {
                let Some(lac) = value.as_u64() else {
                    return Vec::new();
                };
                self.location.lac = lac as u32;
                self.location_bit(LOC_LAC)
            }
            "CellId" => {
                let Some(cell_id) = value.as_u64() else {
                    return Vec::new();
                };
                self.location.cell_id = cell_id as u32;
                self.location_bit(LOC_CID)
            }
            _ => Vec::new(),
        }
    }

    /// Record one location sub-field. The capability-extended notice
    /// fires exactly once, on the transition where the mask completes;
    /// afterwards each update yields only a location notice.
    fn location_bit(&mut self, bit: u8) -> Vec<Notice> {
        let before = self.location_mask;
        self.location_mask |= bit;
        if self.location_mask != LOC_ALL {
            return Vec::new();
        }
        let mut notices = Vec::new();
        if before != LOC_ALL {
            self.caps.caps |= Caps::LOCATION;
            self.caps.location = tether_common::models::LocationCaps::GPP;
            notices.push(Notice::CapabilityExtended(Caps::LOCATION));
        }
        notices.push(Notice::Location(self.location));
        notices
    }
}

impl DeviceBackend for OfonoDevice {
    fn capabilities(&self) -> CapabilitySet {
        self.caps
    }

    fn state_snapshot(&mut self) -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();
        let prop = |iface: &str, name: &str| self.channel.get_property(&self.path, iface, name);
        if let Some(online) = prop(MODEM_IFACE, "Online").and_then(|v| v.as_bool()) {
            snapshot.enabled = Some(online);
        }
        if let Some(powered) = prop(MODEM_IFACE, "Powered").and_then(|v| v.as_bool()) {
            snapshot.prepared = Some(powered);
        }
        if let Some(required) = prop(SIM_IFACE, "PinRequired").and_then(|v| {
            v.as_str().map(lock_type_from_pin_required)
        }) {
            snapshot.blocked = Some(required != LockType::None);
            snapshot.lock_type = Some(required);
        }
        if let Some(status) = prop(NETWORK_IFACE, "Status")
            .and_then(|v| v.as_str().map(registration_status))
        {
            snapshot.registered = Some(status.is_registered());
        }
        snapshot
    }

    fn translate_signal(&mut self, ev: &SignalEvent) -> Vec<Notice> {
        if ev.path != self.path {
            return Vec::new();
        }
        // Delivered messages land in the external history store; the
        // signal only says the list is worth re-reading.
        if matches!(
            ev.interface.as_str(),
            MESSAGES_IFACE | CDMA_MESSAGES_IFACE
        ) && matches!(ev.signal.as_str(), "IncomingMessage" | "ImmediateMessage")
        {
            return vec![Notice::MessageListChanged];
        }
        if ev.signal != PROPERTY_CHANGED {
            return Vec::new();
        }
        let Some((name, boxed)) = property_pair(&ev.args) else {
            return Vec::new();
        };
        let value = boxed.clone();
        match ev.interface.as_str() {
            MODEM_IFACE => match name {
                "Online" => value
                    .as_bool()
                    .map(|online| {
                        vec![Notice::State(StateSnapshot {
                            enabled: Some(online),
                            ..Default::default()
                        })]
                    })
                    .unwrap_or_default(),
                "Powered" => value
                    .as_bool()
                    .map(|powered| {
                        vec![Notice::State(StateSnapshot {
                            prepared: Some(powered),
                            ..Default::default()
                        })]
                    })
                    .unwrap_or_default(),
                "Interfaces" => {
                    let names: Vec<String> = value
                        .as_array()
                        .map(|list| {
                            list.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_owned)
                                .collect()
                        })
                        .unwrap_or_default();
                    self.probe_interfaces(&names)
                }
                _ => Vec::new(),
            },
            SIM_IFACE => match name {
                "PinRequired" => value
                    .as_str()
                    .map(|raw| {
                        let lock = lock_type_from_pin_required(raw);
                        vec![Notice::State(StateSnapshot {
                            blocked: Some(lock != LockType::None),
                            lock_type: Some(lock),
                            ..Default::default()
                        })]
                    })
                    .unwrap_or_default(),
                _ => Vec::new(),
            },
            NETWORK_IFACE | CDMA_NETWORK_IFACE => self.network_property(name, &value),
            CONNECTION_IFACE => match name {
                "Attached" => value
                    .as_bool()
                    .map(|attached| {
                        vec![Notice::State(StateSnapshot {
                            connected: Some(attached),
                            ..Default::default()
                        })]
                    })
                    .unwrap_or_default(),
                _ => Vec::new(),
            },
            MESSAGES_IFACE | CDMA_MESSAGES_IFACE => Vec::new(),
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
                "SetProperty",
                json!(["Online", on]),
            )),
            OperationRequest::Unlock { pin } => Ok(PreparedCall::new(
                &self.path,
                SIM_IFACE,
                "EnterPin",
                json!(["pin", pin]),
            )),
            OperationRequest::SendSms { number, text, .. } => Ok(PreparedCall::new(
                &self.path,
                self.messages_iface(),
                "SendMessage",
                json!([number, text]),
            )),
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
                self.network_iface(),
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
                // Initiate answers (type, value); Respond answers a bare
                // string.
                let answer = if reply.as_array().map(|a| a.len()).unwrap_or(0) >= 2 {
                    tuple_member(reply, 1).and_then(Value::as_str)
                } else {
                    tuple_member(reply, 0).and_then(Value::as_str)
                };
                Ok(Completion::Done(Some(OperationResponse::UssdReply(
                    answer.unwrap_or_default().to_owned(),
                ))))
            }
            OperationKind::Scan => {
                let networks = tuple_member(reply, 0)
                    .and_then(Value::as_array)
                    .map(|entries| entries.iter().filter_map(parse_operator).collect())
                    .unwrap_or_default();
                Ok(Completion::Done(Some(OperationResponse::Networks(networks))))
            }
        }
    }

    fn read_registration_info(&mut self) -> RegistrationInfo {
        match self.channel.call_sync(
            &self.path,
            self.network_iface(),
            "GetProperties",
            json!([]),
            QUERY_TIMEOUT,
        ) {
            Ok(reply) => {
                let props = tuple_member(&reply, 0).cloned().unwrap_or(Value::Null);
                let status = props
                    .get("Status")
                    .and_then(Value::as_str)
                    .map(registration_status)
                    .unwrap_or(RegistrationStatus::Unknown);
                let mcc = props
                    .get("MobileCountryCode")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<u32>().ok())
                    .unwrap_or(0);
                let mnc = props
                    .get("MobileNetworkCode")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<u32>().ok())
                    .unwrap_or(0);
                self.reg = RegistrationInfo {
                    status,
                    operator_code: ((mcc & 0xffff) << 16) | (mnc & 0xffff),
                    operator_name: props
                        .get("Name")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned),
                };
                self.reg.clone()
            }
            Err(err) => {
                debug!(path = %self.path, error = %err, "registration read failed");
                self.reg.clone()
            }
        }
    }

    fn read_identity(&mut self) -> IdentityInfo {
        IdentityInfo {
            imei: self
                .channel
                .get_property(&self.path, MODEM_IFACE, "Serial")
                .and_then(|v| v.as_str().map(str::to_owned))
                .filter(|s| !s.is_empty()),
            imsi: self
                .channel
                .get_property(&self.path, SIM_IFACE, "SubscriberIdentity")
                .and_then(|v| v.as_str().map(str::to_owned))
                .filter(|s| !s.is_empty()),
        }
    }

    fn enable_location(&mut self) -> Option<CellLocation> {
        // Location data flows in by itself through property updates;
        // nothing to switch on. The fix exists once the mask is full.
        (self.location_mask == LOC_ALL).then_some(self.location)
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
        if let Some(sub) = self.open_ifaces.remove(USSD_IFACE) {
            self.channel.unsubscribe(sub);
        }
        let present = self
            .channel
            .get_property(&self.path, MODEM_IFACE, "Interfaces")
            .and_then(|v| {
                v.as_array().map(|list| {
                    list.iter().any(|name| name.as_str() == Some(USSD_IFACE))
                })
            })
            .unwrap_or(false);
        if present {
            let sub = self.channel.subscribe(&self.path, USSD_IFACE);
            self.open_ifaces.insert(USSD_IFACE.to_owned(), sub);
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
        Ok(self.history.lock().unwrap().messages())
    }

    fn get_message(&mut self, id: u32) -> Option<SmsMessage> {
        self.history
            .lock()
            .unwrap()
            .messages()
            .into_iter()
            .find(|message| message.id == id)
    }

    fn delete_message(&mut self, id: u32) -> Result<(), BackendError> {
        if self.history.lock().unwrap().remove(id) {
            Ok(())
        } else {
            Err(BackendError::Malformed(format!("unknown message {id}")))
        }
    }

    fn list_contacts(&mut self) -> Result<Vec<Contact>, BackendError> {
        // The phonebook only exports a vCard blob, handled by the
        // address-book importer outside this layer.
        Err(BackendError::NotSupported)
    }

    fn add_contact(&mut self, _contact: &Contact) -> Result<u32, BackendError> {
        Err(BackendError::NotSupported)
    }

    fn delete_contact(&mut self, _id: u32) -> Result<(), BackendError> {
        Err(BackendError::NotSupported)
    }

    fn close(&mut self) {
        self.history.lock().unwrap().close_device();
        for (_, sub) in self.open_ifaces.drain() {
            self.channel.unsubscribe(sub);
        }
        if let Some(sub) = self.modem_sub.take() {
            self.channel.unsubscribe(sub);
        }
    }
}

impl OfonoDevice {
    fn messages_iface(&self) -> &'static str {
        match self.device_type {
            DeviceType::Gsm => MESSAGES_IFACE,
            DeviceType::Cdma => CDMA_MESSAGES_IFACE,
        }
    }

    fn network_iface(&self) -> &'static str {
        match self.device_type {
            DeviceType::Gsm => NETWORK_IFACE,
            DeviceType::Cdma => CDMA_NETWORK_IFACE,
        }
    }
}
