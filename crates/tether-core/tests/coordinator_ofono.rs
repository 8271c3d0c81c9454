//! # Integration: coordinator over the telephony-daemon backend
//!
//! The daemon's defining behaviors: interfaces appearing dynamically as
//! capability negotiation completes, the four-part location
//! accumulation, delivery through the external history store, and
//! enablement through the `Online` property.

mod common;

use std::sync::{Arc, Mutex};

use serde_json::json;

use common::{drain_events, MockChannel, Reply};
use tether_common::events::CoreEvent;
use tether_common::models::{Caps, OperationKind, OperationStatus, SmsMessage};
use tether_core::backend::ofono::{self, MessageHistory, OfonoBackend};
use tether_core::config::CoreConfig;
use tether_core::coordinator::Coordinator;
use tether_core::rpc::{signal_bus, SignalEvent};

const MODEM_0: &str = "/ril_0";

/// In-memory stand-in for the delivered-message store.
#[derive(Default)]
struct FakeHistory {
    messages: Vec<SmsMessage>,
    open: bool,
}

type HistoryRef = Arc<Mutex<FakeHistory>>;

struct HistoryClient(HistoryRef);

impl MessageHistory for HistoryClient {
    fn open_device(&mut self, _object_path: &str) {
        self.0.lock().unwrap().open = true;
    }

    fn close_device(&mut self) {
        self.0.lock().unwrap().open = false;
    }

    fn messages(&mut self) -> Vec<SmsMessage> {
        self.0.lock().unwrap().messages.clone()
    }

    fn remove(&mut self, id: u32) -> bool {
        let mut store = self.0.lock().unwrap();
        let before = store.messages.len();
        store.messages.retain(|m| m.id != id);
        store.messages.len() != before
    }
}

struct Fixture {
    channel: Arc<MockChannel>,
    coordinator: Coordinator,
    events: tokio::sync::mpsc::UnboundedReceiver<CoreEvent>,
    history: HistoryRef,
}

fn fixture(online: bool, interfaces: &[&str]) -> Fixture {
    let (sink, source) = signal_bus();
    let channel = Arc::new(MockChannel::new(sink));

    let props = json!({
        "Online": online,
        "Powered": true,
        "Manufacturer": "Sierra Wireless",
        "Model": "MC7710",
        "Revision": "SWI9200X_03.05.10.02",
        "Serial": "358178040668164",
        "Interfaces": interfaces,
    });
    channel.script_default(
        ofono::MANAGER_IFACE,
        "GetModems",
        Reply::Ok(json!([[[MODEM_0, props]]])),
    );
    channel.set_property(MODEM_0, ofono::MODEM_IFACE, "Online", json!(online));
    channel.set_property(MODEM_0, ofono::MODEM_IFACE, "Powered", json!(true));
    channel.set_property(
        MODEM_0,
        ofono::MODEM_IFACE,
        "Serial",
        json!("358178040668164"),
    );
    channel.set_property(
        MODEM_0,
        ofono::MODEM_IFACE,
        "Interfaces",
        json!(interfaces),
    );

    let history: HistoryRef = Arc::new(Mutex::new(FakeHistory::default()));
    let backend = Box::new(OfonoBackend::new(
        channel.clone(),
        Arc::new(Mutex::new(HistoryClient(history.clone()))),
    ));
    let (coordinator, events) =
        Coordinator::new(channel.clone(), backend, CoreConfig::default(), source);
    Fixture {
        channel,
        coordinator,
        events,
        history,
    }
}

fn property_changed(interface: &str, name: &str, value: serde_json::Value) -> SignalEvent {
    SignalEvent::new(MODEM_0, interface, "PropertyChanged", json!([name, value]))
}

// ─── Dynamic interface discovery ────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn interfaces_grow_as_negotiation_completes() {
    let mut fx = fixture(true, &[ofono::SIM_IFACE]);
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();
    drain_events(&mut fx.events);

    // Negotiation finishes: messaging and supplementary services appear
    fx.channel.emit(property_changed(
        ofono::MODEM_IFACE,
        "Interfaces",
        json!([ofono::SIM_IFACE, ofono::MESSAGES_IFACE, ofono::USSD_IFACE]),
    ));
    fx.coordinator.step().await;

    let events = drain_events(&mut fx.events);
    let extended: Vec<Caps> = events
        .iter()
        .filter_map(|e| match e {
            CoreEvent::CapabilityExtended { capability, .. } => Some(*capability),
            _ => None,
        })
        .collect();
    assert!(extended.contains(&Caps::SMS));
    assert!(extended.contains(&Caps::USSD));

    let device = fx.coordinator.device(0).unwrap();
    assert!(device.caps.contains(Caps::SMS | Caps::USSD));

    // The same announcement again opens nothing twice
    fx.channel.emit(property_changed(
        ofono::MODEM_IFACE,
        "Interfaces",
        json!([ofono::SIM_IFACE, ofono::MESSAGES_IFACE, ofono::USSD_IFACE]),
    ));
    fx.coordinator.step().await;
    assert!(drain_events(&mut fx.events)
        .iter()
        .all(|e| !matches!(e, CoreEvent::CapabilityExtended { .. })));
}

// ─── Location accumulation ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn location_capability_fires_once_when_last_field_lands() {
    let mut fx = fixture(true, &[ofono::NETWORK_IFACE]);
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();
    drain_events(&mut fx.events);

    let fields = [
        ("MobileCountryCode", json!("250")),
        ("MobileNetworkCode", json!("01")),
        ("LocationAreaCode", json!(5023)),
    ];
    for (name, value) in fields {
        fx.channel
            .emit(property_changed(ofono::NETWORK_IFACE, name, value));
        fx.coordinator.step().await;
    }
    // Three of four fields: no location yet
    assert!(drain_events(&mut fx.events)
        .iter()
        .all(|e| !matches!(e, CoreEvent::LocationChanged { .. })));

    fx.channel.emit(property_changed(
        ofono::NETWORK_IFACE,
        "CellId",
        json!(31337),
    ));
    fx.coordinator.step().await;

    let events = drain_events(&mut fx.events);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(
                e,
                CoreEvent::CapabilityExtended { capability, .. } if *capability == Caps::LOCATION
            ))
            .count(),
        1
    );
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::LocationChanged { location, .. }
            if location.mcc == 250 && location.mnc == 1
                && location.lac == 5023 && location.cell_id == 31337
    )));

    // Later updates refresh the fix without re-advertising
    fx.channel.emit(property_changed(
        ofono::NETWORK_IFACE,
        "CellId",
        json!(31338),
    ));
    fx.coordinator.step().await;
    let events = drain_events(&mut fx.events);
    assert!(events
        .iter()
        .all(|e| !matches!(e, CoreEvent::CapabilityExtended { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, CoreEvent::LocationChanged { .. })));
}

// ─── History store ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn delivered_messages_come_from_history_store() {
    let mut fx = fixture(true, &[ofono::MESSAGES_IFACE]);
    fx.history.lock().unwrap().messages.push(SmsMessage {
        id: 11,
        number: "+79161234567".into(),
        text: "stored".into(),
        ..Default::default()
    });
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();
    assert!(fx.history.lock().unwrap().open);
    drain_events(&mut fx.events);

    let messages = fx.coordinator.list_sms(0).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, 11);

    // The daemon announces an arrival; the list is worth re-reading
    fx.channel.emit(SignalEvent::new(
        MODEM_0,
        ofono::MESSAGES_IFACE,
        "IncomingMessage",
        json!(["ping", { "Sender": "+79161234567" }]),
    ));
    fx.coordinator.step().await;
    assert!(drain_events(&mut fx.events)
        .iter()
        .any(|e| matches!(e, CoreEvent::MessageListReady { .. })));

    fx.coordinator.delete_sms(0, 11).unwrap();
    assert!(fx.coordinator.list_sms(0).unwrap().is_empty());
    assert!(fx.coordinator.delete_sms(0, 11).is_err());

    fx.coordinator.close_device(0);
    assert!(!fx.history.lock().unwrap().open);
}

// ─── Enablement through Online ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn enable_completes_through_online_flip() {
    let mut fx = fixture(false, &[ofono::SIM_IFACE]);
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();
    drain_events(&mut fx.events);

    fx.coordinator.enable(0, true).unwrap();
    let set_calls = fx.channel.calls_of("SetProperty");
    assert!(set_calls
        .iter()
        .any(|call| call.args == json!(["Online", true])));

    fx.coordinator.step().await;
    fx.channel.emit(property_changed(
        ofono::MODEM_IFACE,
        "Online",
        json!(true),
    ));
    fx.coordinator.step().await;

    let events = drain_events(&mut fx.events);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(
                e,
                CoreEvent::OperationResult {
                    kind: OperationKind::Enable,
                    status: OperationStatus::Succeeded,
                    ..
                }
            ))
            .count(),
        1
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, CoreEvent::EnabledChanged { .. })));
    assert!(fx.coordinator.device(0).unwrap().enabled);
}
