//! # Integration: coordinator over the object-manager backend
//!
//! Full vertical slices through coordinator → session → adapter against
//! a scripted channel: enumeration from cached state, operation
//! admission, flip attribution, timeout, cancellation and the USSD
//! session dance.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use common::{drain_events, MockChannel, Reply};
use tether_common::events::{CoreEvent, OperationResponse};
use tether_common::models::{OperationKind, OperationStatus};
use tether_core::backend::modern::{self, ModernBackend};
use tether_core::config::CoreConfig;
use tether_core::coordinator::Coordinator;
use tether_core::rpc::{signal_bus, SignalEvent};

const MODEM_0: &str = "/org/freedesktop/ModemManager1/Modem/0";
const MODEM_1: &str = "/org/freedesktop/ModemManager1/Modem/1";
const SIM_0: &str = "/org/freedesktop/ModemManager1/SIM/0";

// Modem states used below: 2 locked, 3 disabled, 8 registered.

fn managed_objects(paths: &[&str]) -> Value {
    let mut objects = serde_json::Map::new();
    for path in paths {
        objects.insert((*path).to_owned(), json!({ modern::MODEM_IFACE: {} }));
    }
    json!([objects])
}

fn setup_modem(channel: &MockChannel, path: &str, state: i64) {
    let set = |name: &str, value: Value| {
        channel.set_property(path, modern::MODEM_IFACE, name, value)
    };
    set("Manufacturer", json!("ZTE"));
    set("Model", json!("MF190"));
    set("Revision", json!("BD_MF190V1.0.0"));
    set("PrimaryPort", json!("ttyUSB2"));
    set("State", json!(state));
    set("CurrentCapabilities", json!(4u64));
    set("Sim", json!(SIM_0));
    channel.set_interfaces(path, &[modern::MODEM_IFACE, modern::USSD_IFACE]);
}

struct Fixture {
    channel: Arc<MockChannel>,
    coordinator: Coordinator,
    events: tokio::sync::mpsc::UnboundedReceiver<CoreEvent>,
}

fn fixture(paths: &[&str]) -> Fixture {
    let (sink, source) = signal_bus();
    let channel = Arc::new(MockChannel::new(sink));
    channel.script_default(
        modern::OBJECT_MANAGER_IFACE,
        "GetManagedObjects",
        Reply::Ok(managed_objects(paths)),
    );
    let backend = Box::new(ModernBackend::new(channel.clone()));
    let (coordinator, events) =
        Coordinator::new(channel.clone(), backend, CoreConfig::default(), source);
    Fixture {
        channel,
        coordinator,
        events,
    }
}

fn state_changed(path: &str, old: i64, new: i64) -> SignalEvent {
    SignalEvent::new(
        path,
        modern::MODEM_IFACE,
        "StateChanged",
        json!([old, new, 0]),
    )
}

// ─── Enumeration ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn enumerate_reflects_cached_state() {
    let mut fx = fixture(&[MODEM_0, MODEM_1]);
    setup_modem(&fx.channel, MODEM_0, 8);
    setup_modem(&fx.channel, MODEM_1, 2);
    fx.channel
        .set_property(MODEM_1, modern::MODEM_IFACE, "UnlockRequired", json!(2u64));

    fx.coordinator.start().unwrap();

    let added = drain_events(&mut fx.events)
        .into_iter()
        .filter(|e| matches!(e, CoreEvent::DeviceAdded { .. }))
        .count();
    assert_eq!(added, 2);

    let mut devices = fx.coordinator.devices();
    devices.sort_by_key(|d| d.id);
    assert_eq!(devices.len(), 2);

    // State 8: registered, hence enabled, not blocked
    assert!(devices[0].enabled);
    assert!(devices[0].registered);
    assert!(!devices[0].blocked);
    // State 2: locked, neither enabled nor registered
    assert!(!devices[1].enabled);
    assert!(!devices[1].registered);
    assert!(devices[1].blocked);
    assert_eq!(
        devices[1].lock_type,
        tether_common::models::LockType::Pin
    );
}

// ─── Admission ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn enable_on_enabled_device_fails_without_rpc() {
    let mut fx = fixture(&[MODEM_0]);
    setup_modem(&fx.channel, MODEM_0, 8);
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();

    assert!(fx.coordinator.enable(0, true).is_err());
    assert!(fx.channel.calls_of("Enable").is_empty());
    // Synchronous rejection: no event reaches the consumer
    assert!(drain_events(&mut fx.events)
        .iter()
        .all(|e| !matches!(e, CoreEvent::OperationResult { .. })));
}

#[tokio::test(start_paused = true)]
async fn operations_on_unknown_device_are_rejected() {
    let mut fx = fixture(&[]);
    fx.coordinator.start().unwrap();
    assert!(fx.coordinator.enable(9, true).is_err());
    assert!(fx.coordinator.send_sms(9, "110", "hi", -1, false).is_err());
    assert!(fx.coordinator.scan_networks(9).is_err());
}

// ─── Flip attribution ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn enable_completes_through_state_flip() {
    let mut fx = fixture(&[MODEM_0]);
    setup_modem(&fx.channel, MODEM_0, 3);
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();
    drain_events(&mut fx.events);

    fx.coordinator.enable(0, true).unwrap();
    assert_eq!(
        fx.coordinator.current_operation(0),
        Some(OperationKind::Enable)
    );
    // The acknowledgement only defers to the flip
    fx.coordinator.step().await;
    assert_eq!(
        fx.coordinator.current_operation(0),
        Some(OperationKind::Enable)
    );

    fx.channel.emit(state_changed(MODEM_0, 3, 6));
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
    assert_eq!(fx.coordinator.current_operation(0), None);
    assert!(fx.coordinator.device(0).unwrap().enabled);
}

#[tokio::test(start_paused = true)]
async fn unsolicited_flip_emits_change_event() {
    let mut fx = fixture(&[MODEM_0]);
    setup_modem(&fx.channel, MODEM_0, 3);
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();
    drain_events(&mut fx.events);

    fx.channel.emit(state_changed(MODEM_0, 3, 6));
    fx.coordinator.step().await;

    let events = drain_events(&mut fx.events);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, CoreEvent::EnabledChanged { enabled: true, .. }))
            .count(),
        1
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, CoreEvent::OperationResult { .. })));
}

// ─── Timeout and cancellation ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sms_send_timeout_reports_failure_and_cleans_up() {
    let mut fx = fixture(&[MODEM_0]);
    setup_modem(&fx.channel, MODEM_0, 8);
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();
    drain_events(&mut fx.events);

    fx.channel.script(
        modern::MESSAGING_IFACE,
        "Create",
        Reply::Ok(json!(["/org/freedesktop/ModemManager1/SMS/4"])),
    );
    fx.channel.script(modern::SMS_IFACE, "Send", Reply::Hang);

    fx.coordinator
        .send_sms(0, "+4917012345678", "hello", -1, false)
        .unwrap();
    // The hung call resolves through the channel-enforced timeout
    fx.coordinator.step().await;

    let events = drain_events(&mut fx.events);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::OperationResult {
            kind: OperationKind::SendSms,
            status: OperationStatus::Failed,
            ..
        }
    )));
    assert_eq!(fx.coordinator.current_operation(0), None);
    assert!(fx
        .coordinator
        .last_error(0)
        .is_some_and(|msg| !msg.is_empty()));
    // The created message object is removed from storage either way
    let deletes = fx.channel.calls_of("Delete");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].path, MODEM_0);
    assert_eq!(
        deletes[0].args,
        json!(["/org/freedesktop/ModemManager1/SMS/4"])
    );
}

#[tokio::test(start_paused = true)]
async fn remote_error_reports_failure_with_last_error() {
    let mut fx = fixture(&[MODEM_0]);
    setup_modem(&fx.channel, MODEM_0, 3);
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();
    drain_events(&mut fx.events);

    fx.channel.script(
        modern::MODEM_IFACE,
        "Enable",
        Reply::Err(tether_core::rpc::RpcError::remote(
            "org.freedesktop.ModemManager1.Error.Core.Failed",
            "modem not responding",
        )),
    );
    fx.coordinator.enable(0, true).unwrap();
    fx.coordinator.step().await;

    let events = drain_events(&mut fx.events);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::OperationResult {
            kind: OperationKind::Enable,
            status: OperationStatus::Failed,
            ..
        }
    )));
    assert!(fx
        .coordinator
        .last_error(0)
        .is_some_and(|msg| msg.contains("modem not responding")));
    // Device state is left unchanged by a transport failure
    assert!(!fx.coordinator.device(0).unwrap().enabled);
    assert_eq!(fx.coordinator.current_operation(0), None);
}

#[tokio::test(start_paused = true)]
async fn cancellation_reports_distinct_outcome() {
    let mut fx = fixture(&[MODEM_0]);
    setup_modem(&fx.channel, MODEM_0, 8);
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();
    drain_events(&mut fx.events);

    fx.channel.script(modern::NET3GPP_IFACE, "Scan", Reply::Hang);
    fx.coordinator.scan_networks(0).unwrap();
    assert!(fx.coordinator.interrupt(0));
    fx.coordinator.step().await;

    let events = drain_events(&mut fx.events);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::OperationResult {
            kind: OperationKind::Scan,
            status: OperationStatus::Cancelled,
            ..
        }
    )));
    assert_eq!(fx.coordinator.current_operation(0), None);
    // Caller-initiated abort is not a transport failure
    assert!(fx.coordinator.last_error(0).is_none());
}

// ─── USSD session dance ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn fresh_request_during_user_response_cancels_then_initiates() {
    let mut fx = fixture(&[MODEM_0]);
    setup_modem(&fx.channel, MODEM_0, 8);
    // Session waiting for a menu answer
    fx.channel
        .set_property(MODEM_0, modern::USSD_IFACE, "State", json!(3u64));
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();
    drain_events(&mut fx.events);

    fx.channel
        .script(modern::USSD_IFACE, "Initiate", Reply::Ok(json!(["Balance: 42"])));
    fx.coordinator.send_ussd(0, "*100#").unwrap();
    fx.coordinator.step().await;

    let methods: Vec<String> = fx
        .channel
        .calls()
        .into_iter()
        .filter(|call| call.interface == modern::USSD_IFACE)
        .map(|call| call.method)
        .collect();
    assert_eq!(methods, vec!["Cancel".to_owned(), "Initiate".to_owned()]);

    let events = drain_events(&mut fx.events);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::OperationResult {
            kind: OperationKind::SendUssd,
            status: OperationStatus::Succeeded,
            response: Some(OperationResponse::UssdReply(answer)),
            ..
        } if answer == "Balance: 42"
    )));
}

#[tokio::test(start_paused = true)]
async fn ussd_timeout_restarts_interface_and_fails() {
    let mut fx = fixture(&[MODEM_0]);
    setup_modem(&fx.channel, MODEM_0, 8);
    fx.channel
        .set_property(MODEM_0, modern::USSD_IFACE, "State", json!(1u64));
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();
    drain_events(&mut fx.events);

    fx.channel.script(modern::USSD_IFACE, "Initiate", Reply::Hang);
    fx.coordinator.send_ussd(0, "*100#").unwrap();
    fx.coordinator.step().await;

    let events = drain_events(&mut fx.events);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::OperationResult {
            kind: OperationKind::SendUssd,
            status: OperationStatus::Failed,
            ..
        }
    )));
    assert!(fx.coordinator.last_error(0).is_some());
    // The interface survives the restart; a second request goes through
    fx.channel
        .script(modern::USSD_IFACE, "Initiate", Reply::Ok(json!(["ok"])));
    fx.coordinator.send_ussd(0, "*100#").unwrap();
    fx.coordinator.step().await;
    assert!(drain_events(&mut fx.events).iter().any(|e| matches!(
        e,
        CoreEvent::OperationResult {
            status: OperationStatus::Succeeded,
            ..
        }
    )));
}

// ─── Scan payload ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn scan_returns_parsed_networks() {
    let mut fx = fixture(&[MODEM_0]);
    setup_modem(&fx.channel, MODEM_0, 8);
    fx.coordinator.start().unwrap();
    fx.coordinator.open_device(0).unwrap();
    drain_events(&mut fx.events);

    fx.channel.script(
        modern::NET3GPP_IFACE,
        "Scan",
        Reply::Ok(json!([[
            {
                "operator-code": "25001",
                "access-technology": (1u64 << 5),
                "operator-long": "Mobile TeleSystems",
                "operator-short": "MTS",
                "status": 2,
            },
            // No availability status: dropped
            { "operator-code": "25002" },
        ]])),
    );
    fx.coordinator.scan_networks(0).unwrap();
    fx.coordinator.step().await;

    let events = drain_events(&mut fx.events);
    let networks = events
        .iter()
        .find_map(|e| match e {
            CoreEvent::OperationResult {
                response: Some(OperationResponse::Networks(networks)),
                ..
            } => Some(networks.clone()),
            _ => None,
        })
        .expect("scan result event");
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0].operator_code, (250 << 16) | 1);
}
