//! Runtime configuration for the coordinator.
//!
//! Timeouts are per operation kind and independently tunable; the
//! defaults match what the supported services reliably finish within.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_common::models::OperationKind;

/// Per-operation timeout table, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutTable {
    pub enable_ms: u64,
    pub unlock_ms: u64,
    pub send_sms_ms: u64,
    pub send_ussd_ms: u64,
    pub scan_ms: u64,
}

impl Default for TimeoutTable {
    fn default() -> Self {
        TimeoutTable {
            enable_ms: 20_000,
            unlock_ms: 20_000,
            send_sms_ms: 35_000,
            send_ussd_ms: 25_000,
            scan_ms: 60_000,
        }
    }
}

impl TimeoutTable {
    /// Timeout for one operation kind. Disable shares the enable budget.
    pub fn duration(&self, kind: OperationKind) -> Duration {
        let ms = match kind {
            OperationKind::Enable | OperationKind::Disable => self.enable_ms,
            OperationKind::Unlock => self.unlock_ms,
            OperationKind::SendSms => self.send_sms_ms,
            OperationKind::SendUssd => self.send_ussd_ms,
            OperationKind::Scan => self.scan_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn set(&mut self, kind: OperationKind, timeout: Duration) {
        let ms = timeout.as_millis() as u64;
        match kind {
            OperationKind::Enable | OperationKind::Disable => self.enable_ms = ms,
            OperationKind::Unlock => self.unlock_ms = ms,
            OperationKind::SendSms => self.send_sms_ms = ms,
            OperationKind::SendUssd => self.send_ussd_ms = ms,
            OperationKind::Scan => self.scan_ms = ms,
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub timeouts: TimeoutTable,
    /// Message-list poll cadence for backends that cannot signal
    /// completed messages.
    pub sms_poll: SmsPollConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsPollConfig {
    pub interval_ms: u64,
}

impl Default for SmsPollConfig {
    fn default() -> Self {
        SmsPollConfig { interval_ms: 3_000 }
    }
}

impl CoreConfig {
    /// Parse a TOML fragment; missing fields keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}
