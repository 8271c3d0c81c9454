//! Per-device single-flight guard for mutating operations.
//!
//! Every mutating call on a device goes through its slot: at most one
//! operation is in flight, each gets a fresh cancellation token, and the
//! slot returns to idle exactly once per begun operation. Timers live in
//! the RPC channel — the slot only holds the token the channel observes.

use tether_common::models::OperationKind;
use tokio_util::sync::CancellationToken;

/// Why an operation was refused admission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("operation {0} already in flight")]
    Busy(OperationKind),
    #[error("device is not enabled")]
    NotEnabled,
    #[error("device already in requested power state")]
    AlreadyInState,
    #[error("device is not locked with a PIN")]
    NotPinLocked,
    #[error("device does not support {0}")]
    Unsupported(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no session for device {0}")]
    NoSession(u32),
}

/// Single-flight admission control for one device.
#[derive(Debug)]
pub struct OperationSlot {
    current: Option<OperationKind>,
    token: CancellationToken,
}

impl OperationSlot {
    pub fn new() -> Self {
        OperationSlot {
            current: None,
            token: CancellationToken::new(),
        }
    }

    /// The operation in flight, if any.
    pub fn current(&self) -> Option<OperationKind> {
        self.current
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Admit `kind`, installing a fresh cancellation token so a stale
    /// cancel from an aborted call cannot disturb this one. Returns the
    /// token the pending call must observe.
    pub fn begin(&mut self, kind: OperationKind) -> Result<CancellationToken, AdmissionError> {
        if let Some(active) = self.current {
            return Err(AdmissionError::Busy(active));
        }
        self.current = Some(kind);
        self.token = CancellationToken::new();
        Ok(self.token.clone())
    }

    /// Return to idle. True when an operation was actually active;
    /// a second completion for the same operation is a no-op.
    pub fn complete(&mut self) -> bool {
        self.current.take().is_some()
    }

    /// Signal the in-flight call's token. Returns whether a cancellation
    /// was delivered; cancelling an idle slot is a no-op, not an error.
    pub fn cancel(&mut self) -> bool {
        if self.current.is_some() {
            self.token.cancel();
            true
        } else {
            false
        }
    }

    /// The token of the current operation.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Default for OperationSlot {
    fn default() -> Self {
        Self::new()
    }
}
