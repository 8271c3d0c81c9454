//! Shared types for the Tether modem mediation layer.
//!
//! This crate contains:
//! - **Data models** — the canonical device snapshot and status enums every
//!   backend is normalized into
//! - **Events** — the ordered notification stream emitted to consumers
//! - **Identity helpers** — object-path index extraction, persistent device
//!   fingerprints, operator-code assembly (decimal and UCS-2 hex forms)

pub mod events;
pub mod ids;
pub mod models;
