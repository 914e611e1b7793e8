//! Agent control loop: hosts emulated PLC devices on this host and keeps
//! them in sync with the fleet server via a periodic heartbeat.
//!
//! The pure pieces of the control loop — config normalization/diffing and
//! heartbeat-response dispatch — live here so they can be unit tested
//! without a running server or open sockets. [`crate::devices`] wires them
//! to real tokio tasks.

pub mod config;
pub mod devices;
pub mod heartbeat;
pub mod signals;

pub use config::{AgentWireConfig, PlcConfig, PlcKind};
pub use heartbeat::{HeartbeatOutcome, HeartbeatRequest, HeartbeatResponse};
