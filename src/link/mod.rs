//! # Flight Link Module
//!
//! Boundary to the flight-controller protocol decoder.
//!
//! The decoder itself lives outside this crate. The gateway only needs a
//! typed view of it:
//! - Non-blocking pull of already-cleaned telemetry records
//! - Command forwarding and mission download/upload
//! - Readiness and permanent-failure flags
//! - A vehicle attitude/position snapshot for perception operations

pub mod udp;

use async_trait::async_trait;
use serde_json::Value;

pub use udp::UdpLink;

/// One sanitized snapshot of vehicle state fields, keyed by field name.
pub type TelemetryRecord = serde_json::Map<String, Value>;

/// Vehicle pose sampled by perception operations.
///
/// Angles are in degrees, altitude is meters above home.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VehicleState {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub yaw: f64,
    pub pitch: f64,
}

/// Result of forwarding a command to the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// A single command was accepted
    Single,
    /// A list of commands was accepted
    List,
    /// The command could not be delivered
    Failed,
}

/// Typed view of the flight-controller link.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FlightLink: Send + Sync {
    /// Next cleaned record, or `None` when nothing is pending. Never blocks.
    fn try_recv(&self) -> Option<TelemetryRecord>;

    fn send_command(&self, command: &Value) -> CommandOutcome;

    /// Mission items freshly read from the vehicle, or `None` if they
    /// cannot be obtained in time.
    async fn mission_get(&self) -> Option<Vec<Value>>;

    fn mission_set(&self, items: &[Value]) -> bool;

    /// True when the link is live enough to serve operations.
    fn is_ready(&self) -> bool;

    /// Set once the link has given up; the relay must exit.
    fn failed_permanently(&self) -> bool;

    fn telemetry_snapshot(&self) -> VehicleState;
}
