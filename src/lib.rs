//! # Telemetry Gateway Library
//!
//! Relays flight-controller telemetry to a remote dashboard and supervises
//! onboard sensor-processing operations whose results travel back over the
//! same connection.
//!
//! This library provides the relay loop and its parts: the telemetry flush
//! buffer, the connection health monitor, the operation supervisor, and the
//! target acquisition engine used by perception operations.

pub mod config;
pub mod control;
pub mod error;
pub mod link;
pub mod logging;
pub mod operation;
pub mod relay;
pub mod serial;
pub mod tracking;
pub mod transport;
