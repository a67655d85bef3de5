//! # Dashboard Transport Module
//!
//! Persistent duplex connection to the remote dashboard.
//!
//! This module handles:
//! - Connecting and disconnecting the dashboard session
//! - Emitting named events with JSON payloads
//! - Delivering inbound named requests to the relay loop
//! - Transparent low-level reconnection (see [`ws::WsTransport`])

pub mod ws;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub use ws::WsTransport;

/// Wire event names
pub mod events {
    pub const MAVLINK_MESSAGE: &str = "mavlink_message";
    pub const OPERATION_RESULT: &str = "operation_result";

    pub const REQUEST_COMMAND: &str = "request_command";
    pub const RESPONSE_COMMAND: &str = "response_command";
    pub const REQUEST_MISSION_DOWNLOAD: &str = "request_mission_download";
    pub const RESPONSE_MISSION_DOWNLOAD: &str = "response_mission_download";
    pub const REQUEST_MISSION_UPLOAD: &str = "request_mission_upload";
    pub const RESPONSE_MISSION_UPLOAD: &str = "response_mission_upload";
    pub const REQUEST_START_OPERATION: &str = "request_start_operation";
    pub const RESPONSE_START_OPERATION: &str = "response_start_operation";
    pub const REQUEST_STOP_OPERATION: &str = "request_stop_operation";
    pub const RESPONSE_STOP_OPERATION: &str = "response_stop_operation";
}

/// A named request received from the dashboard
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    pub event: String,
    pub data: Value,
}

/// Duplex connection to the dashboard.
///
/// `emit` must only be called from one task at a time; the relay loop is the
/// single writer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the initial connection. Returns `false` on failure.
    async fn connect(&self) -> bool;

    /// Close the connection and stop reconnecting.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Send one named event.
    ///
    /// # Errors
    ///
    /// [`GatewayError::TransportUnavailable`](crate::error::GatewayError::TransportUnavailable)
    /// while disconnected, [`GatewayError::Transport`](crate::error::GatewayError::Transport)
    /// if the send itself fails.
    async fn emit(&self, event: &str, payload: &Value) -> Result<()>;
}
