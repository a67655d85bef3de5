//! # Control Request Router
//!
//! Turns dashboard requests into flight-link and supervisor calls. Every
//! recognized request yields exactly one response event carrying
//! `{"success": true, ...}` or `{"success": false, "error": ...}`.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::link::{CommandOutcome, FlightLink};
use crate::operation::OperationSupervisor;
use crate::transport::{events, InboundRequest};

/// A response event queued for the relay loop
#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponse {
    pub event: &'static str,
    pub payload: Value,
}

impl ControlResponse {
    fn new(event: &'static str, payload: Value) -> Self {
        Self { event, payload }
    }

    fn failure(event: &'static str, error: impl std::fmt::Display) -> Self {
        Self::new(event, json!({ "success": false, "error": error.to_string() }))
    }
}

/// Dispatches inbound requests. Cheap to clone into per-request tasks.
#[derive(Clone)]
pub struct ControlRouter {
    link: Arc<dyn FlightLink>,
    supervisor: Arc<OperationSupervisor>,
}

impl std::fmt::Debug for ControlRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRouter")
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl ControlRouter {
    pub fn new(link: Arc<dyn FlightLink>, supervisor: Arc<OperationSupervisor>) -> Self {
        Self { link, supervisor }
    }

    /// Handle one request. Returns `None` for unrecognized events.
    pub async fn handle(&self, request: InboundRequest) -> Option<ControlResponse> {
        debug!("Control request: {}", request.event);

        let response = match request.event.as_str() {
            events::REQUEST_COMMAND => self.command(&request.data),
            events::REQUEST_MISSION_DOWNLOAD => self.mission_download().await,
            events::REQUEST_MISSION_UPLOAD => self.mission_upload(&request.data),
            events::REQUEST_START_OPERATION => self.start_operation(&request.data).await,
            events::REQUEST_STOP_OPERATION => self.stop_operation(&request.data).await,
            other => {
                warn!("Ignoring unknown request event: {}", other);
                return None;
            }
        };
        Some(response)
    }

    fn command(&self, data: &Value) -> ControlResponse {
        let event = events::RESPONSE_COMMAND;
        match self.link.send_command(data) {
            CommandOutcome::Single => ControlResponse::new(event, json!({ "success": true, "list": false })),
            CommandOutcome::List => ControlResponse::new(event, json!({ "success": true, "list": true })),
            CommandOutcome::Failed => {
                ControlResponse::failure(event, "Command processing failed on bridge/vehicle")
            }
        }
    }

    async fn mission_download(&self) -> ControlResponse {
        let event = events::RESPONSE_MISSION_DOWNLOAD;
        match self.link.mission_get().await {
            Some(items) => ControlResponse::new(event, json!({ "success": true, "items": items })),
            None => ControlResponse::failure(event, "Mission download failed on bridge/vehicle"),
        }
    }

    fn mission_upload(&self, data: &Value) -> ControlResponse {
        let event = events::RESPONSE_MISSION_UPLOAD;
        let Some(items) = data.as_array() else {
            return ControlResponse::failure(event, "Invalid data format: Expected list");
        };

        if self.link.mission_set(items) {
            info!("Uploaded mission with {} items", items.len());
            ControlResponse::new(event, json!({ "success": true }))
        } else {
            ControlResponse::failure(event, "Mission upload failed on bridge/vehicle")
        }
    }

    async fn start_operation(&self, data: &Value) -> ControlResponse {
        let event = events::RESPONSE_START_OPERATION;
        let requested_id = data.get("id").and_then(Value::as_str).map(str::to_string);

        let name = data
            .get("operation_name")
            .or_else(|| data.get("name"))
            .and_then(Value::as_str);
        let Some(name) = name else {
            return operation_failure(event, requested_id, "Missing operation_name");
        };

        let params = match data.get("params") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(params)) => params.clone(),
            Some(_) => {
                return operation_failure(event, requested_id, "Invalid data format: params must be an object");
            }
        };

        match self.supervisor.start(name, params, requested_id.clone()).await {
            Ok(id) => ControlResponse::new(event, json!({ "success": true, "id": id })),
            Err(e) => operation_failure(event, requested_id, e),
        }
    }

    async fn stop_operation(&self, data: &Value) -> ControlResponse {
        let event = events::RESPONSE_STOP_OPERATION;
        let Some(id) = data.get("id").and_then(Value::as_str) else {
            return operation_failure(event, None, "Missing operation id");
        };

        match self.supervisor.stop(id).await {
            Ok(()) => ControlResponse::new(event, json!({ "success": true, "id": id })),
            // A faulty stop still removes the instance; only the error is reported.
            Err(e) => operation_failure(event, Some(id.to_string()), e),
        }
    }
}

fn operation_failure(
    event: &'static str,
    id: Option<String>,
    error: impl std::fmt::Display,
) -> ControlResponse {
    warn!("{} failed: {}", event, error);
    ControlResponse::new(
        event,
        json!({ "success": false, "id": id, "error": error.to_string() }),
    )
}
