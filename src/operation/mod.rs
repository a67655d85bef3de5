//! # Operations Module
//!
//! Pluggable background tasks started and stopped by the dashboard.
//!
//! This module handles:
//! - The [`Operation`] start/stop contract
//! - The shared [`OutputSink`] operations report results through
//! - The name → factory [`OperationRegistry`]
//! - Supervision of running instances ([`supervisor::OperationSupervisor`])
//!
//! Built-in operation kinds:
//!
//! | Kind | Module | Reports |
//! |------|--------|---------|
//! | `color_tracker` | [`color_tracker`] | `target_detected` |
//! | `serial_listener` | [`serial_listener`] | `external_data` |

pub mod color_tracker;
pub mod serial_listener;
pub mod supervisor;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::link::FlightLink;

pub use supervisor::OperationSupervisor;

/// Operation parameters as sent by the dashboard
pub type OperationParams = Map<String, Value>;

/// One result record queued for the dashboard.
///
/// Serialized with a `type` tag, e.g.
/// `{"type": "target_detected", "operation_type": "color_tracker", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationResult {
    TargetDetected {
        operation_type: String,
        id: String,
        lat: f64,
        lon: f64,
        timestamp: f64,
    },
    ExternalData {
        operation_type: String,
        timestamp: f64,
        payload: Map<String, Value>,
    },
}

/// Multi-producer handle into the relay loop's result queue.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<OperationResult>,
}

impl OutputSink {
    /// Create a sink and the single consumer end read by the relay loop.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OperationResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a result. Returns `false` if the relay loop is gone.
    pub fn send(&self, result: OperationResult) -> bool {
        match self.tx.send(result) {
            Ok(()) => true,
            Err(_) => {
                warn!("Result dropped: relay loop no longer consuming");
                false
            }
        }
    }
}

/// Lifecycle contract of a background operation.
///
/// `start` returns `Ok(false)` for expected refusals (already running, input
/// device unavailable) and `Err` only for internal faults. `stop` must not
/// return until the background work has ceased and owned resources are
/// released.
#[async_trait]
pub trait Operation: Send {
    async fn start(&mut self) -> Result<bool>;
    async fn stop(&mut self) -> Result<()>;
}

/// Everything an operation is constructed with.
#[derive(Clone)]
pub struct OperationContext {
    pub link: Arc<dyn FlightLink>,
    pub sink: OutputSink,
    pub params: OperationParams,
}

/// Constructor registered under an operation kind
pub type OperationFactory = fn(OperationContext) -> Result<Box<dyn Operation>>;

/// Operation name → constructor table.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    factories: BTreeMap<String, OperationFactory>,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of every operation kind compiled into the gateway.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(color_tracker::KIND, color_tracker::create);
        registry.register(serial_listener::KIND, serial_listener::create);
        registry
    }

    /// Build the name table from configuration (`name = "kind"` entries).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownOperation`] for a kind that is not built in.
    pub fn from_config(operations: &BTreeMap<String, String>) -> Result<Self> {
        let builtin = Self::builtin();
        let mut registry = Self::new();
        for (name, kind) in operations {
            let factory = builtin
                .get(kind)
                .ok_or_else(|| GatewayError::UnknownOperation(kind.clone()))?;
            registry.register(name, factory);
        }
        Ok(registry)
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, factory: OperationFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn get(&self, name: &str) -> Option<OperationFactory> {
        self.factories.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

/// Deserialize typed parameters, falling back to defaults for missing fields.
pub(crate) fn parse_params<T: DeserializeOwned>(params: &OperationParams) -> Result<T> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| {
        GatewayError::OperationStartFailure(format!("Invalid operation parameters: {}", e))
    })
}

/// Wall-clock time in fractional seconds since the Unix epoch
pub(crate) fn timestamp_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}
