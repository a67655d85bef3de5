//! # Operation Supervisor
//!
//! Resolves operation names, starts instances bound to the shared output
//! sink, and keeps running instances addressable by id until they are
//! stopped.
//!
//! No instance failure propagates out of the supervisor: refusals, errors and
//! panics raised from an instance's `start` or `stop` are converted into
//! [`GatewayError`] values for the caller to report.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Operation, OperationContext, OperationFactory, OperationParams, OperationRegistry, OutputSink};
use crate::error::{GatewayError, Result};
use crate::link::FlightLink;

/// Instances by id. The lock is never held across an `await`.
#[derive(Default)]
struct Instances {
    running: HashMap<String, Box<dyn Operation>>,
    /// Ids reserved by a `start` that has not returned yet
    starting: HashSet<String>,
    /// Set by `shutdown_all`; later starts are refused
    closed: bool,
}

/// Releases a start reservation on every exit path, cancellation included.
struct Reservation<'a> {
    supervisor: &'a OperationSupervisor,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.supervisor.instances().starting.remove(&self.id);
    }
}

/// Owner of every running operation instance.
pub struct OperationSupervisor {
    registry: OperationRegistry,
    link: Arc<dyn FlightLink>,
    sink: OutputSink,
    stop_timeout: Duration,
    instances: Mutex<Instances>,
}

impl std::fmt::Debug for OperationSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationSupervisor")
            .field("registry", &self.registry)
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

impl OperationSupervisor {
    /// # Arguments
    ///
    /// * `registry` - Operation names accepted by [`start`](Self::start)
    /// * `link` - Flight link shared with every instance
    /// * `sink` - Output queue shared with every instance
    /// * `stop_timeout` - Bound on how long a single `stop` may take
    pub fn new(
        registry: OperationRegistry,
        link: Arc<dyn FlightLink>,
        sink: OutputSink,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            link,
            sink,
            stop_timeout,
            instances: Mutex::new(Instances::default()),
        }
    }

    /// Start operation `name` under `id` (generated when `None`).
    ///
    /// Returns the id the instance is registered under. The id is reserved
    /// while the instance starts, so a slow `start` blocks neither other
    /// starts nor `stop`/`shutdown_all`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UnknownOperation`] if `name` is not registered
    /// - [`GatewayError::LinkUnavailable`] if the flight link is not ready
    /// - [`GatewayError::DuplicateOperationId`] if `id` is running or starting
    /// - [`GatewayError::OperationStartFailure`] if construction or `start`
    ///   refused, failed or panicked, or the supervisor shut down meanwhile
    ///
    /// The registry is left untouched on every error.
    pub async fn start(
        &self,
        name: &str,
        params: OperationParams,
        id: Option<String>,
    ) -> Result<String> {
        let factory = self
            .registry
            .get(name)
            .ok_or_else(|| GatewayError::UnknownOperation(name.to_string()))?;

        if !self.link.is_ready() {
            warn!("Refusing to start '{}': flight link not ready", name);
            return Err(GatewayError::LinkUnavailable);
        }

        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let reservation = self.reserve(name, &id)?;

        let instance = self.launch(name, &id, factory, params).await?;

        let registered = {
            let mut instances = self.instances();
            if instances.closed {
                Err(instance)
            } else {
                instances.running.insert(id.clone(), instance);
                Ok(())
            }
        };
        drop(reservation);

        if let Err(instance) = registered {
            warn!("Operation '{}' ({}) started during shutdown, stopping it", name, id);
            if let Err(e) = self.stop_instance(&id, instance).await {
                error!("Error stopping operation {} during shutdown: {}", id, e);
            }
            return Err(shutting_down());
        }

        info!("Operation '{}' started with id {}", name, id);
        Ok(id)
    }

    /// Stop the instance registered under `id` and remove it.
    ///
    /// The instance is removed even when its `stop` fails or overruns the
    /// stop timeout; the error is still returned for reporting.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UnknownOperationId`] if nothing runs under `id`
    /// - [`GatewayError::OperationFault`] if `stop` failed, panicked or timed out
    pub async fn stop(&self, id: &str) -> Result<()> {
        let instance = self
            .instances()
            .running
            .remove(id)
            .ok_or_else(|| GatewayError::UnknownOperationId(id.to_string()))?;

        let result = self.stop_instance(id, instance).await;
        if result.is_ok() {
            info!("Operation {} stopped", id);
        }
        result
    }

    /// Stop every running instance concurrently, logging individual failures.
    ///
    /// Refuses further starts; an instance still starting is stopped as soon
    /// as its `start` returns. Takes at most about one stop timeout.
    ///
    /// Returns the number of instances that were running.
    pub async fn shutdown_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut instances = self.instances();
            instances.closed = true;
            instances.running.drain().collect()
        };
        let count = drained.len();

        let stops = drained.into_iter().map(|(id, instance)| async move {
            if let Err(e) = self.stop_instance(&id, instance).await {
                error!("Error stopping operation {} during shutdown: {}", id, e);
            }
        });
        join_all(stops).await;

        if count > 0 {
            info!("Stopped {} running operation(s)", count);
        }
        count
    }

    /// Ids of running instances, sorted
    pub async fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances().running.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.instances().running.contains_key(id)
    }

    fn instances(&self) -> MutexGuard<'_, Instances> {
        self.instances.lock().unwrap_or_else(|poisoned| {
            warn!("Operation registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn reserve(&self, name: &str, id: &str) -> Result<Reservation<'_>> {
        let mut instances = self.instances();
        if instances.closed {
            warn!("Refusing to start '{}': shutting down", name);
            return Err(shutting_down());
        }
        if instances.running.contains_key(id) || !instances.starting.insert(id.to_string()) {
            return Err(GatewayError::DuplicateOperationId(id.to_string()));
        }
        Ok(Reservation { supervisor: self, id: id.to_string() })
    }

    async fn launch(
        &self,
        name: &str,
        id: &str,
        factory: OperationFactory,
        params: OperationParams,
    ) -> Result<Box<dyn Operation>> {
        let context = OperationContext {
            link: Arc::clone(&self.link),
            sink: self.sink.clone(),
            params,
        };

        let mut instance = match std::panic::catch_unwind(AssertUnwindSafe(|| factory(context))) {
            Ok(Ok(instance)) => instance,
            Ok(Err(e)) => {
                error!("Failed to create operation '{}' ({}): {}", name, id, e);
                return Err(start_failure(e));
            }
            Err(panic) => {
                error!("Operation '{}' ({}) panicked during construction", name, id);
                return Err(GatewayError::OperationStartFailure(panic_message(panic)));
            }
        };

        match AssertUnwindSafe(instance.start()).catch_unwind().await {
            Ok(Ok(true)) => Ok(instance),
            Ok(Ok(false)) => {
                warn!("Operation '{}' ({}) refused to start", name, id);
                Err(GatewayError::OperationStartFailure(format!(
                    "Operation '{}' refused to start",
                    name
                )))
            }
            Ok(Err(e)) => {
                error!("Operation '{}' ({}) failed to start: {}", name, id, e);
                Err(start_failure(e))
            }
            Err(panic) => {
                error!("Operation '{}' ({}) panicked while starting", name, id);
                Err(GatewayError::OperationStartFailure(panic_message(panic)))
            }
        }
    }

    async fn stop_instance(&self, id: &str, mut instance: Box<dyn Operation>) -> Result<()> {
        let stopping = AssertUnwindSafe(instance.stop()).catch_unwind();

        match tokio::time::timeout(self.stop_timeout, stopping).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                error!("Operation {} failed to stop cleanly: {}", id, e);
                Err(GatewayError::OperationFault(e.to_string()))
            }
            Ok(Err(panic)) => {
                error!("Operation {} panicked while stopping", id);
                Err(GatewayError::OperationFault(panic_message(panic)))
            }
            Err(_) => {
                // No preemption: the worker is abandoned, not killed.
                error!(
                    "Operation {} did not stop within {:?}, abandoning it",
                    id, self.stop_timeout
                );
                Err(GatewayError::OperationFault(format!(
                    "Operation did not stop within {} ms",
                    self.stop_timeout.as_millis()
                )))
            }
        }
    }
}

fn shutting_down() -> GatewayError {
    GatewayError::OperationStartFailure("Supervisor is shutting down".to_string())
}

fn start_failure(e: GatewayError) -> GatewayError {
    match e {
        GatewayError::OperationStartFailure(_) => e,
        other => GatewayError::OperationStartFailure(other.to_string()),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic: {}", msg)
    } else {
        "panic with non-string payload".to_string()
    }
}
