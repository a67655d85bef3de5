//! # UDP Sidecar Link
//!
//! [`FlightLink`] backed by JSON datagrams exchanged with an external
//! protocol decoder process.
//!
//! ## Datagram Format
//!
//! | Direction | Content |
//! |-----------|---------|
//! | Inbound   | One cleaned record object, `mavpackettype` names the message |
//! | Inbound   | `{"mavpackettype": "MISSION_ITEMS", "items": [...]}` answers pending mission downloads |
//! | Outbound  | `{"type": "command", "command": ...}` |
//! | Outbound  | `{"type": "mission_set", "items": [...]}` |
//! | Outbound  | `{"type": "mission_request"}` |
//!
//! `GLOBAL_POSITION_INT` (degE7, millimeters) and `ATTITUDE` (radians)
//! records also refresh the [`VehicleState`] snapshot.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{CommandOutcome, FlightLink, TelemetryRecord, VehicleState};
use crate::config::LinkConfig;
use crate::error::{GatewayError, Result};

/// Largest datagram accepted from the sidecar
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Record type carrying the vehicle's mission list
const MISSION_ITEMS_TYPE: &str = "MISSION_ITEMS";

#[derive(Default)]
struct LinkState {
    vehicle: VehicleState,
    /// Downloads waiting for the next `MISSION_ITEMS` reply
    mission_waiters: Vec<oneshot::Sender<Vec<Value>>>,
    last_record: Option<Instant>,
}

struct Shared {
    state: Mutex<LinkState>,
    failed: AtomicBool,
}

/// Flight link talking to a decoder sidecar over UDP.
pub struct UdpLink {
    sender: std::net::UdpSocket,
    peer: SocketAddr,
    local_addr: SocketAddr,
    ready_timeout: Duration,
    mission_timeout: Duration,
    records: Mutex<mpsc::UnboundedReceiver<TelemetryRecord>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for UdpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpLink")
            .field("local_addr", &self.local_addr)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl UdpLink {
    /// Bind the local socket and start the background receiver.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if an address cannot be parsed or the socket cannot be bound.
    pub fn bind(config: &LinkConfig) -> Result<Self> {
        let bind: SocketAddr = config
            .bind
            .parse()
            .map_err(|e| GatewayError::Transport(format!("Invalid link bind address {}: {}", config.bind, e)))?;
        let peer: SocketAddr = config
            .peer
            .parse()
            .map_err(|e| GatewayError::Transport(format!("Invalid link peer address {}: {}", config.peer, e)))?;

        let sender = std::net::UdpSocket::bind(bind)?;
        sender.set_nonblocking(true)?;
        let local_addr = sender.local_addr()?;
        let receiver = tokio::net::UdpSocket::from_std(sender.try_clone()?)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(LinkState::default()),
            failed: AtomicBool::new(false),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(receive_loop(
            receiver,
            tx,
            Arc::clone(&shared),
            config.max_recv_errors,
        ));

        info!("Flight link listening on {} (decoder peer {})", local_addr, peer);

        Ok(Self {
            sender,
            peer,
            local_addr,
            ready_timeout: config.ready_timeout(),
            mission_timeout: config.mission_timeout(),
            records: Mutex::new(rx),
            shared,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_json(&self, value: &Value) -> bool {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode datagram for decoder: {}", e);
                return false;
            }
        };

        match self.sender.send_to(&bytes, self.peer) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to send datagram to decoder {}: {}", self.peer, e);
                false
            }
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl FlightLink for UdpLink {
    fn try_recv(&self) -> Option<TelemetryRecord> {
        let mut records = self.records.lock().ok()?;
        records.try_recv().ok()
    }

    fn send_command(&self, command: &Value) -> CommandOutcome {
        let outcome = if command.is_array() {
            CommandOutcome::List
        } else {
            CommandOutcome::Single
        };

        if self.send_json(&json!({ "type": "command", "command": command })) {
            outcome
        } else {
            CommandOutcome::Failed
        }
    }

    async fn mission_get(&self) -> Option<Vec<Value>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            state.mission_waiters.retain(|waiter| !waiter.is_closed());
            state.mission_waiters.push(tx);
        }

        if !self.send_json(&json!({ "type": "mission_request" })) {
            return None;
        }

        match tokio::time::timeout(self.mission_timeout, rx).await {
            Ok(Ok(items)) => {
                debug!("Mission download returned {} items", items.len());
                Some(items)
            }
            _ => {
                warn!("No mission reply from decoder within {:?}", self.mission_timeout);
                None
            }
        }
    }

    fn mission_set(&self, items: &[Value]) -> bool {
        self.send_json(&json!({ "type": "mission_set", "items": items }))
    }

    fn is_ready(&self) -> bool {
        if self.failed_permanently() {
            return false;
        }
        self.state()
            .last_record
            .is_some_and(|last| last.elapsed() <= self.ready_timeout)
    }

    fn failed_permanently(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    fn telemetry_snapshot(&self) -> VehicleState {
        self.state().vehicle
    }
}

async fn receive_loop(
    socket: tokio::net::UdpSocket,
    tx: mpsc::UnboundedSender<TelemetryRecord>,
    shared: Arc<Shared>,
    max_errors: u32,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut consecutive_errors = 0u32;

    loop {
        let len = match socket.recv_from(&mut buf).await {
            Ok((len, _)) => {
                consecutive_errors = 0;
                len
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!("Flight link receive error ({}/{}): {}", consecutive_errors, max_errors, e);
                if consecutive_errors >= max_errors {
                    error!("Flight link failed permanently after {} receive errors", consecutive_errors);
                    shared.failed.store(true, Ordering::Release);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let record = match parse_record(&buf[..len]) {
            Some(record) => record,
            None => continue,
        };

        let forward = {
            let mut state = shared
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.last_record = Some(Instant::now());
            apply_record(&mut state, &record)
        };

        if forward && tx.send(record).is_err() {
            debug!("Telemetry consumer dropped, stopping flight link receiver");
            return;
        }
    }
}

fn parse_record(datagram: &[u8]) -> Option<TelemetryRecord> {
    match serde_json::from_slice::<Value>(datagram) {
        Ok(Value::Object(record)) => Some(record),
        Ok(other) => {
            warn!("Ignoring non-object datagram from decoder: {}", other);
            None
        }
        Err(e) => {
            warn!("Ignoring malformed datagram from decoder: {}", e);
            None
        }
    }
}

/// Fold a record into the cached state. Returns whether it is telemetry to relay.
fn apply_record(state: &mut LinkState, record: &TelemetryRecord) -> bool {
    let field = |name: &str| record.get(name).and_then(Value::as_f64);

    match record.get("mavpackettype").and_then(Value::as_str) {
        Some("GLOBAL_POSITION_INT") => {
            if let (Some(lat), Some(lon)) = (field("lat"), field("lon")) {
                state.vehicle.lat = lat / 1e7;
                state.vehicle.lon = lon / 1e7;
            }
            if let Some(alt) = field("relative_alt") {
                state.vehicle.alt = alt / 1000.0;
            }
            true
        }
        Some("ATTITUDE") => {
            if let Some(yaw) = field("yaw") {
                state.vehicle.yaw = yaw.to_degrees();
            }
            if let Some(pitch) = field("pitch") {
                state.vehicle.pitch = pitch.to_degrees();
            }
            true
        }
        Some(MISSION_ITEMS_TYPE) => {
            if let Some(items) = record.get("items").and_then(Value::as_array) {
                for waiter in state.mission_waiters.drain(..) {
                    // Err only if that download already gave up.
                    let _ = waiter.send(items.clone());
                }
            }
            false
        }
        _ => true,
    }
}
