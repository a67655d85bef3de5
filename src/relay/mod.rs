//! # Relay Module
//!
//! The composition root of the gateway.
//!
//! This module handles:
//! - Pulling cleaned telemetry off the flight link into the [`buffer::FlushController`]
//! - Flushing buffered telemetry to the dashboard on the size and timeout triggers
//! - Forwarding operation results, one `operation_result` event each
//! - Dispatching control requests and emitting their responses
//! - Polling the [`health::LinkHealthMonitor`] and stopping on fatal loss
//!
//! The relay loop is the only caller of [`Transport::emit`]; control requests
//! are handled on spawned tasks whose responses come back over a channel.
//! On shutdown no further requests are accepted and in-flight ones are
//! awaited before the operations are stopped.

pub mod buffer;
pub mod health;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::control::{ControlResponse, ControlRouter};
use crate::error::{GatewayError, Result};
use crate::link::FlightLink;
use crate::operation::{OperationResult, OperationSupervisor};
use crate::transport::{events, InboundRequest, Transport};

use buffer::FlushController;
use health::{LinkHealth, LinkHealthMonitor};

/// Relay loop state. Built once at startup and consumed by [`run`](Self::run).
pub struct RelayLoop {
    link: Arc<dyn FlightLink>,
    transport: Arc<dyn Transport>,
    supervisor: Arc<OperationSupervisor>,
    router: ControlRouter,
    buffer: FlushController,
    health: LinkHealthMonitor,
    results: mpsc::UnboundedReceiver<OperationResult>,
    requests: mpsc::UnboundedReceiver<InboundRequest>,
    responses_tx: mpsc::UnboundedSender<ControlResponse>,
    responses_rx: mpsc::UnboundedReceiver<ControlResponse>,
    control_tasks: JoinSet<()>,
    loop_sleep: Duration,
    /// Bound on waiting for in-flight control requests at shutdown
    drain_timeout: Duration,
}

impl std::fmt::Debug for RelayLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLoop")
            .field("buffer", &self.buffer)
            .field("health", &self.health)
            .field("loop_sleep", &self.loop_sleep)
            .finish_non_exhaustive()
    }
}

impl RelayLoop {
    /// # Arguments
    ///
    /// * `config` - Buffer, health and loop timing settings
    /// * `link` - Flight link telemetry is pulled from
    /// * `transport` - Dashboard connection, already connected
    /// * `supervisor` - Owner of running operations
    /// * `results` - Consumer end of the operations' output sink
    /// * `requests` - Inbound dashboard requests
    pub fn new(
        config: &Config,
        link: Arc<dyn FlightLink>,
        transport: Arc<dyn Transport>,
        supervisor: Arc<OperationSupervisor>,
        results: mpsc::UnboundedReceiver<OperationResult>,
        requests: mpsc::UnboundedReceiver<InboundRequest>,
    ) -> Self {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        Self {
            router: ControlRouter::new(Arc::clone(&link), Arc::clone(&supervisor)),
            link,
            transport,
            supervisor,
            buffer: FlushController::new(config.buffer.size, config.buffer.flush_timeout()),
            health: LinkHealthMonitor::new(
                config.health.check_interval(),
                config.health.max_disconnect(),
            ),
            results,
            requests,
            responses_tx,
            responses_rx,
            control_tasks: JoinSet::new(),
            loop_sleep: config.relay.loop_sleep(),
            drain_timeout: config.relay.stop_timeout(),
        }
    }

    pub fn buffer(&self) -> &FlushController {
        &self.buffer
    }

    pub fn health(&self) -> LinkHealth {
        self.health.state()
    }

    /// Run until `shutdown` resolves or a fatal condition is reached, then
    /// stop every operation and disconnect.
    ///
    /// # Errors
    ///
    /// [`GatewayError::LinkFailed`] or [`GatewayError::LinkFatallyLost`]; the
    /// process should exit and be restarted externally.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.loop_sleep);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        self.health.reset_at(Instant::now());
        info!("Relay loop running");

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Relay loop stopping: {}", e);
                        break Err(e);
                    }
                }
            }
        };

        self.shutdown().await;
        outcome
    }

    /// One relay cycle at the current time.
    pub async fn tick(&mut self) -> Result<()> {
        self.tick_at(Instant::now()).await
    }

    /// One relay cycle evaluated at `now`.
    pub async fn tick_at(&mut self, now: Instant) -> Result<()> {
        if self.link.failed_permanently() {
            error!("Flight link failed permanently");
            return Err(GatewayError::LinkFailed);
        }

        while let Some(record) = self.link.try_recv() {
            if self.buffer.append_at(record, now) {
                debug!("Buffer full, flushing");
                self.flush_at(now).await;
            }
        }

        if self.buffer.timed_out_at(now) {
            debug!("Buffer timed out, flushing");
            self.flush_at(now).await;
        }

        if self.transport.is_connected() {
            self.forward_results().await;
        }

        while let Some(joined) = self.control_tasks.try_join_next() {
            log_control_task(joined);
        }

        while let Ok(request) = self.requests.try_recv() {
            let router = self.router.clone();
            let responses = self.responses_tx.clone();
            self.control_tasks.spawn(async move {
                if let Some(response) = router.handle(request).await {
                    // Receiver lives as long as the relay loop.
                    let _ = responses.send(response);
                }
            });
        }

        self.emit_responses().await;

        if self.health.check_at(self.transport.is_connected(), now) == LinkHealth::FatallyLost {
            return Err(GatewayError::LinkFatallyLost {
                seconds: self.health.cumulative_disconnected().as_secs_f64(),
            });
        }

        Ok(())
    }

    /// Emit the buffered telemetry as one `mavlink_message`.
    ///
    /// Records stay buffered while disconnected and are put back if the
    /// emit fails. Returns `true` if the buffer was emitted.
    async fn flush_at(&self, now: Instant) -> bool {
        if !self.transport.is_connected() {
            debug!("Transport disconnected, holding {} records", self.buffer.len());
            return false;
        }

        let records = self.buffer.drain();
        if records.is_empty() {
            return true;
        }

        let payload = Value::Array(records.iter().cloned().map(Value::Object).collect());
        match self.transport.emit(events::MAVLINK_MESSAGE, &payload).await {
            Ok(()) => {
                debug!("Flushed {} records", records.len());
                true
            }
            Err(e) => {
                warn!("Telemetry flush failed, keeping {} records: {}", records.len(), e);
                self.buffer.restore_at(records, now);
                false
            }
        }
    }

    async fn emit_responses(&mut self) {
        while let Ok(response) = self.responses_rx.try_recv() {
            if let Err(e) = self.transport.emit(response.event, &response.payload).await {
                warn!("Cannot emit {}: {}", response.event, e);
            }
        }
    }

    /// Refuse new control requests and wait for in-flight ones.
    async fn drain_control_tasks(&mut self) {
        self.requests.close();
        if self.control_tasks.is_empty() {
            return;
        }

        debug!("Waiting for {} control request(s)", self.control_tasks.len());
        let tasks = &mut self.control_tasks;
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                log_control_task(joined);
            }
        })
        .await;

        if drained.is_err() {
            // Detached, not aborted: a late start is stopped by the closed supervisor.
            warn!(
                "{} control request(s) still running after {:?}",
                self.control_tasks.len(),
                self.drain_timeout
            );
            self.control_tasks.detach_all();
        }
    }

    async fn forward_results(&mut self) {
        while let Ok(result) = self.results.try_recv() {
            let payload = match serde_json::to_value(&result) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Cannot serialize operation result: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.transport.emit(events::OPERATION_RESULT, &payload).await {
                warn!("Operation result dropped: {}", e);
            }
        }
    }

    async fn shutdown(&mut self) {
        self.drain_control_tasks().await;

        let stopped = self.supervisor.shutdown_all().await;
        debug!("Shutdown stopped {} operation(s)", stopped);

        if self.transport.is_connected() {
            self.emit_responses().await;
        }

        if self.transport.is_connected() && !self.buffer.is_empty() {
            self.flush_at(Instant::now()).await;
        }

        self.transport.disconnect().await;
        info!("Relay loop stopped");
    }
}

fn log_control_task(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Control request task failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{CommandOutcome, TelemetryRecord, VehicleState};
    use crate::operation::{Operation, OperationContext, OperationRegistry, OutputSink};
    use crate::transport::mocks::MockTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLink {
        records: Mutex<VecDeque<TelemetryRecord>>,
        failed: AtomicBool,
    }

    impl FakeLink {
        fn push(&self, count: usize, first_seq: usize) {
            let mut records = self.records.lock().unwrap();
            for seq in first_seq..first_seq + count {
                let mut record = TelemetryRecord::new();
                record.insert("seq".to_string(), json!(seq));
                records.push_back(record);
            }
        }
    }

    #[async_trait]
    impl FlightLink for FakeLink {
        fn try_recv(&self) -> Option<TelemetryRecord> {
            self.records.lock().unwrap().pop_front()
        }

        fn send_command(&self, _command: &Value) -> CommandOutcome {
            CommandOutcome::Single
        }

        async fn mission_get(&self) -> Option<Vec<Value>> {
            None
        }

        fn mission_set(&self, _items: &[Value]) -> bool {
            false
        }

        fn is_ready(&self) -> bool {
            true
        }

        fn failed_permanently(&self) -> bool {
            self.failed.load(Ordering::SeqCst)
        }

        fn telemetry_snapshot(&self) -> VehicleState {
            VehicleState::default()
        }
    }

    static SLOW_STOPPED: AtomicBool = AtomicBool::new(false);

    /// Takes a while to start; records when it is stopped.
    struct SlowStart;

    #[async_trait]
    impl Operation for SlowStart {
        async fn start(&mut self) -> Result<bool> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(true)
        }

        async fn stop(&mut self) -> Result<()> {
            SLOW_STOPPED.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn create_slow(_context: OperationContext) -> Result<Box<dyn Operation>> {
        Ok(Box::new(SlowStart))
    }

    struct Harness {
        relay: RelayLoop,
        link: Arc<FakeLink>,
        supervisor: Arc<OperationSupervisor>,
        transport: MockTransport,
        sink: OutputSink,
        requests: mpsc::UnboundedSender<InboundRequest>,
    }

    fn test_config() -> Config {
        toml::from_str(
            r#"
            [server]
            [link]
            [buffer]
            size = 50
            flush_timeout_ms = 1000
            [health]
            check_interval_ms = 5000
            max_disconnect_ms = 30000
            [relay]
            [logging]
            "#,
        )
        .unwrap()
    }

    fn harness(connected: bool) -> Harness {
        harness_with(connected, OperationRegistry::new())
    }

    fn harness_with(connected: bool, registry: OperationRegistry) -> Harness {
        let link = Arc::new(FakeLink::default());
        let transport = MockTransport::new(connected);
        let (sink, results) = OutputSink::channel();
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(OperationSupervisor::new(
            registry,
            link.clone(),
            sink.clone(),
            Duration::from_millis(100),
        ));
        let relay = RelayLoop::new(
            &test_config(),
            link.clone(),
            Arc::new(transport.clone()),
            Arc::clone(&supervisor),
            results,
            requests_rx,
        );
        Harness { relay, link, supervisor, transport, sink, requests }
    }

    fn seqs(payload: &Value) -> Vec<u64> {
        payload
            .as_array()
            .unwrap()
            .iter()
            .map(|record| record["seq"].as_u64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_overflow_keeps_newest_while_disconnected() {
        let mut h = harness(false);
        h.link.push(51, 1);

        h.relay.tick_at(Instant::now()).await.unwrap();

        assert_eq!(h.relay.buffer().len(), 50);
        let records = h.relay.buffer().drain();
        assert_eq!(records.first().unwrap()["seq"], 2);
        assert_eq!(records.last().unwrap()["seq"], 51);
        assert!(h.transport.emitted().is_empty());
    }

    #[tokio::test]
    async fn test_size_trigger_flushes_in_order() {
        let mut h = harness(true);
        h.link.push(52, 0);

        h.relay.tick_at(Instant::now()).await.unwrap();

        let flushed = h.transport.emitted_named(events::MAVLINK_MESSAGE);
        assert_eq!(flushed.len(), 1);
        assert_eq!(seqs(&flushed[0]), (0..50).collect::<Vec<_>>());
        assert_eq!(h.relay.buffer().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_trigger_flushes_partial_buffer() {
        let mut h = harness(true);
        let start = Instant::now();
        h.link.push(3, 0);

        h.relay.tick_at(start).await.unwrap();
        assert!(h.transport.emitted_named(events::MAVLINK_MESSAGE).is_empty());

        h.relay.tick_at(start + Duration::from_millis(1001)).await.unwrap();
        let flushed = h.transport.emitted_named(events::MAVLINK_MESSAGE);
        assert_eq!(flushed.len(), 1);
        assert_eq!(seqs(&flushed[0]), vec![0, 1, 2]);
        assert!(h.relay.buffer().is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_records() {
        let mut h = harness(true);
        h.transport.set_emit_error(true);
        let start = Instant::now();
        h.link.push(3, 0);

        h.relay.tick_at(start).await.unwrap();
        h.relay.tick_at(start + Duration::from_millis(1001)).await.unwrap();
        assert_eq!(h.relay.buffer().len(), 3);

        h.transport.set_emit_error(false);
        h.link.push(1, 3);
        h.relay.tick_at(start + Duration::from_millis(1500)).await.unwrap();
        h.relay.tick_at(start + Duration::from_millis(2600)).await.unwrap();

        let flushed = h.transport.emitted_named(events::MAVLINK_MESSAGE);
        assert_eq!(flushed.len(), 1);
        assert_eq!(seqs(&flushed[0]), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_results_forwarded_only_while_connected() {
        let mut h = harness(false);
        h.sink.send(OperationResult::TargetDetected {
            operation_type: "color_tracker".to_string(),
            id: "t1".to_string(),
            lat: 41.0,
            lon: 29.0,
            timestamp: 1.0,
        });

        h.relay.tick_at(Instant::now()).await.unwrap();
        assert!(h.transport.emitted().is_empty());

        h.transport.set_connected(true);
        h.relay.tick_at(Instant::now()).await.unwrap();
        let results = h.transport.emitted_named(events::OPERATION_RESULT);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["type"], "target_detected");
        assert_eq!(results[0]["id"], "t1");
    }

    #[tokio::test]
    async fn test_control_request_gets_one_response() {
        let mut h = harness(true);
        h.requests
            .send(InboundRequest {
                event: events::REQUEST_STOP_OPERATION.to_string(),
                data: json!({"id": "ghost"}),
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while h.transport.emitted_named(events::RESPONSE_STOP_OPERATION).is_empty() {
            assert!(Instant::now() < deadline, "no response emitted");
            h.relay.tick().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for _ in 0..3 {
            h.relay.tick().await.unwrap();
        }

        let responses = h.transport.emitted_named(events::RESPONSE_STOP_OPERATION);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["success"], false);
        assert_eq!(responses[0]["id"], "ghost");
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_start() {
        let mut registry = OperationRegistry::new();
        registry.register("slow", create_slow);
        let mut h = harness_with(true, registry);
        let start = || InboundRequest {
            event: events::REQUEST_START_OPERATION.to_string(),
            data: json!({"operation_name": "slow", "id": "late"}),
        };

        h.requests.send(start()).unwrap();
        h.relay.tick().await.unwrap();
        h.relay.shutdown().await;

        assert!(SLOW_STOPPED.load(Ordering::SeqCst));
        assert!(h.supervisor.running_ids().await.is_empty());
        let responses = h.transport.emitted_named(events::RESPONSE_START_OPERATION);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["success"], true);
        assert!(h.requests.send(start()).is_err());
    }

    #[tokio::test]
    async fn test_brief_disconnect_stays_healthy() {
        let mut h = harness(false);
        let start = Instant::now();
        let step = Duration::from_secs(6);

        for k in 1..=4 {
            h.relay.tick_at(start + step * k).await.unwrap();
        }
        assert_eq!(h.relay.health(), LinkHealth::Healthy);

        h.transport.set_connected(true);
        h.relay.tick_at(start + step * 5).await.unwrap();
        h.transport.set_connected(false);
        for k in 6..=9 {
            h.relay.tick_at(start + step * k).await.unwrap();
        }
        assert_eq!(h.relay.health(), LinkHealth::Healthy);
    }

    #[tokio::test]
    async fn test_persistent_disconnect_is_fatal() {
        let mut h = harness(false);
        let start = Instant::now();
        let step = Duration::from_secs(6);

        for k in 1..=4 {
            h.relay.tick_at(start + step * k).await.unwrap();
        }
        match h.relay.tick_at(start + step * 5).await {
            Err(GatewayError::LinkFatallyLost { seconds }) => assert!(seconds >= 30.0),
            other => panic!("Expected LinkFatallyLost, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_link_failure_stops_loop() {
        let mut h = harness(true);
        h.link.failed.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.relay.tick_at(Instant::now()).await,
            Err(GatewayError::LinkFailed)
        ));
    }

    #[tokio::test]
    async fn test_run_flushes_and_disconnects_on_shutdown() {
        let h = harness(true);
        h.link.push(2, 0);
        let transport = h.transport.clone();

        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        h.relay.run(shutdown).await.unwrap();

        assert!(!transport.is_connected());
        let flushed = transport.emitted_named(events::MAVLINK_MESSAGE);
        assert_eq!(flushed.len(), 1);
        assert_eq!(seqs(&flushed[0]), vec![0, 1]);
    }
}
