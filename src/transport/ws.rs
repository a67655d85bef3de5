//! # WebSocket Transport
//!
//! [`Transport`] over a WebSocket client session. Every frame is a JSON text
//! message `{"event": <name>, "data": <payload>}` in both directions.
//!
//! After the first successful [`connect`](Transport::connect) a background
//! task owns the read half. When the session drops it clears the write half,
//! marks the transport disconnected and retries with a backoff of 1 s
//! doubling up to 5 s until it reconnects or [`disconnect`](Transport::disconnect)
//! is called.
//!
//! An emit that fails or stalls past the emit timeout (a half-open session
//! whose peer stopped reading) is treated the same way: the session is
//! dropped and the background task reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{InboundRequest, Transport};
use crate::error::{GatewayError, Result};

/// Timeout for a single connection attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// First reconnection delay
const RECONNECT_DELAY_MIN: Duration = Duration::from_secs(1);

/// Upper bound of the reconnection backoff
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(5);

/// Default bound on a single outgoing frame
pub const EMIT_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

struct Shared {
    connected: AtomicBool,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    inbound: mpsc::UnboundedSender<InboundRequest>,
    shutdown: watch::Sender<bool>,
    /// Signalled by a failed emit so the read side abandons the session
    session_lost: Notify,
}

impl Shared {
    async fn drop_session(&self, reason: &str) {
        self.writer.lock().await.take();
        self.connected.store(false, Ordering::Release);
        self.session_lost.notify_one();
        warn!("Dropping dashboard session: {}", reason);
    }
}

/// Dashboard session over WebSocket with automatic reconnection.
pub struct WsTransport {
    url: String,
    emit_timeout: Duration,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl WsTransport {
    /// Create a disconnected transport.
    ///
    /// Inbound requests are delivered on the returned receiver.
    pub fn new(url: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<InboundRequest>) {
        let (inbound, requests) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let transport = Self {
            url: url.into(),
            emit_timeout: EMIT_TIMEOUT,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                writer: tokio::sync::Mutex::new(None),
                inbound,
                shutdown,
                session_lost: Notify::new(),
            }),
            task: Mutex::new(None),
        };

        (transport, requests)
    }

    /// Replace [`EMIT_TIMEOUT`].
    pub fn with_emit_timeout(mut self, emit_timeout: Duration) -> Self {
        self.emit_timeout = emit_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn replace_task(&self, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *task, handle)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }

        info!("Attempting dashboard connection to {}...", self.url);
        let stream = match open(&self.url).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Dashboard connection failed: {}", e);
                return false;
            }
        };

        self.shared.shutdown.send_replace(false);
        let source = attach(&self.shared, stream).await;
        info!("Dashboard connected to {}", self.url);

        let handle = tokio::spawn(connection_task(
            Arc::clone(&self.shared),
            self.url.clone(),
            source,
        ));
        if let Some(previous) = self.replace_task(Some(handle)) {
            previous.abort();
        }

        true
    }

    async fn disconnect(&self) {
        self.shared.shutdown.send_replace(true);

        if let Some(mut sink) = self.shared.writer.lock().await.take() {
            let closing = async {
                sink.send(Message::Close(None)).await?;
                sink.close().await
            };
            match tokio::time::timeout(self.emit_timeout, closing).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Close frame not delivered: {}", e),
                Err(_) => debug!("Close frame not delivered within {:?}", self.emit_timeout),
            }
        }
        self.shared.connected.store(false, Ordering::Release);

        if let Some(handle) = self.replace_task(None) {
            handle.abort();
        }

        info!("Dashboard transport disconnected");
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    async fn emit(&self, event: &str, payload: &Value) -> Result<()> {
        if !self.is_connected() {
            return Err(GatewayError::TransportUnavailable);
        }

        let frame = serde_json::to_string(&json!({ "event": event, "data": payload }))?;

        let sent = {
            let mut writer = self.shared.writer.lock().await;
            let sink = writer.as_mut().ok_or(GatewayError::TransportUnavailable)?;
            tokio::time::timeout(self.emit_timeout, sink.send(Message::Text(frame.into()))).await
        };

        let reason = match sent {
            Ok(Ok(())) => {
                debug!("Emitted '{}'", event);
                return Ok(());
            }
            Ok(Err(e)) => format!("Failed to emit '{}': {}", event, e),
            Err(_) => format!("Timed out emitting '{}' after {:?}", event, self.emit_timeout),
        };
        self.shared.drop_session(&reason).await;
        Err(GatewayError::Transport(reason))
    }
}

async fn open(url: &str) -> Result<WsStream> {
    let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| GatewayError::Transport(format!("Timed out connecting to {}", url)))?
        .map_err(|e| GatewayError::Transport(format!("Failed to connect to {}: {}", url, e)))?;
    Ok(stream)
}

/// Install the write half and return the read half.
async fn attach(shared: &Shared, stream: WsStream) -> WsSource {
    let (sink, source) = stream.split();
    *shared.writer.lock().await = Some(sink);
    shared.connected.store(true, Ordering::Release);
    source
}

async fn connection_task(shared: Arc<Shared>, url: String, mut source: WsSource) {
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        read_until_closed(&shared, &mut source, &mut shutdown).await;
        if *shutdown.borrow() {
            return;
        }

        shared.connected.store(false, Ordering::Release);
        shared.writer.lock().await.take();
        warn!("Dashboard disconnected. Attempting automatic reconnection...");

        let mut delay = RECONNECT_DELAY_MIN;
        source = loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match open(&url).await {
                Ok(stream) => {
                    let source = attach(&shared, stream).await;
                    info!("Dashboard connection re-established to {}", url);
                    break source;
                }
                Err(e) => {
                    debug!("Reconnection attempt failed: {}", e);
                    delay = (delay * 2).min(RECONNECT_DELAY_MAX);
                }
            }
        };
    }
}

async fn read_until_closed(
    shared: &Shared,
    source: &mut WsSource,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = shared.session_lost.notified() => return,
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(shared, text.as_str()),
                Some(Ok(Message::Close(_))) | None => return,
                Some(Err(e)) => {
                    warn!("Dashboard read error: {}", e);
                    return;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

fn dispatch(shared: &Shared, text: &str) {
    match parse_request(text) {
        Some(request) => {
            debug!("Received '{}'", request.event);
            if shared.inbound.send(request).is_err() {
                debug!("Request consumer dropped");
            }
        }
        None => warn!("Ignoring malformed dashboard frame: {}", text),
    }
}

fn parse_request(text: &str) -> Option<InboundRequest> {
    let mut frame: Value = serde_json::from_str(text).ok()?;
    let event = frame.get("event")?.as_str()?.to_string();
    let data = frame
        .get_mut("data")
        .map(Value::take)
        .unwrap_or(Value::Null);
    Some(InboundRequest { event, data })
}
