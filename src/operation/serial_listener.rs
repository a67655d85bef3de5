//! # Serial Listener Operation
//!
//! Forwards data from a serially attached sensor to the dashboard. Each line
//! of the form `type=beacon,lat=41.01,lon=28.97` becomes one `external_data`
//! result.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{parse_params, timestamp_now, Operation, OperationContext, OperationResult, OutputSink};
use crate::error::{GatewayError, Result};
use crate::serial::{open_port, parse_line, DEFAULT_BAUD_RATE};

/// Registry kind
pub const KIND: &str = "serial_listener";

/// Parameters accepted in `request_start_operation`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SerialListenerParams {
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUD_RATE
}

/// Running serial listener instance.
#[derive(Debug)]
pub struct SerialListener {
    params: SerialListenerParams,
    sink: OutputSink,
    stop_tx: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<u64>>,
}

/// Registry factory
pub fn create(context: OperationContext) -> Result<Box<dyn Operation>> {
    Ok(Box::new(SerialListener::new(context)?))
}

impl SerialListener {
    pub fn new(context: OperationContext) -> Result<Self> {
        let params: SerialListenerParams = parse_params(&context.params)?;
        if params.baudrate == 0 {
            return Err(GatewayError::OperationStartFailure(
                "Invalid serial_listener parameters: baudrate must be positive".to_string(),
            ));
        }
        Ok(Self {
            params,
            sink: context.sink,
            stop_tx: None,
            worker: None,
        })
    }

    pub fn params(&self) -> &SerialListenerParams {
        &self.params
    }
}

#[async_trait]
impl Operation for SerialListener {
    async fn start(&mut self) -> Result<bool> {
        if self.worker.is_some() {
            warn!("Serial listener already running on {}", self.params.port);
            return Ok(false);
        }

        let port = match open_port(&self.params.port, self.params.baudrate) {
            Ok(port) => port,
            Err(e) => {
                error!("Serial listener cannot start: {}", e);
                return Ok(false);
            }
        };
        info!(
            "Serial port {} opened at {} baud",
            self.params.port, self.params.baudrate
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let sink = self.sink.clone();
        let port_name = self.params.port.clone();
        self.stop_tx = Some(stop_tx);
        self.worker = Some(tokio::spawn(async move {
            let forwarded = listen(port, sink, stop_rx).await;
            info!("Serial port {} closed after {} lines", port_name, forwarded);
            forwarded
        }));

        Ok(true)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            // Err only if the worker already exited.
            let _ = stop_tx.send(true);
        }
        if let Some(worker) = self.worker.take() {
            worker.await.map_err(|e| {
                GatewayError::OperationFault(format!("Serial listener worker failed: {}", e))
            })?;
        }
        Ok(())
    }
}

/// Read lines from `reader` until stopped, end of stream or a read error,
/// forwarding every valid line to `sink`.
///
/// `reader` is dropped on return, releasing the underlying device. Returns
/// the number of lines forwarded.
pub async fn listen<R>(reader: R, sink: OutputSink, mut stop: watch::Receiver<bool>) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut forwarded = 0;

    loop {
        if *stop.borrow() {
            break;
        }

        line.clear();
        tokio::select! {
            _ = stop.changed() => break,
            read = reader.read_until(b'\n', &mut line) => match read {
                Ok(0) => {
                    warn!("Serial stream ended");
                    break;
                }
                Ok(_) => {
                    if forward_line(&line, &sink) {
                        forwarded += 1;
                    }
                }
                Err(e) => {
                    error!("Serial read failed: {}", e);
                    break;
                }
            },
        }
    }

    forwarded
}

fn forward_line(raw: &[u8], sink: &OutputSink) -> bool {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text.trim(),
        Err(_) => {
            warn!("Discarding serial line that is not valid UTF-8");
            return false;
        }
    };
    if text.is_empty() {
        return false;
    }
    debug!("Serial line: {}", text);

    let Some(payload) = parse_line(text) else {
        warn!("Discarding invalid serial line: {}", text);
        return false;
    };

    sink.send(OperationResult::ExternalData {
        operation_type: KIND.to_string(),
        timestamp: timestamp_now(),
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockFlightLink;
    use crate::operation::OperationParams;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn context(params: serde_json::Value) -> (OperationContext, UnboundedReceiver<OperationResult>) {
        let (sink, rx) = OutputSink::channel();
        let params: OperationParams = params.as_object().cloned().unwrap_or_default();
        let context = OperationContext {
            link: Arc::new(MockFlightLink::new()),
            sink,
            params,
        };
        (context, rx)
    }

    fn payloads(rx: &mut UnboundedReceiver<OperationResult>) -> Vec<serde_json::Map<String, serde_json::Value>> {
        let mut payloads = Vec::new();
        while let Ok(result) = rx.try_recv() {
            match result {
                OperationResult::ExternalData { operation_type, payload, .. } => {
                    assert_eq!(operation_type, KIND);
                    payloads.push(payload);
                }
                other => panic!("Unexpected result: {:?}", other),
            }
        }
        payloads
    }

    #[test]
    fn test_param_defaults() {
        let (ctx, _rx) = context(json!({}));
        let listener = SerialListener::new(ctx).unwrap();
        assert_eq!(listener.params().port, "/dev/ttyUSB0");
        assert_eq!(listener.params().baudrate, 57_600);
    }

    #[test]
    fn test_zero_baudrate_rejected() {
        let (ctx, _rx) = context(json!({"baudrate": 0}));
        assert!(matches!(
            SerialListener::new(ctx),
            Err(GatewayError::OperationStartFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_listen_forwards_valid_lines() {
        let reader = tokio_test::io::Builder::new()
            .read(b"type=beacon,lat=41.5,lon=29.25\n")
            .read(b"lat=1.0,lon=2.0\n")
            .read(b"\xff\xfe\n")
            .read(b"\r\n")
            .read(b"type=status,")
            .read(b"battery=87\n")
            .build();
        let (sink, mut rx) = OutputSink::channel();
        let (_stop_tx, stop_rx) = watch::channel(false);

        assert_eq!(listen(reader, sink, stop_rx).await, 2);

        let payloads = payloads(&mut rx);
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0]["type"], "beacon");
        assert_eq!(payloads[0]["lat"], 41.5);
        assert_eq!(payloads[1]["type"], "status");
        assert_eq!(payloads[1]["battery"], "87");
    }

    #[tokio::test]
    async fn test_listen_stops_on_read_error() {
        let reader = tokio_test::io::Builder::new()
            .read(b"type=beacon\n")
            .read_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged"))
            .build();
        let (sink, mut rx) = OutputSink::channel();
        let (_stop_tx, stop_rx) = watch::channel(false);

        assert_eq!(listen(reader, sink, stop_rx).await, 1);
        assert_eq!(payloads(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_listen_observes_stop_signal() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (sink, mut rx) = OutputSink::channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = tokio::spawn(listen(reader, sink, stop_rx));
        writer.write_all(b"type=beacon\n").await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(first.is_some());

        // Writer stays open; only the stop signal can end the loop.
        stop_tx.send(true).unwrap();
        let forwarded = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("listener did not stop")
            .unwrap();
        assert_eq!(forwarded, 1);
        drop(writer);
    }

    #[tokio::test]
    async fn test_unavailable_port_refuses_start() {
        let (ctx, _rx) = context(json!({"port": "/dev/nonexistent_serial_device_12345"}));
        let mut listener = SerialListener::new(ctx).unwrap();
        assert!(!listener.start().await.unwrap());
        listener.stop().await.unwrap();
    }
}
