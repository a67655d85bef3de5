//! # Serial Communication Module
//!
//! Serial access for external sensors attached to the companion computer.
//!
//! This module handles:
//! - Opening a serial port with 8N1 framing at a configurable baud rate
//! - Parsing the `key=value,key=value` line format used by attached beacons

use serde_json::{Map, Value};
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Default baud rate for attached sensors
pub const DEFAULT_BAUD_RATE: u32 = 57_600;

/// Fields parsed as floating point numbers
const NUMERIC_FIELDS: &[&str] = &["lat", "lon"];

/// Open `path` at `baud_rate` (8 data bits, no parity, 1 stop bit).
///
/// # Errors
///
/// Returns [`GatewayError::Serial`] if the device cannot be opened.
///
/// # Examples
///
/// ```no_run
/// use telemetry_gateway::serial::open_port;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let port = open_port("/dev/ttyUSB0", 57_600)?;
///     Ok(())
/// }
/// ```
pub fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
    debug!("Opening serial port {} at {} baud", path, baud_rate);

    let port = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| GatewayError::Serial(format!("Failed to open {}: {}", path, e)))?;

    Ok(port)
}

/// Parse one `key=value,key=value` line.
///
/// Returns `None` for lines without a `type` key or with an unparseable
/// `lat`/`lon`. Pairs without `=` are ignored. Values other than `lat` and
/// `lon` are kept as strings.
///
/// # Examples
///
/// ```
/// use telemetry_gateway::serial::parse_line;
///
/// let fields = parse_line("type=beacon,lat=41.5,lon=29.25,id=7").unwrap();
/// assert_eq!(fields["type"], "beacon");
/// assert_eq!(fields["lat"], 41.5);
/// assert_eq!(fields["id"], "7");
/// ```
pub fn parse_line(line: &str) -> Option<Map<String, Value>> {
    let mut fields = Map::new();

    for pair in line.trim().split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            continue;
        }

        let value = if NUMERIC_FIELDS.contains(&key) {
            let number = value.parse::<f64>().ok()?;
            Value::Number(serde_json::Number::from_f64(number)?)
        } else {
            Value::String(value.to_string())
        };
        fields.insert(key.to_string(), value);
    }

    fields.contains_key("type").then_some(fields)
}
