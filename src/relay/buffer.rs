//! # Flush Controller
//!
//! Bounded FIFO of cleaned telemetry records with two flush triggers:
//! the buffer reaching capacity, and an inactivity timeout since the last
//! arrival. On overflow the oldest record is evicted so the freshest
//! telemetry always survives.
//!
//! ## Usage
//!
//! ```
//! use std::time::Duration;
//! use telemetry_gateway::link::TelemetryRecord;
//! use telemetry_gateway::relay::buffer::FlushController;
//!
//! let buffer = FlushController::new(2, Duration::from_secs(1));
//! assert!(!buffer.append(TelemetryRecord::new()));
//! assert!(buffer.append(TelemetryRecord::new())); // reached capacity
//!
//! let records = buffer.drain();
//! assert_eq!(records.len(), 2);
//! assert!(buffer.is_empty());
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::link::TelemetryRecord;

struct FlushBuffer {
    records: VecDeque<TelemetryRecord>,
    last_arrival: Option<Instant>,
}

/// Size- and time-bounded telemetry buffer.
pub struct FlushController {
    capacity: usize,
    flush_timeout: Duration,
    inner: Mutex<FlushBuffer>,
}

impl std::fmt::Debug for FlushController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushController")
            .field("capacity", &self.capacity)
            .field("flush_timeout", &self.flush_timeout)
            .finish_non_exhaustive()
    }
}

impl FlushController {
    /// Create an empty buffer. A capacity of zero is raised to one.
    pub fn new(capacity: usize, flush_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            flush_timeout,
            inner: Mutex::new(FlushBuffer {
                records: VecDeque::with_capacity(capacity + 1),
                last_arrival: None,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a record, evicting the oldest one on overflow.
    ///
    /// Returns `true` when the buffer has reached capacity.
    pub fn append(&self, record: TelemetryRecord) -> bool {
        self.append_at(record, Instant::now())
    }

    /// [`append`](Self::append) with an explicit arrival time.
    pub fn append_at(&self, record: TelemetryRecord, now: Instant) -> bool {
        let mut buffer = match self.inner.lock() {
            Ok(buffer) => buffer,
            Err(_) => {
                // Already-buffered records stay intact; only this record is lost.
                error!("Telemetry buffer lock poisoned, dropping record");
                self.inner.clear_poison();
                return false;
            }
        };

        buffer.records.push_back(record);
        buffer.last_arrival = Some(now);
        while buffer.records.len() > self.capacity {
            buffer.records.pop_front();
        }

        debug!("Buffer size: {}/{}", buffer.records.len(), self.capacity);
        buffer.records.len() >= self.capacity
    }

    /// True iff the buffer holds records and nothing arrived for longer than
    /// the flush timeout.
    pub fn timed_out(&self) -> bool {
        self.timed_out_at(Instant::now())
    }

    /// [`timed_out`](Self::timed_out) evaluated at `now`.
    pub fn timed_out_at(&self, now: Instant) -> bool {
        let buffer = self.lock();
        match buffer.last_arrival {
            Some(last) if !buffer.records.is_empty() => {
                now.saturating_duration_since(last) > self.flush_timeout
            }
            _ => false,
        }
    }

    /// Take the full ordered content and clear the buffer.
    pub fn drain(&self) -> Vec<TelemetryRecord> {
        let mut buffer = self.lock();
        buffer.last_arrival = None;
        buffer.records.drain(..).collect()
    }

    /// Put records that failed to emit back in front of any newer arrivals.
    ///
    /// Capacity is still enforced, so the oldest restored records are the
    /// first to go if newer telemetry arrived in the meantime.
    pub fn restore(&self, records: Vec<TelemetryRecord>) {
        self.restore_at(records, Instant::now());
    }

    /// [`restore`](Self::restore) with an explicit clock reading.
    pub fn restore_at(&self, records: Vec<TelemetryRecord>, now: Instant) {
        if records.is_empty() {
            return;
        }

        let mut buffer = self.lock();
        for record in records.into_iter().rev() {
            buffer.records.push_front(record);
        }
        while buffer.records.len() > self.capacity {
            buffer.records.pop_front();
        }
        if buffer.last_arrival.is_none() {
            buffer.last_arrival = Some(now);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    fn lock(&self) -> MutexGuard<'_, FlushBuffer> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            self.inner.clear_poison();
            poisoned.into_inner()
        })
    }
}
