//! # Link Health Monitor
//!
//! Hysteresis over the transport's connected flag. Brief drops are tolerated
//! because the transport reconnects on its own; only cumulative disconnected
//! time reaching the configured ceiling is fatal.
//!
//! Sampling is throttled to `check_interval`: calls in between are no-ops, so
//! the monitor can be polled from every relay loop tick.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

/// Observable monitor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    /// Connected, or disconnected for less than the ceiling
    Healthy,
    /// Terminal: the process must exit and be restarted externally
    FatallyLost,
}

/// Tracks cumulative disconnected time of the duplex transport.
#[derive(Debug)]
pub struct LinkHealthMonitor {
    check_interval: Duration,
    max_disconnected: Duration,
    last_check: Instant,
    disconnected_for: Duration,
    state: LinkHealth,
}

impl LinkHealthMonitor {
    pub fn new(check_interval: Duration, max_disconnected: Duration) -> Self {
        Self::new_at(check_interval, max_disconnected, Instant::now())
    }

    /// Create a monitor whose first sampling window starts at `now`.
    pub fn new_at(check_interval: Duration, max_disconnected: Duration, now: Instant) -> Self {
        Self {
            check_interval,
            max_disconnected,
            last_check: now,
            disconnected_for: Duration::ZERO,
            state: LinkHealth::Healthy,
        }
    }

    /// Sample the transport state.
    pub fn check(&mut self, connected: bool) -> LinkHealth {
        self.check_at(connected, Instant::now())
    }

    /// Sample the transport state at `now`.
    ///
    /// Nothing is accounted until more than `check_interval` has passed since
    /// the previous sample. Once [`LinkHealth::FatallyLost`] is reached it is
    /// returned forever.
    pub fn check_at(&mut self, connected: bool, now: Instant) -> LinkHealth {
        if self.state == LinkHealth::FatallyLost {
            return self.state;
        }

        let elapsed = now.saturating_duration_since(self.last_check);
        if elapsed <= self.check_interval {
            return self.state;
        }
        self.last_check = now;

        if connected {
            if !self.disconnected_for.is_zero() {
                info!("Dashboard connection re-established");
            }
            self.disconnected_for = Duration::ZERO;
            return self.state;
        }

        self.disconnected_for += elapsed;
        warn!(
            "Dashboard still disconnected. Accumulated duration: {:.1}s / {:.1}s",
            self.disconnected_for.as_secs_f64(),
            self.max_disconnected.as_secs_f64()
        );

        if self.disconnected_for >= self.max_disconnected {
            error!(
                "Dashboard disconnect threshold ({:.1}s) exceeded",
                self.max_disconnected.as_secs_f64()
            );
            self.state = LinkHealth::FatallyLost;
        }

        self.state
    }

    /// Restart accounting after a fresh connection.
    pub fn reset_at(&mut self, now: Instant) {
        if self.state == LinkHealth::Healthy {
            self.disconnected_for = Duration::ZERO;
            self.last_check = now;
        }
    }

    pub fn state(&self) -> LinkHealth {
        self.state
    }

    pub fn cumulative_disconnected(&self) -> Duration {
        self.disconnected_for
    }
}
