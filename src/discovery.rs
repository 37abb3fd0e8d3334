//! Device discovery scheduling
//!
//! Discovery is a broadcast poll: the controller sends the discovery token
//! to the local network every half second and folds whatever answers into
//! its device registry. This module only owns the schedule; the broadcast
//! itself and the response parsing live with the controller, which owns the
//! telemetry channel.

use crate::error::{Error, Result};
use std::time::{Duration, Instant};

/// Interval between discovery broadcasts
const DISCOVERY_INTERVAL: Duration = Duration::from_millis(500);

/// Ports at or below this are never used for discovery
const MIN_DISCOVERY_PORT: u16 = 1024;

/// Periodic discovery broadcast schedule
#[derive(Debug, Default)]
pub struct DiscoveryService {
    port: Option<u16>,
    next_broadcast: Option<Instant>,
}

impl DiscoveryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start broadcasting to `port`; the first broadcast is due immediately
    pub fn configure(&mut self, port: u16) -> Result<()> {
        if port <= MIN_DISCOVERY_PORT {
            return Err(Error::Config(format!(
                "discovery port {} must be above {}",
                port, MIN_DISCOVERY_PORT
            )));
        }
        self.port = Some(port);
        self.next_broadcast = Some(Instant::now());
        Ok(())
    }

    /// Stop broadcasting
    pub fn stop(&mut self) {
        self.port = None;
        self.next_broadcast = None;
    }

    pub fn is_running(&self) -> bool {
        self.port.is_some()
    }

    /// Target port if a broadcast is due at `now`, scheduling the next one
    pub fn poll(&mut self, now: Instant) -> Option<u16> {
        let port = self.port?;
        let due = self.next_broadcast?;
        if now < due {
            return None;
        }
        self.next_broadcast = Some(now + DISCOVERY_INTERVAL);
        Some(port)
    }
}
