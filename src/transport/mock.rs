//! Mock transports for testing
//!
//! The mocks record everything sent and expose the event sender so tests
//! can script replies, connection failures, and unsolicited disconnects.

use super::{ControlChannel, ControlEvent, TelemetryChannel, TelemetryEvent};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex;

/// Mock control channel for unit testing
#[derive(Clone)]
pub struct MockControlChannel {
    inner: Arc<Mutex<MockControlInner>>,
    events_tx: Sender<ControlEvent>,
    events_rx: Receiver<ControlEvent>,
}

struct MockControlInner {
    sent: Vec<Vec<u8>>,
    open: bool,
    opened_to: Option<(IpAddr, u16)>,
    /// When set, open() queues Connected immediately; otherwise the test
    /// scripts the outcome itself
    auto_connect: bool,
    /// When set, open() queues ConnectFailed with this message
    fail_connect: Option<String>,
}

impl MockControlChannel {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            inner: Arc::new(Mutex::new(MockControlInner {
                sent: Vec::new(),
                open: false,
                opened_to: None,
                auto_connect: true,
                fail_connect: None,
            })),
            events_tx,
            events_rx,
        }
    }

    /// Make open() report no outcome; the test pushes events itself
    pub fn manual_connect(self) -> Self {
        self.inner.lock().unwrap().auto_connect = false;
        self
    }

    /// Make open() fail with the given message
    pub fn failing_connect(self, message: &str) -> Self {
        self.inner.lock().unwrap().fail_connect = Some(message.to_string());
        self
    }

    /// Event sender handle for scripting replies from the "device"
    pub fn event_sender(&self) -> Sender<ControlEvent> {
        self.events_tx.clone()
    }

    /// All messages sent so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Command ids of all messages sent so far
    pub fn sent_command_ids(&self) -> Vec<u8> {
        self.inner.lock().unwrap().sent.iter().map(|m| m[0]).collect()
    }

    /// Endpoint the last open() targeted
    pub fn opened_to(&self) -> Option<(IpAddr, u16)> {
        self.inner.lock().unwrap().opened_to
    }

    pub fn clear_sent(&self) {
        self.inner.lock().unwrap().sent.clear();
    }
}

impl Default for MockControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel for MockControlChannel {
    fn open(&mut self, address: IpAddr, port: u16) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.opened_to = Some((address, port));
        if let Some(message) = inner.fail_connect.clone() {
            let _ = self.events_tx.send(ControlEvent::ConnectFailed(message));
        } else {
            inner.open = true;
            if inner.auto_connect {
                let _ = self.events_tx.send(ControlEvent::Connected);
            }
        }
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(Error::Transport("mock control channel is not open".to_string()));
        }
        inner.sent.push(bytes.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.inner.lock().unwrap().open = false;
    }

    fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    fn events(&self) -> Receiver<ControlEvent> {
        self.events_rx.clone()
    }
}

/// Mock telemetry channel for unit testing
#[derive(Clone)]
pub struct MockTelemetryChannel {
    inner: Arc<Mutex<MockTelemetryInner>>,
    events_tx: Sender<TelemetryEvent>,
    events_rx: Receiver<TelemetryEvent>,
}

struct MockTelemetryInner {
    local_port: u16,
    remote: Option<SocketAddr>,
    sent: Vec<Vec<u8>>,
    broadcasts: Vec<(u16, Vec<u8>)>,
}

impl MockTelemetryChannel {
    pub fn new(local_port: u16) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            inner: Arc::new(Mutex::new(MockTelemetryInner {
                local_port,
                remote: None,
                sent: Vec::new(),
                broadcasts: Vec::new(),
            })),
            events_tx,
            events_rx,
        }
    }

    /// Event sender handle for injecting inbound datagrams
    pub fn event_sender(&self) -> Sender<TelemetryEvent> {
        self.events_tx.clone()
    }

    /// Inject an inbound datagram
    pub fn inject(&self, text: &str, from: IpAddr) {
        let _ = self.events_tx.send(TelemetryEvent::Datagram {
            text: text.to_string(),
            from,
        });
    }

    /// All unicast datagrams sent so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// All broadcasts sent so far
    pub fn broadcasts(&self) -> Vec<(u16, Vec<u8>)> {
        self.inner.lock().unwrap().broadcasts.clone()
    }

    /// Remote endpoint configured by the controller, if any
    pub fn remote(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap().remote
    }

    pub fn clear_sent(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.sent.clear();
        inner.broadcasts.clear();
    }
}

impl TelemetryChannel for MockTelemetryChannel {
    fn local_port(&self) -> u16 {
        self.inner.lock().unwrap().local_port
    }

    fn set_remote(&mut self, address: IpAddr, port: u16) {
        self.inner.lock().unwrap().remote = Some(SocketAddr::new(address, port));
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.remote.is_none() {
            return Err(Error::Transport("no telemetry remote endpoint set".to_string()));
        }
        inner.sent.push(bytes.to_vec());
        Ok(())
    }

    fn broadcast(&mut self, port: u16, bytes: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .broadcasts
            .push((port, bytes.to_vec()));
        Ok(())
    }

    fn events(&self) -> Receiver<TelemetryEvent> {
        self.events_rx.clone()
    }
}
