//! Transport layer for channel abstraction
//!
//! The controller core never touches sockets directly. It drives two
//! channel traits and consumes their event queues:
//!
//! - [`ControlChannel`]: reliable, ordered byte stream carrying session
//!   lifecycle commands (TCP in the real implementation)
//! - [`TelemetryChannel`]: connectionless datagrams carrying position
//!   commands and discovery traffic (UDP in the real implementation)
//!
//! Received bytes and connection-state changes are delivered as events on a
//! crossbeam channel, so all protocol decoding happens on the single thread
//! that drains the queues. Delivered control messages are always non-empty.

use crate::error::Result;
use crossbeam_channel::Receiver;
use std::net::IpAddr;

mod tcp;
mod udp;

pub mod mock;

pub use tcp::TcpControlChannel;
pub use udp::UdpTelemetryChannel;

/// Events emitted by a control channel
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// The connect attempt succeeded; the channel is open
    Connected,
    /// The connect attempt failed before the channel opened
    ConnectFailed(String),
    /// A complete inbound message (never empty)
    Message(Vec<u8>),
    /// The open channel was lost or closed by the peer
    Disconnected,
}

/// Events emitted by a telemetry channel
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// An inbound datagram, decoded as ASCII text, with its sender address
    Datagram { text: String, from: IpAddr },
}

/// Reliable, ordered byte-stream channel for session control commands
pub trait ControlChannel: Send {
    /// Begin connecting to the device's control endpoint
    ///
    /// Completion is reported asynchronously as a [`ControlEvent::Connected`]
    /// or [`ControlEvent::ConnectFailed`] event.
    fn open(&mut self, address: IpAddr, port: u16) -> Result<()>;

    /// Send one command message
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Close the channel if open (idempotent)
    fn close(&mut self);

    /// Whether the channel is currently open
    fn is_open(&self) -> bool;

    /// Event queue for this channel
    fn events(&self) -> Receiver<ControlEvent>;
}

/// Connectionless datagram channel for telemetry and discovery traffic
pub trait TelemetryChannel: Send {
    /// Local listening port
    fn local_port(&self) -> u16;

    /// Set the remote endpoint used by [`TelemetryChannel::send`]
    fn set_remote(&mut self, address: IpAddr, port: u16);

    /// Send a datagram to the configured remote endpoint
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Broadcast a datagram to the local network on `port`
    fn broadcast(&mut self, port: u16, bytes: &[u8]) -> Result<()>;

    /// Event queue for this channel
    fn events(&self) -> Receiver<TelemetryEvent>;
}
