//! UDP telemetry channel
//!
//! One socket carries outbound position commands (unicast to the connected
//! device), discovery broadcasts, and all inbound datagrams. A background
//! reader thread decodes each datagram as ASCII and queues it with the
//! sender address; the controller decides what it is.

use super::{TelemetryChannel, TelemetryEvent};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, trace};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Maximum expected datagram size; position reports are 27 bytes and
/// discovery records well under 100
const MAX_DATAGRAM_SIZE: usize = 512;

/// Reader poll timeout so the thread notices shutdown promptly
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// UDP implementation of the telemetry channel contract
pub struct UdpTelemetryChannel {
    socket: UdpSocket,
    local_port: u16,
    remote: Option<SocketAddr>,
    running: Arc<AtomicBool>,
    events_rx: Receiver<TelemetryEvent>,
}

impl UdpTelemetryChannel {
    /// Bind the channel to a local listening port and start receiving
    pub fn bind(local_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, local_port))?;
        socket.set_broadcast(true)?;

        let local_port = socket.local_addr()?.port();
        let running = Arc::new(AtomicBool::new(true));
        let (events_tx, events_rx) = unbounded();

        let reader = socket.try_clone()?;
        reader.set_read_timeout(Some(READ_TIMEOUT))?;
        let reader_running = Arc::clone(&running);

        std::thread::Builder::new()
            .name("telemetry-read".to_string())
            .spawn(move || Self::read_loop(reader, events_tx, reader_running))?;

        debug!("Telemetry channel listening on UDP port {}", local_port);

        Ok(Self {
            socket,
            local_port,
            remote: None,
            running,
            events_rx,
        })
    }

    fn read_loop(socket: UdpSocket, events: Sender<TelemetryEvent>, running: Arc<AtomicBool>) {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        while running.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buffer) {
                Ok((n, sender)) => {
                    let text = String::from_utf8_lossy(&buffer[..n]).into_owned();
                    trace!("Datagram from {}: {:?}", sender, text);
                    if events
                        .send(TelemetryEvent::Datagram {
                            text,
                            from: sender.ip(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    debug!("Telemetry read error: {}", e);
                    break;
                }
            }
        }
    }
}

impl Drop for UdpTelemetryChannel {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl TelemetryChannel for UdpTelemetryChannel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn set_remote(&mut self, address: IpAddr, port: u16) {
        debug!("Telemetry remote endpoint set to {}:{}", address, port);
        self.remote = Some(SocketAddr::new(address, port));
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let remote = self
            .remote
            .ok_or_else(|| Error::Transport("no telemetry remote endpoint set".to_string()))?;
        self.socket
            .send_to(bytes, remote)
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(())
    }

    fn broadcast(&mut self, port: u16, bytes: &[u8]) -> Result<()> {
        self.socket
            .send_to(bytes, (Ipv4Addr::BROADCAST, port))
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(())
    }

    fn events(&self) -> Receiver<TelemetryEvent> {
        self.events_rx.clone()
    }
}
