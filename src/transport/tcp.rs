//! TCP control channel
//!
//! Connecting and reading happen on named background threads; results are
//! delivered to the controller thread through the event queue. A generation
//! counter ties each thread to the `open()` call that spawned it, so events
//! from a connection that was closed or superseded are discarded instead of
//! reaching the controller.

use super::{ControlChannel, ControlEvent};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Read buffer size; control replies are far smaller than this, so one read
/// always yields one complete message
const READ_BUFFER_SIZE: usize = 1024;

/// OS-level connect timeout; the controller's own 10 s round-trip timeout
/// fires first, this only bounds the connector thread's lifetime
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

struct Shared {
    stream: Option<TcpStream>,
    generation: u64,
}

/// TCP implementation of the control channel contract
pub struct TcpControlChannel {
    shared: Arc<Mutex<Shared>>,
    events_tx: Sender<ControlEvent>,
    events_rx: Receiver<ControlEvent>,
}

impl TcpControlChannel {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            shared: Arc::new(Mutex::new(Shared {
                stream: None,
                generation: 0,
            })),
            events_tx,
            events_rx,
        }
    }

    /// Reader loop: one read yields one control message
    fn read_loop(
        mut stream: TcpStream,
        shared: Arc<Mutex<Shared>>,
        events: Sender<ControlEvent>,
        generation: u64,
    ) {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            match stream.read(&mut buffer) {
                Ok(0) => {
                    debug!("Control channel closed by peer");
                    break;
                }
                Ok(n) => {
                    trace!("Control message received ({} bytes)", n);
                    if events.send(ControlEvent::Message(buffer[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Control channel read error: {}", e);
                    break;
                }
            }
        }

        // Only the reader belonging to the current connection may report the
        // loss; a reader outliving a close() stays silent
        let mut shared = shared.lock();
        if shared.generation == generation {
            shared.stream = None;
            shared.generation += 1;
            drop(shared);
            let _ = events.send(ControlEvent::Disconnected);
        }
    }
}

impl Default for TcpControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel for TcpControlChannel {
    fn open(&mut self, address: IpAddr, port: u16) -> Result<()> {
        let target = SocketAddr::new(address, port);
        let shared = Arc::clone(&self.shared);
        let events = self.events_tx.clone();
        let generation = {
            let mut guard = self.shared.lock();
            guard.generation += 1;
            guard.generation
        };

        debug!("Connecting control channel to {}", target);
        std::thread::Builder::new()
            .name("control-connect".to_string())
            .spawn(move || {
                match TcpStream::connect_timeout(&target, CONNECT_TIMEOUT) {
                    Ok(stream) => {
                        let reader = match stream.try_clone() {
                            Ok(r) => r,
                            Err(e) => {
                                let _ = events.send(ControlEvent::ConnectFailed(e.to_string()));
                                return;
                            }
                        };

                        {
                            let mut guard = shared.lock();
                            if guard.generation != generation {
                                // open() superseded or close() raced us
                                let _ = stream.shutdown(Shutdown::Both);
                                return;
                            }
                            guard.stream = Some(stream);
                        }

                        if events.send(ControlEvent::Connected).is_ok() {
                            let spawned = std::thread::Builder::new()
                                .name("control-read".to_string())
                                .spawn(move || {
                                    Self::read_loop(reader, shared, events, generation)
                                });
                            if let Err(e) = spawned {
                                warn!("Failed to spawn control reader: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        let guard = shared.lock();
                        if guard.generation == generation {
                            drop(guard);
                            let _ = events.send(ControlEvent::ConnectFailed(e.to_string()));
                        }
                    }
                }
            })
            .map_err(Error::Io)?;

        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.shared.lock();
        let stream = guard
            .stream
            .as_mut()
            .ok_or_else(|| Error::Transport("control channel is not open".to_string()))?;
        stream
            .write_all(bytes)
            .and_then(|_| stream.flush())
            .map_err(|e| Error::Transport(e.to_string()))
    }

    fn close(&mut self) {
        let mut guard = self.shared.lock();
        if let Some(stream) = guard.stream.take() {
            debug!("Closing control channel");
            let _ = stream.shutdown(Shutdown::Both);
        }
        // Invalidate any in-flight connector or reader thread
        guard.generation += 1;
    }

    fn is_open(&self) -> bool {
        self.shared.lock().stream.is_some()
    }

    fn events(&self) -> Receiver<ControlEvent> {
        self.events_rx.clone()
    }
}
