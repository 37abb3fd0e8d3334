//! Connection lifecycle controller
//!
//! Single-threaded core driving the whole session: discovery, check-in,
//! start/stop, disconnect, and per-tick position streaming. The transports
//! run their own reader threads but deliver everything as events; the
//! controller drains those queues from [`YawController::update`], so every
//! state transition and callback fires on the caller's thread.
//!
//! Session commands are asynchronous. Each takes optional one-shot success
//! and error callbacks; whichever outcome arrives first (reply, failure, or
//! the 10 second timeout) consumes both, so a late reply can never fire a
//! stale callback.

use crate::device::{DeviceRegistry, DeviceStatus, TiltLimits, YawDevice};
use crate::discovery::DiscoveryService;
use crate::error::{Error, Result};
use crate::motion::{MotionConfig, MotionPipeline, ReferenceBody, ReferenceMotion};
use crate::prefs::PrefStore;
use crate::protocol::{self, ControlMessage, DEVICE_DISCOVERY, DISCOVERY_MARKER};
use crate::transport::{ControlChannel, ControlEvent, TelemetryChannel, TelemetryEvent};
use crate::types::{Rotation, signed_form, unsigned_form};
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Window within which a session command must be answered
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

// Preference keys for the remembered device.
const KEY_REMEMBER_DEVICE: &str = "REMEMBER_DEVICE";
const KEY_LAST_DEVICE_ID: &str = "LAST_USED_DEVICE_ID";
const KEY_LAST_DEVICE_NAME: &str = "LAST_USED_DEVICE_NAME";
const KEY_LAST_IP_ADDRESS: &str = "LAST_USED_IP";
const KEY_LAST_TCP_PORT: &str = "LAST_USED_TCP_PORT";
const KEY_LAST_UDP_PORT: &str = "LAST_USED_UDP_PORT";

/// Connection lifecycle states
///
/// The four transient states (`Connecting`, `Starting`, `Stopping`,
/// `Disconnecting`) each cover one in-flight command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    /// No device, no channel
    #[default]
    Initial,
    /// TCP connect or check-in in flight
    Connecting,
    /// Checked in, platform idle
    Connected,
    /// START in flight
    Starting,
    /// Session live, position commands streaming
    Started,
    /// STOP in flight
    Stopping,
    /// EXIT in flight
    Disconnecting,
}

/// Host-application hooks for controller events
///
/// All methods default to no-ops so implementors override only what they
/// need. Called synchronously from [`YawController::update`].
pub trait ControllerObserver: Send {
    fn state_changed(&mut self, _state: ControllerState) {}
    fn device_discovered(&mut self, _device: &YawDevice) {}
    fn device_disconnected(&mut self) {}
    fn yaw_limit_changed(&mut self, _degrees: i32) {}
    fn tilt_limits_changed(&mut self, _limits: &TiltLimits) {}
}

/// One-shot success callback for a session command
pub type SuccessFn = Box<dyn FnOnce() + Send>;
/// One-shot error callback for a session command
pub type ErrorFn = Box<dyn FnOnce(Error) + Send>;

/// Callbacks and deadline for one in-flight session command
struct PendingCommand {
    on_success: Option<SuccessFn>,
    on_error: Option<ErrorFn>,
    deadline: Instant,
}

impl PendingCommand {
    fn new(on_success: Option<SuccessFn>, on_error: Option<ErrorFn>) -> Self {
        Self {
            on_success,
            on_error,
            deadline: Instant::now() + COMMAND_TIMEOUT,
        }
    }

    fn succeed(self) {
        if let Some(on_success) = self.on_success {
            on_success();
        }
    }

    fn fail(self, error: Error) {
        warn!("Command failed: {}", error);
        if let Some(on_error) = self.on_error {
            on_error(error);
        }
    }
}

/// Motion platform session controller
pub struct YawController {
    state: ControllerState,
    control: Box<dyn ControlChannel>,
    telemetry: Box<dyn TelemetryChannel>,
    control_events: Receiver<ControlEvent>,
    telemetry_events: Receiver<TelemetryEvent>,
    observer: Option<Box<dyn ControllerObserver>>,
    registry: DeviceRegistry,
    discovery: DiscoveryService,
    pipeline: MotionPipeline,
    prefs: Box<dyn PrefStore>,
    game_name: String,
    remember_device: bool,
    device: Option<YawDevice>,
    yaw_limit: Option<i32>,
    tilt_limits: Option<TiltLimits>,
    connect: Option<PendingCommand>,
    starting: Option<PendingCommand>,
    stopping: Option<PendingCommand>,
    disconnecting: Option<PendingCommand>,
    /// Connect request queued while tearing down the previous session
    pending_reconnect: Option<(YawDevice, Option<SuccessFn>, Option<ErrorFn>)>,
}

impl YawController {
    /// Create a controller over the given transports and preference store
    ///
    /// Loads the persisted motion configuration and, when device memory is
    /// enabled and a device was saved, immediately begins reconnecting to it.
    pub fn new(
        control: Box<dyn ControlChannel>,
        telemetry: Box<dyn TelemetryChannel>,
        prefs: Box<dyn PrefStore>,
        game_name: impl Into<String>,
    ) -> Self {
        let control_events = control.events();
        let telemetry_events = telemetry.events();
        let pipeline = MotionPipeline::new(MotionConfig::load(prefs.as_ref()));
        let remember_device = prefs.get_string(KEY_REMEMBER_DEVICE, "FALSE") == "TRUE";

        let mut controller = Self {
            state: ControllerState::Initial,
            control,
            telemetry,
            control_events,
            telemetry_events,
            observer: None,
            registry: DeviceRegistry::new(),
            discovery: DiscoveryService::new(),
            pipeline,
            prefs,
            game_name: game_name.into(),
            remember_device,
            device: None,
            yaw_limit: None,
            tilt_limits: None,
            connect: None,
            starting: None,
            stopping: None,
            disconnecting: None,
            pending_reconnect: None,
        };

        if controller.remember_device {
            if let Some(device) = controller.load_remembered_device() {
                info!("Reconnecting to remembered device {}", device.name);
                controller.connect_to_device(device, None, None);
            }
        }

        controller
    }

    pub fn set_observer(&mut self, observer: Box<dyn ControllerObserver>) {
        self.observer = Some(observer);
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Device of the current session (set from `Connecting` onwards)
    pub fn device(&self) -> Option<&YawDevice> {
        self.device.as_ref()
    }

    /// Discovered devices in registry order
    pub fn devices(&self) -> &[YawDevice] {
        self.registry.devices()
    }

    pub fn yaw_limit(&self) -> Option<i32> {
        self.yaw_limit
    }

    pub fn tilt_limits(&self) -> Option<TiltLimits> {
        self.tilt_limits
    }

    pub fn motion_config(&self) -> &MotionConfig {
        self.pipeline.config()
    }

    pub fn set_game_name(&mut self, name: impl Into<String>) {
        self.game_name = name.into();
    }

    // ===== Session commands =====

    /// Begin a session with `device`
    ///
    /// Only an `Available` device can be claimed; anything else fails
    /// through `on_error` without touching the current state. If a session
    /// is already active it is torn down first and the connect is re-issued
    /// once the teardown resolves.
    pub fn connect_to_device(
        &mut self,
        device: YawDevice,
        on_success: Option<SuccessFn>,
        on_error: Option<ErrorFn>,
    ) {
        if device.status != DeviceStatus::Available {
            warn!("Refusing to connect to {}: not available", device.name);
            if let Some(on_error) = on_error {
                on_error(Error::DeviceUnavailable);
            }
            return;
        }

        // One connect at a time: an in-flight connect or an already queued
        // reconnect must resolve or time out before a new one may be issued
        if self.state == ControllerState::Connecting || self.pending_reconnect.is_some() {
            warn!("Refusing to connect to {}: connect already in progress", device.name);
            if let Some(on_error) = on_error {
                on_error(Error::NotConnected(
                    "Connect already in progress".to_string(),
                ));
            }
            return;
        }

        if self.state == ControllerState::Initial {
            self.begin_connect(device, on_success, on_error);
        } else {
            debug!("Queueing reconnect to {} behind teardown", device.name);
            self.pending_reconnect = Some((device, on_success, on_error));
            self.disconnect_from_device(None, None);
        }
    }

    fn begin_connect(
        &mut self,
        device: YawDevice,
        on_success: Option<SuccessFn>,
        on_error: Option<ErrorFn>,
    ) {
        info!(
            "Connecting to {} at {}:{}",
            device.name, device.address, device.tcp_port
        );
        let address = device.address;
        let port = device.tcp_port;
        self.device = Some(device);
        self.set_state(ControllerState::Connecting);
        self.connect = Some(PendingCommand::new(on_success, on_error));
        if let Err(e) = self.control.open(address, port) {
            self.fail_connect(Error::Transport(e.to_string()));
        }
    }

    fn fail_connect(&mut self, error: Error) {
        let pending = self.connect.take();
        self.set_state(ControllerState::Initial);
        if let Some(pending) = pending {
            pending.fail(error);
        }
    }

    /// Send START, entering `Started` on acknowledgement
    pub fn start_device(&mut self, on_success: Option<SuccessFn>, on_error: Option<ErrorFn>) {
        if self.state != ControllerState::Connected {
            if let Some(on_error) = on_error {
                on_error(Error::NotConnected("Not connected to a device".to_string()));
            }
            return;
        }
        self.set_state(ControllerState::Starting);
        self.starting = Some(PendingCommand::new(on_success, on_error));
        if let Err(e) = self.control.send(&protocol::start()) {
            if let Some(pending) = self.starting.take() {
                pending.fail(e);
            }
        }
    }

    /// Send STOP, returning to `Connected` on acknowledgement
    pub fn stop_device(&mut self, on_success: Option<SuccessFn>, on_error: Option<ErrorFn>) {
        if self.state != ControllerState::Started {
            if let Some(on_error) = on_error {
                on_error(Error::NotConnected("Device is not started".to_string()));
            }
            return;
        }
        self.set_state(ControllerState::Stopping);
        self.stopping = Some(PendingCommand::new(on_success, on_error));
        if let Err(e) = self.control.send(&protocol::stop()) {
            if let Some(pending) = self.stopping.take() {
                pending.fail(e);
            }
        }
    }

    /// Send EXIT and tear the session down
    pub fn disconnect_from_device(
        &mut self,
        on_success: Option<SuccessFn>,
        on_error: Option<ErrorFn>,
    ) {
        if self.state == ControllerState::Initial {
            if let Some(on_error) = on_error {
                on_error(Error::NotConnected("Not connected to a device".to_string()));
            }
            return;
        }
        // The in-flight disconnect keeps its continuations; a second request
        // must wait for it to resolve or time out
        if self.state == ControllerState::Disconnecting {
            if let Some(on_error) = on_error {
                on_error(Error::NotConnected(
                    "Disconnect already in progress".to_string(),
                ));
            }
            return;
        }
        if !self.control.is_open() {
            // Nothing to notify; finish locally
            self.set_state(ControllerState::Initial);
            if let Some(on_success) = on_success {
                on_success();
            }
            self.issue_pending_reconnect();
            return;
        }
        self.set_state(ControllerState::Disconnecting);
        self.disconnecting = Some(PendingCommand::new(on_success, on_error));
        if let Err(e) = self.control.send(&protocol::exit()) {
            let pending = self.disconnecting.take();
            self.set_state(ControllerState::Initial);
            if let Some(pending) = pending {
                pending.fail(e);
            }
            self.issue_pending_reconnect();
        }
    }

    // ===== Limits =====

    /// Request a new symmetric yaw travel limit in degrees
    pub fn set_yaw_limit(&mut self, degrees: i32) -> Result<()> {
        self.require_session()?;
        self.control.send(&protocol::set_yaw_limit(degrees))
    }

    /// Request new tilt travel limits in degrees
    pub fn set_tilt_limits(
        &mut self,
        pitch_forward: i32,
        pitch_backward: i32,
        roll: i32,
    ) -> Result<()> {
        self.require_session()?;
        self.control
            .send(&protocol::set_tilt_limits(pitch_forward, pitch_backward, roll))
    }

    fn require_session(&self) -> Result<()> {
        match self.state {
            ControllerState::Initial | ControllerState::Disconnecting => Err(Error::NotConnected(
                "Not connected to a device".to_string(),
            )),
            _ => Ok(()),
        }
    }

    // ===== Discovery =====

    /// Start broadcasting discovery requests to `port`
    ///
    /// Clears the registry; devices reappear as they answer.
    pub fn discover_devices(&mut self, port: u16) -> Result<()> {
        self.registry.clear();
        self.discovery.configure(port)
    }

    pub fn stop_discovery(&mut self) {
        self.discovery.stop();
    }

    // ===== Preferences =====

    /// Enable or disable device memory
    ///
    /// Disabling forgets the saved device immediately.
    pub fn set_remember_device(&mut self, remember: bool) {
        self.remember_device = remember;
        self.prefs
            .set_string(KEY_REMEMBER_DEVICE, if remember { "TRUE" } else { "FALSE" });
        if !remember {
            self.prefs.delete_key(KEY_LAST_DEVICE_ID);
            self.prefs.delete_key(KEY_LAST_DEVICE_NAME);
            self.prefs.delete_key(KEY_LAST_IP_ADDRESS);
            self.prefs.delete_key(KEY_LAST_TCP_PORT);
            self.prefs.delete_key(KEY_LAST_UDP_PORT);
        }
        self.save_prefs();
    }

    pub fn remember_device(&self) -> bool {
        self.remember_device
    }

    pub fn set_reference_motion(&mut self, motion: ReferenceMotion) {
        self.pipeline.set_reference_motion(motion);
        self.pipeline.config().persist_motion_type(self.prefs.as_mut());
        self.save_prefs();
    }

    pub fn set_rotation_multiplier(&mut self, yaw: f32, pitch: f32, roll: f32) {
        self.pipeline.set_rotation_multiplier(yaw, pitch, roll);
        self.pipeline
            .config()
            .persist_rotation_multiplier(self.prefs.as_mut());
        self.save_prefs();
    }

    pub fn set_acceleration_multiplier(&mut self, pitch: f32, roll: f32) {
        self.pipeline.set_acceleration_multiplier(pitch, roll);
        self.pipeline
            .config()
            .persist_acceleration_multiplier(self.prefs.as_mut());
        self.save_prefs();
    }

    pub fn set_lateral_force_multiplier(&mut self, multiplier: f32) {
        self.pipeline.set_lateral_force_multiplier(multiplier);
        self.pipeline
            .config()
            .persist_lateral_force_multiplier(self.prefs.as_mut());
        self.save_prefs();
    }

    /// Change the motion smoothing window; sizes below 1 are ignored
    pub fn set_motion_sample_size(&mut self, size: usize) {
        if !self.pipeline.set_sample_size(size) {
            warn!("Ignoring motion sample size {}", size);
            return;
        }
        self.pipeline.config().persist_sample_size(self.prefs.as_mut());
        self.save_prefs();
    }

    fn save_prefs(&mut self) {
        if let Err(e) = self.prefs.save() {
            warn!("Failed to save preferences: {}", e);
        }
    }

    fn save_device(&mut self, device: &YawDevice) {
        self.prefs.set_string(KEY_LAST_DEVICE_ID, &device.id);
        self.prefs.set_string(KEY_LAST_DEVICE_NAME, &device.name);
        self.prefs
            .set_string(KEY_LAST_IP_ADDRESS, &device.address.to_string());
        self.prefs.set_int(KEY_LAST_TCP_PORT, device.tcp_port as i32);
        self.prefs.set_int(KEY_LAST_UDP_PORT, device.udp_port as i32);
        self.save_prefs();
    }

    fn load_remembered_device(&self) -> Option<YawDevice> {
        let id = self.prefs.get_string(KEY_LAST_DEVICE_ID, "");
        if id.is_empty() {
            return None;
        }
        let address = self
            .prefs
            .get_string(KEY_LAST_IP_ADDRESS, "")
            .parse()
            .ok()?;
        let tcp_port = self.prefs.get_int(KEY_LAST_TCP_PORT, 0);
        let udp_port = self.prefs.get_int(KEY_LAST_UDP_PORT, 0);
        if tcp_port <= 0 || udp_port <= 0 {
            return None;
        }
        Some(YawDevice::new(
            id,
            self.prefs.get_string(KEY_LAST_DEVICE_NAME, ""),
            address,
            tcp_port as u16,
            udp_port as u16,
            DeviceStatus::Available,
        ))
    }

    // ===== Tick =====

    /// Drive one fixed tick
    ///
    /// Drains transport events, fires expired command timeouts, sends due
    /// discovery broadcasts, and, when a reference body is supplied, runs
    /// the motion pipeline and streams the resulting position while the
    /// session is `Started`.
    pub fn update(&mut self, now: Instant, dt: f32, body: Option<&ReferenceBody>) {
        while let Ok(event) = self.control_events.try_recv() {
            self.handle_control_event(event);
        }
        while let Ok(event) = self.telemetry_events.try_recv() {
            self.handle_telemetry_event(event);
        }

        self.check_timeouts(now);

        if let Some(port) = self.discovery.poll(now) {
            if let Err(e) = self.telemetry.broadcast(port, DEVICE_DISCOVERY) {
                debug!("Discovery broadcast failed: {}", e);
            }
        }

        if let Some(body) = body {
            self.pipeline.process(body, dt);
            if self.state == ControllerState::Started {
                self.send_position();
            }
        }
    }

    fn send_position(&mut self) {
        let command = self.apply_limits(self.pipeline.command_rotation());
        let payload = protocol::set_position(command.yaw, command.pitch, command.roll);
        if let Err(e) = self.telemetry.send(&payload) {
            debug!("Position send failed: {}", e);
        }
    }

    /// Clamp a command rotation to the device-reported travel limits
    ///
    /// Clamping happens in signed form so the asymmetric pitch bounds apply
    /// on the correct sides; the result goes back to unsigned form for the
    /// wire.
    fn apply_limits(&self, command: Rotation) -> Rotation {
        let mut yaw = signed_form(command.yaw);
        let mut pitch = signed_form(command.pitch);
        let mut roll = signed_form(command.roll);
        if let Some(limit) = self.yaw_limit {
            let limit = limit as f32;
            yaw = yaw.clamp(-limit, limit);
        }
        if let Some(limits) = self.tilt_limits {
            pitch = pitch.clamp(-(limits.pitch_backward as f32), limits.pitch_forward as f32);
            roll = roll.clamp(-(limits.roll as f32), limits.roll as f32);
        }
        Rotation::new(unsigned_form(yaw), unsigned_form(pitch), unsigned_form(roll))
    }

    // ===== Event handling =====

    fn handle_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Connected => {
                if self.state != ControllerState::Connecting {
                    return;
                }
                debug!("Control channel open, checking in as {:?}", self.game_name);
                let message = protocol::check_in(self.telemetry.local_port(), &self.game_name);
                if let Err(e) = self.control.send(&message) {
                    self.fail_connect(e);
                } else if let Some(pending) = self.connect.as_mut() {
                    // Check-in gets its own full timeout window
                    pending.deadline = Instant::now() + COMMAND_TIMEOUT;
                }
            }
            ControlEvent::ConnectFailed(message) => {
                if self.state == ControllerState::Connecting {
                    self.fail_connect(Error::Transport(message));
                }
            }
            ControlEvent::Message(bytes) => match protocol::decode(&bytes) {
                Some(message) => self.handle_control_message(message),
                None => debug!("Dropping unrecognized control message: {:02x?}", bytes),
            },
            ControlEvent::Disconnected => self.handle_transport_loss(),
        }
    }

    fn handle_control_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::CheckInResponse(payload) => self.handle_check_in_response(&payload),
            ControlMessage::StartAck => {
                if self.state == ControllerState::Starting {
                    self.set_state(ControllerState::Started);
                    if let Some(pending) = self.starting.take() {
                        pending.succeed();
                    }
                }
            }
            ControlMessage::StopAck => {
                if self.state == ControllerState::Stopping {
                    self.set_state(ControllerState::Connected);
                    if let Some(pending) = self.stopping.take() {
                        pending.succeed();
                    }
                }
            }
            ControlMessage::ExitAck => {
                if self.state == ControllerState::Disconnecting {
                    info!("Session closed");
                    let pending = self.disconnecting.take();
                    self.set_state(ControllerState::Initial);
                    if let Some(pending) = pending {
                        pending.succeed();
                    }
                    self.issue_pending_reconnect();
                } else if self.state != ControllerState::Initial {
                    // Platform ended the session on its own
                    info!("Session ended by the platform");
                    self.handle_transport_loss();
                }
            }
            ControlMessage::YawLimitReport(degrees) => {
                debug!("Yaw limit is now {} degrees", degrees);
                self.yaw_limit = Some(degrees);
                if let Some(observer) = self.observer.as_mut() {
                    observer.yaw_limit_changed(degrees);
                }
            }
            ControlMessage::TiltLimitsReport {
                pitch_forward,
                pitch_backward,
                roll,
            } => {
                let limits = TiltLimits {
                    pitch_forward,
                    pitch_backward,
                    roll,
                };
                debug!("Tilt limits are now {:?}", limits);
                self.tilt_limits = Some(limits);
                if let Some(observer) = self.observer.as_mut() {
                    observer.tilt_limits_changed(&limits);
                }
            }
        }
    }

    fn handle_check_in_response(&mut self, payload: &str) {
        // A check-in reply is only meaningful while a connect is in flight;
        // a duplicate or late copy arriving after resolution is dropped
        if self.state != ControllerState::Connecting {
            debug!("Dropping check-in reply outside of connect: {:?}", payload);
            return;
        }
        if payload == "AVAILABLE" {
            if let Some(device) = self.device.clone() {
                self.telemetry.set_remote(device.address, device.udp_port);
                if self.remember_device {
                    self.save_device(&device);
                }
            }
            self.set_state(ControllerState::Connected);
            if let Some(pending) = self.connect.take() {
                pending.succeed();
            }
        } else if payload.starts_with("RESERVED") {
            let parts: Vec<&str> = payload.split(';').collect();
            if parts.len() != 3 {
                debug!("Dropping malformed reservation record: {:?}", payload);
                return;
            }
            self.fail_connect(Error::DeviceReserved {
                game: parts[1].to_string(),
                ip: parts[2].to_string(),
            });
        } else {
            debug!("Dropping unknown check-in payload: {:?}", payload);
        }
    }

    fn handle_telemetry_event(&mut self, event: TelemetryEvent) {
        let TelemetryEvent::Datagram { text, from } = event;
        if text.starts_with(DISCOVERY_MARKER) {
            let port = self.telemetry.local_port();
            if let Some(device) = protocol::parse_discovery_response(&text, from, port) {
                if self.registry.fold(device.clone()) {
                    info!("Discovered {} ({}) at {}", device.name, device.id, device.address);
                    if let Some(observer) = self.observer.as_mut() {
                        observer.device_discovered(&device);
                    }
                }
            }
        } else if let Some(rotation) = protocol::parse_position_report(&text) {
            // Only the connected device may report its position
            if let Some(device) = self.device.as_mut() {
                if device.address == from {
                    device.actual_position = Some(rotation);
                }
            }
        }
    }

    /// The control channel dropped out from under an active session
    fn handle_transport_loss(&mut self) {
        if self.state == ControllerState::Initial {
            return;
        }
        warn!("Lost connection to the device");
        self.cancel_pending(Error::Transport(
            "Connection to the device was lost".to_string(),
        ));
        if let Some(observer) = self.observer.as_mut() {
            observer.device_disconnected();
        }
        self.set_state(ControllerState::Initial);
        self.issue_pending_reconnect();
    }

    fn cancel_pending(&mut self, error: Error) {
        let pending = [
            self.connect.take(),
            self.starting.take(),
            self.stopping.take(),
            self.disconnecting.take(),
        ];
        for command in pending.into_iter().flatten() {
            command.fail(match &error {
                Error::Transport(message) => Error::Transport(message.clone()),
                _ => Error::CommandTimeout,
            });
        }
    }

    fn issue_pending_reconnect(&mut self) {
        if let Some((device, on_success, on_error)) = self.pending_reconnect.take() {
            self.begin_connect(device, on_success, on_error);
        }
    }

    // ===== Timeouts =====

    fn check_timeouts(&mut self, now: Instant) {
        if self.connect.as_ref().is_some_and(|p| now >= p.deadline) {
            let error = if self.control.is_open() {
                Error::CommandTimeout
            } else {
                Error::Transport("Failed to open the control connection".to_string())
            };
            self.fail_connect(error);
        }

        // A start or stop timeout surrenders both callbacks but leaves the
        // state alone; the platform may still be processing the command.
        if self.starting.as_ref().is_some_and(|p| now >= p.deadline) {
            if let Some(pending) = self.starting.take() {
                pending.fail(Error::CommandTimeout);
            }
        }
        if self.stopping.as_ref().is_some_and(|p| now >= p.deadline) {
            if let Some(pending) = self.stopping.take() {
                pending.fail(Error::CommandTimeout);
            }
        }

        if self.disconnecting.as_ref().is_some_and(|p| now >= p.deadline) {
            let pending = self.disconnecting.take();
            self.set_state(ControllerState::Initial);
            if let Some(pending) = pending {
                pending.fail(Error::CommandTimeout);
            }
            self.issue_pending_reconnect();
        }
    }

    // ===== State =====

    fn set_state(&mut self, state: ControllerState) {
        if self.state == state {
            return;
        }
        debug!("Controller state {:?} -> {:?}", self.state, state);
        self.state = state;
        if state == ControllerState::Initial {
            self.device = None;
            self.control.close();
        }
        if let Some(observer) = self.observer.as_mut() {
            observer.state_changed(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ids;
    use crate::transport::mock::{MockControlChannel, MockTelemetryChannel};
    use crate::prefs::MemoryPrefStore;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const DEVICE_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

    fn available_device() -> YawDevice {
        YawDevice::new("AABBCC", "Sim", DEVICE_IP, 50020, 50010, DeviceStatus::Available)
    }

    fn controller_with(
        control: MockControlChannel,
        telemetry: MockTelemetryChannel,
    ) -> YawController {
        YawController::new(
            Box::new(control),
            Box::new(telemetry),
            Box::new(MemoryPrefStore::new()),
            "TestGame",
        )
    }

    fn tick(controller: &mut YawController) {
        controller.update(Instant::now(), 0.02, None);
    }

    fn reply(control: &MockControlChannel, bytes: &[u8]) {
        control
            .event_sender()
            .send(ControlEvent::Message(bytes.to_vec()))
            .unwrap();
    }

    fn connect(controller: &mut YawController, control: &MockControlChannel) {
        controller.connect_to_device(available_device(), None, None);
        tick(controller);
        let mut answer = vec![ids::CHECK_IN_ANS];
        answer.extend_from_slice(b"AVAILABLE");
        reply(control, &answer);
        tick(controller);
        assert_eq!(controller.state(), ControllerState::Connected);
    }

    #[test]
    fn test_connect_sends_check_in_and_reaches_connected() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry.clone());

        let connected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connected);
        controller.connect_to_device(
            available_device(),
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            None,
        );
        assert_eq!(controller.state(), ControllerState::Connecting);
        tick(&mut controller);

        let sent = control.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], ids::CHECK_IN);
        assert_eq!(&sent[0][1..5], &50010i32.to_be_bytes());
        assert_eq!(&sent[0][5..], b"TestGame");

        let mut answer = vec![ids::CHECK_IN_ANS];
        answer.extend_from_slice(b"AVAILABLE");
        reply(&control, &answer);
        tick(&mut controller);

        assert_eq!(controller.state(), ControllerState::Connected);
        assert!(connected.load(Ordering::SeqCst));
        // Telemetry remote was pointed at the device
        assert_eq!(telemetry.remote().unwrap().ip(), DEVICE_IP);
        assert_eq!(telemetry.remote().unwrap().port(), 50010);
    }

    #[test]
    fn test_connect_refuses_unavailable_device() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry);

        let mut device = available_device();
        device.status = DeviceStatus::Reserved;

        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        controller.connect_to_device(
            device,
            None,
            Some(Box::new(move |e| {
                assert!(matches!(e, Error::DeviceUnavailable));
                flag.store(true, Ordering::SeqCst);
            })),
        );

        assert!(failed.load(Ordering::SeqCst));
        assert_eq!(controller.state(), ControllerState::Initial);
        assert!(control.sent().is_empty());
    }

    #[test]
    fn test_reserved_check_in_returns_to_initial() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry);

        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        controller.connect_to_device(
            available_device(),
            None,
            Some(Box::new(move |e| {
                assert_eq!(
                    e.to_string(),
                    "Device is in use from: 10.0.0.9 with game: OtherGame"
                );
                flag.store(true, Ordering::SeqCst);
            })),
        );
        tick(&mut controller);

        let mut answer = vec![ids::CHECK_IN_ANS];
        answer.extend_from_slice(b"RESERVED;OtherGame;10.0.0.9");
        reply(&control, &answer);
        tick(&mut controller);

        assert!(failed.load(Ordering::SeqCst));
        assert_eq!(controller.state(), ControllerState::Initial);
        assert!(controller.device().is_none());
    }

    #[test]
    fn test_connect_timeout_returns_to_initial() {
        let control = MockControlChannel::new().manual_connect();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control, telemetry);

        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        controller.connect_to_device(
            available_device(),
            None,
            Some(Box::new(move |_| flag.store(true, Ordering::SeqCst))),
        );
        assert_eq!(controller.state(), ControllerState::Connecting);

        controller.update(Instant::now() + Duration::from_secs(11), 0.02, None);
        assert!(failed.load(Ordering::SeqCst));
        assert_eq!(controller.state(), ControllerState::Initial);
    }

    #[test]
    fn test_start_and_stop_round_trip() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry);
        connect(&mut controller, &control);

        controller.start_device(None, None);
        assert_eq!(controller.state(), ControllerState::Starting);
        reply(&control, &[ids::START]);
        tick(&mut controller);
        assert_eq!(controller.state(), ControllerState::Started);

        controller.stop_device(None, None);
        assert_eq!(controller.state(), ControllerState::Stopping);
        reply(&control, &[ids::STOP]);
        tick(&mut controller);
        assert_eq!(controller.state(), ControllerState::Connected);
    }

    #[test]
    fn test_start_timeout_drops_late_success() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry);
        connect(&mut controller, &control);

        let outcomes = Arc::new(AtomicUsize::new(0));
        let on_success = {
            let outcomes = Arc::clone(&outcomes);
            Box::new(move || {
                outcomes.fetch_add(100, Ordering::SeqCst);
            })
        };
        let on_error = {
            let outcomes = Arc::clone(&outcomes);
            Box::new(move |e: Error| {
                assert!(matches!(e, Error::CommandTimeout));
                outcomes.fetch_add(1, Ordering::SeqCst);
            })
        };
        controller.start_device(Some(on_success), Some(on_error));

        controller.update(Instant::now() + Duration::from_secs(11), 0.02, None);
        assert_eq!(outcomes.load(Ordering::SeqCst), 1);
        // State is left alone by a start timeout
        assert_eq!(controller.state(), ControllerState::Starting);

        // The acknowledgement arriving late still transitions but must not
        // fire the surrendered success callback
        reply(&control, &[ids::START]);
        tick(&mut controller);
        assert_eq!(controller.state(), ControllerState::Started);
        assert_eq!(outcomes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_round_trip() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry);
        connect(&mut controller, &control);

        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        controller.disconnect_from_device(
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            None,
        );
        assert_eq!(controller.state(), ControllerState::Disconnecting);
        assert_eq!(control.sent_command_ids().last(), Some(&ids::EXIT));

        reply(&control, &[ids::EXIT]);
        tick(&mut controller);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(controller.state(), ControllerState::Initial);
        assert!(controller.device().is_none());
    }

    #[test]
    fn test_reconnect_waits_for_teardown() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry);
        connect(&mut controller, &control);
        control.clear_sent();

        let mut second = available_device();
        second.id = "DDEEFF".to_string();
        second.address = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8));
        controller.connect_to_device(second, None, None);

        // EXIT goes out first; the new connect waits
        assert_eq!(controller.state(), ControllerState::Disconnecting);
        assert_eq!(control.sent_command_ids(), vec![ids::EXIT]);

        reply(&control, &[ids::EXIT]);
        tick(&mut controller);

        // Teardown resolved, the queued connect was issued
        assert_eq!(controller.state(), ControllerState::Connecting);
        assert_eq!(
            control.opened_to(),
            Some((IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8)), 50020))
        );
    }

    #[test]
    fn test_transport_loss_cancels_pending_and_notifies() {
        struct Watcher {
            disconnected: Arc<AtomicBool>,
        }
        impl ControllerObserver for Watcher {
            fn device_disconnected(&mut self) {
                self.disconnected.store(true, Ordering::SeqCst);
            }
        }

        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry);
        let disconnected = Arc::new(AtomicBool::new(false));
        controller.set_observer(Box::new(Watcher {
            disconnected: Arc::clone(&disconnected),
        }));
        connect(&mut controller, &control);

        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        controller.start_device(
            None,
            Some(Box::new(move |e| {
                assert!(matches!(e, Error::Transport(_)));
                flag.store(true, Ordering::SeqCst);
            })),
        );

        control.event_sender().send(ControlEvent::Disconnected).unwrap();
        tick(&mut controller);

        assert!(disconnected.load(Ordering::SeqCst));
        assert!(failed.load(Ordering::SeqCst));
        assert_eq!(controller.state(), ControllerState::Initial);
    }

    #[test]
    fn test_discovery_broadcast_and_registry_fold() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control, telemetry.clone());

        controller.discover_devices(50010).unwrap();
        tick(&mut controller);
        let broadcasts = telemetry.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0], (50010, DEVICE_DISCOVERY.to_vec()));

        telemetry.inject("YAWDEVICE;AABBCC;Sim 1;50020;AVAILABLE", DEVICE_IP);
        tick(&mut controller);
        assert_eq!(controller.devices().len(), 1);
        assert_eq!(controller.devices()[0].id, "AABBCC");
        assert_eq!(controller.devices()[0].udp_port, 50010);
    }

    #[test]
    fn test_limit_reports_update_and_clamp() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry.clone());
        connect(&mut controller, &control);

        let mut tilt = vec![ids::SET_TILT_LIMITS];
        tilt.extend_from_slice(&15i32.to_be_bytes());
        tilt.extend_from_slice(&5i32.to_be_bytes());
        tilt.extend_from_slice(&20i32.to_be_bytes());
        reply(&control, &tilt);
        let mut yaw = vec![ids::SET_YAW_LIMIT];
        yaw.extend_from_slice(&30i32.to_be_bytes());
        reply(&control, &yaw);
        tick(&mut controller);

        assert_eq!(controller.yaw_limit(), Some(30));
        assert_eq!(
            controller.tilt_limits(),
            Some(TiltLimits { pitch_forward: 15, pitch_backward: 5, roll: 20 })
        );

        // Pitch bounds are asymmetric: +20 clamps to +15, -20 to -5
        let clamped = controller.apply_limits(Rotation::new(50.0, 20.0, 350.0));
        assert_eq!(clamped.yaw, 30.0);
        assert_eq!(clamped.pitch, 15.0);
        assert_eq!(clamped.roll, 350.0);
        let clamped = controller.apply_limits(Rotation::new(310.0, 340.0, 330.0));
        assert_eq!(clamped.yaw, 330.0);
        assert_eq!(clamped.pitch, 355.0);
        assert_eq!(clamped.roll, 340.0);
    }

    #[test]
    fn test_position_streams_only_when_started() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry.clone());
        connect(&mut controller, &control);

        let body = ReferenceBody {
            orientation: Rotation::new(350.0, 10.0, 0.0),
            world_velocity: None,
        };
        controller.update(Instant::now(), 0.02, Some(&body));
        assert!(telemetry.sent().is_empty());

        controller.start_device(None, None);
        reply(&control, &[ids::START]);
        controller.update(Instant::now(), 0.02, Some(&body));

        let sent = telemetry.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], b"Y[350.00]P[010.00]R[000.00]");
    }

    #[test]
    fn test_remembered_device_reconnects_on_startup() {
        // Literal key names: preference files written by existing
        // deployments must keep loading
        let mut prefs = MemoryPrefStore::new();
        prefs.set_string("REMEMBER_DEVICE", "TRUE");
        prefs.set_string("LAST_USED_DEVICE_ID", "AABBCC");
        prefs.set_string("LAST_USED_DEVICE_NAME", "Sim");
        prefs.set_string("LAST_USED_IP", "10.0.0.7");
        prefs.set_int("LAST_USED_TCP_PORT", 50020);
        prefs.set_int("LAST_USED_UDP_PORT", 50010);

        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let controller = YawController::new(
            Box::new(control.clone()),
            Box::new(telemetry),
            Box::new(prefs),
            "TestGame",
        );

        assert_eq!(controller.state(), ControllerState::Connecting);
        assert_eq!(control.opened_to(), Some((DEVICE_IP, 50020)));
    }

    #[test]
    fn test_limit_setters_require_session() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry);

        assert!(matches!(
            controller.set_yaw_limit(40),
            Err(Error::NotConnected(_))
        ));

        connect(&mut controller, &control);
        control.clear_sent();
        controller.set_yaw_limit(40).unwrap();
        controller.set_tilt_limits(30, 25, 35).unwrap();
        assert_eq!(
            control.sent_command_ids(),
            vec![ids::SET_YAW_LIMIT, ids::SET_TILT_LIMITS]
        );
    }

    #[test]
    fn test_late_reserved_reply_cannot_kill_a_live_session() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry);
        connect(&mut controller, &control);

        controller.start_device(None, None);
        reply(&control, &[ids::START]);
        tick(&mut controller);
        assert_eq!(controller.state(), ControllerState::Started);

        // A duplicate check-in reply lands after the connect resolved; it
        // must be dropped, not tear down the live session
        let mut reserved = vec![ids::CHECK_IN_ANS];
        reserved.extend_from_slice(b"RESERVED;OtherGame;10.0.0.9");
        reply(&control, &reserved);
        tick(&mut controller);

        assert_eq!(controller.state(), ControllerState::Started);
        assert!(controller.device().is_some());
        assert!(controller.control.is_open());
    }

    #[test]
    fn test_second_disconnect_waits_for_the_first() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry);
        connect(&mut controller, &control);
        control.clear_sent();

        let successes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&successes);
        controller.disconnect_from_device(
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        );

        // The second request is rejected and must not displace the first
        // caller's continuations or send another EXIT
        let rejected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&rejected);
        controller.disconnect_from_device(
            None,
            Some(Box::new(move |e| {
                assert!(matches!(e, Error::NotConnected(_)));
                flag.store(true, Ordering::SeqCst);
            })),
        );
        assert!(rejected.load(Ordering::SeqCst));
        assert_eq!(control.sent_command_ids(), vec![ids::EXIT]);

        reply(&control, &[ids::EXIT]);
        tick(&mut controller);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), ControllerState::Initial);
    }

    #[test]
    fn test_second_connect_while_busy_is_rejected() {
        let control = MockControlChannel::new();
        let telemetry = MockTelemetryChannel::new(50010);
        let mut controller = controller_with(control.clone(), telemetry);
        connect(&mut controller, &control);

        let mut second = available_device();
        second.id = "DDEEFF".to_string();
        second.address = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8));
        controller.connect_to_device(second, None, None);
        assert_eq!(controller.state(), ControllerState::Disconnecting);

        // A third connect while one is already queued is rejected without
        // touching the queued request
        let rejected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&rejected);
        let mut third = available_device();
        third.id = "112233".to_string();
        third.address = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        controller.connect_to_device(
            third,
            None,
            Some(Box::new(move |e| {
                assert!(matches!(e, Error::NotConnected(_)));
                flag.store(true, Ordering::SeqCst);
            })),
        );
        assert!(rejected.load(Ordering::SeqCst));

        // Teardown resolves and the originally queued device wins
        reply(&control, &[ids::EXIT]);
        tick(&mut controller);
        assert_eq!(controller.state(), ControllerState::Connecting);
        assert_eq!(
            control.opened_to(),
            Some((IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8)), 50020))
        );

        // And a connect during the connect phase itself is rejected too
        let rejected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&rejected);
        controller.connect_to_device(
            available_device(),
            None,
            Some(Box::new(move |e| {
                assert!(matches!(e, Error::NotConnected(_)));
                flag.store(true, Ordering::SeqCst);
            })),
        );
        assert!(rejected.load(Ordering::SeqCst));
        assert_eq!(controller.state(), ControllerState::Connecting);
    }
}
