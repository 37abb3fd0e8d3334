//! Wire protocol for the motion platform
//!
//! Two wire formats are in play, one per channel:
//!
//! **Control (TCP, binary)**: every message is a single command-id byte
//! optionally followed by a payload. Integer parameters are 4-byte big-endian
//! two's-complement; string parameters are raw ASCII with no length prefix
//! (boundaries are inferred from the fixed-size fields preceding them).
//!
//! ```text
//! ┌──────────┬────────────────────┐
//! │ ID (1 B) │ Payload (variable) │
//! └──────────┴────────────────────┘
//! ```
//!
//! **Telemetry (UDP, ASCII)**: position reports are the literal string
//! `Y[yyy.yy]P[ppp.pp]R[rrr.rr]` with each angle rendered as a fixed
//! 6-character `DDD.DD` field in `[0, 360)`. Discovery traffic shares the
//! channel: the request is the literal token `YAW_CALLING`, responses are
//! semicolon-delimited `YAWDEVICE;<id>;<name>;<tcpPort>;<AVAILABLE|other>`
//! records.
//!
//! Both formats must stay byte-exact to interoperate with unmodified
//! platform firmware. Malformed inbound data is dropped, never surfaced.

use crate::device::{DeviceStatus, YawDevice};
use crate::types::Rotation;
use std::net::IpAddr;

/// Control command IDs
///
/// The full table from the platform firmware is kept for reference; this
/// crate only emits a subset (CHECK_IN, START, STOP, EXIT, SET_TILT_LIMITS,
/// SET_YAW_LIMIT).
pub mod ids {
    pub const CHECK_IN: u8 = 0x30;
    pub const START: u8 = 0xA1;
    pub const STOP: u8 = 0xA2;
    pub const EXIT: u8 = 0xA3;
    pub const RESET_PORTS: u8 = 0x01;
    pub const SET_SIMU_INPUT_PORT: u8 = 0x10;
    pub const SET_GAME_INPUT_PORT: u8 = 0x11;
    pub const SET_GAME_IP_ADDRESS: u8 = 0xA4;
    pub const SET_OUTPUT_PORT: u8 = 0x12;
    pub const SET_YAW_PID: u8 = 0x99;
    pub const SET_PITCH_PID: u8 = 0x9A;
    pub const SET_ROLL_PID: u8 = 0x9B;
    pub const SET_GAME_MODE: u8 = 0x80;
    pub const GET_GAME_PARAMS: u8 = 0x81;
    pub const SET_POWER: u8 = 0x30;
    pub const SET_TILT_LIMITS: u8 = 0x40;
    pub const SET_YAW_LIMIT: u8 = 0x70;
    pub const SET_YAW_LIMIT_SPEED: u8 = 0x71;
    pub const SET_LED_STRIP_COLOR: u8 = 0xB0;
    pub const SET_LED_STRIP_MODE: u8 = 0xB1;
    pub const CHECK_IN_ANS: u8 = 0x31;
    pub const ERROR: u8 = 0xA5;
    pub const SERVER_PID_PARAMS: u8 = 0xFF;
}

/// UDP discovery request token
pub const DEVICE_DISCOVERY: &[u8] = b"YAW_CALLING";

/// Discovery response record marker
pub const DISCOVERY_MARKER: &str = "YAWDEVICE";

// ===== Control channel encoders =====

/// Prepend the command-id byte to an assembled payload
///
/// The id occupies index 0; the payload follows unchanged.
fn with_command_id(id: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut message = Vec::with_capacity(payload.len() + 1);
    message.push(id);
    message.extend_from_slice(&payload);
    message
}

/// CHECK_IN command: 4-byte UDP listening port + raw ASCII game name
pub fn check_in(udp_listening_port: u16, game_name: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + game_name.len());
    payload.extend_from_slice(&(udp_listening_port as i32).to_be_bytes());
    payload.extend_from_slice(game_name.as_bytes());
    with_command_id(ids::CHECK_IN, payload)
}

/// START command (id byte only)
pub fn start() -> Vec<u8> {
    vec![ids::START]
}

/// STOP command (id byte only)
pub fn stop() -> Vec<u8> {
    vec![ids::STOP]
}

/// EXIT command (id byte only)
pub fn exit() -> Vec<u8> {
    vec![ids::EXIT]
}

/// SET_TILT_LIMITS command: three consecutive big-endian i32 values
pub fn set_tilt_limits(pitch_forward_max: i32, pitch_backward_max: i32, roll_max: i32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&pitch_forward_max.to_be_bytes());
    payload.extend_from_slice(&pitch_backward_max.to_be_bytes());
    payload.extend_from_slice(&roll_max.to_be_bytes());
    with_command_id(ids::SET_TILT_LIMITS, payload)
}

/// SET_YAW_LIMIT command: one big-endian i32 value
pub fn set_yaw_limit(yaw_max: i32) -> Vec<u8> {
    with_command_id(ids::SET_YAW_LIMIT, yaw_max.to_be_bytes().to_vec())
}

// ===== Control channel decoder =====

/// Decoded control-channel message from the platform
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Check-in acknowledgement with its raw ASCII payload
    /// (`AVAILABLE` or a `RESERVED;<game>;<ip>` record)
    CheckInResponse(String),
    /// START acknowledgement
    StartAck,
    /// STOP acknowledgement
    StopAck,
    /// EXIT acknowledgement (also sent unsolicited when the platform ends
    /// the session on its own)
    ExitAck,
    /// Current yaw limit report (degrees)
    YawLimitReport(i32),
    /// Current tilt limits report (degrees)
    TiltLimitsReport {
        pitch_forward: i32,
        pitch_backward: i32,
        roll: i32,
    },
}

/// Decode a control-channel message
///
/// Dispatches on the first byte and validates the exact expected payload
/// length before parsing numeric fields. Undersized, oversized, or unknown
/// messages yield `None` and are dropped by the caller.
pub fn decode(data: &[u8]) -> Option<ControlMessage> {
    let command_id = *data.first()?;

    match command_id {
        ids::CHECK_IN_ANS => {
            let payload = String::from_utf8_lossy(&data[1..]).into_owned();
            Some(ControlMessage::CheckInResponse(payload))
        }
        ids::START => Some(ControlMessage::StartAck),
        ids::STOP => Some(ControlMessage::StopAck),
        ids::EXIT => Some(ControlMessage::ExitAck),
        ids::SET_YAW_LIMIT => {
            if data.len() == 5 {
                Some(ControlMessage::YawLimitReport(read_i32(data, 1)))
            } else {
                None
            }
        }
        ids::SET_TILT_LIMITS => {
            if data.len() == 13 {
                Some(ControlMessage::TiltLimitsReport {
                    pitch_forward: read_i32(data, 1),
                    pitch_backward: read_i32(data, 5),
                    roll: read_i32(data, 9),
                })
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Read a big-endian i32 at `offset`
///
/// Caller has already validated the message length.
fn read_i32(data: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

// ===== Telemetry channel =====

/// Outbound position report: `Y[yyy.yy]P[ppp.pp]R[rrr.rr]`
pub fn set_position(yaw: f32, pitch: f32, roll: f32) -> Vec<u8> {
    format!(
        "Y[{}]P[{}]R[{}]",
        format_rotation(yaw),
        format_rotation(pitch),
        format_rotation(roll)
    )
    .into_bytes()
}

/// Render one angle as a fixed 6-character `DDD.DD` field
///
/// The value is truncated (not rounded) toward zero to two decimal digits,
/// then wrapped into `[0, 360)`. There is no `360.00`, only `000.00`.
pub fn format_rotation(angle: f32) -> String {
    let mut truncated = ((angle * 100.0) as i64 as f32) / 100.0;
    while truncated < 0.0 {
        truncated += 360.0;
    }
    while truncated >= 360.0 {
        truncated -= 360.0;
    }
    format!("{:06.2}", truncated)
}

/// Parse an inbound position report into its three angles
///
/// The message is split on `[` / `]` delimiters and must contain exactly six
/// tokens (`Y`, yaw, `P`, pitch, `R`, roll, after dropping the trailing
/// closing bracket); the angle fields are taken positionally.
pub fn parse_position_report(message: &str) -> Option<Rotation> {
    if !message.starts_with("Y[") || !message.ends_with(']') {
        return None;
    }
    let parts: Vec<&str> = message[..message.len() - 1].split(['[', ']']).collect();
    if parts.len() != 6 {
        return None;
    }
    let yaw: f32 = parts[1].parse().ok()?;
    let pitch: f32 = parts[3].parse().ok()?;
    let roll: f32 = parts[5].parse().ok()?;
    Some(Rotation::new(yaw, pitch, roll))
}

/// Parse a discovery response record into a device entry
///
/// Record format: `YAWDEVICE;<id>;<name>;<tcpPort>;<AVAILABLE|other>`.
/// The sender address comes from the datagram, the UDP port is the local
/// discovery listening port (the device listens where it was called).
/// Malformed records (wrong field count, non-numeric port) yield `None`.
pub fn parse_discovery_response(
    message: &str,
    sender: IpAddr,
    discovery_port: u16,
) -> Option<YawDevice> {
    let parts: Vec<&str> = message.split(';').collect();
    if parts.len() != 5 {
        return None;
    }
    let tcp_port: u16 = parts[3].parse().ok()?;
    let status = if parts[4] == "AVAILABLE" {
        DeviceStatus::Available
    } else {
        DeviceStatus::Reserved
    };
    Some(YawDevice::new(
        parts[1], parts[2], sender, tcp_port, discovery_port, status,
    ))
}
