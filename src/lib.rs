//! YawIO - Session controller for networked motion platforms
//!
//! This library drives a motion simulator over its two-channel network
//! protocol: a binary TCP control channel for the session lifecycle
//! (check-in, start, stop, exit, travel limits) and an ASCII UDP telemetry
//! channel for position streaming and device discovery.
//!
//! The host application owns the tick loop: it calls
//! [`controller::YawController::update`] at a fixed rate with the current
//! reference body state, and the controller handles everything else on that
//! thread. Transports run background reader threads internally but surface
//! all traffic as queued events.

pub mod config;
pub mod controller;
pub mod device;
pub mod discovery;
pub mod error;
pub mod motion;
pub mod prefs;
pub mod protocol;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use controller::{ControllerObserver, ControllerState, YawController};
pub use device::{DeviceStatus, TiltLimits, YawDevice};
pub use error::{Error, Result};
pub use motion::{MotionConfig, ReferenceBody, ReferenceMotion};
pub use types::{Rotation, Vec2};
