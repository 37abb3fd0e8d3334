//! Motion derivation pipeline
//!
//! Sampled once per fixed simulation tick while a reference body is
//! attached. Converts the host's orientation and velocity into a filtered
//! rotation command:
//!
//! 1. Capture the body's Euler orientation (skipped in pure acceleration mode)
//! 2. Derive local-frame velocity, turn rate, acceleration, and lateral
//!    force from consecutive world-frame velocity samples, smoothing each
//!    through a sliding window
//! 3. Combine into a target rotation according to the reference motion mode
//!    and the configured multipliers
//! 4. Clamp to the hardware-agnostic safety band (±90° pitch/roll, ±180° yaw)
//!
//! Device-reported limits are applied afterwards by the controller, which
//! owns them. All math is f32 for bit-exact reproducibility across runs.

use crate::prefs::PrefStore;
use crate::types::{Rotation, Vec2, signed_angle, signed_form, unsigned_form};
use std::ops::{Add, Div};

/// Fixed scale applied to the turn-rate × speed product
const LATERAL_FORCE_SCALE: f32 = 0.01;

/// Default sliding-window size in samples
const DEFAULT_SAMPLE_SIZE: usize = 5;

// Preference keys. The PICTH spelling is historical; stored preferences
// written under it must keep loading.
const KEY_MOTION_TYPE: &str = "MOTION_TYPE";
const KEY_YAW_ROTATION: &str = "YAW_ROTATION_MULTIPLIER";
const KEY_PITCH_ROTATION: &str = "PICTH_ROTATION_MULTIPLIER";
const KEY_ROLL_ROTATION: &str = "ROLL_ROTATION_MULTIPLIER";
const KEY_PITCH_ACCELERATION: &str = "PITCH_ACCELERATION_MULTIPLIER";
const KEY_ROLL_ACCELERATION: &str = "ROLL_ACCELERATION_MULTIPLIER";
const KEY_LATERAL_FORCE: &str = "LATERAL_FORCE_MULTIPLIER";
const KEY_SAMPLE_SIZE: &str = "MOTION_SAMPLE_SIZE";

/// Which physical quantity drives the transmitted motion command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceMotion {
    /// Orientation only
    #[default]
    Rotation,
    /// Derived acceleration and lateral force only
    Acceleration,
    /// Sum of both
    Mixed,
}

impl ReferenceMotion {
    fn as_pref_str(self) -> &'static str {
        match self {
            ReferenceMotion::Rotation => "ROTATION",
            ReferenceMotion::Acceleration => "ACCELERATION",
            ReferenceMotion::Mixed => "MIXED",
        }
    }

    fn from_pref_str(value: &str) -> Self {
        match value {
            "ACCELERATION" => ReferenceMotion::Acceleration,
            "MIXED" => ReferenceMotion::Mixed,
            _ => ReferenceMotion::Rotation,
        }
    }
}

/// Per-axis rotation multipliers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationMultiplier {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

impl Default for RotationMultiplier {
    fn default() -> Self {
        Self { yaw: 1.0, pitch: 1.0, roll: 1.0 }
    }
}

/// Per-axis acceleration multipliers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelerationMultiplier {
    pub pitch: f32,
    pub roll: f32,
}

impl Default for AccelerationMultiplier {
    fn default() -> Self {
        Self { pitch: 1.0, roll: 1.0 }
    }
}

/// Motion processing configuration
///
/// Loaded from the preference store at startup; every setter on the
/// controller persists its mutation immediately.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionConfig {
    pub reference_motion: ReferenceMotion,
    pub rotation_multiplier: RotationMultiplier,
    pub acceleration_multiplier: AccelerationMultiplier,
    pub lateral_force_multiplier: f32,
    pub sample_size: usize,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            reference_motion: ReferenceMotion::default(),
            rotation_multiplier: RotationMultiplier::default(),
            acceleration_multiplier: AccelerationMultiplier::default(),
            lateral_force_multiplier: 1.0,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }
}

impl MotionConfig {
    /// Load the persisted configuration, falling back to defaults per key
    pub fn load(store: &dyn PrefStore) -> Self {
        let defaults = Self::default();
        Self {
            reference_motion: ReferenceMotion::from_pref_str(&store.get_string(KEY_MOTION_TYPE, "")),
            rotation_multiplier: RotationMultiplier {
                yaw: store.get_float(KEY_YAW_ROTATION, 1.0),
                pitch: store.get_float(KEY_PITCH_ROTATION, 1.0),
                roll: store.get_float(KEY_ROLL_ROTATION, 1.0),
            },
            acceleration_multiplier: AccelerationMultiplier {
                pitch: store.get_float(KEY_PITCH_ACCELERATION, 1.0),
                roll: store.get_float(KEY_ROLL_ACCELERATION, 1.0),
            },
            lateral_force_multiplier: store.get_float(KEY_LATERAL_FORCE, 1.0),
            sample_size: store
                .get_int(KEY_SAMPLE_SIZE, defaults.sample_size as i32)
                .max(1) as usize,
        }
    }

    pub(crate) fn persist_motion_type(&self, store: &mut dyn PrefStore) {
        store.set_string(KEY_MOTION_TYPE, self.reference_motion.as_pref_str());
    }

    pub(crate) fn persist_rotation_multiplier(&self, store: &mut dyn PrefStore) {
        store.set_float(KEY_YAW_ROTATION, self.rotation_multiplier.yaw);
        store.set_float(KEY_PITCH_ROTATION, self.rotation_multiplier.pitch);
        store.set_float(KEY_ROLL_ROTATION, self.rotation_multiplier.roll);
    }

    pub(crate) fn persist_acceleration_multiplier(&self, store: &mut dyn PrefStore) {
        store.set_float(KEY_PITCH_ACCELERATION, self.acceleration_multiplier.pitch);
        store.set_float(KEY_ROLL_ACCELERATION, self.acceleration_multiplier.roll);
    }

    pub(crate) fn persist_lateral_force_multiplier(&self, store: &mut dyn PrefStore) {
        store.set_float(KEY_LATERAL_FORCE, self.lateral_force_multiplier);
    }

    pub(crate) fn persist_sample_size(&self, store: &mut dyn PrefStore) {
        store.set_int(KEY_SAMPLE_SIZE, self.sample_size as i32);
    }
}

/// Fixed-capacity circular sample buffer
///
/// The mean is recomputed over the full buffer each tick; untouched slots
/// hold the zero value, matching a freshly attached reference body.
#[derive(Debug, Clone)]
pub struct SampleWindow<T> {
    samples: Vec<T>,
    cursor: usize,
}

impl<T> SampleWindow<T>
where
    T: Copy + Default + Add<Output = T> + Div<f32, Output = T>,
{
    pub fn new(size: usize) -> Self {
        Self {
            samples: vec![T::default(); size.max(1)],
            cursor: 0,
        }
    }

    /// Overwrite the oldest slot and advance the cursor
    pub fn push(&mut self, sample: T) {
        self.samples[self.cursor] = sample;
        self.cursor = (self.cursor + 1) % self.samples.len();
    }

    /// Mean over the full buffer
    pub fn mean(&self) -> T {
        let sum = self
            .samples
            .iter()
            .fold(T::default(), |acc, &sample| acc + sample);
        sum / self.samples.len() as f32
    }

    /// Replace the buffer with a cleared one of the new size
    pub fn resize(&mut self, size: usize) {
        *self = Self::new(size);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Snapshot of the host physics body for one tick
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceBody {
    /// Euler orientation in unsigned-form degrees
    pub orientation: Rotation,
    /// Planar world-frame velocity (x = east, y = north), if the body has a
    /// rigid-body velocity this tick
    pub world_velocity: Option<Vec2>,
}

/// Sliding-window motion pipeline
#[derive(Debug)]
pub struct MotionPipeline {
    config: MotionConfig,
    reference_rotation: Rotation,
    reference_velocity: Vec2,
    reference_acceleration: Vec2,
    reference_turn_rate: f32,
    reference_lateral_force: f32,
    velocity_window: SampleWindow<Vec2>,
    acceleration_window: SampleWindow<Vec2>,
    lateral_force_window: SampleWindow<f32>,
    last_local_velocity: Option<Vec2>,
    last_world_velocity: Option<Vec2>,
}

impl MotionPipeline {
    pub fn new(config: MotionConfig) -> Self {
        let size = config.sample_size;
        Self {
            config,
            reference_rotation: Rotation::default(),
            reference_velocity: Vec2::default(),
            reference_acceleration: Vec2::default(),
            reference_turn_rate: 0.0,
            reference_lateral_force: 0.0,
            velocity_window: SampleWindow::new(size),
            acceleration_window: SampleWindow::new(size),
            lateral_force_window: SampleWindow::new(size),
            last_local_velocity: None,
            last_world_velocity: None,
        }
    }

    /// Process one fixed tick of body state
    ///
    /// `dt` is the fixed tick duration in seconds. Turn rate, acceleration,
    /// and lateral force need one tick of history and are first produced on
    /// the second velocity sample.
    pub fn process(&mut self, body: &ReferenceBody, dt: f32) {
        if self.config.reference_motion != ReferenceMotion::Acceleration {
            self.reference_rotation = body.orientation;
        }

        if self.config.reference_motion == ReferenceMotion::Rotation {
            return;
        }
        let Some(world_velocity) = body.world_velocity else {
            return;
        };

        // Body frame: x = lateral (right), y = forward. Yaw is clockwise
        // positive viewed from above, so rotating the world vector CCW by
        // the yaw angle lands it in the body frame.
        let local_velocity = world_velocity.rotated_degrees(signed_form(body.orientation.yaw));

        if let (Some(last_world), Some(last_local)) =
            (self.last_world_velocity, self.last_local_velocity)
        {
            self.reference_turn_rate = signed_angle(last_world, world_velocity) / dt;

            self.velocity_window.push(local_velocity);
            self.reference_velocity = self.velocity_window.mean();

            self.acceleration_window.push((local_velocity - last_local) / dt);
            self.reference_acceleration = self.acceleration_window.mean();

            self.lateral_force_window
                .push(self.reference_turn_rate * local_velocity.magnitude());
            self.reference_lateral_force = self.lateral_force_window.mean() * LATERAL_FORCE_SCALE;
        }

        self.last_local_velocity = Some(local_velocity);
        self.last_world_velocity = Some(world_velocity);
    }

    /// Target rotation for the current tick, in unsigned form and clamped
    /// to the hardware-agnostic safety band
    pub fn command_rotation(&self) -> Rotation {
        let multiplier = self.config.rotation_multiplier;
        let acceleration_multiplier = self.config.acceleration_multiplier;

        // Signed-form per-axis terms. In acceleration space, forward
        // acceleration (y) pitches the platform and lateral acceleration
        // (x) plus the turn-induced force rolls it.
        let rotation_yaw = signed_form(self.reference_rotation.yaw) * multiplier.yaw;
        let rotation_pitch = signed_form(self.reference_rotation.pitch) * multiplier.pitch;
        let rotation_roll = signed_form(self.reference_rotation.roll) * multiplier.roll;

        let acceleration_pitch = -self.reference_acceleration.y * acceleration_multiplier.pitch;
        let acceleration_roll = -(self.reference_acceleration.x * acceleration_multiplier.roll
            + self.reference_lateral_force * self.config.lateral_force_multiplier);

        let (yaw, pitch, roll) = match self.config.reference_motion {
            ReferenceMotion::Rotation => (rotation_yaw, rotation_pitch, rotation_roll),
            ReferenceMotion::Acceleration => (0.0, acceleration_pitch, acceleration_roll),
            ReferenceMotion::Mixed => (
                rotation_yaw,
                rotation_pitch + acceleration_pitch,
                rotation_roll + acceleration_roll,
            ),
        };

        Rotation {
            yaw: unsigned_form(yaw.clamp(-180.0, 180.0)),
            pitch: unsigned_form(pitch.clamp(-90.0, 90.0)),
            roll: unsigned_form(roll.clamp(-90.0, 90.0)),
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn reference_rotation(&self) -> Rotation {
        self.reference_rotation
    }

    pub fn reference_velocity(&self) -> Vec2 {
        self.reference_velocity
    }

    pub fn reference_acceleration(&self) -> Vec2 {
        self.reference_acceleration
    }

    pub fn reference_turn_rate(&self) -> f32 {
        self.reference_turn_rate
    }

    pub fn reference_lateral_force(&self) -> f32 {
        self.reference_lateral_force
    }

    pub(crate) fn set_reference_motion(&mut self, motion: ReferenceMotion) {
        self.config.reference_motion = motion;
    }

    pub(crate) fn set_rotation_multiplier(&mut self, yaw: f32, pitch: f32, roll: f32) {
        self.config.rotation_multiplier = RotationMultiplier { yaw, pitch, roll };
    }

    pub(crate) fn set_acceleration_multiplier(&mut self, pitch: f32, roll: f32) {
        self.config.acceleration_multiplier = AccelerationMultiplier { pitch, roll };
    }

    pub(crate) fn set_lateral_force_multiplier(&mut self, multiplier: f32) {
        self.config.lateral_force_multiplier = multiplier;
    }

    /// Change the sliding-window size, clearing all three windows
    ///
    /// Sizes below 1 are ignored.
    pub(crate) fn set_sample_size(&mut self, size: usize) -> bool {
        if size < 1 {
            return false;
        }
        self.config.sample_size = size;
        self.velocity_window.resize(size);
        self.acceleration_window.resize(size);
        self.lateral_force_window.resize(size);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::MemoryPrefStore;
    use approx::assert_relative_eq;

    #[test]
    fn test_sample_window_mean_over_full_buffer() {
        let mut window: SampleWindow<f32> = SampleWindow::new(4);
        window.push(4.0);
        assert_relative_eq!(window.mean(), 1.0); // 3 zero slots still count
        window.push(4.0);
        window.push(4.0);
        window.push(4.0);
        assert_relative_eq!(window.mean(), 4.0);
        window.push(8.0); // wraps, overwriting the oldest slot
        assert_relative_eq!(window.mean(), 5.0);
    }

    #[test]
    fn test_sample_window_resize_clears() {
        let mut window: SampleWindow<f32> = SampleWindow::new(2);
        window.push(10.0);
        window.resize(3);
        assert_eq!(window.len(), 3);
        assert_relative_eq!(window.mean(), 0.0);
    }

    #[test]
    fn test_rotation_mode_applies_multipliers_and_clamps() {
        let mut pipeline = MotionPipeline::new(MotionConfig::default());
        pipeline.process(
            &ReferenceBody {
                orientation: Rotation::new(350.0, 10.0, 0.0),
                world_velocity: None,
            },
            0.02,
        );
        let command = pipeline.command_rotation();
        // 350° -> signed -10° -> unsigned 350°; 10° passes through
        assert_relative_eq!(command.yaw, 350.0);
        assert_relative_eq!(command.pitch, 10.0);
        assert_relative_eq!(command.roll, 0.0);
    }

    #[test]
    fn test_rotation_mode_safety_clamp() {
        let config = MotionConfig {
            rotation_multiplier: RotationMultiplier { yaw: 2.0, pitch: 3.0, roll: 3.0 },
            ..MotionConfig::default()
        };
        let mut pipeline = MotionPipeline::new(config);
        pipeline.process(
            &ReferenceBody {
                orientation: Rotation::new(170.0, 40.0, 320.0),
                world_velocity: None,
            },
            0.02,
        );
        let command = pipeline.command_rotation();
        // 170*2=340 clamps to 180; 40*3=120 clamps to 90; -40*3=-120 clamps to -90
        assert_relative_eq!(command.yaw, 180.0);
        assert_relative_eq!(command.pitch, 90.0);
        assert_relative_eq!(command.roll, 270.0);
    }

    #[test]
    fn test_acceleration_needs_one_tick_of_history() {
        let config = MotionConfig {
            reference_motion: ReferenceMotion::Acceleration,
            ..MotionConfig::default()
        };
        let mut pipeline = MotionPipeline::new(config);
        let body = ReferenceBody {
            orientation: Rotation::default(),
            world_velocity: Some(Vec2::new(0.0, 5.0)),
        };
        pipeline.process(&body, 0.02);
        assert_eq!(pipeline.reference_acceleration(), Vec2::default());

        pipeline.process(&body, 0.02);
        // Constant velocity: acceleration stays zero, but windows now fill
        assert_eq!(pipeline.reference_acceleration(), Vec2::default());
        assert_relative_eq!(pipeline.reference_velocity().y, 1.0); // 5.0 in 1 of 5 slots
    }

    #[test]
    fn test_forward_braking_pitches_forward() {
        let config = MotionConfig {
            reference_motion: ReferenceMotion::Acceleration,
            sample_size: 1,
            ..MotionConfig::default()
        };
        let mut pipeline = MotionPipeline::new(config);
        let dt = 0.1;
        pipeline.process(
            &ReferenceBody {
                orientation: Rotation::default(),
                world_velocity: Some(Vec2::new(0.0, 10.0)),
            },
            dt,
        );
        pipeline.process(
            &ReferenceBody {
                orientation: Rotation::default(),
                world_velocity: Some(Vec2::new(0.0, 8.0)),
            },
            dt,
        );
        // Forward deceleration of 20 m/s² -> pitch +20° before clamping
        let command = pipeline.command_rotation();
        assert_relative_eq!(command.pitch, 20.0, epsilon = 1e-3);
        assert_relative_eq!(command.yaw, 0.0);
    }

    #[test]
    fn test_deterministic_for_fixed_input_sequence() {
        let run = || {
            let config = MotionConfig {
                reference_motion: ReferenceMotion::Mixed,
                sample_size: 3,
                ..MotionConfig::default()
            };
            let mut pipeline = MotionPipeline::new(config);
            let dt = 0.02;
            for i in 0..50 {
                let t = i as f32 * dt;
                let body = ReferenceBody {
                    orientation: Rotation::new((t * 40.0) % 360.0, 5.0, 1.0),
                    world_velocity: Some(Vec2::new(t.sin() * 3.0, 10.0 + t * 0.5)),
                };
                pipeline.process(&body, dt);
            }
            pipeline.command_rotation()
        };

        let first = run();
        let second = run();
        // Bit-for-bit identical across runs
        assert_eq!(first.yaw.to_bits(), second.yaw.to_bits());
        assert_eq!(first.pitch.to_bits(), second.pitch.to_bits());
        assert_eq!(first.roll.to_bits(), second.roll.to_bits());
    }

    #[test]
    fn test_config_load_defaults_and_roundtrip() {
        let mut store = MemoryPrefStore::new();
        let config = MotionConfig::load(&store);
        assert_eq!(config, MotionConfig::default());

        let saved = MotionConfig {
            reference_motion: ReferenceMotion::Mixed,
            rotation_multiplier: RotationMultiplier { yaw: 0.5, pitch: 0.25, roll: 2.0 },
            acceleration_multiplier: AccelerationMultiplier { pitch: 1.5, roll: 0.75 },
            lateral_force_multiplier: 3.0,
            sample_size: 9,
        };
        saved.persist_motion_type(&mut store);
        saved.persist_rotation_multiplier(&mut store);
        saved.persist_acceleration_multiplier(&mut store);
        saved.persist_lateral_force_multiplier(&mut store);
        saved.persist_sample_size(&mut store);

        assert_eq!(MotionConfig::load(&store), saved);
    }
}
