//! Small math types shared across the motion pipeline and protocol layers.
//!
//! All angles are degrees. A platform rotation exists in two equivalent
//! representations:
//! - **unsigned form**: `[0, 360)`, used on the wire and for captured Euler angles
//! - **signed form**: `(-180, 180]`, used for multiplier and clamping math

use std::ops::{Add, Div, Mul, Sub};

/// 2D vector for planar velocity / acceleration values
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean length
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Rotate counter-clockwise by `degrees`
    pub fn rotated_degrees(&self, degrees: f32) -> Vec2 {
        let rad = degrees.to_radians();
        let (sin, cos) = rad.sin_cos();
        Vec2 {
            x: self.x * cos - self.y * sin,
            y: self.x * sin + self.y * cos,
        }
    }
}

/// Signed angle in degrees from `from` to `to`, counter-clockwise positive
pub fn signed_angle(from: Vec2, to: Vec2) -> f32 {
    let cross = from.x * to.y - from.y * to.x;
    let dot = from.x * to.x + from.y * to.y;
    cross.atan2(dot).to_degrees()
}

impl Add for Vec2 {
    type Output = Vec2;
    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;
    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Vec2;
    fn mul(self, rhs: f32) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

impl Div<f32> for Vec2 {
    type Output = Vec2;
    fn div(self, rhs: f32) -> Vec2 {
        Vec2::new(self.x / rhs, self.y / rhs)
    }
}

/// Three-axis platform rotation in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rotation {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

impl Rotation {
    pub fn new(yaw: f32, pitch: f32, roll: f32) -> Self {
        Self { yaw, pitch, roll }
    }
}

/// Map an unsigned-form angle `[0, 360)` to signed form `(-180, 180]`
pub fn signed_form(angle: f32) -> f32 {
    if angle >= 180.0 { angle - 360.0 } else { angle }
}

/// Map a signed-form angle back to unsigned form `[0, 360)`
pub fn unsigned_form(angle: f32) -> f32 {
    if angle < 0.0 { 360.0 + angle } else { angle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_signed_unsigned_roundtrip() {
        for angle in [0.0f32, 10.0, 90.0, 179.99, 180.0, 270.0, 350.0, 359.9] {
            let roundtrip = unsigned_form(signed_form(angle));
            assert_relative_eq!(roundtrip.rem_euclid(360.0), angle.rem_euclid(360.0), epsilon = 1e-4);
        }
    }

    #[test]
    fn test_signed_form_boundaries() {
        assert_eq!(signed_form(0.0), 0.0);
        assert_eq!(signed_form(180.0), -180.0);
        assert_eq!(signed_form(179.9999), 179.9999);
        assert_eq!(signed_form(350.0), -10.0);
        assert_eq!(unsigned_form(-10.0), 350.0);
        assert_eq!(unsigned_form(10.0), 10.0);
    }

    #[test]
    fn test_signed_angle() {
        let east = Vec2::new(1.0, 0.0);
        let north = Vec2::new(0.0, 1.0);
        assert_relative_eq!(signed_angle(east, north), 90.0, epsilon = 1e-4);
        assert_relative_eq!(signed_angle(north, east), -90.0, epsilon = 1e-4);
    }

    #[test]
    fn test_rotated_degrees() {
        let v = Vec2::new(1.0, 0.0).rotated_degrees(90.0);
        assert_relative_eq!(v.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(v.y, 1.0, epsilon = 1e-6);
    }
}
