//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! It avoids SIMD/unsafe and focuses on stable semantics.

use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

/// 2D vector. Used for entity positions and velocities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn len(self) -> f32 {
        self.len_sq().sqrt()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Linear blend towards `to`. `t` is clamped to $[0,1]$.
    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(self.x + (to.x - self.x) * t, self.y + (to.y - self.y) * t)
    }

    /// Returns `self` shortened to at most `max_len`.
    pub fn clamp_len(self, max_len: f32) -> Self {
        let len_sq = self.len_sq();
        if len_sq > max_len * max_len && len_sq > 0.0 {
            self * (max_len / len_sq.sqrt())
        } else {
            self
        }
    }
}

impl Add for Vec2 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

/// Critically damped approach of `current` towards `target`.
///
/// `velocity` is carried between calls by the caller. `smooth_time` is roughly
/// the time (seconds) to reach the target; `max_speed` bounds how fast the
/// value may move (units/second). Never overshoots the target.
pub fn smooth_damp(
    current: Vec2,
    target: Vec2,
    velocity: &mut Vec2,
    smooth_time: f32,
    max_speed: f32,
    dt: f32,
) -> Vec2 {
    if dt <= 0.0 {
        return current;
    }
    let smooth_time = smooth_time.max(1.0e-4);
    let omega = 2.0 / smooth_time;
    let x = omega * dt;
    let exp = 1.0 / (1.0 + x + 0.48 * x * x + 0.235 * x * x * x);

    let max_change = max_speed * smooth_time;
    let change = (current - target).clamp_len(max_change);
    let clamped_target = current - change;

    let temp = (*velocity + change * omega) * dt;
    *velocity = (*velocity - temp * omega) * exp;
    let mut output = clamped_target + (change + temp) * exp;

    // Stop exactly on the target rather than passing it.
    let to_target = target - current;
    let past = output - target;
    if to_target.dot(past) > 0.0 {
        output = target;
        *velocity = (output - target) * (1.0 / dt);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec2_lerp_midpoint() {
        let a = Vec2::new(0.0, 0.0);
        let b = Vec2::new(2.0, 4.0);
        assert_eq!(a.lerp(b, 0.5), Vec2::new(1.0, 2.0));
    }

    #[test]
    fn lerp_clamps_fraction() {
        let a = Vec2::new(0.0, 0.0);
        let b = Vec2::new(1.0, 1.0);
        assert_eq!(a.lerp(b, 7.0), b);
        assert_eq!(a.lerp(b, -3.0), a);
    }

    #[test]
    fn smooth_damp_converges_without_overshoot() {
        let target = Vec2::new(10.0, 0.0);
        let mut pos = Vec2::ZERO;
        let mut vel = Vec2::ZERO;
        for _ in 0..600 {
            pos = smooth_damp(pos, target, &mut vel, 0.1, 1000.0, 1.0 / 60.0);
            assert!(pos.x <= 10.0 + 1e-4, "overshot: {pos:?}");
        }
        assert!((pos.x - 10.0).abs() < 1e-3);
    }

    #[test]
    fn smooth_damp_respects_max_speed() {
        let mut vel = Vec2::ZERO;
        let pos = smooth_damp(Vec2::ZERO, Vec2::new(1000.0, 0.0), &mut vel, 0.1, 5.0, 0.1);
        // Max change per step is bounded by max_speed * smooth_time.
        assert!(pos.x <= 0.5 + 1e-4, "moved too far: {pos:?}");
    }
}
