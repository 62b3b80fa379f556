//! Point-to-point steering used by `move-to` instructions.

use std::f32::consts::{PI, TAU};

use bevy::math::Vec2;
use serde::{Deserialize, Serialize};

/// Position plus heading (radians, counter-clockwise from +x).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec2,
    pub orientation: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SteeringCommand {
    /// Radians per second.
    pub angular_velocity: f32,
    /// World-space units per second.
    pub linear_velocity: Vec2,
}

impl SteeringCommand {
    pub const IDLE: Self = Self {
        angular_velocity: 0.0,
        linear_velocity: Vec2::ZERO,
    };
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NavigatorConfig {
    /// Distance at which the target counts as reached.
    pub arrival_radius: f32,
    /// Speed ramps down linearly inside this distance.
    pub slowing_radius: f32,
    pub turn_gain: f32,
    /// Radians per second.
    pub max_turn_rate: f32,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            arrival_radius: 4.0,
            slowing_radius: 40.0,
            turn_gain: 3.0,
            max_turn_rate: PI,
        }
    }
}

/// Stateless steering controller.
#[derive(Debug, Clone, Default)]
pub struct Navigator {
    config: NavigatorConfig,
}

impl Navigator {
    pub fn new(config: NavigatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NavigatorConfig {
        &self.config
    }

    /// Steers from `pose` towards `target`, never exceeding `max_speed`.
    ///
    /// Linear velocity always points straight at the target so every step
    /// shortens the distance; angular velocity turns the body to face it.
    pub fn steer_towards(&self, pose: Pose, target: Vec2, max_speed: f32) -> SteeringCommand {
        let offset = target - pose.position;
        let distance = offset.length();
        if !distance.is_finite() || distance <= self.config.arrival_radius {
            return SteeringCommand::IDLE;
        }

        let heading = offset.y.atan2(offset.x);
        let error = wrap_angle(heading - pose.orientation);
        let max_turn = self.config.max_turn_rate.abs();
        let angular_velocity = (error * self.config.turn_gain).clamp(-max_turn, max_turn);

        let ramp = if self.config.slowing_radius > 0.0 {
            (distance / self.config.slowing_radius).min(1.0)
        } else {
            1.0
        };
        let max_speed = if max_speed.is_finite() { max_speed.max(0.0) } else { 0.0 };
        let speed = max_speed * ramp;

        SteeringCommand {
            angular_velocity,
            linear_velocity: offset / distance * speed,
        }
    }
}

/// Wraps an angle into `(-PI, PI]`.
pub fn wrap_angle(angle: f32) -> f32 {
    if !angle.is_finite() {
        return 0.0;
    }
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steering_points_at_target_and_caps_speed() {
        let navigator = Navigator::default();
        let pose = Pose {
            position: Vec2::ZERO,
            orientation: 0.0,
        };
        let command = navigator.steer_towards(pose, Vec2::new(100.0, 0.0), 50.0);
        assert!((command.linear_velocity.x - 50.0).abs() < 1e-4);
        assert!(command.linear_velocity.y.abs() < 1e-4);
        assert!(command.angular_velocity.abs() < 1e-4);
    }

    #[test]
    fn steering_turns_towards_target_behind() {
        let navigator = Navigator::default();
        let pose = Pose {
            position: Vec2::ZERO,
            orientation: 0.0,
        };
        let command = navigator.steer_towards(pose, Vec2::new(0.0, 100.0), 50.0);
        assert!(command.angular_velocity > 0.0);
        assert!(command.angular_velocity <= PI + 1e-4);
    }

    #[test]
    fn steering_stops_inside_arrival_radius() {
        let navigator = Navigator::default();
        let pose = Pose {
            position: Vec2::new(10.0, 10.0),
            orientation: 1.0,
        };
        assert_eq!(
            navigator.steer_towards(pose, Vec2::new(11.0, 10.0), 80.0),
            SteeringCommand::IDLE
        );
    }

    #[test]
    fn speed_ramps_down_near_target() {
        let navigator = Navigator::default();
        let pose = Pose::default();
        let near = navigator.steer_towards(pose, Vec2::new(20.0, 0.0), 80.0);
        assert!((near.linear_velocity.length() - 40.0).abs() < 1e-3);
    }

    #[test]
    fn wrap_angle_stays_in_half_open_range() {
        assert!((wrap_angle(3.0 * PI) - PI).abs() < 1e-4);
        assert!((wrap_angle(-PI / 2.0) + PI / 2.0).abs() < 1e-6);
        assert_eq!(wrap_angle(f32::NAN), 0.0);
    }
}
