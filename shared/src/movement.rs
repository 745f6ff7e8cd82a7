//! Player movement rules.
//!
//! The server applies [`apply_movement`] to a player's rigid body every tick and
//! clients run the same function for prediction, followed by [`integrate`] in
//! place of the physics step. Any change here changes both sides at once.

use crate::protocol::PlayerInput;
use crate::{GRAVITY, GROUND_PROBE_DISTANCE, PLAYER_HALF_HEIGHT};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementTuning {
    pub walk_speed: f32,
    pub run_speed: f32,
    pub crouch_speed: f32,
    /// Horizontal acceleration on the ground, m/s².
    pub ground_acceleration: f32,
    /// Fraction of ground acceleration available while airborne.
    pub air_control: f32,
    pub jump_speed: f32,
    pub max_stamina: f32,
    /// Stamina per second spent while running.
    pub stamina_drain: f32,
    /// Stamina per second recovered otherwise.
    pub stamina_regen: f32,
    pub gravity: f32,
}

impl Default for MovementTuning {
    fn default() -> Self {
        Self {
            walk_speed: 5.0,
            run_speed: 9.0,
            crouch_speed: 2.5,
            ground_acceleration: 40.0,
            air_control: 0.3,
            jump_speed: 6.5,
            max_stamina: 100.0,
            stamina_drain: 20.0,
            stamina_regen: 12.0,
            gravity: GRAVITY,
        }
    }
}

/// Kinematic state of a player body as movement sees it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionState {
    pub position: Vector3<f32>,
    pub velocity: Vector3<f32>,
    pub grounded: bool,
    pub stamina: f32,
}

impl MotionState {
    pub fn at(position: Vector3<f32>, stamina: f32) -> Self {
        Self {
            position,
            velocity: Vector3::zeros(),
            grounded: false,
            stamina,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MovementOutcome {
    pub jumped: bool,
    pub jump_rejected: bool,
    pub running: bool,
}

/// Forward and right unit vectors on the ground plane for a yaw.
///
/// Yaw zero faces -Z, positive yaw turns toward -X.
pub fn movement_basis(yaw: f32) -> (Vector3<f32>, Vector3<f32>) {
    let (sin, cos) = yaw.sin_cos();
    let forward = Vector3::new(-sin, 0.0, -cos);
    let right = Vector3::new(cos, 0.0, -sin);
    (forward, right)
}

/// Input projected onto the movement basis, magnitude at most one.
pub fn wish_direction(input: &PlayerInput) -> Vector3<f32> {
    let (forward, right) = movement_basis(input.yaw);
    let wish = forward * input.forward + right * input.right;
    let magnitude = wish.norm();
    if magnitude > 1.0 {
        wish / magnitude
    } else {
        wish
    }
}

pub fn target_speed(tuning: &MovementTuning, input: &PlayerInput, stamina: f32) -> f32 {
    if input.crouch {
        tuning.crouch_speed
    } else if input.run && stamina > 0.0 {
        tuning.run_speed
    } else {
        tuning.walk_speed
    }
}

/// Applies one input to velocity and stamina. Position is left to the caller's
/// integrator.
pub fn apply_movement(
    state: &mut MotionState,
    input: &PlayerInput,
    tuning: &MovementTuning,
    dt: f32,
) -> MovementOutcome {
    let mut outcome = MovementOutcome::default();
    let wish = wish_direction(input);
    let target = wish * target_speed(tuning, input, state.stamina);

    let accel = if state.grounded {
        tuning.ground_acceleration
    } else {
        tuning.ground_acceleration * tuning.air_control
    };
    let current = Vector3::new(state.velocity.x, 0.0, state.velocity.z);
    let delta = target - current;
    let max_change = accel * dt;
    let change = if delta.norm() > max_change {
        delta.normalize() * max_change
    } else {
        delta
    };
    state.velocity.x += change.x;
    state.velocity.z += change.z;

    if input.jump {
        if state.grounded && !input.crouch {
            state.velocity.y = tuning.jump_speed;
            state.grounded = false;
            outcome.jumped = true;
        } else {
            outcome.jump_rejected = true;
        }
    }

    let moving = input.has_movement() && current.norm() > 0.1;
    outcome.running = input.run && !input.crouch && moving && state.stamina > 0.0;
    if outcome.running {
        state.stamina -= tuning.stamina_drain * dt;
    } else {
        state.stamina += tuning.stamina_regen * dt;
    }
    state.stamina = state.stamina.clamp(0.0, tuning.max_stamina);

    outcome
}

/// Advances position under gravity and resolves contact with the ground below.
///
/// `ground_height` is the terrain height at the new horizontal position.
pub fn integrate(state: &mut MotionState, tuning: &MovementTuning, ground_height: f32, dt: f32) {
    let was_grounded = state.grounded;
    if !state.grounded || state.velocity.y > 0.0 {
        state.velocity.y += tuning.gravity * dt;
    }
    state.position += state.velocity * dt;

    let floor = ground_height + PLAYER_HALF_HEIGHT;
    let clearance = state.position.y - floor;
    if clearance <= 0.0 {
        state.position.y = floor;
        state.velocity.y = state.velocity.y.max(0.0);
        state.grounded = state.velocity.y <= 0.0;
    } else if was_grounded && state.velocity.y <= 0.0 && clearance <= GROUND_PROBE_DISTANCE {
        state.position.y = floor;
        state.velocity.y = 0.0;
        state.grounded = true;
    } else {
        state.grounded = false;
    }
}

/// One full prediction step: movement, then integration against the terrain.
pub fn step<H>(
    state: &mut MotionState,
    input: &PlayerInput,
    tuning: &MovementTuning,
    ground_height: H,
    dt: f32,
) -> MovementOutcome
where
    H: Fn(f32, f32) -> f32,
{
    let outcome = apply_movement(state, input, tuning, dt);
    let next_x = state.position.x + state.velocity.x * dt;
    let next_z = state.position.z + state.velocity.z * dt;
    integrate(state, tuning, ground_height(next_x, next_z), dt);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn grounded_state() -> MotionState {
        MotionState {
            position: Vector3::new(0.0, PLAYER_HALF_HEIGHT, 0.0),
            velocity: Vector3::zeros(),
            grounded: true,
            stamina: 100.0,
        }
    }

    #[test]
    fn test_basis_is_orthonormal() {
        for yaw in [0.0_f32, 0.3, 1.7, -2.4] {
            let (forward, right) = movement_basis(yaw);
            assert_approx_eq!(forward.norm(), 1.0, 1e-6);
            assert_approx_eq!(right.norm(), 1.0, 1e-6);
            assert_approx_eq!(forward.dot(&right), 0.0, 1e-6);
        }
        let (forward, right) = movement_basis(0.0);
        assert_eq!(forward, Vector3::new(0.0, 0.0, -1.0));
        assert_eq!(right, Vector3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_diagonal_input_is_clamped() {
        let input = PlayerInput {
            forward: 1.0,
            right: 1.0,
            ..PlayerInput::default()
        };
        assert_approx_eq!(wish_direction(&input).norm(), 1.0, 1e-6);
    }

    #[test]
    fn test_speed_table() {
        let tuning = MovementTuning::default();
        let mut input = PlayerInput::default();
        assert_eq!(target_speed(&tuning, &input, 50.0), tuning.walk_speed);
        input.run = true;
        assert_eq!(target_speed(&tuning, &input, 50.0), tuning.run_speed);
        assert_eq!(target_speed(&tuning, &input, 0.0), tuning.walk_speed);
        input.crouch = true;
        assert_eq!(target_speed(&tuning, &input, 50.0), tuning.crouch_speed);
    }

    #[test]
    fn test_acceleration_is_bounded_per_step() {
        let tuning = MovementTuning::default();
        let mut state = grounded_state();
        let input = PlayerInput {
            forward: 1.0,
            ..PlayerInput::default()
        };
        let dt = 1.0 / 60.0;
        apply_movement(&mut state, &input, &tuning, dt);
        assert_approx_eq!(state.velocity.z, -tuning.ground_acceleration * dt, 1e-5);
    }

    #[test]
    fn test_air_control_is_reduced() {
        let tuning = MovementTuning::default();
        let mut state = grounded_state();
        state.grounded = false;
        let input = PlayerInput {
            right: 1.0,
            ..PlayerInput::default()
        };
        let dt = 1.0 / 60.0;
        apply_movement(&mut state, &input, &tuning, dt);
        assert_approx_eq!(
            state.velocity.x,
            tuning.ground_acceleration * tuning.air_control * dt,
            1e-5
        );
    }

    #[test]
    fn test_jump_only_when_grounded_and_standing() {
        let tuning = MovementTuning::default();
        let jump = PlayerInput {
            jump: true,
            ..PlayerInput::default()
        };

        let mut state = grounded_state();
        let outcome = apply_movement(&mut state, &jump, &tuning, 1.0 / 60.0);
        assert!(outcome.jumped);
        assert_eq!(state.velocity.y, tuning.jump_speed);

        let mut airborne = grounded_state();
        airborne.grounded = false;
        airborne.velocity.y = -2.0;
        let outcome = apply_movement(&mut airborne, &jump, &tuning, 1.0 / 60.0);
        assert!(outcome.jump_rejected);
        assert_eq!(airborne.velocity.y, -2.0);

        let crouch_jump = PlayerInput {
            jump: true,
            crouch: true,
            ..PlayerInput::default()
        };
        let mut crouched = grounded_state();
        let outcome = apply_movement(&mut crouched, &crouch_jump, &tuning, 1.0 / 60.0);
        assert!(outcome.jump_rejected);
        assert_eq!(crouched.velocity.y, 0.0);
    }

    #[test]
    fn test_stamina_drains_only_while_moving() {
        let tuning = MovementTuning::default();
        let dt = 0.1;
        let mut state = grounded_state();
        state.stamina = 50.0;
        let standing_run = PlayerInput {
            run: true,
            ..PlayerInput::default()
        };
        apply_movement(&mut state, &standing_run, &tuning, dt);
        assert!(state.stamina > 50.0);

        state.velocity = Vector3::new(0.0, 0.0, -5.0);
        let stamina_before = state.stamina;
        let running = PlayerInput {
            run: true,
            forward: 1.0,
            ..PlayerInput::default()
        };
        let outcome = apply_movement(&mut state, &running, &tuning, dt);
        assert!(outcome.running);
        assert_approx_eq!(state.stamina, stamina_before - tuning.stamina_drain * dt, 1e-4);
    }

    #[test]
    fn test_stamina_is_clamped() {
        let tuning = MovementTuning::default();
        let mut state = grounded_state();
        state.stamina = tuning.max_stamina;
        apply_movement(&mut state, &PlayerInput::default(), &tuning, 5.0);
        assert_eq!(state.stamina, tuning.max_stamina);

        state.stamina = 0.5;
        state.velocity = Vector3::new(0.0, 0.0, -5.0);
        let running = PlayerInput {
            run: true,
            forward: 1.0,
            ..PlayerInput::default()
        };
        apply_movement(&mut state, &running, &tuning, 5.0);
        assert_eq!(state.stamina, 0.0);
    }

    #[test]
    fn test_integrate_lands_on_ground() {
        let tuning = MovementTuning::default();
        let mut state = grounded_state();
        state.grounded = false;
        state.position.y = 3.0;
        for _ in 0..240 {
            integrate(&mut state, &tuning, 0.0, 1.0 / 60.0);
        }
        assert!(state.grounded);
        assert_approx_eq!(state.position.y, PLAYER_HALF_HEIGHT, 1e-6);
        assert_eq!(state.velocity.y, 0.0);
    }

    #[test]
    fn test_step_is_deterministic() {
        let tuning = MovementTuning::default();
        let input = PlayerInput {
            forward: 0.8,
            right: -0.3,
            run: true,
            yaw: 0.4,
            ..PlayerInput::default()
        };
        let ground = |x: f32, z: f32| (x * 0.1).sin() + (z * 0.05).cos();
        let mut a = grounded_state();
        let mut b = grounded_state();
        for _ in 0..120 {
            step(&mut a, &input, &tuning, ground, 1.0 / 60.0);
            step(&mut b, &input, &tuning, ground, 1.0 / 60.0);
        }
        assert_eq!(a, b);
    }
}
