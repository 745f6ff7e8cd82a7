//! Differential track drive.
//!
//! Road wheels only carry the hull. Each track pushes along the hull's
//! forward axis; steering is the difference between the two.

use super::wheeled::suspension;
use super::ModelContext;
use crate::physics::PhysicsError;
use nalgebra::Vector3;
use shared::WheelState;

const YAW_DAMPING: f32 = 1.5;

/// Track commands in [-1, 1] for throttle and steering. Positive steering
/// drives the left track harder, turning right.
pub(super) fn track_mix(throttle: f32, steering: f32) -> (f32, f32) {
    (
        (throttle + steering).clamp(-1.0, 1.0),
        (throttle - steering).clamp(-1.0, 1.0),
    )
}

pub(super) fn update(ctx: &mut ModelContext) -> Result<Vec<WheelState>, PhysicsError> {
    let spec = ctx.spec;
    let mut total_load = 0.0;
    let mut normal = Vector3::zeros();
    for mount in &spec.mounts {
        if let Some(contact) = suspension(ctx, mount)? {
            total_load += contact.load;
            normal += contact.normal;
        }
    }
    if total_load <= 0.0 {
        return Ok(Vec::new());
    }
    let normal = normal.try_normalize(1.0e-6).unwrap_or_else(Vector3::y);

    let heading = ctx.kinematics.forward();
    let forward = (heading - normal * heading.dot(&normal))
        .try_normalize(1.0e-6)
        .unwrap_or(heading);
    let side = forward.cross(&normal);
    let traction = spec.grip * total_load;
    let mass = ctx.kinematics.mass;

    let (left, right) = if ctx.engine_running {
        track_mix(ctx.input.throttle, ctx.input.steering)
    } else {
        (0.0, 0.0)
    };
    let half_track = spec.half_extents.x;
    let track_force = spec.engine_force * 0.5;
    let left_point = ctx.kinematics.to_world(Vector3::new(-half_track, -spec.half_extents.y, 0.0));
    let right_point = ctx.kinematics.to_world(Vector3::new(half_track, -spec.half_extents.y, 0.0));
    ctx.physics
        .add_force_at_point(ctx.body, forward * (left * track_force), left_point)?;
    ctx.physics
        .add_force_at_point(ctx.body, forward * (right * track_force), right_point)?;

    // Tracks resist sliding sideways and rolling freely, but not pivoting.
    let velocity = ctx.kinematics.linvel;
    let lateral = (-velocity.dot(&side) * mass / ctx.dt).clamp(-traction, traction);
    let brake = if ctx.input.handbrake {
        1.0
    } else {
        ctx.input.brake
    };
    let v_long = velocity.dot(&forward);
    let braking = (-v_long.signum() * brake * spec.brake_force * (v_long.abs() / 0.5).min(1.0))
        .clamp(-traction, traction);
    ctx.physics
        .add_force(ctx.body, side * lateral + forward * braking)?;

    let yaw_rate = ctx.kinematics.angvel.dot(&normal);
    ctx.physics
        .add_torque(ctx.body, -normal * yaw_rate * mass * YAW_DAMPING)?;
    Ok(Vec::new())
}
