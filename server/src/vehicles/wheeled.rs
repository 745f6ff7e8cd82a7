//! Raycast suspension and tyre forces for cars, trucks and motorcycles.

use super::spec::WheelMount;
use super::ModelContext;
use crate::physics::PhysicsError;
use nalgebra::Vector3;
use shared::WheelState;

/// Below this longitudinal speed brakes fade out instead of reversing the car.
const BRAKE_FADE_SPEED: f32 = 0.5;
const REVERSE_POWER: f32 = 0.5;
const HANDBRAKE_REAR_GRIP: f32 = 0.4;

/// Ground contact of one wheel after its spring force was applied.
#[derive(Debug, Clone, Copy)]
pub(super) struct Contact {
    pub point: Vector3<f32>,
    pub normal: Vector3<f32>,
    pub compression: f32,
    /// Spring plus damper force along the body's up axis, N.
    pub load: f32,
}

/// Spring plus damper, damper clamped to a share of the spring so rebound can
/// never pull the wheel into the ground.
pub(super) fn spring_damper(compression: f32, velocity: f32, stiffness: f32, damping: f32) -> f32 {
    let velocity = if velocity.abs() < 0.05 { 0.0 } else { velocity };
    let spring = stiffness * compression;
    let damper = (-damping * velocity).clamp(-spring * 0.6, spring * 0.6);
    (spring + damper).max(0.0)
}

/// Casts along the body's down axis from `mount` and pushes the chassis up
/// with the resulting suspension force.
pub(super) fn suspension(
    ctx: &mut ModelContext,
    mount: &WheelMount,
) -> Result<Option<Contact>, PhysicsError> {
    let s = ctx.spec.suspension;
    let up = ctx.kinematics.up();
    let origin = ctx.kinematics.to_world(mount.offset);
    let reach = s.rest_length + s.wheel_radius;

    let Some(hit) = ctx.physics.raycast(origin, -up, reach, Some(ctx.body)) else {
        return Ok(None);
    };
    let compression = (reach - hit.distance).clamp(0.0, s.travel);
    let velocity = ctx.kinematics.velocity_at(origin).dot(&up);
    let load = spring_damper(compression, velocity, s.stiffness, s.damping);
    if load > 0.0 {
        ctx.physics.add_force_at_point(ctx.body, up * load, origin)?;
    }

    Ok(Some(Contact {
        point: hit.point,
        normal: hit.normal,
        compression,
        load,
    }))
}

/// Forward and sideways unit vectors of a wheel, flattened onto the ground.
fn wheel_basis(
    ctx: &ModelContext,
    steer_angle: f32,
    normal: Vector3<f32>,
) -> (Vector3<f32>, Vector3<f32>) {
    let local = Vector3::new(steer_angle.sin(), 0.0, -steer_angle.cos());
    let heading = ctx.kinematics.rotation * local;
    let forward = (heading - normal * heading.dot(&normal))
        .try_normalize(1.0e-6)
        .unwrap_or(heading);
    let side = forward.cross(&normal);
    (forward, side)
}

pub(super) fn update(
    ctx: &mut ModelContext,
    steer_angle: &mut f32,
) -> Result<Vec<WheelState>, PhysicsError> {
    let spec = ctx.spec;
    let target = ctx.input.steering * spec.max_steer_angle;
    let max_step = spec.steer_rate * ctx.dt;
    *steer_angle += (target - *steer_angle).clamp(-max_step, max_step);

    let wheel_count = spec.mounts.len().max(1) as f32;
    let driven = spec.mounts.iter().filter(|m| m.driven).count().max(1) as f32;
    let mass_share = ctx.kinematics.mass / wheel_count;
    let throttle = if ctx.engine_running {
        ctx.input.throttle
    } else {
        0.0
    };
    let throttle = if throttle < 0.0 {
        throttle * REVERSE_POWER
    } else {
        throttle
    };
    let brake = if ctx.input.handbrake {
        1.0
    } else {
        ctx.input.brake
    };

    let mut wheels = Vec::with_capacity(spec.mounts.len());
    for mount in &spec.mounts {
        let angle = if mount.steered { *steer_angle } else { 0.0 };
        let Some(contact) = suspension(ctx, mount)? else {
            wheels.push(WheelState {
                contact: false,
                steer_angle: angle,
                compression: 0.0,
            });
            continue;
        };

        let (forward, side) = wheel_basis(ctx, angle, contact.normal);
        let velocity = ctx.kinematics.velocity_at(contact.point);
        let v_long = velocity.dot(&forward);
        let v_lat = velocity.dot(&side);

        let mut grip = spec.grip;
        if ctx.input.handbrake && !mount.steered {
            grip *= HANDBRAKE_REAR_GRIP;
        }
        let traction = grip * contact.load;

        let mut longitudinal = 0.0;
        if mount.driven {
            longitudinal += throttle * spec.engine_force / driven;
        }
        if brake > 0.0 {
            let fade = (v_long.abs() / BRAKE_FADE_SPEED).min(1.0);
            longitudinal -= v_long.signum() * brake * spec.brake_force / wheel_count * fade;
        }
        let longitudinal = longitudinal.clamp(-traction, traction);
        let lateral = (-v_lat * mass_share / ctx.dt).clamp(-traction, traction);

        ctx.physics
            .add_force_at_point(ctx.body, forward * longitudinal + side * lateral, contact.point)?;
        wheels.push(WheelState {
            contact: true,
            steer_angle: angle,
            compression: contact.compression,
        });
    }

    if spec.mounts.len() == 2 {
        keep_upright(ctx)?;
    }
    Ok(wheels)
}

/// Two wheels in a line cannot stand on their own; a righting torque plays
/// the rider's balance.
fn keep_upright(ctx: &mut ModelContext) -> Result<(), PhysicsError> {
    let mass = ctx.kinematics.mass;
    let tilt = ctx.kinematics.up().cross(&Vector3::y());
    let forward = ctx.kinematics.forward();
    let roll_rate = ctx.kinematics.angvel.dot(&forward);
    let torque = tilt * mass * 60.0 - forward * roll_rate * mass * 8.0;
    ctx.physics.add_torque(ctx.body, torque)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_spring_damper_never_pulls() {
        assert_eq!(spring_damper(0.0, 3.0, 30000.0, 3000.0), 0.0);
        assert_approx_eq!(spring_damper(0.1, 0.0, 30000.0, 3000.0), 3000.0, 0.01);
        // Fast rebound is capped at 60% of the spring.
        assert_approx_eq!(spring_damper(0.1, 10.0, 30000.0, 3000.0), 1200.0, 0.01);
        // Fast compression stiffens by at most 60%.
        assert_approx_eq!(spring_damper(0.1, -10.0, 30000.0, 3000.0), 4800.0, 0.01);
    }

    #[test]
    fn test_spring_damper_ignores_jitter() {
        assert_eq!(
            spring_damper(0.05, 0.01, 20000.0, 5000.0),
            spring_damper(0.05, 0.0, 20000.0, 5000.0)
        );
    }
}
