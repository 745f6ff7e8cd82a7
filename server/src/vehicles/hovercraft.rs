//! Height-seeking skirt springs and a thrust fan.

use super::ModelContext;
use crate::physics::PhysicsError;
use nalgebra::Vector3;
use shared::WheelState;

const UPRIGHT: f32 = 20.0;
const YAW_DAMPING: f32 = 0.8;

/// Upward force of one skirt corner hovering `distance` above the ground.
pub(super) fn skirt_force(
    distance: f32,
    target: f32,
    vertical_speed: f32,
    stiffness: f32,
    damping: f32,
) -> f32 {
    (stiffness * (target - distance) - damping * vertical_speed).max(0.0)
}

pub(super) fn update(ctx: &mut ModelContext) -> Result<Vec<WheelState>, PhysicsError> {
    if !ctx.engine_running {
        return Ok(Vec::new());
    }
    let spec = ctx.spec;
    let k = ctx.kinematics;
    let s = spec.suspension;

    for mount in &spec.mounts {
        let origin = k.to_world(mount.offset);
        let Some(hit) = ctx
            .physics
            .raycast(origin, -Vector3::y(), spec.hover_height * 2.5, Some(ctx.body))
        else {
            continue;
        };
        let vertical = k.velocity_at(origin).y;
        let force = skirt_force(hit.distance, spec.hover_height, vertical, s.stiffness, s.damping);
        if force > 0.0 {
            ctx.physics
                .add_force_at_point(ctx.body, Vector3::y() * force, origin)?;
        }
    }

    let mass = k.mass;
    let heading = k.forward();
    let forward = Vector3::new(heading.x, 0.0, heading.z)
        .try_normalize(1.0e-6)
        .unwrap_or_else(|| Vector3::new(0.0, 0.0, -1.0));
    let side = forward.cross(&Vector3::y());
    let slip = -side * k.linvel.dot(&side) * spec.grip * mass;
    let thrust = forward * ctx.input.throttle * spec.engine_force;
    ctx.physics.add_force(ctx.body, thrust + slip)?;

    let steer = Vector3::y() * (-ctx.input.steering * spec.turn_torque);
    let yaw_damping = -Vector3::y() * k.angvel.y * mass * YAW_DAMPING;
    let upright = k.up().cross(&Vector3::y()) * UPRIGHT * mass;
    ctx.physics
        .add_torque(ctx.body, steer + yaw_damping + upright)?;
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skirt_pushes_only_below_target() {
        assert!(skirt_force(0.5, 1.2, 0.0, 30000.0, 4000.0) > 0.0);
        assert_eq!(skirt_force(2.0, 1.2, 0.0, 30000.0, 4000.0), 0.0);
    }

    #[test]
    fn test_skirt_damps_descent() {
        let rising = skirt_force(1.0, 1.2, 1.0, 30000.0, 4000.0);
        let falling = skirt_force(1.0, 1.2, -1.0, 30000.0, 4000.0);
        assert!(falling > rising);
    }
}
