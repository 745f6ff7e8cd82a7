//! Collective lift and cyclic attitude control.

use super::ModelContext;
use crate::physics::PhysicsError;
use nalgebra::Vector3;
use shared::terrain::safe_ground_height;
use shared::WheelState;

/// Share of hover thrust added or removed at full collective.
const COLLECTIVE_AUTHORITY: f32 = 0.6;
const CYCLIC_TORQUE: f32 = 4.0;
const LEVELING: f32 = 8.0;
const ANGULAR_DRAG: f32 = 3.0;
const LINEAR_DRAG: f32 = 0.4;
/// Spring pulling the airframe back above its terrain floor, per kg.
const FLOOR_SPRING: f32 = 6.0;

/// Lift in multiples of the aircraft's weight for a given collective and
/// altitude.
pub(super) fn lift_factor(collective: f32, altitude: f32, floor: f32, ceiling: f32) -> f32 {
    let mut factor = 1.0 + collective * COLLECTIVE_AUTHORITY;
    if altitude >= ceiling {
        factor = factor.min(1.0 - COLLECTIVE_AUTHORITY * 0.5);
    }
    if altitude < floor {
        factor = factor.max(1.0) + (floor - altitude) * FLOOR_SPRING / 9.81;
    }
    factor.max(0.0)
}

pub(super) fn update(ctx: &mut ModelContext) -> Result<Vec<WheelState>, PhysicsError> {
    if !ctx.engine_running {
        return Ok(Vec::new());
    }
    let spec = ctx.spec;
    let controls = ctx.input.aircraft_or_neutral();
    let k = ctx.kinematics;
    let mass = k.mass;
    let weight = mass * ctx.gravity.abs();

    let ground = safe_ground_height(ctx.terrain, k.position.x, k.position.z);
    let floor = ground + spec.half_extents.y + spec.min_clearance;
    let factor = lift_factor(controls.collective, k.position.y, floor, spec.max_altitude);
    let up = k.up();
    // Tilted rotors still hold altitude; the horizontal part moves the aircraft.
    let lift = up * (weight * factor / up.y.max(0.5));

    let mut drag = -k.linvel * mass * LINEAR_DRAG;
    drag.y *= 0.5;
    ctx.physics.add_force(ctx.body, lift + drag)?;

    let right = k.right();
    let forward = k.forward();
    let cyclic = right * (-controls.pitch) * CYCLIC_TORQUE * mass
        + forward * controls.roll * CYCLIC_TORQUE * mass
        + up * (-controls.yaw) * spec.turn_torque;
    let leveling = up.cross(&Vector3::y()) * LEVELING * mass;
    let damping = -k.angvel * ANGULAR_DRAG * mass;
    ctx.physics.add_torque(ctx.body, cyclic + leveling + damping)?;
    Ok(Vec::new())
}
