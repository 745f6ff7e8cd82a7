//! Conversions between wire arrays and nalgebra types, plus easing helpers.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

pub fn to_vector(v: [f32; 3]) -> Vector3<f32> {
    Vector3::new(v[0], v[1], v[2])
}

pub fn from_vector(v: &Vector3<f32>) -> [f32; 3] {
    [v.x, v.y, v.z]
}

/// Wire quaternions are `[x, y, z, w]`.
pub fn to_rotation(q: [f32; 4]) -> UnitQuaternion<f32> {
    let raw = Quaternion::new(q[3], q[0], q[1], q[2]);
    if raw.norm_squared() <= f32::EPSILON || !raw.coords.iter().all(|c| c.is_finite()) {
        return UnitQuaternion::identity();
    }
    UnitQuaternion::from_quaternion(raw)
}

pub fn from_rotation(q: &UnitQuaternion<f32>) -> [f32; 4] {
    [q.i, q.j, q.k, q.w]
}

pub fn identity_rotation() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

/// Yaw in radians of a rotation, measured around +Y.
pub fn yaw_of(q: &UnitQuaternion<f32>) -> f32 {
    let forward = q * Vector3::new(0.0, 0.0, -1.0);
    if forward.x.abs() < f32::EPSILON && forward.z.abs() < f32::EPSILON {
        return 0.0;
    }
    (-forward.x).atan2(-forward.z)
}

pub fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Non-finite components become zero.
pub fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}
