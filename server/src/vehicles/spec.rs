//! Per-archetype vehicle constants.

use nalgebra::Vector3;
use shared::VehicleType;

/// Where a wheel (or a hidden road wheel) is mounted, in body space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelMount {
    pub offset: Vector3<f32>,
    pub steered: bool,
    pub driven: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Suspension {
    /// Spring length at rest, metres.
    pub rest_length: f32,
    /// Maximum compression, metres.
    pub travel: f32,
    pub wheel_radius: f32,
    /// Spring rate, N/m.
    pub stiffness: f32,
    /// Damper rate, N·s/m.
    pub damping: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VehicleSpec {
    pub half_extents: Vector3<f32>,
    pub mass: f32,
    /// Speed limit in m/s, enforced for every archetype.
    pub max_speed: f32,
    /// Total drive force at full throttle, N.
    pub engine_force: f32,
    /// Total brake force at full brake, N.
    pub brake_force: f32,
    pub max_steer_angle: f32,
    /// Steering slew rate, rad/s.
    pub steer_rate: f32,
    /// Lateral friction coefficient of the tyres or tracks.
    pub grip: f32,
    /// Yaw torque at full steering for vehicles that steer without wheels.
    pub turn_torque: f32,
    pub mounts: Vec<WheelMount>,
    pub suspension: Suspension,
    /// Target ride height of a hovercraft skirt.
    pub hover_height: f32,
    /// Ceiling for aircraft, absolute world height.
    pub max_altitude: f32,
    /// Floor for aircraft, above local terrain.
    pub min_clearance: f32,
}

fn four_corners(half: Vector3<f32>, inset_x: f32, inset_z: f32, front_driven: bool) -> Vec<WheelMount> {
    let x = half.x - inset_x;
    let z = half.z - inset_z;
    let y = -half.y;
    vec![
        WheelMount { offset: Vector3::new(-x, y, -z), steered: true, driven: front_driven },
        WheelMount { offset: Vector3::new(x, y, -z), steered: true, driven: front_driven },
        WheelMount { offset: Vector3::new(-x, y, z), steered: false, driven: true },
        WheelMount { offset: Vector3::new(x, y, z), steered: false, driven: true },
    ]
}

impl VehicleSpec {
    pub fn for_type(vehicle_type: VehicleType) -> Self {
        match vehicle_type {
            VehicleType::Car => {
                let half = Vector3::new(0.9, 0.4, 2.1);
                Self {
                    half_extents: half,
                    mass: 1200.0,
                    max_speed: 40.0,
                    engine_force: 9000.0,
                    brake_force: 14000.0,
                    max_steer_angle: 0.55,
                    steer_rate: 2.5,
                    grip: 1.2,
                    turn_torque: 0.0,
                    mounts: four_corners(half, 0.1, 0.4, false),
                    suspension: Suspension {
                        rest_length: 0.35,
                        travel: 0.3,
                        wheel_radius: 0.35,
                        stiffness: 32000.0,
                        damping: 3500.0,
                    },
                    hover_height: 0.0,
                    max_altitude: 0.0,
                    min_clearance: 0.0,
                }
            }
            VehicleType::Truck => {
                let half = Vector3::new(1.2, 0.7, 3.2);
                Self {
                    half_extents: half,
                    mass: 4000.0,
                    max_speed: 28.0,
                    engine_force: 22000.0,
                    brake_force: 40000.0,
                    max_steer_angle: 0.45,
                    steer_rate: 1.8,
                    grip: 1.0,
                    turn_torque: 0.0,
                    mounts: four_corners(half, 0.1, 0.6, false),
                    suspension: Suspension {
                        rest_length: 0.45,
                        travel: 0.35,
                        wheel_radius: 0.5,
                        stiffness: 90000.0,
                        damping: 11000.0,
                    },
                    hover_height: 0.0,
                    max_altitude: 0.0,
                    min_clearance: 0.0,
                }
            }
            VehicleType::Motorcycle => {
                let half = Vector3::new(0.3, 0.4, 1.0);
                Self {
                    half_extents: half,
                    mass: 250.0,
                    max_speed: 45.0,
                    engine_force: 2600.0,
                    brake_force: 3500.0,
                    max_steer_angle: 0.4,
                    steer_rate: 3.0,
                    grip: 1.3,
                    turn_torque: 0.0,
                    mounts: vec![
                        WheelMount { offset: Vector3::new(0.0, -half.y, -0.85), steered: true, driven: false },
                        WheelMount { offset: Vector3::new(0.0, -half.y, 0.85), steered: false, driven: true },
                    ],
                    suspension: Suspension {
                        rest_length: 0.3,
                        travel: 0.25,
                        wheel_radius: 0.32,
                        stiffness: 14000.0,
                        damping: 1400.0,
                    },
                    hover_height: 0.0,
                    max_altitude: 0.0,
                    min_clearance: 0.0,
                }
            }
            VehicleType::Tank => {
                let half = Vector3::new(1.7, 0.8, 3.4);
                Self {
                    half_extents: half,
                    mass: 20000.0,
                    max_speed: 15.0,
                    engine_force: 120000.0,
                    brake_force: 200000.0,
                    max_steer_angle: 0.0,
                    steer_rate: 0.0,
                    grip: 2.0,
                    turn_torque: 0.0,
                    // Road wheels: support only, steering is differential.
                    mounts: four_corners(half, 0.3, 0.5, true),
                    suspension: Suspension {
                        rest_length: 0.35,
                        travel: 0.3,
                        wheel_radius: 0.4,
                        stiffness: 700000.0,
                        damping: 80000.0,
                    },
                    hover_height: 0.0,
                    max_altitude: 0.0,
                    min_clearance: 0.0,
                }
            }
            VehicleType::Helicopter => Self {
                half_extents: Vector3::new(1.2, 1.0, 3.5),
                mass: 2500.0,
                max_speed: 60.0,
                engine_force: 0.0,
                brake_force: 0.0,
                max_steer_angle: 0.0,
                steer_rate: 0.0,
                grip: 0.0,
                turn_torque: 9000.0,
                mounts: Vec::new(),
                suspension: Suspension {
                    rest_length: 0.0,
                    travel: 0.0,
                    wheel_radius: 0.0,
                    stiffness: 0.0,
                    damping: 0.0,
                },
                hover_height: 0.0,
                max_altitude: 400.0,
                min_clearance: 1.0,
            },
            VehicleType::Hovercraft => {
                let half = Vector3::new(1.5, 0.5, 2.8);
                Self {
                    half_extents: half,
                    mass: 1800.0,
                    max_speed: 32.0,
                    engine_force: 11000.0,
                    brake_force: 0.0,
                    max_steer_angle: 0.0,
                    steer_rate: 0.0,
                    grip: 0.15,
                    turn_torque: 6000.0,
                    mounts: four_corners(half, 0.2, 0.3, false),
                    suspension: Suspension {
                        rest_length: 0.0,
                        travel: 0.0,
                        wheel_radius: 0.0,
                        stiffness: 30000.0,
                        damping: 4000.0,
                    },
                    hover_height: 1.2,
                    max_altitude: 0.0,
                    min_clearance: 0.0,
                }
            }
        }
    }

    /// Height of the body centre above the ground when the vehicle rests.
    pub fn ride_height(&self) -> f32 {
        if self.mounts.is_empty() || self.hover_height > 0.0 {
            self.half_extents.y + self.hover_height
        } else {
            self.half_extents.y + self.suspension.rest_length + self.suspension.wheel_radius
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_type_has_sane_constants() {
        for vehicle_type in VehicleType::ALL {
            let spec = VehicleSpec::for_type(vehicle_type);
            assert!(spec.mass > 0.0, "{:?}", vehicle_type);
            assert!(spec.max_speed > 0.0, "{:?}", vehicle_type);
            assert!(spec.half_extents.iter().all(|e| *e > 0.0));
            assert!(spec.ride_height() >= spec.half_extents.y);
            if vehicle_type.wheel_count() > 0 {
                assert_eq!(spec.mounts.len(), vehicle_type.wheel_count());
                assert!(spec.mounts.iter().any(|m| m.driven));
            }
        }
    }

    #[test]
    fn test_only_aircraft_have_an_altitude_band() {
        for vehicle_type in VehicleType::ALL {
            let spec = VehicleSpec::for_type(vehicle_type);
            assert_eq!(vehicle_type.is_aircraft(), spec.max_altitude > 0.0);
        }
    }
}
