//! Vehicle archetypes, occupancy and per-type force models.
//!
//! Each archetype has an isolated update function under this module that
//! reads the body's kinematics, the current input and the terrain, and acts on
//! the world only through [`PhysicsWorld`] force and torque operations. The
//! manager itself knows nothing about wheels or rotors; it enforces occupancy,
//! the generic speed limit and the aircraft altitude band.

mod helicopter;
mod hovercraft;
pub mod spec;
mod tank;
mod wheeled;

pub use spec::{Suspension, VehicleSpec, WheelMount};

use crate::physics::{BodyId, Kinematics, PhysicsError, PhysicsWorld};
use log::{debug, info, warn};
use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::math::{from_rotation, from_vector};
use shared::terrain::safe_ground_height;
use shared::{
    EntityId, TerrainSampler, VehicleInput, VehicleState, VehicleType, WheelState,
    PLAYER_HALF_HEIGHT,
};
use std::collections::BTreeMap;
use thiserror::Error;

/// Vehicle ids start here so they never collide with player ids.
pub const VEHICLE_ID_BASE: EntityId = 1_000_000;
/// Sideways distance from the vehicle centre to where a driver gets out.
pub const EXIT_OFFSET: f32 = 3.0;
/// Extra height above the ground given to a driver getting out.
pub const EXIT_CLEARANCE: f32 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnterError {
    #[error("vehicle {0} does not exist")]
    UnknownVehicle(EntityId),
    #[error("vehicle {0} already has a driver")]
    Occupied(EntityId),
    #[error("player {player} already drives vehicle {vehicle}")]
    AlreadyDriving { player: EntityId, vehicle: EntityId },
    #[error("no free vehicle in range")]
    NoVehicleInRange,
    #[error("player {0} has no body")]
    UnknownPlayer(EntityId),
}

/// Everything a force model may read or act on during one tick.
pub struct ModelContext<'a> {
    pub body: BodyId,
    pub kinematics: Kinematics,
    pub input: VehicleInput,
    pub engine_running: bool,
    pub spec: &'a VehicleSpec,
    pub physics: &'a mut PhysicsWorld,
    pub terrain: &'a dyn TerrainSampler,
    pub gravity: f32,
    pub dt: f32,
}

#[derive(Debug, Clone)]
pub struct ServerVehicle {
    pub id: EntityId,
    pub vehicle_type: VehicleType,
    pub spec: VehicleSpec,
    pub driver_id: Option<EntityId>,
    pub engine_running: bool,
    input: VehicleInput,
    steer_angle: f32,
    wheels: Vec<WheelState>,
}

impl ServerVehicle {
    pub fn input(&self) -> &VehicleInput {
        &self.input
    }
}

/// Where a driver leaving a vehicle with the given kinematics is placed: a
/// fixed distance to the vehicle's right, never below the ground.
pub fn exit_position(kinematics: &Kinematics, terrain: &dyn TerrainSampler) -> Vector3<f32> {
    let right = kinematics.right();
    let flat = Vector3::new(right.x, 0.0, right.z)
        .try_normalize(1.0e-6)
        .unwrap_or_else(Vector3::x);
    let mut position = kinematics.position + flat * EXIT_OFFSET;
    let floor =
        safe_ground_height(terrain, position.x, position.z) + PLAYER_HALF_HEIGHT + EXIT_CLEARANCE;
    position.y = kinematics.position.y.max(floor);
    position
}

pub struct VehicleManager {
    vehicles: BTreeMap<EntityId, ServerVehicle>,
    next_id: EntityId,
    enter_radius: f32,
    gravity: f32,
}

impl VehicleManager {
    pub fn new(enter_radius: f32, gravity: f32) -> Self {
        Self {
            vehicles: BTreeMap::new(),
            next_id: VEHICLE_ID_BASE,
            enter_radius,
            gravity,
        }
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    pub fn get(&self, id: EntityId) -> Option<&ServerVehicle> {
        self.vehicles.get(&id)
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.vehicles.keys().copied().collect()
    }

    /// Vehicle currently driven by `player_id`, if any.
    pub fn driven_by(&self, player_id: EntityId) -> Option<EntityId> {
        self.vehicles
            .values()
            .find(|v| v.driver_id == Some(player_id))
            .map(|v| v.id)
    }

    /// Creates a parked vehicle facing `yaw`.
    pub fn spawn(
        &mut self,
        vehicle_type: VehicleType,
        position: Vector3<f32>,
        yaw: f32,
        physics: &mut PhysicsWorld,
    ) -> Result<EntityId, PhysicsError> {
        let id = self.next_id;
        let spec = VehicleSpec::for_type(vehicle_type);
        let rotation = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw);
        physics.create_vehicle(id, position, rotation, spec.half_extents, spec.mass)?;
        self.next_id += 1;

        info!("Spawned {:?} {} at {:?}", vehicle_type, id, position);
        self.vehicles.insert(
            id,
            ServerVehicle {
                id,
                vehicle_type,
                wheels: vec![WheelState::default(); vehicle_type.wheel_count()],
                spec,
                driver_id: None,
                engine_running: false,
                input: VehicleInput::idle(),
                steer_angle: 0.0,
            },
        );
        Ok(id)
    }

    /// Parks one vehicle of every type on a ring around `center`.
    pub fn spawn_fleet(
        &mut self,
        center: Vector3<f32>,
        seed: u32,
        terrain: &dyn TerrainSampler,
        physics: &mut PhysicsWorld,
    ) -> Vec<EntityId> {
        let mut rng = StdRng::seed_from_u64(u64::from(seed));
        let step = std::f32::consts::TAU / VehicleType::ALL.len() as f32;
        let mut spawned = Vec::new();

        for (i, vehicle_type) in VehicleType::ALL.into_iter().enumerate() {
            let angle = i as f32 * step + rng.gen_range(-0.2..0.2);
            let distance = rng.gen_range(12.0..18.0);
            let x = center.x + angle.cos() * distance;
            let z = center.z + angle.sin() * distance;
            let spec = VehicleSpec::for_type(vehicle_type);
            let y = safe_ground_height(terrain, x, z) + spec.ride_height() + 0.5;
            let yaw = rng.gen_range(0.0..std::f32::consts::TAU);

            match self.spawn(vehicle_type, Vector3::new(x, y, z), yaw, physics) {
                Ok(id) => spawned.push(id),
                Err(e) => warn!("Failed to spawn {:?}: {}", vehicle_type, e),
            }
        }
        spawned
    }

    pub fn remove(&mut self, id: EntityId, physics: &mut PhysicsWorld) -> Option<ServerVehicle> {
        let vehicle = self.vehicles.remove(&id)?;
        physics.remove(BodyId::Vehicle(id));
        Some(vehicle)
    }

    /// Makes `player_id` the driver of `requested`, or of the nearest free
    /// vehicle in range when no vehicle is named.
    ///
    /// Requests are handled one at a time on the tick thread, so of two
    /// players racing for the same vehicle the first one wins and the second
    /// gets [`EnterError::Occupied`] without any state change.
    pub fn enter(
        &mut self,
        player_id: EntityId,
        requested: Option<EntityId>,
        physics: &PhysicsWorld,
    ) -> Result<EntityId, EnterError> {
        if let Some(vehicle) = self.driven_by(player_id) {
            return Err(EnterError::AlreadyDriving {
                player: player_id,
                vehicle,
            });
        }
        let player_position = physics
            .position(BodyId::Player(player_id))
            .ok_or(EnterError::UnknownPlayer(player_id))?;

        let id = match requested {
            Some(id) => {
                let vehicle = self.vehicles.get(&id).ok_or(EnterError::UnknownVehicle(id))?;
                if vehicle.driver_id.is_some() {
                    return Err(EnterError::Occupied(id));
                }
                let position = physics
                    .position(BodyId::Vehicle(id))
                    .ok_or(EnterError::UnknownVehicle(id))?;
                if (position - player_position).norm() > self.enter_radius {
                    return Err(EnterError::NoVehicleInRange);
                }
                id
            }
            None => self
                .vehicles
                .values()
                .filter(|v| v.driver_id.is_none())
                .filter_map(|v| {
                    let position = physics.position(BodyId::Vehicle(v.id))?;
                    Some((v.id, (position - player_position).norm()))
                })
                .filter(|(_, distance)| *distance <= self.enter_radius)
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(id, _)| id)
                .ok_or(EnterError::NoVehicleInRange)?,
        };

        let vehicle = self
            .vehicles
            .get_mut(&id)
            .ok_or(EnterError::UnknownVehicle(id))?;
        vehicle.driver_id = Some(player_id);
        vehicle.engine_running = true;
        vehicle.input = VehicleInput::default();
        info!("Player {} entered vehicle {}", player_id, id);
        Ok(id)
    }

    /// Releases the vehicle driven by `player_id` and returns it with the
    /// position the driver should be placed at.
    pub fn exit(
        &mut self,
        player_id: EntityId,
        physics: &PhysicsWorld,
        terrain: &dyn TerrainSampler,
    ) -> Option<(EntityId, Vector3<f32>)> {
        let id = self.driven_by(player_id)?;
        let vehicle = self.vehicles.get_mut(&id)?;
        vehicle.driver_id = None;
        vehicle.engine_running = false;
        vehicle.input = VehicleInput::idle();

        let position = match physics.kinematics(BodyId::Vehicle(id)) {
            Some(kinematics) => exit_position(&kinematics, terrain),
            None => physics.position(BodyId::Player(player_id))?,
        };
        info!("Player {} left vehicle {} at {:?}", player_id, id, position);
        Some((id, position))
    }

    /// Stores the driver's latest controls. Returns false when the player is
    /// not driving anything.
    pub fn set_input(&mut self, player_id: EntityId, input: VehicleInput) -> bool {
        match self
            .vehicles
            .values_mut()
            .find(|v| v.driver_id == Some(player_id))
        {
            Some(vehicle) => {
                vehicle.input = input.sanitized();
                true
            }
            None => false,
        }
    }

    /// Runs every vehicle's force model, then applies the generic limits.
    pub fn update(&mut self, physics: &mut PhysicsWorld, terrain: &dyn TerrainSampler, dt: f32) {
        for vehicle in self.vehicles.values_mut() {
            let body = BodyId::Vehicle(vehicle.id);
            let Some(kinematics) = physics.kinematics(body) else {
                warn!("Vehicle {} has no body", vehicle.id);
                continue;
            };

            let input = if vehicle.driver_id.is_some() {
                vehicle.input
            } else {
                VehicleInput::idle()
            };
            let mut ctx = ModelContext {
                body,
                kinematics,
                input,
                engine_running: vehicle.engine_running,
                spec: &vehicle.spec,
                physics: &mut *physics,
                terrain,
                gravity: self.gravity,
                dt,
            };
            let result = match vehicle.vehicle_type {
                VehicleType::Car | VehicleType::Truck | VehicleType::Motorcycle => {
                    wheeled::update(&mut ctx, &mut vehicle.steer_angle)
                }
                VehicleType::Tank => tank::update(&mut ctx),
                VehicleType::Helicopter => helicopter::update(&mut ctx),
                VehicleType::Hovercraft => hovercraft::update(&mut ctx),
            };
            match result {
                Ok(wheels) => vehicle.wheels = wheels,
                Err(e) => warn!("Force model of vehicle {} failed: {}", vehicle.id, e),
            }

            if let Err(e) = enforce_limits(vehicle, &kinematics, physics, terrain) {
                warn!("Failed to limit vehicle {}: {}", vehicle.id, e);
            }
        }
    }

    pub fn state(&self, id: EntityId, physics: &PhysicsWorld) -> Option<VehicleState> {
        let vehicle = self.vehicles.get(&id)?;
        let kinematics = physics.kinematics(BodyId::Vehicle(id))?;
        Some(VehicleState {
            id,
            vehicle_type: vehicle.vehicle_type,
            position: from_vector(&kinematics.position),
            rotation: from_rotation(&kinematics.rotation),
            velocity: from_vector(&kinematics.linvel),
            angular_velocity: from_vector(&kinematics.angvel),
            driver_id: vehicle.driver_id,
            engine_running: vehicle.engine_running,
            wheels: vehicle.wheels.clone(),
        })
    }

    pub fn states(&self, physics: &PhysicsWorld) -> Vec<VehicleState> {
        self.vehicles
            .keys()
            .filter_map(|id| self.state(*id, physics))
            .collect()
    }
}

/// Caps speed for every archetype and keeps aircraft inside their altitude
/// band.
fn enforce_limits(
    vehicle: &ServerVehicle,
    kinematics: &Kinematics,
    physics: &mut PhysicsWorld,
    terrain: &dyn TerrainSampler,
) -> Result<(), PhysicsError> {
    let body = BodyId::Vehicle(vehicle.id);
    let spec = &vehicle.spec;
    let mut velocity = kinematics.linvel;
    let mut changed = false;

    let speed = velocity.norm();
    if speed > spec.max_speed {
        velocity *= spec.max_speed / speed;
        changed = true;
    }

    if vehicle.vehicle_type.is_aircraft() {
        let position = kinematics.position;
        if position.y >= spec.max_altitude && velocity.y > 0.0 {
            velocity.y = 0.0;
            changed = true;
        }
        let surface = safe_ground_height(terrain, position.x, position.z) + spec.half_extents.y;
        if position.y < surface {
            debug!("Vehicle {} below terrain, lifting", vehicle.id);
            let lifted = Vector3::new(position.x, surface + spec.min_clearance, position.z);
            physics.set_position(body, lifted)?;
            velocity.y = velocity.y.max(0.0);
            changed = true;
        }
    }

    if changed {
        physics.set_linvel(body, velocity)?;
    }
    Ok(())
}
