//! Authoritative rigid-body simulation.
//!
//! Wraps a rapier pipeline behind operations keyed by [`BodyId`], so the rest
//! of the server never touches engine handles. Only the tick loop owns and
//! mutates a `PhysicsWorld`.

use nalgebra::{DMatrix, Point3, UnitQuaternion, Vector3};
use rapier3d::prelude::*;
use shared::{
    ChunkCoord, ChunkData, EntityId, CHUNK_RESOLUTION, CHUNK_SIZE, PLAYER_HALF_HEIGHT,
    PLAYER_RADIUS,
};
use std::collections::HashMap;
use thiserror::Error;

pub const GROUP_TERRAIN: Group = Group::GROUP_1;
pub const GROUP_PLAYER: Group = Group::GROUP_2;
pub const GROUP_VEHICLE: Group = Group::GROUP_3;
pub const GROUP_SENSOR: Group = Group::GROUP_4;
pub const GROUP_PROJECTILE: Group = Group::GROUP_5;

/// Bodies further than this from the origin are considered blown up.
pub const MAX_SANE_COORDINATE: f32 = 1.0e6;

/// Identity of a body in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BodyId {
    Player(EntityId),
    Vehicle(EntityId),
    Chunk(ChunkCoord),
}

/// Collision category of a collider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionLayer {
    Terrain,
    Player,
    Vehicle,
    Sensor,
    Projectile,
}

impl CollisionLayer {
    pub fn groups(self) -> InteractionGroups {
        let solids = GROUP_TERRAIN | GROUP_PLAYER | GROUP_VEHICLE;
        match self {
            CollisionLayer::Terrain => InteractionGroups::new(GROUP_TERRAIN, Group::ALL),
            CollisionLayer::Player => InteractionGroups::new(GROUP_PLAYER, solids),
            CollisionLayer::Vehicle => InteractionGroups::new(GROUP_VEHICLE, solids),
            CollisionLayer::Sensor => InteractionGroups::new(GROUP_SENSOR, Group::NONE),
            CollisionLayer::Projectile => InteractionGroups::new(GROUP_PROJECTILE, solids),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PhysicsError {
    #[error("body {0:?} already exists")]
    DuplicateBody(BodyId),
    #[error("body {0:?} does not exist")]
    UnknownBody(BodyId),
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

/// Snapshot of a body's motion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kinematics {
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub linvel: Vector3<f32>,
    pub angvel: Vector3<f32>,
    pub mass: f32,
}

impl Kinematics {
    /// Transforms a point from body space to world space.
    pub fn to_world(&self, local: Vector3<f32>) -> Vector3<f32> {
        self.position + self.rotation * local
    }

    pub fn forward(&self) -> Vector3<f32> {
        self.rotation * Vector3::new(0.0, 0.0, -1.0)
    }

    pub fn right(&self) -> Vector3<f32> {
        self.rotation * Vector3::new(1.0, 0.0, 0.0)
    }

    pub fn up(&self) -> Vector3<f32> {
        self.rotation * Vector3::new(0.0, 1.0, 0.0)
    }

    /// Velocity of a world-space point rigidly attached to the body.
    pub fn velocity_at(&self, world_point: Vector3<f32>) -> Vector3<f32> {
        self.linvel + self.angvel.cross(&(world_point - self.position))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub distance: f32,
    pub point: Vector3<f32>,
    pub normal: Vector3<f32>,
    pub body: Option<BodyId>,
}

#[derive(Debug, Default)]
pub struct StepReport {
    /// Bodies whose state went non-finite or out of range and were frozen.
    pub unstable: Vec<BodyId>,
}

pub struct PhysicsWorld {
    gravity: Vector<Real>,
    integration_parameters: IntegrationParameters,
    pipeline: PhysicsPipeline,
    island_manager: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd: CCDSolver,
    query_pipeline: QueryPipeline,
    handles: HashMap<BodyId, RigidBodyHandle>,
    owners: HashMap<RigidBodyHandle, BodyId>,
    queries_dirty: bool,
}

impl PhysicsWorld {
    /// Creates an empty world stepping by `dt` seconds.
    pub fn new(gravity: f32, dt: f32) -> Result<Self, PhysicsError> {
        if !gravity.is_finite() {
            return Err(PhysicsError::InvalidParameter("gravity must be finite"));
        }
        if !dt.is_finite() || dt <= 0.0 {
            return Err(PhysicsError::InvalidParameter("timestep must be positive"));
        }

        Ok(Self {
            gravity: vector![0.0, gravity, 0.0],
            integration_parameters: IntegrationParameters {
                dt,
                ..IntegrationParameters::default()
            },
            pipeline: PhysicsPipeline::new(),
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            handles: HashMap::new(),
            owners: HashMap::new(),
            queries_dirty: false,
        })
    }

    pub fn dt(&self) -> f32 {
        self.integration_parameters.dt
    }

    pub fn contains(&self, id: BodyId) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn collider_count(&self) -> usize {
        self.colliders.len()
    }

    fn insert(
        &mut self,
        id: BodyId,
        body: RigidBody,
        colliders: Vec<Collider>,
    ) -> Result<(), PhysicsError> {
        if self.handles.contains_key(&id) {
            return Err(PhysicsError::DuplicateBody(id));
        }
        let handle = self.bodies.insert(body);
        for collider in colliders {
            self.colliders
                .insert_with_parent(collider, handle, &mut self.bodies);
        }
        self.handles.insert(id, handle);
        self.owners.insert(handle, id);
        self.queries_dirty = true;
        Ok(())
    }

    /// Upright capsule for a player, rotation locked.
    pub fn create_player(&mut self, id: EntityId, position: Vector3<f32>) -> Result<(), PhysicsError> {
        let body = RigidBodyBuilder::dynamic()
            .translation(position)
            .lock_rotations()
            .ccd_enabled(true)
            .build();
        let collider = ColliderBuilder::capsule_y(PLAYER_HALF_HEIGHT - PLAYER_RADIUS, PLAYER_RADIUS)
            .collision_groups(CollisionLayer::Player.groups())
            .density(1.0)
            .friction(0.0)
            .friction_combine_rule(CoefficientCombineRule::Min)
            .restitution(0.0)
            .build();
        self.insert(BodyId::Player(id), body, vec![collider])
    }

    /// Box chassis for a vehicle with the given total mass.
    pub fn create_vehicle(
        &mut self,
        id: EntityId,
        position: Vector3<f32>,
        rotation: UnitQuaternion<f32>,
        half_extents: Vector3<f32>,
        mass: f32,
    ) -> Result<(), PhysicsError> {
        if half_extents.iter().any(|e| !e.is_finite() || *e <= 0.0) {
            return Err(PhysicsError::InvalidParameter("vehicle extents must be positive"));
        }
        if !mass.is_finite() || mass <= 0.0 {
            return Err(PhysicsError::InvalidParameter("vehicle mass must be positive"));
        }
        let volume = 8.0 * half_extents.x * half_extents.y * half_extents.z;
        let body = RigidBodyBuilder::dynamic()
            .translation(position)
            .rotation(rotation.scaled_axis())
            .linear_damping(0.1)
            .angular_damping(1.0)
            .ccd_enabled(true)
            .build();
        let collider = ColliderBuilder::cuboid(half_extents.x, half_extents.y, half_extents.z)
            .collision_groups(CollisionLayer::Vehicle.groups())
            .density(mass / volume)
            .friction(0.6)
            .restitution(0.0)
            .build();
        self.insert(BodyId::Vehicle(id), body, vec![collider])
    }

    /// Fixed heightfield plus building boxes for one chunk.
    pub fn create_chunk(&mut self, data: &ChunkData) -> Result<(), PhysicsError> {
        if !data.is_well_formed() {
            return Err(PhysicsError::InvalidParameter("malformed chunk heightmap"));
        }
        let coord = data.coord();
        let (cx, cz) = coord.center();
        let n = CHUNK_RESOLUTION;

        // Rows run along z, columns along x, centred on the body.
        let heights = DMatrix::from_fn(n, n, |row, col| data.heightmap[row * n + col]);
        let mut colliders = vec![ColliderBuilder::heightfield(
            heights,
            vector![CHUNK_SIZE, 1.0, CHUNK_SIZE],
        )
        .collision_groups(CollisionLayer::Terrain.groups())
        .friction(0.9)
        .build()];

        for building in &data.buildings {
            let half = Vector3::new(
                building.size[0] * 0.5,
                building.size[1] * 0.5,
                building.size[2] * 0.5,
            );
            colliders.push(
                ColliderBuilder::cuboid(half.x, half.y, half.z)
                    .translation(vector![
                        building.position[0] - cx,
                        building.position[1] + half.y,
                        building.position[2] - cz
                    ])
                    .rotation(vector![0.0, building.rotation, 0.0])
                    .collision_groups(CollisionLayer::Terrain.groups())
                    .friction(0.8)
                    .build(),
            );
        }

        let body = RigidBodyBuilder::fixed()
            .translation(vector![cx, 0.0, cz])
            .build();
        self.insert(BodyId::Chunk(coord), body, colliders)
    }

    /// Removes a body and every collider attached to it.
    pub fn remove(&mut self, id: BodyId) -> bool {
        let Some(handle) = self.handles.remove(&id) else {
            return false;
        };
        self.owners.remove(&handle);
        self.bodies.remove(
            handle,
            &mut self.island_manager,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
        self.queries_dirty = true;
        true
    }

    fn body(&self, id: BodyId) -> Result<&RigidBody, PhysicsError> {
        self.handles
            .get(&id)
            .and_then(|handle| self.bodies.get(*handle))
            .ok_or(PhysicsError::UnknownBody(id))
    }

    fn body_mut(&mut self, id: BodyId) -> Result<&mut RigidBody, PhysicsError> {
        let handle = *self.handles.get(&id).ok_or(PhysicsError::UnknownBody(id))?;
        self.bodies
            .get_mut(handle)
            .ok_or(PhysicsError::UnknownBody(id))
    }

    pub fn kinematics(&self, id: BodyId) -> Option<Kinematics> {
        let body = self.body(id).ok()?;
        Some(Kinematics {
            position: *body.translation(),
            rotation: *body.rotation(),
            linvel: *body.linvel(),
            angvel: *body.angvel(),
            mass: body.mass(),
        })
    }

    pub fn position(&self, id: BodyId) -> Option<Vector3<f32>> {
        self.body(id).ok().map(|body| *body.translation())
    }

    pub fn rotation(&self, id: BodyId) -> Option<UnitQuaternion<f32>> {
        self.body(id).ok().map(|body| *body.rotation())
    }

    pub fn linvel(&self, id: BodyId) -> Option<Vector3<f32>> {
        self.body(id).ok().map(|body| *body.linvel())
    }

    pub fn angvel(&self, id: BodyId) -> Option<Vector3<f32>> {
        self.body(id).ok().map(|body| *body.angvel())
    }

    pub fn set_position(&mut self, id: BodyId, position: Vector3<f32>) -> Result<(), PhysicsError> {
        self.body_mut(id)?.set_translation(position, true);
        self.queries_dirty = true;
        Ok(())
    }

    pub fn set_rotation(
        &mut self,
        id: BodyId,
        rotation: UnitQuaternion<f32>,
    ) -> Result<(), PhysicsError> {
        self.body_mut(id)?.set_rotation(rotation, true);
        self.queries_dirty = true;
        Ok(())
    }

    pub fn set_linvel(&mut self, id: BodyId, velocity: Vector3<f32>) -> Result<(), PhysicsError> {
        self.body_mut(id)?.set_linvel(velocity, true);
        Ok(())
    }

    pub fn set_angvel(&mut self, id: BodyId, velocity: Vector3<f32>) -> Result<(), PhysicsError> {
        self.body_mut(id)?.set_angvel(velocity, true);
        Ok(())
    }

    /// Disabled bodies are neither simulated nor collided with.
    pub fn set_enabled(&mut self, id: BodyId, enabled: bool) -> Result<(), PhysicsError> {
        let body = self.body_mut(id)?;
        body.set_enabled(enabled);
        if enabled {
            body.wake_up(true);
        }
        self.queries_dirty = true;
        Ok(())
    }

    pub fn is_enabled(&self, id: BodyId) -> Option<bool> {
        self.body(id).ok().map(|body| body.is_enabled())
    }

    pub fn add_force(&mut self, id: BodyId, force: Vector3<f32>) -> Result<(), PhysicsError> {
        self.body_mut(id)?.add_force(force, true);
        Ok(())
    }

    pub fn add_force_at_point(
        &mut self,
        id: BodyId,
        force: Vector3<f32>,
        point: Vector3<f32>,
    ) -> Result<(), PhysicsError> {
        self.body_mut(id)?
            .add_force_at_point(force, Point3::from(point), true);
        Ok(())
    }

    pub fn add_torque(&mut self, id: BodyId, torque: Vector3<f32>) -> Result<(), PhysicsError> {
        self.body_mut(id)?.add_torque(torque, true);
        Ok(())
    }

    pub fn apply_impulse(&mut self, id: BodyId, impulse: Vector3<f32>) -> Result<(), PhysicsError> {
        self.body_mut(id)?.apply_impulse(impulse, true);
        Ok(())
    }

    pub fn apply_impulse_at_point(
        &mut self,
        id: BodyId,
        impulse: Vector3<f32>,
        point: Vector3<f32>,
    ) -> Result<(), PhysicsError> {
        self.body_mut(id)?
            .apply_impulse_at_point(impulse, Point3::from(point), true);
        Ok(())
    }

    pub fn apply_torque_impulse(
        &mut self,
        id: BodyId,
        impulse: Vector3<f32>,
    ) -> Result<(), PhysicsError> {
        self.body_mut(id)?.apply_torque_impulse(impulse, true);
        Ok(())
    }

    fn refresh_queries(&mut self) {
        if self.queries_dirty {
            self.query_pipeline.update(&self.colliders);
            self.queries_dirty = false;
        }
    }

    /// Casts a ray against solid colliders, optionally ignoring one body.
    pub fn raycast(
        &mut self,
        origin: Vector3<f32>,
        direction: Vector3<f32>,
        max_distance: f32,
        exclude: Option<BodyId>,
    ) -> Option<RayHit> {
        self.refresh_queries();
        let direction = direction.try_normalize(1.0e-6)?;
        let ray = Ray::new(Point3::from(origin), direction);

        let solids = GROUP_TERRAIN | GROUP_PLAYER | GROUP_VEHICLE;
        let mut filter = QueryFilter::default()
            .exclude_sensors()
            .groups(InteractionGroups::new(Group::ALL, solids));
        if let Some(handle) = exclude.and_then(|id| self.handles.get(&id).copied()) {
            filter = filter.exclude_rigid_body(handle);
        }

        let (collider, hit) = self.query_pipeline.cast_ray_and_get_normal(
            &self.bodies,
            &self.colliders,
            &ray,
            max_distance,
            true,
            filter,
        )?;
        let body = self
            .colliders
            .get(collider)
            .and_then(|c| c.parent())
            .and_then(|handle| self.owners.get(&handle).copied());

        Some(RayHit {
            distance: hit.time_of_impact,
            point: ray.point_at(hit.time_of_impact).coords,
            normal: hit.normal,
            body,
        })
    }

    /// Advances the simulation by exactly one fixed increment.
    ///
    /// Forces added since the previous step act for this step only.
    pub fn step(&mut self) -> StepReport {
        let hooks = ();
        let events = ();
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd,
            Some(&mut self.query_pipeline),
            &hooks,
            &events,
        );
        self.queries_dirty = false;

        let mut report = StepReport::default();
        for (handle, body) in self.bodies.iter_mut() {
            if !body.is_dynamic() {
                continue;
            }
            body.reset_forces(false);
            body.reset_torques(false);

            let pos = body.translation();
            let sane = pos.iter().all(|c| c.is_finite() && c.abs() < MAX_SANE_COORDINATE)
                && body.linvel().iter().all(|c| c.is_finite());
            if !sane {
                body.set_linvel(vector![0.0, 0.0, 0.0], false);
                body.set_angvel(vector![0.0, 0.0, 0.0], false);
                if let Some(id) = self.owners.get(&handle) {
                    report.unstable.push(*id);
                }
            }
        }
        report.unstable.sort();
        report
    }
}
