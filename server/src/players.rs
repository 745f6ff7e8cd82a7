//! Player-only state and the translation of input into body velocity.
//!
//! Network handlers only ever call [`PlayerManager::queue_input`]; the input
//! is consumed on the next tick by [`PlayerManager::update`].

use crate::physics::{BodyId, PhysicsError, PhysicsWorld};
use log::{debug, info, warn};
use nalgebra::{UnitQuaternion, Vector3};
use shared::math::{from_rotation, from_vector};
use shared::movement::apply_movement;
use shared::terrain::safe_ground_height;
use shared::{
    Appearance, EntityId, MotionState, MovementTuning, PlayerInput, PlayerState, TerrainSampler,
    GROUND_PROBE_DISTANCE, PLAYER_HALF_HEIGHT, SPAWN_CLEARANCE,
};
use std::collections::BTreeMap;

/// How far below the terrain a body may sink before it is put back on top.
pub const FALL_TOLERANCE: f32 = 0.5;
/// Upward speed above which a body touching the ground is still airborne.
const GROUNDED_MAX_RISE: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDisposition {
    Accepted,
    /// Sequence number not newer than what was already processed or queued.
    Stale,
    UnknownPlayer,
}

#[derive(Debug, Clone)]
pub struct ServerPlayer {
    pub id: EntityId,
    pub username: String,
    pub appearance: Appearance,
    pub health: f32,
    pub stamina: f32,
    pub grounded: bool,
    pub ground_normal: Vector3<f32>,
    pub vehicle_id: Option<EntityId>,
    pub last_processed_input: u32,
    pending_input: Option<PlayerInput>,
    held_input: PlayerInput,
}

impl ServerPlayer {
    fn new(id: EntityId, username: String, appearance: Appearance, stamina: f32) -> Self {
        Self {
            id,
            username,
            appearance,
            health: 100.0,
            stamina,
            grounded: false,
            ground_normal: Vector3::y(),
            vehicle_id: None,
            last_processed_input: 0,
            pending_input: None,
            held_input: PlayerInput::default(),
        }
    }

    /// Most recent input consumed by the simulation.
    pub fn held_input(&self) -> &PlayerInput {
        &self.held_input
    }

    pub fn has_pending_input(&self) -> bool {
        self.pending_input.is_some()
    }
}

pub struct PlayerManager {
    players: BTreeMap<EntityId, ServerPlayer>,
    tuning: MovementTuning,
}

impl PlayerManager {
    pub fn new(tuning: MovementTuning) -> Self {
        Self {
            players: BTreeMap::new(),
            tuning,
        }
    }

    pub fn tuning(&self) -> &MovementTuning {
        &self.tuning
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.players.contains_key(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&ServerPlayer> {
        self.players.get(&id)
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.players.keys().copied().collect()
    }

    pub fn last_processed_input(&self, id: EntityId) -> Option<u32> {
        self.players.get(&id).map(|p| p.last_processed_input)
    }

    /// Creates the player's body and registers it.
    pub fn spawn(
        &mut self,
        id: EntityId,
        username: String,
        appearance: Appearance,
        position: Vector3<f32>,
        physics: &mut PhysicsWorld,
    ) -> Result<(), PhysicsError> {
        physics.create_player(id, position)?;
        info!("Spawned player {} '{}' at {:?}", id, username, position);
        let player = ServerPlayer::new(id, username, appearance, self.tuning.max_stamina);
        self.players.insert(id, player);
        Ok(())
    }

    pub fn remove(&mut self, id: EntityId, physics: &mut PhysicsWorld) -> Option<ServerPlayer> {
        let player = self.players.remove(&id)?;
        physics.remove(BodyId::Player(id));
        info!("Removed player {}", id);
        Some(player)
    }

    /// Stores `input` as the player's intent for the next tick. Only the
    /// newest input survives until then.
    pub fn queue_input(&mut self, id: EntityId, input: PlayerInput) -> InputDisposition {
        let Some(player) = self.players.get_mut(&id) else {
            return InputDisposition::UnknownPlayer;
        };
        if input.seq <= player.last_processed_input {
            return InputDisposition::Stale;
        }
        if let Some(pending) = &player.pending_input {
            if input.seq <= pending.seq {
                return InputDisposition::Stale;
            }
        }
        player.pending_input = Some(input.sanitized());
        InputDisposition::Accepted
    }

    /// Positions that keep chunks loaded: every player not inside a vehicle.
    pub fn tracked_positions(&self, physics: &PhysicsWorld) -> Vec<Vector3<f32>> {
        self.players
            .values()
            .filter(|p| p.vehicle_id.is_none())
            .filter_map(|p| physics.position(BodyId::Player(p.id)))
            .collect()
    }

    /// Consumes pending input and sets each on-foot player's velocity for the
    /// coming physics step.
    pub fn update(&mut self, physics: &mut PhysicsWorld, terrain: &dyn TerrainSampler, dt: f32) {
        let tuning = self.tuning;
        for player in self.players.values_mut() {
            let fresh = match player.pending_input.take() {
                Some(input) => {
                    player.last_processed_input = input.seq;
                    player.held_input = input;
                    true
                }
                None => false,
            };

            if player.vehicle_id.is_some() {
                continue;
            }
            let body = BodyId::Player(player.id);
            let Some(mut kinematics) = physics.kinematics(body) else {
                warn!("Player {} has no body", player.id);
                continue;
            };

            let floor = safe_ground_height(terrain, kinematics.position.x, kinematics.position.z)
                + PLAYER_HALF_HEIGHT;
            if kinematics.position.y < floor - FALL_TOLERANCE {
                debug!(
                    "Player {} fell through terrain at {:?}, lifting",
                    player.id, kinematics.position
                );
                kinematics.position.y = floor + SPAWN_CLEARANCE;
                kinematics.linvel.y = 0.0;
                if physics.set_position(body, kinematics.position).is_err() {
                    continue;
                }
            }

            let ground = physics.raycast(
                kinematics.position,
                -Vector3::y(),
                PLAYER_HALF_HEIGHT + GROUND_PROBE_DISTANCE,
                Some(body),
            );
            player.grounded = ground.is_some() && kinematics.linvel.y <= GROUNDED_MAX_RISE;
            player.ground_normal = ground.map(|hit| hit.normal).unwrap_or_else(Vector3::y);

            let mut input = player.held_input;
            input.jump = input.jump && fresh;

            let mut state = MotionState {
                position: kinematics.position,
                velocity: kinematics.linvel,
                grounded: player.grounded,
                stamina: player.stamina,
            };
            apply_movement(&mut state, &input, &tuning, dt);
            player.stamina = state.stamina;
            player.grounded = state.grounded;

            if let Err(e) = physics.set_linvel(body, state.velocity) {
                warn!("Failed to drive player {}: {}", player.id, e);
            }
        }
    }

    /// Hides the player's own body while they drive.
    pub fn board_vehicle(
        &mut self,
        id: EntityId,
        vehicle_id: EntityId,
        physics: &mut PhysicsWorld,
    ) -> Result<(), PhysicsError> {
        let body = BodyId::Player(id);
        physics.set_linvel(body, Vector3::zeros())?;
        physics.set_enabled(body, false)?;
        if let Some(player) = self.players.get_mut(&id) {
            player.vehicle_id = Some(vehicle_id);
            player.grounded = false;
        }
        Ok(())
    }

    /// Restores the player's body at `exit_position`, at rest.
    pub fn leave_vehicle(
        &mut self,
        id: EntityId,
        exit_position: Vector3<f32>,
        physics: &mut PhysicsWorld,
    ) -> Result<(), PhysicsError> {
        let body = BodyId::Player(id);
        physics.set_position(body, exit_position)?;
        physics.set_linvel(body, Vector3::zeros())?;
        physics.set_enabled(body, true)?;
        if let Some(player) = self.players.get_mut(&id) {
            player.vehicle_id = None;
        }
        Ok(())
    }

    /// Wire state for one player. Drivers report their vehicle's motion.
    pub fn state(&self, id: EntityId, physics: &PhysicsWorld) -> Option<PlayerState> {
        let player = self.players.get(&id)?;
        let source = match player.vehicle_id {
            Some(vehicle_id) => BodyId::Vehicle(vehicle_id),
            None => BodyId::Player(id),
        };
        let kinematics = physics
            .kinematics(source)
            .or_else(|| physics.kinematics(BodyId::Player(id)))?;

        let rotation = match player.vehicle_id {
            Some(_) => kinematics.rotation,
            None => UnitQuaternion::from_axis_angle(&Vector3::y_axis(), player.held_input.yaw),
        };

        Some(PlayerState {
            id,
            username: player.username.clone(),
            appearance: player.appearance.clone(),
            position: from_vector(&kinematics.position),
            rotation: from_rotation(&rotation),
            velocity: from_vector(&kinematics.linvel),
            angular_velocity: from_vector(&kinematics.angvel),
            health: player.health,
            stamina: player.stamina,
            grounded: player.grounded,
            ground_normal: from_vector(&player.ground_normal),
            vehicle_id: player.vehicle_id,
            last_processed_input: player.last_processed_input,
        })
    }

    pub fn states(&self, physics: &PhysicsWorld) -> Vec<PlayerState> {
        self.players
            .keys()
            .filter_map(|id| self.state(*id, physics))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::{generate_chunk, ChunkCoord, FlatTerrain, GRAVITY};

    const DT: f32 = 1.0 / 60.0;

    fn setup() -> (PhysicsWorld, PlayerManager, FlatTerrain) {
        let terrain = FlatTerrain::new(0.0);
        let mut physics = PhysicsWorld::new(GRAVITY, DT).unwrap();
        physics
            .create_chunk(&generate_chunk(ChunkCoord::new(0, 0), &terrain))
            .unwrap();
        let mut players = PlayerManager::new(MovementTuning::default());
        players
            .spawn(
                1,
                "ann".into(),
                Appearance::default(),
                Vector3::new(32.0, PLAYER_HALF_HEIGHT + 0.01, 32.0),
                &mut physics,
            )
            .unwrap();
        (physics, players, terrain)
    }

    fn tick(physics: &mut PhysicsWorld, players: &mut PlayerManager, terrain: &FlatTerrain) {
        players.update(physics, terrain, DT);
        physics.step();
    }

    fn input(seq: u32) -> PlayerInput {
        PlayerInput {
            seq,
            ..PlayerInput::default()
        }
    }

    #[test]
    fn test_stale_and_duplicate_inputs_ignored() {
        let (mut physics, mut players, terrain) = setup();
        assert_eq!(players.queue_input(1, input(3)), InputDisposition::Accepted);
        assert_eq!(players.queue_input(1, input(2)), InputDisposition::Stale);
        assert_eq!(players.queue_input(1, input(3)), InputDisposition::Stale);
        tick(&mut physics, &mut players, &terrain);
        assert_eq!(players.last_processed_input(1), Some(3));

        assert_eq!(players.queue_input(1, input(3)), InputDisposition::Stale);
        assert_eq!(players.queue_input(9, input(4)), InputDisposition::UnknownPlayer);
        tick(&mut physics, &mut players, &terrain);
        assert_eq!(players.last_processed_input(1), Some(3));
    }

    #[test]
    fn test_latest_input_wins() {
        let (mut physics, mut players, terrain) = setup();
        players.queue_input(1, input(1));
        players.queue_input(1, input(5));
        tick(&mut physics, &mut players, &terrain);
        assert_eq!(players.last_processed_input(1), Some(5));
        assert!(!players.get(1).unwrap().has_pending_input());
    }

    #[test]
    fn test_forward_input_moves_toward_negative_z() {
        let (mut physics, mut players, terrain) = setup();
        for seq in 1..=60 {
            players.queue_input(
                1,
                PlayerInput {
                    seq,
                    forward: 1.0,
                    ..PlayerInput::default()
                },
            );
            tick(&mut physics, &mut players, &terrain);
        }
        let velocity = physics.linvel(BodyId::Player(1)).unwrap();
        assert_approx_eq!(velocity.z, -MovementTuning::default().walk_speed, 0.3);
        assert!(physics.position(BodyId::Player(1)).unwrap().z < 32.0);
    }

    #[test]
    fn test_airborne_jump_rejected_but_acknowledged() {
        let (mut physics, mut players, terrain) = setup();
        physics
            .set_position(BodyId::Player(1), Vector3::new(32.0, 20.0, 32.0))
            .unwrap();
        tick(&mut physics, &mut players, &terrain);
        let before = physics.linvel(BodyId::Player(1)).unwrap().y;

        players.queue_input(
            1,
            PlayerInput {
                seq: 7,
                jump: true,
                ..PlayerInput::default()
            },
        );
        players.update(&mut physics, &terrain, DT);
        let after = physics.linvel(BodyId::Player(1)).unwrap().y;
        assert_eq!(before, after);
        assert_eq!(players.last_processed_input(1), Some(7));
    }

    #[test]
    fn test_grounded_jump_applies_once() {
        let (mut physics, mut players, terrain) = setup();
        for _ in 0..30 {
            tick(&mut physics, &mut players, &terrain);
        }
        assert!(players.get(1).unwrap().grounded);

        players.queue_input(
            1,
            PlayerInput {
                seq: 1,
                jump: true,
                ..PlayerInput::default()
            },
        );
        players.update(&mut physics, &terrain, DT);
        let jump_speed = MovementTuning::default().jump_speed;
        assert_approx_eq!(physics.linvel(BodyId::Player(1)).unwrap().y, jump_speed);
        physics.step();

        // The held input still says jump, but it is not fresh any more.
        players.update(&mut physics, &terrain, DT);
        assert!(physics.linvel(BodyId::Player(1)).unwrap().y < jump_speed);
    }

    #[test]
    fn test_fallen_player_is_lifted_above_terrain() {
        let (mut physics, mut players, terrain) = setup();
        physics
            .set_position(BodyId::Player(1), Vector3::new(32.0, -10.0, 32.0))
            .unwrap();
        players.update(&mut physics, &terrain, DT);
        let y = physics.position(BodyId::Player(1)).unwrap().y;
        assert!(y >= PLAYER_HALF_HEIGHT);
    }

    #[test]
    fn test_vehicle_occupant_is_not_tracked() {
        let (mut physics, mut players, _terrain) = setup();
        assert_eq!(players.tracked_positions(&physics).len(), 1);
        players.board_vehicle(1, 42, &mut physics).unwrap();
        assert!(players.tracked_positions(&physics).is_empty());
        assert_eq!(physics.is_enabled(BodyId::Player(1)), Some(false));

        players
            .leave_vehicle(1, Vector3::new(40.0, 2.0, 40.0), &mut physics)
            .unwrap();
        assert_eq!(players.tracked_positions(&physics).len(), 1);
        assert_eq!(
            physics.position(BodyId::Player(1)),
            Some(Vector3::new(40.0, 2.0, 40.0))
        );
    }

    #[test]
    fn test_remove_frees_body() {
        let (mut physics, mut players, _terrain) = setup();
        assert!(players.remove(1, &mut physics).is_some());
        assert!(!physics.contains(BodyId::Player(1)));
        assert!(players.remove(1, &mut physics).is_none());
        assert!(players.states(&physics).is_empty());
    }
}
