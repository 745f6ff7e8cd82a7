//! Authoritative world state and the fixed tick.
//!
//! `GameState` is the one context object of the authoritative server: it owns
//! the physics world, chunk streaming, the player and vehicle managers and the
//! spawn resolver. Only the tick loop holds it. Network handlers talk to it
//! through [`GameState::enqueue`] and the input queues, which record intent
//! for the next tick and never touch physics directly.

use crate::chunks::ChunkStreamingManager;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::physics::{BodyId, PhysicsWorld, MAX_SANE_COORDINATE};
use crate::players::{InputDisposition, PlayerManager};
use crate::spawn::{SpawnPoint, SpawnResolver};
use crate::vehicles::{VehicleManager, VehicleSpec};
use log::{debug, info, warn};
use nalgebra::Vector3;
use shared::math::to_vector;
use shared::terrain::safe_ground_height;
use shared::{
    Appearance, ChunkCoord, ChunkData, Entity, EntityId, EntityKind, MovementTuning, NoiseTerrain,
    PlayerInput, ServerPacket, TerrainSampler, VehicleInput, WorldConfig, WorldSnapshot,
    CHUNK_RESOLUTION, CHUNK_SIZE, GRAVITY, PLAYER_HALF_HEIGHT, SPAWN_CLEARANCE,
};
use std::collections::VecDeque;
use std::sync::Arc;

/// Candidates examined when searching for the spawn point.
const SPAWN_SEARCH_BUDGET: usize = 512;

/// Intent recorded by the network side, applied at the start of a tick in
/// arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingAction {
    Join {
        client_id: EntityId,
        username: String,
        appearance: Appearance,
    },
    Leave {
        client_id: EntityId,
    },
    VehicleEnter {
        client_id: EntityId,
        vehicle_id: Option<EntityId>,
    },
    VehicleExit {
        client_id: EntityId,
    },
}

/// Outbound traffic produced by a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    Send {
        to: EntityId,
        packet: ServerPacket,
    },
    Broadcast {
        packet: ServerPacket,
        exclude: Option<EntityId>,
    },
    /// The client's player now exists; its session may enter `Playing`.
    PlayerJoined(EntityId),
}

pub struct GameState {
    config: ServerConfig,
    tuning: MovementTuning,
    terrain: Box<dyn TerrainSampler>,
    physics: PhysicsWorld,
    chunks: ChunkStreamingManager,
    players: PlayerManager,
    vehicles: VehicleManager,
    spawn: SpawnResolver,
    pending: VecDeque<PendingAction>,
    tick: u64,
}

impl GameState {
    /// World generated from the configured seed.
    pub fn new(config: &ServerConfig) -> Result<Self, ServerError> {
        Self::with_terrain(config, Box::new(NoiseTerrain::new(config.seed)))
    }

    /// Fails fast when the physics world cannot be created.
    pub fn with_terrain(
        config: &ServerConfig,
        terrain: Box<dyn TerrainSampler>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let physics =
            PhysicsWorld::new(GRAVITY, config.fixed_dt()).map_err(ServerError::PhysicsInit)?;
        let tuning = MovementTuning::default();

        let mut game = Self {
            config: config.clone(),
            tuning,
            terrain,
            physics,
            chunks: ChunkStreamingManager::new(config.physics_radius, config.max_chunk_ops_per_tick),
            players: PlayerManager::new(tuning),
            vehicles: VehicleManager::new(config.vehicle_enter_radius, GRAVITY),
            spawn: SpawnResolver::new(SPAWN_SEARCH_BUDGET),
            pending: VecDeque::new(),
            tick: 0,
        };

        if config.spawn_vehicles {
            let point = game.spawn.resolve(game.terrain.as_ref());
            let center = Vector3::new(point.x as f32, 0.0, point.z as f32);
            game.chunks.force_load(
                center,
                config.physics_radius,
                &mut game.physics,
                game.terrain.as_ref(),
            );
            let fleet =
                game.vehicles
                    .spawn_fleet(center, config.seed, game.terrain.as_ref(), &mut game.physics);
            info!("Spawned {} vehicles around the spawn point", fleet.len());
        }
        Ok(game)
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn physics(&self) -> &PhysicsWorld {
        &self.physics
    }

    pub fn players(&self) -> &PlayerManager {
        &self.players
    }

    pub fn vehicles(&self) -> &VehicleManager {
        &self.vehicles
    }

    pub fn chunks(&self) -> &ChunkStreamingManager {
        &self.chunks
    }

    pub fn terrain(&self) -> &dyn TerrainSampler {
        self.terrain.as_ref()
    }

    pub fn spawn_point(&mut self) -> SpawnPoint {
        self.spawn.resolve(self.terrain.as_ref())
    }

    pub fn world_config(&self) -> WorldConfig {
        WorldConfig {
            seed: self.config.seed,
            chunk_size: CHUNK_SIZE,
            chunk_resolution: CHUNK_RESOLUTION as u32,
            physics_radius: self.config.physics_radius,
            tick_rate: self.config.tick_rate,
            interpolation_delay_ms: self.config.interpolation_delay_ms,
            movement: self.tuning,
        }
    }

    pub fn enqueue(&mut self, action: PendingAction) {
        self.pending.push_back(action);
    }

    pub fn pending_actions(&self) -> usize {
        self.pending.len()
    }

    pub fn queue_input(&mut self, client_id: EntityId, input: PlayerInput) -> InputDisposition {
        self.players.queue_input(client_id, input)
    }

    pub fn queue_vehicle_input(&mut self, client_id: EntityId, input: VehicleInput) -> bool {
        self.vehicles.set_input(client_id, input)
    }

    pub fn last_processed_input(&self, client_id: EntityId) -> Option<u32> {
        self.players.last_processed_input(client_id)
    }

    /// Chunk containing the client's player, or their vehicle.
    pub fn player_chunk(&self, client_id: EntityId) -> Option<ChunkCoord> {
        let player = self.players.get(client_id)?;
        let body = match player.vehicle_id {
            Some(vehicle_id) => BodyId::Vehicle(vehicle_id),
            None => BodyId::Player(client_id),
        };
        let position = self.physics.position(body)?;
        Some(ChunkCoord::from_world(position.x, position.z))
    }

    pub fn chunk_data(&self, coord: ChunkCoord) -> Arc<ChunkData> {
        self.chunks.chunk_data(coord, self.terrain.as_ref())
    }

    /// Advances the world by one fixed step.
    ///
    /// Pending actions are applied first, then chunk streaming around every
    /// tracked position, player movement, vehicle force models and finally
    /// the physics step, in that order.
    pub fn tick(&mut self, server_time: f64) -> Vec<GameEvent> {
        let mut events = Vec::new();
        while let Some(action) = self.pending.pop_front() {
            self.apply_action(action, server_time, &mut events);
        }

        let dt = self.config.fixed_dt();
        let positions = self.tracked_positions();
        self.chunks
            .update(&positions, &mut self.physics, self.terrain.as_ref());
        self.park_unsupported_vehicles();

        self.players
            .update(&mut self.physics, self.terrain.as_ref(), dt);
        self.vehicles
            .update(&mut self.physics, self.terrain.as_ref(), dt);

        let report = self.physics.step();
        for body in report.unstable {
            self.repair(body);
        }

        self.tick += 1;
        events
    }

    /// Authoritative state of every entity as of the last completed tick.
    /// `your_last_input_seq` is left at zero for the caller to fill per client.
    pub fn world_snapshot(&self, server_time: f64) -> WorldSnapshot {
        WorldSnapshot {
            tick: self.tick,
            server_time,
            players: self.players.states(&self.physics),
            vehicles: self.vehicles.states(&self.physics),
            your_last_input_seq: 0,
        }
    }

    /// Non-vehicle players plus vehicles somebody is driving.
    fn tracked_positions(&self) -> Vec<Vector3<f32>> {
        let mut positions = self.players.tracked_positions(&self.physics);
        positions.extend(
            self.vehicles
                .ids()
                .into_iter()
                .filter(|id| {
                    self.vehicles
                        .get(*id)
                        .is_some_and(|v| v.driver_id.is_some())
                })
                .filter_map(|id| self.physics.position(BodyId::Vehicle(id))),
        );
        positions
    }

    /// Parked vehicles over unloaded terrain are frozen until their chunk is
    /// simulated again.
    fn park_unsupported_vehicles(&mut self) {
        for id in self.vehicles.ids() {
            let body = BodyId::Vehicle(id);
            let Some(position) = self.physics.position(body) else {
                continue;
            };
            let supported = self
                .chunks
                .is_loaded(ChunkCoord::from_world(position.x, position.z));
            if self.physics.is_enabled(body) != Some(supported) {
                if let Err(e) = self.physics.set_enabled(body, supported) {
                    warn!("Failed to toggle vehicle {}: {}", id, e);
                }
            }
        }
    }

    /// Puts a body that blew up back on the ground at rest.
    fn repair(&mut self, body: BodyId) {
        let Some(position) = self.physics.position(body) else {
            return;
        };
        let in_bounds = |c: f32| c.is_finite() && c.abs() < MAX_SANE_COORDINATE;
        let (x, z) = if in_bounds(position.x) && in_bounds(position.z) {
            (position.x, position.z)
        } else {
            let point = self.spawn.resolve(self.terrain.as_ref());
            (point.x as f32, point.z as f32)
        };
        let lift = match body {
            BodyId::Player(_) => PLAYER_HALF_HEIGHT + SPAWN_CLEARANCE,
            BodyId::Vehicle(id) => self
                .vehicles
                .get(id)
                .map(|v| v.spec.ride_height())
                .unwrap_or_else(|| VehicleSpec::for_type(shared::VehicleType::Car).ride_height()),
            BodyId::Chunk(_) => return,
        };
        let y = safe_ground_height(self.terrain.as_ref(), x, z) + lift;
        warn!("Repairing unstable body {:?}, moving to ({}, {}, {})", body, x, y, z);
        let repaired = self
            .physics
            .set_position(body, Vector3::new(x, y, z))
            .and_then(|_| self.physics.set_linvel(body, Vector3::zeros()))
            .and_then(|_| self.physics.set_angvel(body, Vector3::zeros()));
        if let Err(e) = repaired {
            warn!("Failed to repair {:?}: {}", body, e);
        }
    }

    fn apply_action(&mut self, action: PendingAction, server_time: f64, events: &mut Vec<GameEvent>) {
        match action {
            PendingAction::Join {
                client_id,
                username,
                appearance,
            } => self.join(client_id, username, appearance, server_time, events),
            PendingAction::Leave { client_id } => self.leave(client_id, events),
            PendingAction::VehicleEnter {
                client_id,
                vehicle_id,
            } => self.enter_vehicle(client_id, vehicle_id, events),
            PendingAction::VehicleExit { client_id } => self.exit_vehicle(client_id, events),
        }
    }

    fn join(
        &mut self,
        client_id: EntityId,
        username: String,
        appearance: Appearance,
        server_time: f64,
        events: &mut Vec<GameEvent>,
    ) {
        if self.players.contains(client_id) {
            debug!("Client {} sent a second handshake", client_id);
            return;
        }

        let position = self.spawn.next_position(self.terrain.as_ref());
        self.chunks.force_load(
            position,
            self.config.physics_radius,
            &mut self.physics,
            self.terrain.as_ref(),
        );
        if let Err(e) =
            self.players
                .spawn(client_id, username, appearance, position, &mut self.physics)
        {
            warn!("Could not spawn player for client {}: {}", client_id, e);
            events.push(GameEvent::Send {
                to: client_id,
                packet: ServerPacket::Disconnect {
                    reason: "spawn failed".to_string(),
                },
            });
            return;
        }

        events.push(GameEvent::Send {
            to: client_id,
            packet: ServerPacket::HandshakeAck {
                client_id,
                server_time,
                tick_rate: self.config.tick_rate,
                world_config: self.world_config(),
                spawn_position: [position.x, position.y, position.z],
            },
        });

        for other in self.players.states(&self.physics) {
            if other.id != client_id {
                events.push(GameEvent::Send {
                    to: client_id,
                    packet: ServerPacket::EntitySpawn {
                        entity: Entity::Player(other),
                    },
                });
            }
        }
        for vehicle in self.vehicles.states(&self.physics) {
            events.push(GameEvent::Send {
                to: client_id,
                packet: ServerPacket::EntitySpawn {
                    entity: Entity::Vehicle(vehicle),
                },
            });
        }

        if let Some(state) = self.players.state(client_id, &self.physics) {
            events.push(GameEvent::Broadcast {
                packet: ServerPacket::EntitySpawn {
                    entity: Entity::Player(state),
                },
                exclude: Some(client_id),
            });
        }
        events.push(GameEvent::PlayerJoined(client_id));
    }

    /// Tears a player down: out of any vehicle, body removed, others told.
    fn leave(&mut self, client_id: EntityId, events: &mut Vec<GameEvent>) {
        if !self.players.contains(client_id) {
            return;
        }
        if let Some((vehicle_id, exit_position)) =
            self.vehicles
                .exit(client_id, &self.physics, self.terrain.as_ref())
        {
            events.push(GameEvent::Broadcast {
                packet: ServerPacket::VehicleExit {
                    vehicle_id,
                    player_id: client_id,
                    exit_position: [exit_position.x, exit_position.y, exit_position.z],
                },
                exclude: Some(client_id),
            });
        }
        self.players.remove(client_id, &mut self.physics);
        events.push(GameEvent::Broadcast {
            packet: ServerPacket::EntityDestroy {
                entity_id: client_id,
                kind: EntityKind::Player,
            },
            exclude: Some(client_id),
        });
    }

    fn enter_vehicle(
        &mut self,
        client_id: EntityId,
        vehicle_id: Option<EntityId>,
        events: &mut Vec<GameEvent>,
    ) {
        let vehicle_id = match self.vehicles.enter(client_id, vehicle_id, &self.physics) {
            Ok(id) => id,
            Err(e) => {
                debug!("Vehicle enter by {} rejected: {}", client_id, e);
                return;
            }
        };
        if let Err(e) = self
            .players
            .board_vehicle(client_id, vehicle_id, &mut self.physics)
        {
            warn!("Failed to board player {}: {}", client_id, e);
            self.vehicles
                .exit(client_id, &self.physics, self.terrain.as_ref());
            return;
        }
        events.push(GameEvent::Broadcast {
            packet: ServerPacket::VehicleEnter {
                vehicle_id,
                player_id: client_id,
            },
            exclude: None,
        });
    }

    fn exit_vehicle(&mut self, client_id: EntityId, events: &mut Vec<GameEvent>) {
        let Some((vehicle_id, exit_position)) =
            self.vehicles
                .exit(client_id, &self.physics, self.terrain.as_ref())
        else {
            debug!("Client {} is not in a vehicle", client_id);
            return;
        };
        if let Err(e) = self
            .players
            .leave_vehicle(client_id, exit_position, &mut self.physics)
        {
            warn!("Failed to restore player {}: {}", client_id, e);
        }
        events.push(GameEvent::Broadcast {
            packet: ServerPacket::VehicleExit {
                vehicle_id,
                player_id: client_id,
                exit_position: [exit_position.x, exit_position.y, exit_position.z],
            },
            exclude: None,
        });
    }
}

/// Snapshot for one client: the shared world state plus that client's ack.
pub fn snapshot_for(base: &WorldSnapshot, last_processed_input: u32) -> WorldSnapshot {
    WorldSnapshot {
        your_last_input_seq: last_processed_input,
        ..base.clone()
    }
}

/// Position in a snapshot of the player with `id`.
pub fn snapshot_position(snapshot: &WorldSnapshot, id: EntityId) -> Option<Vector3<f32>> {
    snapshot
        .players
        .iter()
        .find(|p| p.id == id)
        .map(|p| to_vector(p.position))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::FlatTerrain;

    fn flat_game() -> GameState {
        let config = ServerConfig {
            spawn_vehicles: false,
            ..ServerConfig::default()
        };
        GameState::with_terrain(&config, Box::new(FlatTerrain::new(0.0))).unwrap()
    }

    fn join(game: &mut GameState, id: EntityId) -> Vec<GameEvent> {
        game.enqueue(PendingAction::Join {
            client_id: id,
            username: format!("p{}", id),
            appearance: Appearance::default(),
        });
        game.tick(0.0)
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let config = ServerConfig {
            tick_rate: 0,
            ..ServerConfig::default()
        };
        assert!(GameState::with_terrain(&config, Box::new(FlatTerrain::new(0.0))).is_err());
    }

    #[test]
    fn test_join_sends_ack_then_marks_playing() {
        let mut game = flat_game();
        let events = join(&mut game, 1);
        assert!(matches!(
            events.first(),
            Some(GameEvent::Send {
                to: 1,
                packet: ServerPacket::HandshakeAck { client_id: 1, .. }
            })
        ));
        assert_eq!(events.last(), Some(&GameEvent::PlayerJoined(1)));
        assert!(game.players().contains(1));
        // The spawn area is simulated immediately.
        let coord = game.player_chunk(1).unwrap();
        assert!(game.chunks().is_loaded(coord));
    }

    #[test]
    fn test_second_player_learns_about_first() {
        let mut game = flat_game();
        join(&mut game, 1);
        let events = join(&mut game, 2);
        assert!(events.iter().any(|e| matches!(
            e,
            GameEvent::Send {
                to: 2,
                packet: ServerPacket::EntitySpawn {
                    entity: Entity::Player(p)
                }
            } if p.id == 1
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            GameEvent::Broadcast {
                packet: ServerPacket::EntitySpawn { .. },
                exclude: Some(2)
            }
        )));
    }

    #[test]
    fn test_leave_broadcasts_destroy() {
        let mut game = flat_game();
        join(&mut game, 1);
        game.enqueue(PendingAction::Leave { client_id: 1 });
        let events = game.tick(0.0);
        assert!(events.contains(&GameEvent::Broadcast {
            packet: ServerPacket::EntityDestroy {
                entity_id: 1,
                kind: EntityKind::Player
            },
            exclude: Some(1),
        }));
        assert!(!game.physics().contains(BodyId::Player(1)));
        assert!(game.world_snapshot(0.0).players.is_empty());
    }

    #[test]
    fn test_snapshot_for_carries_ack() {
        let mut game = flat_game();
        join(&mut game, 1);
        game.queue_input(
            1,
            PlayerInput {
                seq: 4,
                ..PlayerInput::default()
            },
        );
        game.tick(0.0);
        let base = game.world_snapshot(12.0);
        let snapshot = snapshot_for(&base, game.last_processed_input(1).unwrap());
        assert_eq!(snapshot.your_last_input_seq, 4);
        assert_eq!(snapshot.tick, game.tick_count());
        assert!(snapshot_position(&snapshot, 1).is_some());
    }

    #[test]
    fn test_fleet_spawned_with_world() {
        let config = ServerConfig::default();
        let game = GameState::with_terrain(&config, Box::new(FlatTerrain::new(0.0))).unwrap();
        assert_eq!(game.vehicles().len(), shared::VehicleType::ALL.len());
    }

    #[test]
    fn test_unstable_body_is_repaired() {
        let mut game = flat_game();
        join(&mut game, 1);
        game.physics
            .set_position(BodyId::Player(1), Vector3::new(3.0e7, 5.0, 0.0))
            .unwrap();
        game.tick(0.0);
        let position = game.physics().position(BodyId::Player(1)).unwrap();
        assert!(position.y >= PLAYER_HALF_HEIGHT);
        assert_eq!(game.physics().linvel(BodyId::Player(1)), Some(Vector3::zeros()));
    }
}
