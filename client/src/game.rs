use crate::config::ClientConfig;
use crate::input::{InputIntent, InputManager};
use crate::interpolation::Interpolator;
use crate::network::ClockSync;
use crate::prediction::{Correction, PredictionEngine, ReconcileSettings};
use log::{debug, info, warn};
use nalgebra::Vector3;
use shared::math::to_vector;
use shared::terrain::lattice_height;
use shared::{
    sanitize_chat, Appearance, ChunkCoord, ChunkData, ClientPacket, Entity, EntityId, EntityKind,
    MotionState, NoiseTerrain, PlayerState, ServerPacket, WorldConfig, WorldSnapshot,
    PROTOCOL_VERSION,
};
use std::collections::{HashMap, VecDeque};

const CHAT_HISTORY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatLine {
    pub username: String,
    pub message: String,
    pub timestamp: f64,
}

/// Chunks the client keeps for drawing, independent of the server's
/// physics radius.
pub struct RenderChunkTracker {
    radius: i32,
    per_frame: usize,
    retry_ms: f64,
    center: Option<ChunkCoord>,
    loaded: HashMap<ChunkCoord, ChunkData>,
    /// Outstanding requests and when they were sent.
    requested: HashMap<ChunkCoord, f64>,
}

impl RenderChunkTracker {
    pub fn new(radius: i32, per_frame: usize, retry_ms: f64) -> Self {
        Self {
            radius: radius.max(0),
            per_frame,
            retry_ms,
            center: None,
            loaded: HashMap::new(),
            requested: HashMap::new(),
        }
    }

    /// Moves the window to `center` and returns the chunks to ask for this
    /// frame, nearest first.
    pub fn requests(&mut self, center: ChunkCoord, now_ms: f64) -> Vec<ChunkCoord> {
        let radius = self.radius;
        if self.center != Some(center) {
            let before = self.loaded.len();
            self.loaded
                .retain(|coord, _| coord.chebyshev_distance(&center) <= radius);
            self.requested
                .retain(|coord, _| coord.chebyshev_distance(&center) <= radius);
            if self.loaded.len() < before {
                debug!("Forgot {} render chunks", before - self.loaded.len());
            }
            self.center = Some(center);
        }

        let mut wanted: Vec<ChunkCoord> = center
            .neighborhood(radius)
            .filter(|coord| coord.in_world() && !self.loaded.contains_key(coord))
            .filter(|coord| match self.requested.get(coord) {
                Some(&sent) => now_ms - sent >= self.retry_ms,
                None => true,
            })
            .collect();
        wanted.sort_by_key(|coord| coord.chebyshev_distance(&center));
        wanted.truncate(self.per_frame);

        for coord in &wanted {
            self.requested.insert(*coord, now_ms);
        }
        wanted
    }

    /// Stores a received chunk. Returns false if it is no longer wanted.
    pub fn on_chunk(&mut self, data: ChunkData) -> bool {
        let coord = data.coord();
        self.requested.remove(&coord);
        let wanted = self
            .center
            .map_or(false, |center| coord.chebyshev_distance(&center) <= self.radius);
        if wanted {
            self.loaded.insert(coord, data);
        }
        wanted
    }

    pub fn is_loaded(&self, coord: &ChunkCoord) -> bool {
        self.loaded.contains_key(coord)
    }

    pub fn get(&self, coord: &ChunkCoord) -> Option<&ChunkData> {
        self.loaded.get(coord)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    pub fn pending_count(&self) -> usize {
        self.requested.len()
    }

    pub fn clear(&mut self) {
        self.center = None;
        self.loaded.clear();
        self.requested.clear();
    }
}

/// Client side of one game session.
///
/// Consumes server packets and per-frame input, and produces the packets to
/// send. Owns no sockets, so it runs the same under the headless binary and
/// in tests.
pub struct ClientSession {
    config: ClientConfig,
    username: String,
    appearance: Appearance,
    client_id: Option<EntityId>,
    world: Option<WorldConfig>,
    terrain: NoiseTerrain,
    prediction: Option<PredictionEngine>,
    interpolator: Interpolator,
    input: InputManager,
    clock: ClockSync,
    chunks: RenderChunkTracker,
    vehicle_id: Option<EntityId>,
    last_snapshot_tick: Option<u64>,
    last_ping_ms: Option<f64>,
    chat: VecDeque<ChatLine>,
    disconnect_reason: Option<String>,
}

impl ClientSession {
    pub fn new(config: ClientConfig, username: impl Into<String>, appearance: Appearance) -> Self {
        let chunks = RenderChunkTracker::new(
            config.render_chunk_radius,
            config.max_chunk_requests_per_frame,
            config.chunk_request_retry.as_secs_f64() * 1000.0,
        );
        Self {
            interpolator: Interpolator::new(config.interpolation_delay_ms),
            config,
            username: username.into(),
            appearance,
            client_id: None,
            world: None,
            terrain: NoiseTerrain::new(0),
            prediction: None,
            input: InputManager::new(),
            clock: ClockSync::new(),
            chunks,
            vehicle_id: None,
            last_snapshot_tick: None,
            last_ping_ms: None,
            chat: VecDeque::new(),
            disconnect_reason: None,
        }
    }

    pub fn client_id(&self) -> Option<EntityId> {
        self.client_id
    }

    /// True once the server has accepted the handshake.
    pub fn is_playing(&self) -> bool {
        self.client_id.is_some() && self.prediction.is_some()
    }

    pub fn world_config(&self) -> Option<&WorldConfig> {
        self.world.as_ref()
    }

    pub fn vehicle_id(&self) -> Option<EntityId> {
        self.vehicle_id
    }

    pub fn prediction(&self) -> Option<&PredictionEngine> {
        self.prediction.as_ref()
    }

    pub fn interpolator(&self) -> &Interpolator {
        &self.interpolator
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn chunks(&self) -> &RenderChunkTracker {
        &self.chunks
    }

    pub fn chat(&self) -> impl Iterator<Item = &ChatLine> {
        self.chat.iter()
    }

    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnect_reason.as_deref()
    }

    /// Where the local player is drawn: the driven vehicle while driving,
    /// the corrected prediction otherwise.
    pub fn local_position(&self) -> Option<Vector3<f32>> {
        if let Some(transform) = self
            .vehicle_id
            .and_then(|id| self.interpolator.transform(id))
        {
            return Some(transform.position);
        }
        self.prediction.as_ref().map(|p| p.render_position())
    }

    /// A fresh transport connection is up; the server expects a handshake first.
    pub fn on_connected(&mut self) -> ClientPacket {
        self.disconnect_reason = None;
        self.last_ping_ms = None;
        ClientPacket::Handshake {
            username: self.username.clone(),
            appearance: self.appearance.clone(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// The link dropped. Prediction keeps running until a new handshake
    /// replaces it.
    pub fn on_disconnected(&mut self, reason: &str) {
        info!("Disconnected from server: {}", reason);
        self.client_id = None;
        self.disconnect_reason = Some(reason.to_string());
    }

    pub fn handle_packet(&mut self, packet: ServerPacket, now_ms: f64) {
        match packet {
            ServerPacket::HandshakeAck {
                client_id,
                server_time,
                tick_rate,
                world_config,
                spawn_position,
            } => {
                info!(
                    "Joined as {} ({} Hz, seed {}, server time {:.0})",
                    client_id, tick_rate, world_config.seed, server_time
                );
                self.client_id = Some(client_id);
                self.terrain = NoiseTerrain::new(world_config.seed);
                self.prediction = Some(PredictionEngine::new(
                    ReconcileSettings::from(&self.config),
                    world_config.movement,
                    to_vector(spawn_position),
                ));
                self.interpolator
                    .set_delay_ms(world_config.interpolation_delay_ms);
                self.interpolator.clear();
                self.chunks.clear();
                self.vehicle_id = None;
                self.last_snapshot_tick = None;
                self.world = Some(world_config);
            }
            ServerPacket::WorldSnapshot(snapshot) => self.apply_snapshot(snapshot, now_ms),
            ServerPacket::Pong {
                client_time,
                server_time,
            } => {
                self.clock.on_pong(client_time, server_time, now_ms);
            }
            ServerPacket::VehicleEnter {
                vehicle_id,
                player_id,
            } => {
                if Some(player_id) == self.client_id {
                    info!("Entered vehicle {}", vehicle_id);
                    self.vehicle_id = Some(vehicle_id);
                }
            }
            ServerPacket::VehicleExit {
                vehicle_id,
                player_id,
                exit_position,
            } => {
                if Some(player_id) == self.client_id {
                    info!("Left vehicle {}", vehicle_id);
                    self.vehicle_id = None;
                    if let Some(prediction) = self.prediction.as_mut() {
                        let stamina = prediction.predicted().stamina;
                        prediction.reset(MotionState::at(to_vector(exit_position), stamina));
                    }
                }
            }
            ServerPacket::ChunkData(data) => {
                let coord = data.coord();
                if !self.chunks.on_chunk(data) {
                    debug!("Discarding chunk {:?} outside render radius", coord);
                }
            }
            ServerPacket::EntitySpawn { entity } => match entity {
                Entity::Player(player) => {
                    if Some(player.id) != self.client_id {
                        self.interpolator.push_player(&player, now_ms);
                    }
                }
                Entity::Vehicle(vehicle) => self.interpolator.push_vehicle(&vehicle, now_ms),
                // Buildings arrive with their chunk.
                Entity::Building(_) => {}
            },
            ServerPacket::EntityDestroy { entity_id, kind } => {
                if self.interpolator.remove(entity_id) {
                    debug!("Removed {:?} {}", kind, entity_id);
                }
            }
            ServerPacket::ChatMessage {
                username,
                message,
                timestamp,
            } => {
                info!("<{}> {}", username, message);
                self.chat.push_back(ChatLine {
                    username,
                    message,
                    timestamp,
                });
                while self.chat.len() > CHAT_HISTORY {
                    self.chat.pop_front();
                }
            }
            ServerPacket::Disconnect { reason } => {
                warn!("Server closed the session: {}", reason);
                self.client_id = None;
                self.prediction = None;
                self.disconnect_reason = Some(reason);
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: WorldSnapshot, now_ms: f64) {
        let Some(client_id) = self.client_id else {
            return;
        };
        if self
            .last_snapshot_tick
            .map_or(false, |last| snapshot.tick <= last)
        {
            return;
        }
        self.last_snapshot_tick = Some(snapshot.tick);

        let mut others = Vec::with_capacity(snapshot.players.len());
        for player in &snapshot.players {
            if player.id == client_id {
                self.apply_local_state(player, snapshot.your_last_input_seq);
            } else {
                self.interpolator.push_player(player, now_ms);
                others.push(player.id);
            }
        }
        self.interpolator
            .retain_kind(EntityKind::Player, &others);

        let vehicles: Vec<EntityId> = snapshot.vehicles.iter().map(|v| v.id).collect();
        for vehicle in &snapshot.vehicles {
            self.interpolator.push_vehicle(vehicle, now_ms);
        }
        self.interpolator
            .retain_kind(EntityKind::Vehicle, &vehicles);
    }

    fn apply_local_state(&mut self, state: &PlayerState, ack: u32) {
        let Some(prediction) = self.prediction.as_mut() else {
            return;
        };
        self.vehicle_id = state.vehicle_id;
        if state.vehicle_id.is_some() {
            // The server drives the body while seated.
            prediction.reset(MotionState {
                position: to_vector(state.position),
                velocity: to_vector(state.velocity),
                grounded: state.grounded,
                stamina: state.stamina,
            });
            return;
        }

        let terrain = &self.terrain;
        let correction = prediction.reconcile(state, ack, |x, z| lattice_height(terrain, x, z));
        if let Correction::Snapped { error } = correction {
            info!("Snapped local player after {:.2} m divergence", error);
        }
    }

    /// Advances one local frame and returns the packets to send.
    pub fn frame(&mut self, intent: &InputIntent, dt: f32, now_ms: f64) -> Vec<ClientPacket> {
        let mut packets = Vec::new();
        self.interpolator.update(now_ms);

        let Some(prediction) = self.prediction.as_mut() else {
            return packets;
        };

        if self.vehicle_id.is_some() {
            let controls = self.input.vehicle_input(intent);
            packets.push(ClientPacket::VehicleInput(controls));
        } else {
            let input = self.input.next_input(intent);
            let terrain = &self.terrain;
            prediction.predict(input, dt, now_ms, |x, z| lattice_height(terrain, x, z));
            packets.push(ClientPacket::PlayerInput(input));
        }

        if let Some(position) = self.local_position() {
            let center = ChunkCoord::from_world(position.x, position.z);
            for coord in self.chunks.requests(center, now_ms) {
                packets.push(ClientPacket::ChunkRequest {
                    chunk_x: coord.x,
                    chunk_z: coord.z,
                });
            }
        }

        let ping_due = self.last_ping_ms.map_or(true, |last| {
            now_ms - last >= self.config.ping_interval.as_secs_f64() * 1000.0
        });
        if ping_due {
            self.last_ping_ms = Some(now_ms);
            packets.push(ClientPacket::Ping {
                client_time: now_ms,
            });
        }
        packets
    }

    /// A chat line to send, or `None` if nothing printable is left.
    pub fn say(&self, message: &str) -> Option<ClientPacket> {
        sanitize_chat(message).map(|message| ClientPacket::ChatMessage { message })
    }

    /// Asks to enter `vehicle_id`, or the nearest free vehicle when `None`.
    pub fn enter_vehicle(&self, vehicle_id: Option<EntityId>) -> Option<ClientPacket> {
        if self.vehicle_id.is_some() || !self.is_playing() {
            return None;
        }
        Some(ClientPacket::VehicleEnter { vehicle_id })
    }

    pub fn exit_vehicle(&self) -> Option<ClientPacket> {
        self.vehicle_id.map(|_| ClientPacket::VehicleExit)
    }
}
