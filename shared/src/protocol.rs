//! Wire schema for both deployables.
//!
//! Every message kind is a variant of a closed enum, so adding a message is a
//! compile-checked change at every `match`. The enums use serde's external
//! tagging, which both the JSON and the bincode encodings support.

use crate::entity::Entity;
use crate::math::{finite_or_zero, identity_rotation};
use crate::movement::MovementTuning;
use crate::{MAX_APPEARANCE_FIELD_LENGTH, MAX_CHAT_LENGTH, MAX_USERNAME_LENGTH};
use serde::{Deserialize, Serialize};

pub type EntityId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Car,
    Truck,
    Motorcycle,
    Tank,
    Helicopter,
    Hovercraft,
}

impl VehicleType {
    pub const ALL: [VehicleType; 6] = [
        VehicleType::Car,
        VehicleType::Truck,
        VehicleType::Motorcycle,
        VehicleType::Tank,
        VehicleType::Helicopter,
        VehicleType::Hovercraft,
    ];

    pub fn is_aircraft(self) -> bool {
        matches!(self, VehicleType::Helicopter)
    }

    pub fn wheel_count(self) -> usize {
        match self {
            VehicleType::Car | VehicleType::Truck => 4,
            VehicleType::Motorcycle => 2,
            VehicleType::Tank | VehicleType::Helicopter | VehicleType::Hovercraft => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Player,
    Vehicle,
    Building,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Biome {
    Plains,
    Forest,
    Desert,
    Mountains,
    Tundra,
    City,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Appearance {
    pub body_color: String,
    pub shirt_color: String,
    pub hat: Option<String>,
}

impl Appearance {
    /// Caps both colours and drops a hat name that is blank or too long.
    /// Appearance is copied into every snapshot, so it must stay small.
    pub fn sanitized(self) -> Self {
        let cap = |s: &str| -> String {
            s.trim().chars().take(MAX_APPEARANCE_FIELD_LENGTH).collect()
        };
        Self {
            body_color: cap(&self.body_color),
            shirt_color: cap(&self.shirt_color),
            hat: self.hat.filter(|hat| {
                let hat = hat.trim();
                !hat.is_empty() && hat.chars().count() <= MAX_APPEARANCE_FIELD_LENGTH
            }),
        }
    }
}

/// One sequenced frame of player intent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayerInput {
    pub seq: u32,
    pub forward: f32,
    pub right: f32,
    pub jump: bool,
    pub run: bool,
    pub crouch: bool,
    pub yaw: f32,
    pub timestamp: f64,
}

impl PlayerInput {
    /// Clamps axes to [-1, 1] and zeroes anything non-finite.
    pub fn sanitized(mut self) -> Self {
        self.forward = finite_or_zero(self.forward).clamp(-1.0, 1.0);
        self.right = finite_or_zero(self.right).clamp(-1.0, 1.0);
        self.yaw = finite_or_zero(self.yaw);
        self.timestamp = if self.timestamp.is_finite() {
            self.timestamp
        } else {
            0.0
        };
        self
    }

    pub fn has_movement(&self) -> bool {
        self.forward.abs() > 0.01 || self.right.abs() > 0.01
    }
}

/// Controls only aircraft read.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AircraftInput {
    pub collective: f32,
    pub pitch: f32,
    pub roll: f32,
    pub yaw: f32,
}

/// Ground controls every vehicle reads, with an explicitly present or absent
/// aircraft extension.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VehicleInput {
    pub throttle: f32,
    pub brake: f32,
    pub steering: f32,
    pub handbrake: bool,
    pub aircraft: Option<AircraftInput>,
}

impl VehicleInput {
    /// Input applied to a vehicle nobody drives.
    pub fn idle() -> Self {
        Self {
            handbrake: true,
            ..Self::default()
        }
    }

    pub fn sanitized(mut self) -> Self {
        self.throttle = finite_or_zero(self.throttle).clamp(-1.0, 1.0);
        self.brake = finite_or_zero(self.brake).clamp(0.0, 1.0);
        self.steering = finite_or_zero(self.steering).clamp(-1.0, 1.0);
        self.aircraft = self.aircraft.map(|a| AircraftInput {
            collective: finite_or_zero(a.collective).clamp(-1.0, 1.0),
            pitch: finite_or_zero(a.pitch).clamp(-1.0, 1.0),
            roll: finite_or_zero(a.roll).clamp(-1.0, 1.0),
            yaw: finite_or_zero(a.yaw).clamp(-1.0, 1.0),
        });
        self
    }

    /// Aircraft controls, neutral when the sender omitted them.
    pub fn aircraft_or_neutral(&self) -> AircraftInput {
        self.aircraft.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub id: EntityId,
    pub username: String,
    pub appearance: Appearance,
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub velocity: [f32; 3],
    pub angular_velocity: [f32; 3],
    pub health: f32,
    pub stamina: f32,
    pub grounded: bool,
    pub ground_normal: [f32; 3],
    pub vehicle_id: Option<EntityId>,
    pub last_processed_input: u32,
}

impl PlayerState {
    pub fn new(id: EntityId, username: impl Into<String>, position: [f32; 3]) -> Self {
        Self {
            id,
            username: username.into(),
            appearance: Appearance::default(),
            position,
            rotation: identity_rotation(),
            velocity: [0.0; 3],
            angular_velocity: [0.0; 3],
            health: 100.0,
            stamina: MovementTuning::default().max_stamina,
            grounded: false,
            ground_normal: [0.0, 1.0, 0.0],
            vehicle_id: None,
            last_processed_input: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WheelState {
    pub contact: bool,
    pub steer_angle: f32,
    pub compression: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub id: EntityId,
    pub vehicle_type: VehicleType,
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub velocity: [f32; 3],
    pub angular_velocity: [f32; 3],
    pub driver_id: Option<EntityId>,
    pub engine_running: bool,
    pub wheels: Vec<WheelState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuildingDescriptor {
    pub id: EntityId,
    /// Centre of the footprint at ground level.
    pub position: [f32; 3],
    /// Full width, height and depth.
    pub size: [f32; 3],
    /// Yaw in radians.
    pub rotation: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkData {
    pub chunk_x: i32,
    pub chunk_z: i32,
    /// Row-major heights, `CHUNK_RESOLUTION` rows along z.
    pub heightmap: Vec<f32>,
    pub buildings: Vec<BuildingDescriptor>,
    pub biome: Biome,
}

/// World parameters a client needs to predict and stream like the server does.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldConfig {
    pub seed: u32,
    pub chunk_size: f32,
    pub chunk_resolution: u32,
    pub physics_radius: i32,
    pub tick_rate: u32,
    pub interpolation_delay_ms: f64,
    pub movement: MovementTuning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub tick: u64,
    pub server_time: f64,
    pub players: Vec<PlayerState>,
    pub vehicles: Vec<VehicleState>,
    pub your_last_input_seq: u32,
}

/// Messages a client sends to the authoritative server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientPacket {
    Handshake {
        username: String,
        appearance: Appearance,
        protocol_version: u32,
    },
    Ping {
        client_time: f64,
    },
    PlayerInput(PlayerInput),
    VehicleInput(VehicleInput),
    VehicleEnter {
        vehicle_id: Option<EntityId>,
    },
    VehicleExit,
    ChunkRequest {
        chunk_x: i32,
        chunk_z: i32,
    },
    ChatMessage {
        message: String,
    },
    Disconnect,
}

/// Messages the authoritative server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerPacket {
    HandshakeAck {
        client_id: EntityId,
        server_time: f64,
        tick_rate: u32,
        world_config: WorldConfig,
        spawn_position: [f32; 3],
    },
    Pong {
        client_time: f64,
        server_time: f64,
    },
    WorldSnapshot(WorldSnapshot),
    VehicleEnter {
        vehicle_id: EntityId,
        player_id: EntityId,
    },
    VehicleExit {
        vehicle_id: EntityId,
        player_id: EntityId,
        exit_position: [f32; 3],
    },
    ChunkData(ChunkData),
    EntitySpawn {
        entity: Entity,
    },
    EntityDestroy {
        entity_id: EntityId,
        kind: EntityKind,
    },
    ChatMessage {
        username: String,
        message: String,
        timestamp: f64,
    },
    Disconnect {
        reason: String,
    },
}

/// Payloads peers exchange through the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayBody {
    EntitySpawn {
        entity: Entity,
    },
    EntityUpdate {
        entity: Entity,
    },
    EntityDestroy {
        entity_id: EntityId,
        kind: EntityKind,
    },
    ChatMessage {
        username: String,
        message: String,
        timestamp: f64,
    },
}

/// Messages a peer sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayClientPacket {
    Join { room: String, username: String },
    Relay { broadcast: bool, body: RelayBody },
    Ping { client_time: f64 },
}

/// Messages the relay sends to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayServerPacket {
    Welcome {
        peer_id: u32,
        room: String,
        cached: Vec<Entity>,
    },
    Forward {
        from: u32,
        body: RelayBody,
    },
    PeerLeft {
        peer_id: u32,
        destroyed: Vec<EntityId>,
    },
    Pong {
        client_time: f64,
        server_time: f64,
    },
}

/// Trims a username to the allowed length, substituting a placeholder for blanks.
pub fn sanitize_username(name: &str) -> String {
    let trimmed: String = name.trim().chars().take(MAX_USERNAME_LENGTH).collect();
    if trimmed.is_empty() {
        "player".to_string()
    } else {
        trimmed
    }
}

pub fn sanitize_chat(message: &str) -> Option<String> {
    let trimmed: String = message.trim().chars().take(MAX_CHAT_LENGTH).collect();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_input_sanitized_clamps_and_zeroes() {
        let input = PlayerInput {
            seq: 3,
            forward: 4.0,
            right: f32::NAN,
            yaw: f32::INFINITY,
            ..PlayerInput::default()
        }
        .sanitized();
        assert_eq!(input.forward, 1.0);
        assert_eq!(input.right, 0.0);
        assert_eq!(input.yaw, 0.0);
        assert_eq!(input.seq, 3);
    }

    #[test]
    fn test_vehicle_input_keeps_extension_presence() {
        let ground = VehicleInput {
            throttle: 2.0,
            ..VehicleInput::default()
        }
        .sanitized();
        assert_eq!(ground.throttle, 1.0);
        assert!(ground.aircraft.is_none());
        assert_eq!(ground.aircraft_or_neutral(), AircraftInput::default());

        let air = VehicleInput {
            aircraft: Some(AircraftInput {
                collective: -5.0,
                pitch: 0.5,
                roll: f32::NAN,
                yaw: 0.0,
            }),
            ..VehicleInput::default()
        }
        .sanitized();
        let controls = air.aircraft.unwrap();
        assert_eq!(controls.collective, -1.0);
        assert_eq!(controls.pitch, 0.5);
        assert_eq!(controls.roll, 0.0);
    }

    #[test]
    fn test_appearance_sanitized_caps_fields() {
        let appearance = Appearance {
            body_color: "x".repeat(600_000),
            shirt_color: " #ff0000 ".to_string(),
            hat: Some("h".repeat(MAX_APPEARANCE_FIELD_LENGTH + 1)),
        }
        .sanitized();
        assert_eq!(appearance.body_color.len(), MAX_APPEARANCE_FIELD_LENGTH);
        assert_eq!(appearance.shirt_color, "#ff0000");
        assert_eq!(appearance.hat, None);

        let cap = Appearance {
            hat: Some("cap".to_string()),
            ..Appearance::default()
        };
        assert_eq!(cap.clone().sanitized(), cap);
    }

    #[test]
    fn test_idle_vehicle_input_is_handbraked() {
        let idle = VehicleInput::idle();
        assert!(idle.handbrake);
        assert_eq!(idle.throttle, 0.0);
    }

    #[test]
    fn test_client_packet_json_shape() {
        let packet = ClientPacket::ChunkRequest {
            chunk_x: 2,
            chunk_z: -1,
        };
        let json = serde_json::to_string(&packet).unwrap();
        assert_eq!(json, r#"{"chunk_request":{"chunk_x":2,"chunk_z":-1}}"#);

        let unit: ClientPacket = serde_json::from_str(r#""vehicle_exit""#).unwrap();
        assert_eq!(unit, ClientPacket::VehicleExit);
    }

    #[test]
    fn test_unknown_message_kind_is_rejected() {
        let result = serde_json::from_str::<ClientPacket>(r#"{"teleport":{"x":1}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_sanitize_username_and_chat() {
        assert_eq!(sanitize_username("   "), "player");
        assert_eq!(sanitize_username(&"x".repeat(100)).len(), MAX_USERNAME_LENGTH);
        assert!(sanitize_chat("  ").is_none());
        assert_eq!(sanitize_chat(" hi ").as_deref(), Some("hi"));
    }

    #[test]
    fn test_wheel_counts() {
        assert_eq!(VehicleType::Car.wheel_count(), 4);
        assert_eq!(VehicleType::Motorcycle.wheel_count(), 2);
        assert_eq!(VehicleType::Tank.wheel_count(), 0);
        assert!(VehicleType::Helicopter.is_aircraft());
        assert!(!VehicleType::Hovercraft.is_aircraft());
    }
}
