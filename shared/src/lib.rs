//! Types and algorithms shared by the authoritative server and its clients.
//!
//! Everything that both sides must agree on bit-for-bit lives here: the wire
//! schema and codec, the player movement rules used for server simulation and
//! client prediction, the terrain oracle and deterministic chunk generation.

pub mod chunk;
pub mod codec;
pub mod entity;
pub mod math;
pub mod movement;
pub mod protocol;
pub mod terrain;

pub use chunk::{generate_chunk, ChunkCoord};
pub use codec::{decode, encode, CodecError, Frame, WireFormat};
pub use entity::{apply_update, serialize_entity, Entity, EntityError};
pub use movement::{MotionState, MovementOutcome, MovementTuning};
pub use protocol::*;
pub use terrain::{FlatTerrain, NoiseTerrain, TerrainSampler};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Edge length of a square terrain chunk in world units.
pub const CHUNK_SIZE: f32 = 64.0;
/// Heightfield samples per chunk side, shared edges included.
pub const CHUNK_RESOLUTION: usize = 17;
/// Chunk coordinates beyond this magnitude are outside the world.
pub const WORLD_CHUNK_LIMIT: i32 = 4096;

pub const GRAVITY: f32 = -9.81;
pub const PLAYER_HALF_HEIGHT: f32 = 0.9;
pub const PLAYER_RADIUS: f32 = 0.35;
/// Gap left between the ground and a player's feet when placing them.
pub const SPAWN_CLEARANCE: f32 = 0.1;
/// How far below the feet a surface still counts as ground.
pub const GROUND_PROBE_DISTANCE: f32 = 0.15;

pub const MAX_CHAT_LENGTH: usize = 256;
pub const MAX_USERNAME_LENGTH: usize = 32;
/// Longest colour or hat name a player may choose.
pub const MAX_APPEARANCE_FIELD_LENGTH: usize = 32;

/// Wall-clock time in milliseconds, the unit every timestamp on the wire uses.
pub fn timestamp_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs_f64()
        * 1000.0
}
