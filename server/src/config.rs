//! Server configuration.

use crate::error::ServerError;
use std::net::SocketAddr;
use std::time::Duration;

/// Which deployable the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServerMode {
    /// Physics-authoritative server with reconciliation support.
    Authoritative,
    /// Room relay without physics; peers trust each other's state.
    Relay,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub mode: ServerMode,
    pub tick_rate: u32,
    pub max_clients: usize,
    pub client_timeout: Duration,
    pub seed: u32,
    /// Chebyshev radius of simulated chunks around each player.
    pub physics_radius: i32,
    /// Chunk loads and unloads each allowed per tick.
    pub max_chunk_ops_per_tick: usize,
    /// Chunk data requests served per tick across all clients.
    pub max_chunk_requests_per_tick: usize,
    pub chunk_request_queue: usize,
    /// Furthest a client may request chunks from its own chunk.
    pub max_chunk_request_distance: i32,
    pub outbound_queue: usize,
    pub vehicle_enter_radius: f32,
    pub spawn_vehicles: bool,
    pub interpolation_delay_ms: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            mode: ServerMode::Authoritative,
            tick_rate: shared::DEFAULT_TICK_RATE,
            max_clients: 32,
            client_timeout: Duration::from_secs(10),
            seed: 12345,
            physics_radius: 2,
            max_chunk_ops_per_tick: 2,
            max_chunk_requests_per_tick: 4,
            chunk_request_queue: 64,
            max_chunk_request_distance: 8,
            outbound_queue: 256,
            vehicle_enter_radius: 5.0,
            spawn_vehicles: true,
            interpolation_delay_ms: 100.0,
        }
    }
}

impl ServerConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate))
    }

    pub fn fixed_dt(&self) -> f32 {
        1.0 / self.tick_rate as f32
    }

    /// Rejects settings the tick loop cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.tick_rate == 0 || self.tick_rate > 240 {
            return Err(ServerError::Config("tick rate must be within 1..=240"));
        }
        if self.physics_radius < 0 {
            return Err(ServerError::Config("physics radius must not be negative"));
        }
        if self.max_chunk_ops_per_tick == 0 {
            return Err(ServerError::Config("chunk budget must be at least one per tick"));
        }
        if self.max_clients == 0 {
            return Err(ServerError::Config("max clients must be at least one"));
        }
        if self.outbound_queue == 0 {
            return Err(ServerError::Config("outbound queue must hold at least one frame"));
        }
        Ok(())
    }
}
