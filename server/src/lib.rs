//! # World Server Library
//!
//! This library provides the two server deployables of the voxel world: the
//! physics-authoritative server and the lightweight room relay. They share the
//! wire schema and the WebSocket transport but nothing else.
//!
//! ## Authoritative Mode
//!
//! ### Authoritative Simulation
//! The server owns the only physics world. Players, vehicles and the terrain
//! colliders around them are simulated here, and clients conform to the
//! snapshots the server sends once per tick.
//!
//! ### Intent, Not Mutation
//! Network handlers never touch physics. A packet only records intent: the
//! latest input for a client, a chunk it asked for, a vehicle it wants to
//! enter. The tick consumes that intent at a fixed point, so the physics world
//! has exactly one writer.
//!
//! ### Tick Order
//! Every tick runs the same sequence:
//! 1. apply pending joins, leaves and vehicle requests in arrival order
//! 2. gather the positions that need terrain (players on foot, driven vehicles)
//! 3. stream chunk colliders toward that required set, a few per tick
//! 4. move players from their latest input
//! 5. run each vehicle's force model
//! 6. step physics once and repair any body that blew up
//! 7. answer a bounded number of chunk requests
//! 8. send every playing client a snapshot carrying its own input ack
//!
//! Because the ack and the physics step that consumed the input belong to the
//! same tick, a client never sees its input acknowledged before it took effect.
//!
//! ## Relay Mode
//!
//! The relay forwards flagged messages to the other members of a room and
//! caches each peer's latest entity state for late joiners. It has no physics
//! and no reconciliation: peers trust each other, which is a much weaker
//! consistency model than the authoritative server.
//!
//! ## Module Organization
//!
//! - `physics`: the rapier3d world behind a small body-id keyed API
//! - `chunks`: rate-limited chunk collider streaming
//! - `players`: player bodies, input slots and movement
//! - `vehicles`: occupancy plus one force model per vehicle type
//! - `spawn`: spawn point search
//! - `game`: the tick context tying the above together
//! - `client_manager`: sessions, outbound queues and chunk request queues
//! - `network`: WebSocket transport and the tick loop
//! - `relay`: the room relay
//! - `config`, `error`: configuration and error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "0.0.0.0:8080".parse()?,
//!         ..ServerConfig::default()
//!     };
//!
//!     // Fails fast if the physics world cannot be created.
//!     let mut server = Server::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod chunks;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod game;
pub mod network;
pub mod physics;
pub mod players;
pub mod relay;
pub mod spawn;
pub mod vehicles;

pub use config::{ServerConfig, ServerMode};
pub use error::ServerError;
