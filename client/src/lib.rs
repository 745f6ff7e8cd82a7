//! # Game Client Library
//!
//! Client side of the open-world netcode: everything a client needs to play
//! against the authoritative server, without any rendering. A graphical
//! frontend or the bundled headless bot drives it one frame at a time.
//!
//! ## Architecture Overview
//!
//! The server owns the simulation. The client only ever sends intent and
//! draws the world, but it hides the round trip from the player:
//!
//! ### Client-Side Prediction
//! Each frame's input is applied to the local player immediately, through
//! the same movement rules the server runs (`shared::movement`), and kept in
//! a bounded buffer until the server acknowledges it.
//!
//! ### Server Reconciliation
//! Every snapshot carries the sequence number of the last input the server
//! applied for this client. The client compares the authoritative state to
//! what it predicted for that input and corrects in three tiers: ignore
//! noise, ease out moderate drift, snap on large divergence. Unacknowledged
//! inputs are then replayed on top of the corrected state.
//!
//! ### Entity Interpolation
//! Other players and vehicles are drawn a fixed delay behind, blending each
//! update in with an eased curve and a small velocity lead.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Reconciliation thresholds, interpolation delay, buffer bounds, reconnect
//! and ping timing, render chunk radius.
//!
//! ### Input Module (`input`)
//! - Sequencing of per-frame intent into `PlayerInput`
//! - Vehicle controls while seated
//! - A seeded wandering bot for headless runs
//!
//! ### Prediction Module (`prediction`)
//! The prediction engine and its correction statistics.
//!
//! ### Interpolation Module (`interpolation`)
//! Smoothing descriptors and shortest-path rotation blending.
//!
//! ### Network Module (`network`)
//! - WebSocket connection on a background task
//! - Reconnect after a fixed delay
//! - JSON or bincode framing
//! - Clock offset estimation from ping round trips
//!
//! ### Game Module (`game`)
//! `ClientSession`, which ties the pieces above together, and the render
//! chunk tracker.
//!
//! ## Usage Example
//!
//! ```ignore
//! use client::config::ClientConfig;
//! use client::game::ClientSession;
//! use client::input::InputIntent;
//! use client::network::{NetworkClient, NetworkEvent};
//! use shared::{timestamp_millis, Appearance, WireFormat};
//!
//! let config = ClientConfig::default();
//! let mut network = NetworkClient::spawn("ws://127.0.0.1:8080", &config, WireFormat::Json);
//! let mut session = ClientSession::new(config, "player", Appearance::default());
//!
//! loop {
//!     let now = timestamp_millis();
//!     for event in network.poll_events() {
//!         match event {
//!             NetworkEvent::Connected => network.send(session.on_connected())?,
//!             NetworkEvent::Packet(packet) => session.handle_packet(packet, now),
//!             NetworkEvent::Disconnected { reason } => session.on_disconnected(&reason),
//!         }
//!     }
//!     for packet in session.frame(&InputIntent::default(), 1.0 / 60.0, now) {
//!         let _ = network.send(packet);
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod game;
pub mod input;
pub mod interpolation;
pub mod network;
pub mod prediction;

pub use config::ClientConfig;
pub use error::ClientError;
