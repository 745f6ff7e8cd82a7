//! Connection bookkeeping for the authoritative server
//!
//! This module tracks every WebSocket session the server holds, including:
//! - Session lifecycle (connected, playing, disconnected) and timeouts
//! - The bounded outbound queue each session's writer task drains
//! - Per-client chunk request queues and their fair servicing
//! - Capacity limits and address lookup for incoming frames
//!
//! Nothing here touches the simulation. The game state decides what to send;
//! the client manager only knows where and in which wire format.

use log::{debug, info, warn};
use shared::{encode, ChunkCoord, EntityId, Frame, ServerPacket, WireFormat};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket open, handshake not yet completed
    Connected,
    /// Player spawned; receives snapshots and broadcasts
    Playing,
    /// Teardown in progress
    Disconnected,
}

/// Represents one connected WebSocket session
///
/// Each client maintains:
/// - Connection metadata (ID, address, last activity, wire format)
/// - The sending half of its writer task's queue
/// - Chunk coordinates it asked for that have not been served yet
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier, also the id of the client's player entity
    pub id: EntityId,
    /// Peer address, used to route frames from the reader task
    pub addr: SocketAddr,
    /// Last time any frame arrived from this client
    pub last_seen: Instant,
    pub state: SessionState,
    /// Encoding of the client's most recent frame; replies use the same
    pub format: WireFormat,
    /// Frames dropped because the outbound queue was full
    pub dropped_frames: u64,
    outbound: mpsc::Sender<Frame>,
    chunk_requests: VecDeque<ChunkCoord>,
    max_chunk_requests: usize,
}

impl Client {
    /// Creates a new session that has not handshaken yet
    pub fn new(
        id: EntityId,
        addr: SocketAddr,
        outbound: mpsc::Sender<Frame>,
        max_chunk_requests: usize,
    ) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            state: SessionState::Connected,
            format: WireFormat::Json,
            dropped_frames: 0,
            outbound,
            chunk_requests: VecDeque::new(),
            max_chunk_requests: max_chunk_requests.max(1),
        }
    }

    /// Checks if the client has exceeded the connection timeout
    ///
    /// Returns true if no frame has been received from this client within
    /// the given duration, indicating a dead connection.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    /// Queues a chunk request
    ///
    /// A coordinate already waiting is not queued twice. When the queue is
    /// full the oldest request is evicted, since the client has most likely
    /// moved on from it.
    pub fn queue_chunk_request(&mut self, coord: ChunkCoord) {
        if self.chunk_requests.contains(&coord) {
            return;
        }
        if self.chunk_requests.len() >= self.max_chunk_requests {
            self.chunk_requests.pop_front();
        }
        self.chunk_requests.push_back(coord);
    }

    pub fn pending_chunk_requests(&self) -> usize {
        self.chunk_requests.len()
    }

    /// Hands a frame to the writer task without waiting
    ///
    /// Returns false when the frame was dropped because the queue is full or
    /// the writer has gone away.
    pub fn send_frame(&mut self, frame: Frame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_frames += 1;
                if self.dropped_frames.is_power_of_two() {
                    warn!(
                        "Outbound queue of client {} full, {} frames dropped so far",
                        self.id, self.dropped_frames
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Encodes a packet at most once per wire format while fanning it out
#[derive(Default)]
struct EncodedPacket {
    json: Option<Frame>,
    binary: Option<Frame>,
}

impl EncodedPacket {
    fn frame(&mut self, packet: &ServerPacket, format: WireFormat) -> Option<Frame> {
        let slot = match format {
            WireFormat::Json => &mut self.json,
            WireFormat::Binary => &mut self.binary,
        };
        if slot.is_none() {
            match encode(packet, format) {
                Ok(frame) => *slot = Some(frame),
                Err(e) => {
                    warn!("Failed to encode packet: {}", e);
                    return None;
                }
            }
        }
        slot.clone()
    }
}

/// Manages all connected clients and their outbound traffic
///
/// The ClientManager enforces the server's capacity limit, maps peer
/// addresses to client ids and is the only place frames are handed to the
/// per-connection writer tasks.
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<EntityId, Client>,
    /// Next available client ID for new connections
    next_client_id: EntityId,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
    max_chunk_requests: usize,
    /// Client served first by the next chunk request round
    chunk_cursor: usize,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity limit
    ///
    /// Client IDs start from 1 and increment for each new connection. They
    /// never collide with vehicle ids, which start far higher.
    pub fn new(max_clients: usize, max_chunk_requests: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            max_chunk_requests,
            chunk_cursor: 0,
        }
    }

    /// Attempts to register a new connection
    ///
    /// Returns Some(client_id) if successful, None if the server is at
    /// capacity. The sender is the queue of the connection's writer task.
    pub fn add_client(&mut self, addr: SocketAddr, outbound: mpsc::Sender<Frame>) -> Option<EntityId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let client = Client::new(client_id, addr, outbound, self.max_chunk_requests);
        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, client);

        Some(client_id)
    }

    /// Removes a client from the server
    ///
    /// Returns the removed session, or None if it was already gone. Dropping
    /// the session drops its sender, which ends the writer task.
    pub fn remove_client(&mut self, client_id: EntityId) -> Option<Client> {
        let mut client = self.clients.remove(&client_id)?;
        client.state = SessionState::Disconnected;
        info!("Client {} disconnected", client.id);
        Some(client)
    }

    /// Finds a client ID by their network address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<EntityId> {
        self.clients
            .values()
            .find(|client| client.addr == addr)
            .map(|client| client.id)
    }

    pub fn get(&self, client_id: EntityId) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    /// Records activity and the frame's wire format for a client
    pub fn touch(&mut self, client_id: EntityId, format: WireFormat) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_seen = Instant::now();
            client.format = format;
        }
    }

    /// Moves a session to `Playing` once its player exists
    pub fn mark_playing(&mut self, client_id: EntityId) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.state = SessionState::Playing;
        }
    }

    pub fn is_playing(&self, client_id: EntityId) -> bool {
        self.clients
            .get(&client_id)
            .is_some_and(|c| c.state == SessionState::Playing)
    }

    /// IDs of every session in `Playing`, in ascending order
    pub fn playing_clients(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .clients
            .values()
            .filter(|c| c.state == SessionState::Playing)
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the IDs of clients that have been silent for too long
    ///
    /// The caller tears them down through the regular leave path so their
    /// players and vehicles are cleaned up like any other disconnect.
    pub fn check_timeouts(&self, timeout: Duration) -> Vec<EntityId> {
        let mut expired: Vec<EntityId> = self
            .clients
            .values()
            .filter(|c| c.is_timed_out(timeout))
            .map(|c| c.id)
            .collect();
        expired.sort_unstable();
        expired
    }

    pub fn queue_chunk_request(&mut self, client_id: EntityId, coord: ChunkCoord) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.queue_chunk_request(coord);
                true
            }
            None => false,
        }
    }

    /// Takes up to `budget` chunk requests across all clients
    ///
    /// Clients are visited round robin, one request each per pass, and the
    /// starting client rotates every call so no client is starved by a
    /// neighbour with a long queue.
    pub fn drain_chunk_requests(&mut self, budget: usize) -> Vec<(EntityId, ChunkCoord)> {
        let mut ids: Vec<EntityId> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        if ids.is_empty() || budget == 0 {
            return Vec::new();
        }
        let start = self.chunk_cursor % ids.len();
        ids.rotate_left(start);
        self.chunk_cursor = self.chunk_cursor.wrapping_add(1);

        let mut drained = Vec::new();
        while drained.len() < budget {
            let mut progressed = false;
            for id in &ids {
                if drained.len() >= budget {
                    break;
                }
                if let Some(coord) = self
                    .clients
                    .get_mut(id)
                    .and_then(|c| c.chunk_requests.pop_front())
                {
                    drained.push((*id, coord));
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        drained
    }

    /// Sends a packet to one client in that client's wire format
    pub fn send_to(&mut self, client_id: EntityId, packet: &ServerPacket) -> bool {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return false;
        };
        match encode(packet, client.format) {
            Ok(frame) => client.send_frame(frame),
            Err(e) => {
                warn!("Failed to encode packet for client {}: {}", client_id, e);
                false
            }
        }
    }

    /// Sends a packet to every playing client except `exclude`
    ///
    /// The packet is encoded once per wire format in use. Returns how many
    /// clients the frame was queued for.
    pub fn broadcast(&mut self, packet: &ServerPacket, exclude: Option<EntityId>) -> usize {
        let mut encoded = EncodedPacket::default();
        let mut sent = 0;
        for client in self.clients.values_mut() {
            if client.state != SessionState::Playing || Some(client.id) == exclude {
                continue;
            }
            if let Some(frame) = encoded.frame(packet, client.format) {
                if client.send_frame(frame) {
                    sent += 1;
                }
            }
        }
        debug!("Broadcast reached {} clients", sent);
        sent
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
