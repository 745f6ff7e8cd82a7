//! Server network layer handling WebSocket sessions and the tick loop

use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::game::{snapshot_for, GameEvent, GameState, PendingAction};
use crate::players::InputDisposition;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use shared::{
    decode, encode, sanitize_chat, sanitize_username, timestamp_millis, ChunkCoord, ClientPacket,
    EntityId, Frame, ServerPacket, WireFormat, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Messages sent from connection tasks to the main server loop
///
/// Generic over the decoded packet type so the relay shares the transport.
#[derive(Debug)]
pub enum ServerMessage<P = ClientPacket> {
    Connected {
        addr: SocketAddr,
        outbound: mpsc::Sender<Frame>,
    },
    PacketReceived {
        packet: P,
        addr: SocketAddr,
        format: WireFormat,
    },
    Disconnected {
        addr: SocketAddr,
    },
    Shutdown,
}

/// Stops a running server from another task.
pub struct ShutdownHandle<P = ClientPacket>(mpsc::UnboundedSender<ServerMessage<P>>);

impl<P> ShutdownHandle<P> {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage<P>>) -> Self {
        Self(tx)
    }

    pub fn shutdown(&self) {
        let _ = self.0.send(ServerMessage::Shutdown);
    }
}

impl<P> Clone for ShutdownHandle<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Authoritative server coordinating networking and the game simulation
pub struct Server {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    config: ServerConfig,
    clients: ClientManager,
    game: GameState,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let game = GameState::new(&config)?;
        Self::with_game(config, game).await
    }

    /// Binds the listener for an already constructed world.
    pub async fn with_game(config: ServerConfig, game: GameState) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on ws://{}", local_addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        Ok(Server {
            listener: Some(listener),
            local_addr,
            clients: ClientManager::new(config.max_clients, config.chunk_request_queue),
            config,
            game,
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.server_tx.clone())
    }

    pub fn game(&self) -> &GameState {
        &self.game
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    fn spawn_listener(&mut self) -> Result<(), ServerError> {
        let listener = self
            .listener
            .take()
            .ok_or(ServerError::Config("server is already running"))?;
        spawn_accept_loop(listener, self.server_tx.clone(), self.config.outbound_queue);
        Ok(())
    }

    /// Routes one message from a connection task
    pub fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Connected { addr, outbound } => self.handle_connect(addr, outbound),
            ServerMessage::PacketReceived {
                packet,
                addr,
                format,
            } => {
                let Some(client_id) = self.clients.find_client_by_addr(addr) else {
                    debug!("Packet from unknown address {}", addr);
                    return;
                };
                self.clients.touch(client_id, format);
                self.handle_packet(client_id, packet);
            }
            ServerMessage::Disconnected { addr } => {
                if let Some(client_id) = self.clients.find_client_by_addr(addr) {
                    self.disconnect_client(client_id);
                }
            }
            ServerMessage::Shutdown => {}
        }
    }

    fn handle_connect(&mut self, addr: SocketAddr, outbound: mpsc::Sender<Frame>) {
        // A reconnect from the same address replaces the stale session.
        if let Some(existing) = self.clients.find_client_by_addr(addr) {
            info!("Removing existing client {} from {}", existing, addr);
            self.disconnect_client(existing);
        }

        if self.clients.add_client(addr, outbound.clone()).is_none() {
            warn!("Rejecting {}: server full", addr);
            let packet = ServerPacket::Disconnect {
                reason: "Server full".to_string(),
            };
            if let Ok(frame) = encode(&packet, WireFormat::Json) {
                let _ = outbound.try_send(frame);
            }
        }
    }

    /// Records intent from one packet. Nothing here mutates the simulation.
    fn handle_packet(&mut self, client_id: EntityId, packet: ClientPacket) {
        match packet {
            ClientPacket::Handshake {
                username,
                appearance,
                protocol_version,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        "Client {} speaks protocol {}, expected {}",
                        client_id, protocol_version, PROTOCOL_VERSION
                    );
                    self.clients.send_to(
                        client_id,
                        &ServerPacket::Disconnect {
                            reason: format!("protocol version {} required", PROTOCOL_VERSION),
                        },
                    );
                    self.disconnect_client(client_id);
                    return;
                }
                if self.clients.is_playing(client_id) {
                    debug!("Ignoring repeated handshake from {}", client_id);
                    return;
                }
                self.game.enqueue(PendingAction::Join {
                    client_id,
                    username: sanitize_username(&username),
                    appearance: appearance.sanitized(),
                });
            }

            ClientPacket::Ping { client_time } => {
                self.clients.send_to(
                    client_id,
                    &ServerPacket::Pong {
                        client_time,
                        server_time: timestamp_millis(),
                    },
                );
            }

            ClientPacket::PlayerInput(input) => {
                if let InputDisposition::Stale = self.game.queue_input(client_id, input) {
                    debug!("Stale input {} from client {}", input.seq, client_id);
                }
            }

            ClientPacket::VehicleInput(input) => {
                self.game.queue_vehicle_input(client_id, input);
            }

            ClientPacket::VehicleEnter { vehicle_id } => {
                self.game.enqueue(PendingAction::VehicleEnter {
                    client_id,
                    vehicle_id,
                });
            }

            ClientPacket::VehicleExit => {
                self.game.enqueue(PendingAction::VehicleExit { client_id });
            }

            ClientPacket::ChunkRequest { chunk_x, chunk_z } => {
                self.clients
                    .queue_chunk_request(client_id, ChunkCoord::new(chunk_x, chunk_z));
            }

            ClientPacket::ChatMessage { message } => {
                let Some(message) = sanitize_chat(&message) else {
                    return;
                };
                let Some(username) = self
                    .game
                    .players()
                    .get(client_id)
                    .map(|p| p.username.clone())
                else {
                    return;
                };
                info!("[chat] {}: {}", username, message);
                self.clients.broadcast(
                    &ServerPacket::ChatMessage {
                        username,
                        message,
                        timestamp: timestamp_millis(),
                    },
                    None,
                );
            }

            ClientPacket::Disconnect => self.disconnect_client(client_id),
        }
    }

    /// Drops the session now and tears the player down on the next tick
    fn disconnect_client(&mut self, client_id: EntityId) {
        if self.clients.remove_client(client_id).is_some() {
            self.game.enqueue(PendingAction::Leave { client_id });
        }
    }

    fn dispatch(&mut self, events: Vec<GameEvent>) {
        for event in events {
            match event {
                GameEvent::Send { to, packet } => {
                    self.clients.send_to(to, &packet);
                }
                GameEvent::Broadcast { packet, exclude } => {
                    self.clients.broadcast(&packet, exclude);
                }
                GameEvent::PlayerJoined(client_id) => self.clients.mark_playing(client_id),
            }
        }
    }

    /// Serves a bounded number of chunk requests
    ///
    /// Requests outside the world or too far from the requester's own chunk
    /// are dropped.
    fn service_chunk_requests(&mut self) {
        let requests = self
            .clients
            .drain_chunk_requests(self.config.max_chunk_requests_per_tick);
        for (client_id, coord) in requests {
            if !coord.in_world() {
                debug!("Client {} requested out-of-world chunk {:?}", client_id, coord);
                continue;
            }
            let Some(center) = self.game.player_chunk(client_id) else {
                continue;
            };
            if center.chebyshev_distance(&coord) > self.config.max_chunk_request_distance {
                debug!(
                    "Client {} requested chunk {:?}, too far from {:?}",
                    client_id, coord, center
                );
                continue;
            }
            let data = self.game.chunk_data(coord);
            self.clients
                .send_to(client_id, &ServerPacket::ChunkData((*data).clone()));
        }
    }

    fn send_snapshots(&mut self, server_time: f64) {
        let playing = self.clients.playing_clients();
        if playing.is_empty() {
            return;
        }
        let base = self.game.world_snapshot(server_time);
        for client_id in playing {
            let ack = self.game.last_processed_input(client_id).unwrap_or(0);
            let packet = ServerPacket::WorldSnapshot(snapshot_for(&base, ack));
            self.clients.send_to(client_id, &packet);
        }
    }

    /// One fixed tick: simulate, then serve chunks and snapshots
    pub fn run_tick(&mut self) {
        let server_time = timestamp_millis();
        let events = self.game.tick(server_time);
        self.dispatch(events);
        self.service_chunk_requests();
        self.send_snapshots(server_time);

        let tick = self.game.tick_count();
        if tick % u64::from(self.config.tick_rate) == 0 {
            for client_id in self.clients.check_timeouts(self.config.client_timeout) {
                warn!("Client {} timed out", client_id);
                self.disconnect_client(client_id);
            }
        }

        // Periodic performance monitoring
        if tick % 60 == 0 && !self.clients.is_empty() {
            debug!(
                "Tick {}: {} clients, {} players, {} chunks loaded, {} bodies",
                tick,
                self.clients.len(),
                self.game.players().len(),
                self.game.chunks().loaded_count(),
                self.game.physics().body_count()
            );
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.spawn_listener()?;

        let mut tick_interval = interval(self.config.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Server started at {} Hz, physics radius {}",
            self.config.tick_rate, self.config.physics_radius
        );

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                        Some(message) => self.handle_message(message),
                    }
                },

                _ = tick_interval.tick() => self.run_tick(),
            }
        }

        Ok(())
    }
}

/// Spawns the task accepting TCP connections and upgrading them
pub fn spawn_accept_loop<P>(
    listener: TcpListener,
    server_tx: mpsc::UnboundedSender<ServerMessage<P>>,
    outbound_queue: usize,
) where
    P: DeserializeOwned + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        addr,
                        server_tx.clone(),
                        outbound_queue,
                    ));
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
            if server_tx.is_closed() {
                break;
            }
        }
    });
}

/// Upgrades one TCP stream and pumps frames in both directions
async fn handle_connection<P>(
    stream: TcpStream,
    addr: SocketAddr,
    server_tx: mpsc::UnboundedSender<ServerMessage<P>>,
    outbound_queue: usize,
) where
    P: DeserializeOwned + Send + 'static,
{
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut write, mut read) = ws.split();
    let (outbound, mut rx) = mpsc::channel::<Frame>(outbound_queue);

    if server_tx
        .send(ServerMessage::Connected { addr, outbound })
        .is_err()
    {
        return;
    }

    // Ends once the server drops this session's sender.
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(bytes) => Message::Binary(bytes),
            };
            if let Err(e) = write.send(message).await {
                debug!("Write to {} failed: {}", addr, e);
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(message) = read.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => Frame::Text(text),
            Ok(Message::Binary(bytes)) => Frame::Binary(bytes),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Read from {} failed: {}", addr, e);
                break;
            }
        };
        match decode::<P>(&frame) {
            Ok(packet) => {
                let message = ServerMessage::PacketReceived {
                    packet,
                    addr,
                    format: frame.format(),
                };
                if server_tx.send(message).is_err() {
                    break;
                }
            }
            Err(e) => warn!("Dropping malformed frame from {}: {}", addr, e),
        }
    }

    let _ = server_tx.send(ServerMessage::Disconnected { addr });
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Appearance, FlatTerrain, PlayerInput};

    async fn test_server() -> Server {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            spawn_vehicles: false,
            max_clients: 2,
            ..ServerConfig::default()
        };
        let game = GameState::with_terrain(&config, Box::new(FlatTerrain::new(0.0))).unwrap();
        Server::with_game(config, game).await.unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn connect(server: &mut Server, port: u16) -> mpsc::Receiver<Frame> {
        let (outbound, rx) = mpsc::channel(64);
        server.handle_message(ServerMessage::Connected {
            addr: addr(port),
            outbound,
        });
        rx
    }

    fn send(server: &mut Server, port: u16, packet: ClientPacket) {
        server.handle_message(ServerMessage::PacketReceived {
            packet,
            addr: addr(port),
            format: WireFormat::Json,
        });
    }

    fn handshake(server: &mut Server, port: u16) {
        send(
            server,
            port,
            ClientPacket::Handshake {
                username: "tester".to_string(),
                appearance: Appearance::default(),
                protocol_version: PROTOCOL_VERSION,
            },
        );
    }

    fn received(rx: &mut mpsc::Receiver<Frame>) -> Vec<ServerPacket> {
        let mut packets = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            packets.push(decode(&frame).unwrap());
        }
        packets
    }

    #[tokio::test]
    async fn test_handshake_then_snapshots() {
        let mut server = test_server().await;
        let mut rx = connect(&mut server, 1);
        handshake(&mut server, 1);

        // Nothing happens until the tick applies the join.
        assert!(received(&mut rx).is_empty());
        server.run_tick();

        let packets = received(&mut rx);
        assert!(matches!(packets[0], ServerPacket::HandshakeAck { client_id: 1, .. }));
        assert!(packets
            .iter()
            .any(|p| matches!(p, ServerPacket::WorldSnapshot(s) if s.players.len() == 1)));
    }

    #[tokio::test]
    async fn test_snapshot_acknowledges_input() {
        let mut server = test_server().await;
        let mut rx = connect(&mut server, 1);
        handshake(&mut server, 1);
        server.run_tick();
        received(&mut rx);

        for seq in [1, 2, 3] {
            send(
                &mut server,
                1,
                ClientPacket::PlayerInput(PlayerInput {
                    seq,
                    forward: 1.0,
                    ..PlayerInput::default()
                }),
            );
        }
        server.run_tick();
        let ack = received(&mut rx).into_iter().find_map(|p| match p {
            ServerPacket::WorldSnapshot(s) => Some(s.your_last_input_seq),
            _ => None,
        });
        assert_eq!(ack, Some(3));
    }

    #[tokio::test]
    async fn test_server_full_rejects() {
        let mut server = test_server().await;
        let _a = connect(&mut server, 1);
        let _b = connect(&mut server, 2);
        let mut c = connect(&mut server, 3);
        assert_eq!(server.clients().len(), 2);
        assert!(matches!(
            received(&mut c).as_slice(),
            [ServerPacket::Disconnect { .. }]
        ));
    }

    #[tokio::test]
    async fn test_wrong_protocol_version_disconnects() {
        let mut server = test_server().await;
        let mut rx = connect(&mut server, 1);
        send(
            &mut server,
            1,
            ClientPacket::Handshake {
                username: "old".to_string(),
                appearance: Appearance::default(),
                protocol_version: PROTOCOL_VERSION + 1,
            },
        );
        assert!(matches!(
            received(&mut rx).as_slice(),
            [ServerPacket::Disconnect { .. }]
        ));
        assert!(server.clients().is_empty());
    }

    #[tokio::test]
    async fn test_chunk_requests_served_within_range() {
        let mut server = test_server().await;
        let mut rx = connect(&mut server, 1);
        handshake(&mut server, 1);
        server.run_tick();
        received(&mut rx);

        send(&mut server, 1, ClientPacket::ChunkRequest { chunk_x: 1, chunk_z: 0 });
        send(&mut server, 1, ClientPacket::ChunkRequest { chunk_x: 500, chunk_z: 0 });
        server.run_tick();

        let chunks: Vec<(i32, i32)> = received(&mut rx)
            .into_iter()
            .filter_map(|p| match p {
                ServerPacket::ChunkData(c) => Some((c.chunk_x, c.chunk_z)),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![(1, 0)]);
    }

    #[tokio::test]
    async fn test_disconnect_removes_player_next_tick() {
        let mut server = test_server().await;
        let _a = connect(&mut server, 1);
        let mut b = connect(&mut server, 2);
        handshake(&mut server, 1);
        handshake(&mut server, 2);
        server.run_tick();
        received(&mut b);

        server.handle_message(ServerMessage::Disconnected { addr: addr(1) });
        assert_eq!(server.game().players().len(), 2);
        server.run_tick();
        assert_eq!(server.game().players().len(), 1);
        assert!(received(&mut b).iter().any(|p| matches!(
            p,
            ServerPacket::EntityDestroy { entity_id: 1, .. }
        )));
    }

    #[tokio::test]
    async fn test_oversized_appearance_keeps_snapshots_flowing() {
        let mut server = test_server().await;
        let mut honest = connect(&mut server, 1);
        let _greedy = connect(&mut server, 2);
        handshake(&mut server, 1);
        send(
            &mut server,
            2,
            ClientPacket::Handshake {
                username: "greedy".to_string(),
                appearance: Appearance {
                    body_color: "x".repeat(600_000),
                    shirt_color: "y".repeat(600_000),
                    hat: Some("z".repeat(600_000)),
                },
                protocol_version: PROTOCOL_VERSION,
            },
        );
        server.run_tick();
        received(&mut honest);

        for _ in 0..3 {
            server.run_tick();
        }
        let snapshots: Vec<_> = received(&mut honest)
            .into_iter()
            .filter_map(|p| match p {
                ServerPacket::WorldSnapshot(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(snapshots.len(), 3);
        let greedy = snapshots[2].players.iter().find(|p| p.id == 2).unwrap();
        assert!(greedy.appearance.body_color.len() <= shared::MAX_APPEARANCE_FIELD_LENGTH);
        assert_eq!(greedy.appearance.hat, None);
    }

    #[tokio::test]
    async fn test_chat_is_sanitized_and_broadcast() {
        let mut server = test_server().await;
        let mut rx = connect(&mut server, 1);
        handshake(&mut server, 1);
        server.run_tick();
        received(&mut rx);

        send(&mut server, 1, ClientPacket::ChatMessage { message: "   ".to_string() });
        send(&mut server, 1, ClientPacket::ChatMessage { message: " hello ".to_string() });
        let chats: Vec<String> = received(&mut rx)
            .into_iter()
            .filter_map(|p| match p {
                ServerPacket::ChatMessage { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(chats, vec!["hello".to_string()]);
    }
}
