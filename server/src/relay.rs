//! Room relay deployable.
//!
//! The relay runs no physics and never reconciles. Peers simulate their own
//! entities and the relay forwards their broadcasts to the rest of the room.
//! It remembers each peer's latest spawn or update per entity so late joiners
//! start from current state, and announces those entities destroyed when the
//! owning peer leaves. Consistency is only as good as the peers themselves.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::network::{spawn_accept_loop, ServerMessage, ShutdownHandle};
use log::{debug, info, warn};
use shared::{
    apply_update, encode, sanitize_chat, sanitize_username, serialize_entity, timestamp_millis,
    Entity, EntityId, Frame, RelayBody, RelayClientPacket, RelayServerPacket, WireFormat,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub type PeerId = u32;

/// A packet addressed to one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: PeerId,
    pub packet: RelayServerPacket,
}

#[derive(Default)]
struct Room {
    members: BTreeSet<PeerId>,
    /// Latest known state of every entity, per owning peer.
    cache: BTreeMap<PeerId, BTreeMap<EntityId, Entity>>,
}

impl Room {
    fn owner_of(&self, entity_id: EntityId) -> Option<PeerId> {
        self.cache
            .iter()
            .find(|(_, entities)| entities.contains_key(&entity_id))
            .map(|(peer, _)| *peer)
    }

    fn cached_for(&self, joiner: PeerId) -> Vec<Entity> {
        self.cache
            .iter()
            .filter(|(peer, _)| **peer != joiner)
            .flat_map(|(_, entities)| entities.values().cloned())
            .collect()
    }
}

struct Peer {
    username: String,
    room: Option<String>,
}

/// Room membership and entity caches, independent of any transport.
pub struct RelayHub {
    peers: HashMap<PeerId, Peer>,
    rooms: HashMap<String, Room>,
    next_peer_id: PeerId,
    max_peers: usize,
}

impl RelayHub {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            rooms: HashMap::new(),
            next_peer_id: 1,
            max_peers,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn members(&self, room: &str) -> Vec<PeerId> {
        self.rooms
            .get(room)
            .map(|r| r.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Registers a peer, or returns None when the relay is full.
    pub fn connect(&mut self) -> Option<PeerId> {
        if self.peers.len() >= self.max_peers {
            return None;
        }
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        self.peers.insert(
            id,
            Peer {
                username: String::new(),
                room: None,
            },
        );
        Some(id)
    }

    pub fn handle(&mut self, peer_id: PeerId, packet: RelayClientPacket) -> Vec<Delivery> {
        if !self.peers.contains_key(&peer_id) {
            return Vec::new();
        }
        match packet {
            RelayClientPacket::Join { room, username } => self.join(peer_id, room, username),
            RelayClientPacket::Relay { broadcast, body } => self.relay(peer_id, broadcast, body),
            RelayClientPacket::Ping { client_time } => vec![Delivery {
                to: peer_id,
                packet: RelayServerPacket::Pong {
                    client_time,
                    server_time: timestamp_millis(),
                },
            }],
        }
    }

    pub fn disconnect(&mut self, peer_id: PeerId) -> Vec<Delivery> {
        let deliveries = self.leave_room(peer_id);
        self.peers.remove(&peer_id);
        deliveries
    }

    fn join(&mut self, peer_id: PeerId, room: String, username: String) -> Vec<Delivery> {
        let mut deliveries = self.leave_room(peer_id);
        let room_name: String = room.trim().chars().take(64).collect();
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.username = sanitize_username(&username);
            peer.room = Some(room_name.clone());
        }
        let room = self.rooms.entry(room_name.clone()).or_default();
        room.members.insert(peer_id);
        info!(
            "Peer {} joined room '{}' ({} members)",
            peer_id,
            room_name,
            room.members.len()
        );
        deliveries.push(Delivery {
            to: peer_id,
            packet: RelayServerPacket::Welcome {
                peer_id,
                room: room_name,
                cached: room.cached_for(peer_id),
            },
        });
        deliveries
    }

    fn relay(&mut self, peer_id: PeerId, broadcast: bool, body: RelayBody) -> Vec<Delivery> {
        let Some(peer) = self.peers.get(&peer_id) else {
            return Vec::new();
        };
        let Some(room_name) = peer.room.clone() else {
            debug!("Peer {} relayed before joining a room", peer_id);
            return Vec::new();
        };
        let username = peer.username.clone();
        let Some(room) = self.rooms.get_mut(&room_name) else {
            return Vec::new();
        };

        let body = match body {
            RelayBody::EntitySpawn { entity } | RelayBody::EntityUpdate { entity }
                if room.owner_of(entity.id()).is_some_and(|owner| owner != peer_id) =>
            {
                debug!(
                    "Peer {} tried to overwrite entity {} it does not own",
                    peer_id,
                    entity.id()
                );
                return Vec::new();
            }
            RelayBody::EntitySpawn { entity } => {
                room.cache
                    .entry(peer_id)
                    .or_default()
                    .insert(entity.id(), entity.clone());
                RelayBody::EntitySpawn { entity }
            }
            RelayBody::EntityUpdate { entity } => {
                let entities = room.cache.entry(peer_id).or_default();
                let next = match entities.get(&entity.id()) {
                    Some(current) => match checked_update(current, &entity) {
                        Ok(next) => next,
                        Err(reason) => {
                            warn!("Rejected update from peer {}: {}", peer_id, reason);
                            return Vec::new();
                        }
                    },
                    None => entity,
                };
                entities.insert(next.id(), next.clone());
                RelayBody::EntityUpdate { entity: next }
            }
            RelayBody::EntityDestroy { entity_id, kind } => {
                if let Some(entities) = room.cache.get_mut(&peer_id) {
                    entities.remove(&entity_id);
                }
                RelayBody::EntityDestroy { entity_id, kind }
            }
            RelayBody::ChatMessage { message, .. } => {
                let Some(message) = sanitize_chat(&message) else {
                    return Vec::new();
                };
                RelayBody::ChatMessage {
                    username,
                    message,
                    timestamp: timestamp_millis(),
                }
            }
        };

        if !broadcast {
            return Vec::new();
        }
        room.members
            .iter()
            .filter(|member| **member != peer_id)
            .map(|member| Delivery {
                to: *member,
                packet: RelayServerPacket::Forward {
                    from: peer_id,
                    body: body.clone(),
                },
            })
            .collect()
    }

    fn leave_room(&mut self, peer_id: PeerId) -> Vec<Delivery> {
        let Some(room_name) = self.peers.get_mut(&peer_id).and_then(|p| p.room.take()) else {
            return Vec::new();
        };
        let Some(room) = self.rooms.get_mut(&room_name) else {
            return Vec::new();
        };
        room.members.remove(&peer_id);
        let destroyed: Vec<EntityId> = room
            .cache
            .remove(&peer_id)
            .map(|entities| entities.into_keys().collect())
            .unwrap_or_default();

        let deliveries = room
            .members
            .iter()
            .map(|member| Delivery {
                to: *member,
                packet: RelayServerPacket::PeerLeft {
                    peer_id,
                    destroyed: destroyed.clone(),
                },
            })
            .collect();
        if room.members.is_empty() {
            self.rooms.remove(&room_name);
            debug!("Room '{}' closed", room_name);
        }
        info!("Peer {} left room '{}'", peer_id, room_name);
        deliveries
    }
}

/// Applies `update` to the cached entity, rejecting kind or id changes.
fn checked_update(current: &Entity, update: &Entity) -> Result<Entity, String> {
    let bytes = serialize_entity(update).map_err(|e| e.to_string())?;
    apply_update(current.clone(), &bytes).map_err(|e| e.to_string())
}

/// Async shell around [`RelayHub`].
pub struct RelayServer {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    outbound_queue: usize,
    hub: RelayHub,
    peers: HashMap<SocketAddr, (PeerId, mpsc::Sender<Frame>, WireFormat)>,
    server_tx: mpsc::UnboundedSender<ServerMessage<RelayClientPacket>>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage<RelayClientPacket>>,
}

impl RelayServer {
    pub async fn new(config: &ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Relay listening on ws://{}", local_addr);
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        Ok(Self {
            listener: Some(listener),
            local_addr,
            outbound_queue: config.outbound_queue,
            hub: RelayHub::new(config.max_clients),
            peers: HashMap::new(),
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle<RelayClientPacket> {
        ShutdownHandle::new(self.server_tx.clone())
    }

    pub async fn run(&mut self) -> Result<(), ServerError> {
        let listener = self
            .listener
            .take()
            .ok_or(ServerError::Config("relay is already running"))?;
        spawn_accept_loop(listener, self.server_tx.clone(), self.outbound_queue);
        info!("Relay started");

        while let Some(message) = self.server_rx.recv().await {
            match message {
                ServerMessage::Connected { addr, outbound } => {
                    match self.hub.connect() {
                        Some(peer_id) => {
                            info!("Peer {} connected from {}", peer_id, addr);
                            self.peers
                                .insert(addr, (peer_id, outbound, WireFormat::Json));
                        }
                        None => warn!("Rejecting {}: relay full", addr),
                    }
                }
                ServerMessage::PacketReceived {
                    packet,
                    addr,
                    format,
                } => {
                    let Some(entry) = self.peers.get_mut(&addr) else {
                        continue;
                    };
                    entry.2 = format;
                    let peer_id = entry.0;
                    let deliveries = self.hub.handle(peer_id, packet);
                    self.deliver(deliveries);
                }
                ServerMessage::Disconnected { addr } => {
                    if let Some((peer_id, _, _)) = self.peers.remove(&addr) {
                        let deliveries = self.hub.disconnect(peer_id);
                        self.deliver(deliveries);
                    }
                }
                ServerMessage::Shutdown => {
                    info!("Relay shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            let Some((_, outbound, format)) =
                self.peers.values().find(|(id, _, _)| *id == delivery.to)
            else {
                continue;
            };
            match encode(&delivery.packet, *format) {
                Ok(frame) => {
                    if outbound.try_send(frame).is_err() {
                        warn!("Dropping frame for slow peer {}", delivery.to);
                    }
                }
                Err(e) => warn!("Failed to encode relay packet: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{BuildingDescriptor, EntityKind, PlayerState};

    fn player(id: EntityId, x: f32) -> Entity {
        Entity::Player(PlayerState::new(id, "p", [x, 0.0, 0.0]))
    }

    fn join(hub: &mut RelayHub, room: &str) -> PeerId {
        let peer = hub.connect().unwrap();
        hub.handle(
            peer,
            RelayClientPacket::Join {
                room: room.to_string(),
                username: format!("peer{}", peer),
            },
        );
        peer
    }

    fn relay(hub: &mut RelayHub, peer: PeerId, body: RelayBody) -> Vec<Delivery> {
        hub.handle(
            peer,
            RelayClientPacket::Relay {
                broadcast: true,
                body,
            },
        )
    }

    #[test]
    fn test_broadcast_reaches_room_only() {
        let mut hub = RelayHub::new(8);
        let a = join(&mut hub, "red");
        let b = join(&mut hub, "red");
        let _c = join(&mut hub, "blue");

        let deliveries = relay(&mut hub, a, RelayBody::EntitySpawn { entity: player(7, 1.0) });
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].to, b);
        assert!(matches!(
            deliveries[0].packet,
            RelayServerPacket::Forward { from, .. } if from == a
        ));
    }

    #[test]
    fn test_late_joiner_receives_latest_state() {
        let mut hub = RelayHub::new(8);
        let a = join(&mut hub, "red");
        relay(&mut hub, a, RelayBody::EntitySpawn { entity: player(7, 1.0) });
        relay(&mut hub, a, RelayBody::EntityUpdate { entity: player(7, 9.0) });

        let late = hub.connect().unwrap();
        let deliveries = hub.handle(
            late,
            RelayClientPacket::Join {
                room: "red".to_string(),
                username: "late".to_string(),
            },
        );
        match &deliveries[0].packet {
            RelayServerPacket::Welcome { cached, .. } => {
                assert_eq!(cached.len(), 1);
                assert_eq!(cached[0].position(), [9.0, 0.0, 0.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unflagged_message_is_cached_but_not_forwarded() {
        let mut hub = RelayHub::new(8);
        let a = join(&mut hub, "red");
        let _b = join(&mut hub, "red");
        let deliveries = hub.handle(
            a,
            RelayClientPacket::Relay {
                broadcast: false,
                body: RelayBody::EntitySpawn { entity: player(3, 0.0) },
            },
        );
        assert!(deliveries.is_empty());
        let c = hub.connect().unwrap();
        let welcome = hub.handle(
            c,
            RelayClientPacket::Join {
                room: "red".to_string(),
                username: "c".to_string(),
            },
        );
        assert!(matches!(
            &welcome[0].packet,
            RelayServerPacket::Welcome { cached, .. } if cached.len() == 1
        ));
    }

    #[test]
    fn test_kind_changing_update_rejected() {
        let mut hub = RelayHub::new(8);
        let a = join(&mut hub, "red");
        let _b = join(&mut hub, "red");
        let building = Entity::Building(BuildingDescriptor {
            id: 7,
            position: [0.0; 3],
            size: [4.0, 8.0, 4.0],
            rotation: 0.0,
        });
        relay(&mut hub, a, RelayBody::EntitySpawn { entity: building });
        let deliveries = relay(&mut hub, a, RelayBody::EntityUpdate { entity: player(7, 2.0) });
        assert!(deliveries.is_empty());
    }

    #[test]
    fn test_foreign_entity_cannot_be_overwritten() {
        let mut hub = RelayHub::new(8);
        let a = join(&mut hub, "red");
        let b = join(&mut hub, "red");
        relay(&mut hub, a, RelayBody::EntitySpawn { entity: player(7, 1.0) });
        assert!(relay(&mut hub, b, RelayBody::EntityUpdate { entity: player(7, 50.0) }).is_empty());
    }

    #[test]
    fn test_leaving_announces_destroyed_entities() {
        let mut hub = RelayHub::new(8);
        let a = join(&mut hub, "red");
        let b = join(&mut hub, "red");
        relay(&mut hub, a, RelayBody::EntitySpawn { entity: player(7, 1.0) });
        relay(&mut hub, a, RelayBody::EntitySpawn { entity: player(8, 1.0) });
        relay(
            &mut hub,
            a,
            RelayBody::EntityDestroy {
                entity_id: 8,
                kind: EntityKind::Player,
            },
        );

        let deliveries = hub.disconnect(a);
        assert_eq!(
            deliveries,
            vec![Delivery {
                to: b,
                packet: RelayServerPacket::PeerLeft {
                    peer_id: a,
                    destroyed: vec![7],
                },
            }]
        );
        hub.disconnect(b);
        assert_eq!(hub.room_count(), 0);
        assert_eq!(hub.peer_count(), 0);
    }

    #[test]
    fn test_relay_before_join_is_ignored() {
        let mut hub = RelayHub::new(1);
        let a = hub.connect().unwrap();
        assert!(hub.connect().is_none());
        assert!(relay(&mut hub, a, RelayBody::EntitySpawn { entity: player(1, 0.0) }).is_empty());
    }

    #[test]
    fn test_chat_uses_registered_username() {
        let mut hub = RelayHub::new(8);
        let a = join(&mut hub, "red");
        let _b = join(&mut hub, "red");
        let deliveries = relay(
            &mut hub,
            a,
            RelayBody::ChatMessage {
                username: "spoofed".to_string(),
                message: " hi ".to_string(),
                timestamp: 0.0,
            },
        );
        assert!(matches!(
            &deliveries[0].packet,
            RelayServerPacket::Forward {
                body: RelayBody::ChatMessage { username, message, .. },
                ..
            } if username == &format!("peer{}", a) && message == "hi"
        ));
    }
}
