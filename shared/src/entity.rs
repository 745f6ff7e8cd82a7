//! The `Entity` variant and its serialization.
//!
//! Per-kind behaviour lives in `match` arms rather than trait objects; an update
//! is simply a newer encoded state of the same entity.

use crate::codec::{decode_binary, encode_binary, CodecError};
use crate::protocol::{BuildingDescriptor, EntityId, EntityKind, PlayerState, VehicleState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Player(PlayerState),
    Vehicle(VehicleState),
    Building(BuildingDescriptor),
}

#[derive(Debug, Error)]
pub enum EntityError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("cannot apply a {update:?} update to a {entity:?}")]
    KindMismatch {
        entity: EntityKind,
        update: EntityKind,
    },
    #[error("update for entity {update} applied to entity {entity}")]
    IdMismatch { entity: EntityId, update: EntityId },
    #[error("building {0} is immutable")]
    Immutable(EntityId),
}

impl Entity {
    pub fn id(&self) -> EntityId {
        match self {
            Entity::Player(player) => player.id,
            Entity::Vehicle(vehicle) => vehicle.id,
            Entity::Building(building) => building.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Player(_) => EntityKind::Player,
            Entity::Vehicle(_) => EntityKind::Vehicle,
            Entity::Building(_) => EntityKind::Building,
        }
    }

    pub fn position(&self) -> [f32; 3] {
        match self {
            Entity::Player(player) => player.position,
            Entity::Vehicle(vehicle) => vehicle.position,
            Entity::Building(building) => building.position,
        }
    }
}

pub fn serialize_entity(entity: &Entity) -> Result<Vec<u8>, CodecError> {
    encode_binary(entity)
}

/// Replaces `entity` with the state encoded in `bytes`.
///
/// The update must describe the same entity: same kind, same id. Buildings
/// never change once created.
pub fn apply_update(entity: Entity, bytes: &[u8]) -> Result<Entity, EntityError> {
    let update: Entity = decode_binary(bytes)?;
    if update.kind() != entity.kind() {
        return Err(EntityError::KindMismatch {
            entity: entity.kind(),
            update: update.kind(),
        });
    }
    if update.id() != entity.id() {
        return Err(EntityError::IdMismatch {
            entity: entity.id(),
            update: update.id(),
        });
    }
    match (entity, update) {
        (Entity::Building(current), Entity::Building(next)) => {
            if current == next {
                Ok(Entity::Building(current))
            } else {
                Err(EntityError::Immutable(current.id))
            }
        }
        (_, next) => Ok(next),
    }
}
