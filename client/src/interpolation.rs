//! Smoothing of remote entities.
//!
//! Remote updates are never applied directly. Each one starts a blend from
//! the currently rendered transform toward the received one over a fixed
//! delay, with a small velocity lead so motion does not stall at the end of
//! the window.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use shared::math::{smoothstep, to_rotation, to_vector};
use shared::{EntityId, EntityKind, PlayerState, VehicleState};
use std::collections::HashMap;

/// Above this quaternion dot product the rotations are treated as identical
/// and blended linearly.
const NLERP_THRESHOLD: f32 = 0.9995;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
}

/// One blend in progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Smoothing {
    pub from: Transform,
    pub to: Transform,
    pub velocity: Vector3<f32>,
    pub start_ms: f64,
    pub duration_ms: f64,
}

impl Smoothing {
    /// Transform at local time `now_ms`.
    pub fn sample(&self, now_ms: f64) -> Transform {
        let t = if self.duration_ms > 0.0 {
            ((now_ms - self.start_ms) / self.duration_ms).clamp(0.0, 1.0) as f32
        } else {
            1.0
        };
        let eased = smoothstep(t);
        let lead = self.velocity * ((1.0 - eased) * (self.duration_ms / 1000.0) as f32);
        let target = self.to.position + lead;
        Transform {
            position: self.from.position.lerp(&target, eased),
            rotation: blend_rotation(&self.from.rotation, &self.to.rotation, eased),
        }
    }

    pub fn is_finished(&self, now_ms: f64) -> bool {
        now_ms - self.start_ms >= self.duration_ms
    }
}

/// Shortest-path rotation blend.
pub fn blend_rotation(
    from: &UnitQuaternion<f32>,
    to: &UnitQuaternion<f32>,
    t: f32,
) -> UnitQuaternion<f32> {
    let mut target: Quaternion<f32> = *to.quaternion();
    let mut dot = from.quaternion().dot(&target);
    if dot < 0.0 {
        target = -target;
        dot = -dot;
    }
    let target = UnitQuaternion::new_unchecked(target);
    if dot > NLERP_THRESHOLD {
        from.nlerp(&target, t)
    } else {
        from.slerp(&target, t)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteEntity {
    pub kind: EntityKind,
    pub rendered: Transform,
    pub smoothing: Option<Smoothing>,
    pub last_update_ms: f64,
}

/// Rendered transforms of every entity other than the local player.
pub struct Interpolator {
    delay_ms: f64,
    entities: HashMap<EntityId, RemoteEntity>,
}

impl Interpolator {
    pub fn new(delay_ms: f64) -> Self {
        Self {
            delay_ms: delay_ms.max(0.0),
            entities: HashMap::new(),
        }
    }

    pub fn delay_ms(&self) -> f64 {
        self.delay_ms
    }

    pub fn set_delay_ms(&mut self, delay_ms: f64) {
        self.delay_ms = delay_ms.max(0.0);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: EntityId) -> Option<&RemoteEntity> {
        self.entities.get(&id)
    }

    pub fn transform(&self, id: EntityId) -> Option<Transform> {
        self.entities.get(&id).map(|e| e.rendered)
    }

    /// Records a new target. The first update of an entity places it directly.
    pub fn push(
        &mut self,
        id: EntityId,
        kind: EntityKind,
        target: Transform,
        velocity: Vector3<f32>,
        now_ms: f64,
    ) {
        let delay_ms = self.delay_ms;
        match self.entities.get_mut(&id) {
            Some(entity) => {
                // Start from wherever the entity is drawn right now.
                if let Some(smoothing) = entity.smoothing {
                    entity.rendered = smoothing.sample(now_ms);
                }
                entity.smoothing = Some(Smoothing {
                    from: entity.rendered,
                    to: target,
                    velocity,
                    start_ms: now_ms,
                    duration_ms: delay_ms,
                });
                entity.last_update_ms = now_ms;
            }
            None => {
                self.entities.insert(
                    id,
                    RemoteEntity {
                        kind,
                        rendered: target,
                        smoothing: None,
                        last_update_ms: now_ms,
                    },
                );
            }
        }
    }

    pub fn push_player(&mut self, state: &PlayerState, now_ms: f64) {
        let target = Transform {
            position: to_vector(state.position),
            rotation: to_rotation(state.rotation),
        };
        self.push(
            state.id,
            EntityKind::Player,
            target,
            to_vector(state.velocity),
            now_ms,
        );
    }

    pub fn push_vehicle(&mut self, state: &VehicleState, now_ms: f64) {
        let target = Transform {
            position: to_vector(state.position),
            rotation: to_rotation(state.rotation),
        };
        self.push(
            state.id,
            EntityKind::Vehicle,
            target,
            to_vector(state.velocity),
            now_ms,
        );
    }

    /// Advances every rendered transform to `now_ms`.
    pub fn update(&mut self, now_ms: f64) {
        for entity in self.entities.values_mut() {
            if let Some(smoothing) = entity.smoothing {
                entity.rendered = smoothing.sample(now_ms);
                if smoothing.is_finished(now_ms) {
                    entity.smoothing = None;
                }
            }
        }
    }

    pub fn remove(&mut self, id: EntityId) -> bool {
        self.entities.remove(&id).is_some()
    }

    /// Drops entities of `kind` that are not in `present`.
    pub fn retain_kind(&mut self, kind: EntityKind, present: &[EntityId]) {
        self.entities
            .retain(|id, entity| entity.kind != kind || present.contains(id));
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }
}
