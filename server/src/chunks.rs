//! Terrain collider streaming.
//!
//! Keeps the set of chunks with colliders in the physics world equal to the
//! union of square neighbourhoods around tracked positions. Differences are
//! queued and drained at a fixed number of chunks per tick, so a teleport or a
//! crowd dispersing never turns into one enormous tick.

use crate::physics::{BodyId, PhysicsWorld};
use log::{debug, warn};
use nalgebra::Vector3;
use shared::{generate_chunk, ChunkCoord, ChunkData, TerrainSampler};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Unloaded,
    Queued,
    Loaded,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamingReport {
    pub loaded: Vec<ChunkCoord>,
    pub unloaded: Vec<ChunkCoord>,
}

/// Union of Chebyshev neighbourhoods around every position.
pub fn required_set(positions: &[Vector3<f32>], radius: i32) -> BTreeSet<ChunkCoord> {
    positions
        .iter()
        .flat_map(|p| ChunkCoord::from_world(p.x, p.z).neighborhood(radius))
        .filter(ChunkCoord::in_world)
        .collect()
}

pub struct ChunkStreamingManager {
    radius: i32,
    max_ops_per_tick: usize,
    loaded: HashMap<ChunkCoord, Arc<ChunkData>>,
    required: BTreeSet<ChunkCoord>,
    load_queue: VecDeque<ChunkCoord>,
    queued_loads: HashSet<ChunkCoord>,
    unload_queue: VecDeque<ChunkCoord>,
    queued_unloads: HashSet<ChunkCoord>,
}

impl ChunkStreamingManager {
    pub fn new(radius: i32, max_ops_per_tick: usize) -> Self {
        Self {
            radius: radius.max(0),
            max_ops_per_tick: max_ops_per_tick.max(1),
            loaded: HashMap::new(),
            required: BTreeSet::new(),
            load_queue: VecDeque::new(),
            queued_loads: HashSet::new(),
            unload_queue: VecDeque::new(),
            queued_unloads: HashSet::new(),
        }
    }

    pub fn radius(&self) -> i32 {
        self.radius
    }

    pub fn state(&self, coord: ChunkCoord) -> ChunkState {
        if self.loaded.contains_key(&coord) {
            ChunkState::Loaded
        } else if self.queued_loads.contains(&coord) {
            ChunkState::Queued
        } else {
            ChunkState::Unloaded
        }
    }

    pub fn is_loaded(&self, coord: ChunkCoord) -> bool {
        self.loaded.contains_key(&coord)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    pub fn loaded_coords(&self) -> BTreeSet<ChunkCoord> {
        self.loaded.keys().copied().collect()
    }

    pub fn pending_loads(&self) -> usize {
        self.load_queue.len()
    }

    pub fn pending_unloads(&self) -> usize {
        self.unload_queue.len()
    }

    /// Recomputes the required set and performs at most the per-tick budget of
    /// loads and of unloads.
    pub fn update(
        &mut self,
        positions: &[Vector3<f32>],
        physics: &mut PhysicsWorld,
        terrain: &dyn TerrainSampler,
    ) -> StreamingReport {
        self.required = required_set(positions, self.radius);

        // Queued work that no longer matches the required set is withdrawn, so
        // a chunk that became required again is never torn down.
        let required = &self.required;
        self.load_queue.retain(|c| required.contains(c));
        self.queued_loads.retain(|c| required.contains(c));
        self.unload_queue.retain(|c| !required.contains(c));
        self.queued_unloads.retain(|c| !required.contains(c));

        let mut new_loads: Vec<ChunkCoord> = self
            .required
            .iter()
            .filter(|c| !self.loaded.contains_key(c) && !self.queued_loads.contains(c))
            .copied()
            .collect();
        // Nearest chunks first so players get ground under them soonest.
        new_loads.sort_by_key(|c| (nearest_distance(*c, positions), *c));
        for coord in new_loads {
            self.queued_loads.insert(coord);
            self.load_queue.push_back(coord);
        }

        let mut new_unloads: Vec<ChunkCoord> = self
            .loaded
            .keys()
            .filter(|c| !self.required.contains(c) && !self.queued_unloads.contains(c))
            .copied()
            .collect();
        new_unloads.sort();
        for coord in new_unloads {
            self.queued_unloads.insert(coord);
            self.unload_queue.push_back(coord);
        }

        let mut report = StreamingReport::default();
        for _ in 0..self.max_ops_per_tick {
            let Some(coord) = self.load_queue.pop_front() else {
                break;
            };
            self.queued_loads.remove(&coord);
            if self.load(coord, physics, terrain) {
                report.loaded.push(coord);
            }
        }

        for _ in 0..self.max_ops_per_tick {
            let Some(coord) = self.unload_queue.pop_front() else {
                break;
            };
            self.queued_unloads.remove(&coord);
            if self.unload(coord, physics) {
                report.unloaded.push(coord);
            }
        }

        if !report.loaded.is_empty() || !report.unloaded.is_empty() {
            debug!(
                "Chunk streaming: +{} -{} (loaded {}, queued +{} -{})",
                report.loaded.len(),
                report.unloaded.len(),
                self.loaded.len(),
                self.load_queue.len(),
                self.unload_queue.len()
            );
        }
        report
    }

    /// Loads every chunk around `position` immediately, ignoring the per-tick
    /// budget. Returns how many chunks were newly loaded.
    pub fn force_load(
        &mut self,
        position: Vector3<f32>,
        radius: i32,
        physics: &mut PhysicsWorld,
        terrain: &dyn TerrainSampler,
    ) -> usize {
        let coords: Vec<ChunkCoord> = required_set(&[position], radius).into_iter().collect();
        let mut count = 0;
        for coord in coords {
            if self.queued_loads.remove(&coord) {
                self.load_queue.retain(|c| *c != coord);
            }
            if self.queued_unloads.remove(&coord) {
                self.unload_queue.retain(|c| *c != coord);
            }
            if self.load(coord, physics, terrain) {
                count += 1;
            }
        }
        count
    }

    /// Chunk content for a client request, generated on demand when the chunk
    /// is not simulated.
    pub fn chunk_data(&self, coord: ChunkCoord, terrain: &dyn TerrainSampler) -> Arc<ChunkData> {
        match self.loaded.get(&coord) {
            Some(data) => Arc::clone(data),
            None => Arc::new(generate_chunk(coord, terrain)),
        }
    }

    fn load(
        &mut self,
        coord: ChunkCoord,
        physics: &mut PhysicsWorld,
        terrain: &dyn TerrainSampler,
    ) -> bool {
        if self.loaded.contains_key(&coord) {
            return false;
        }
        let data = generate_chunk(coord, terrain);
        if let Err(e) = physics.create_chunk(&data) {
            warn!("Failed to create colliders for chunk {:?}: {}", coord, e);
            return false;
        }
        self.loaded.insert(coord, Arc::new(data));
        true
    }

    fn unload(&mut self, coord: ChunkCoord, physics: &mut PhysicsWorld) -> bool {
        if self.loaded.remove(&coord).is_none() {
            return false;
        }
        physics.remove(BodyId::Chunk(coord));
        true
    }
}

fn nearest_distance(coord: ChunkCoord, positions: &[Vector3<f32>]) -> i32 {
    positions
        .iter()
        .map(|p| ChunkCoord::from_world(p.x, p.z).chebyshev_distance(&coord))
        .min()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{FlatTerrain, CHUNK_SIZE, GRAVITY};

    fn world() -> PhysicsWorld {
        PhysicsWorld::new(GRAVITY, 1.0 / 60.0).unwrap()
    }

    fn at_chunk(x: i32, z: i32) -> Vector3<f32> {
        Vector3::new(
            (x as f32 + 0.5) * CHUNK_SIZE,
            0.0,
            (z as f32 + 0.5) * CHUNK_SIZE,
        )
    }

    fn run_until_settled(
        manager: &mut ChunkStreamingManager,
        positions: &[Vector3<f32>],
        physics: &mut PhysicsWorld,
        terrain: &FlatTerrain,
        max_ticks: usize,
    ) -> usize {
        for tick in 1..=max_ticks {
            manager.update(positions, physics, terrain);
            if manager.pending_loads() == 0
                && manager.pending_unloads() == 0
                && manager.loaded_coords() == required_set(positions, manager.radius())
            {
                return tick;
            }
        }
        panic!("streaming did not settle in {} ticks", max_ticks);
    }

    #[test]
    fn test_required_set_is_union_of_squares() {
        let set = required_set(&[at_chunk(0, 0), at_chunk(1, 0)], 1);
        assert_eq!(set.len(), 12);
        assert!(required_set(&[], 3).is_empty());
    }

    #[test]
    fn test_loads_are_rate_limited() {
        let terrain = FlatTerrain::new(0.0);
        let mut physics = world();
        let mut manager = ChunkStreamingManager::new(1, 2);
        let report = manager.update(&[at_chunk(0, 0)], &mut physics, &terrain);
        assert_eq!(report.loaded.len(), 2);
        assert_eq!(manager.pending_loads(), 7);
        assert_eq!(manager.state(ChunkCoord::new(0, 0)), ChunkState::Loaded);
        assert_eq!(physics.body_count(), 2);
    }

    #[test]
    fn test_converges_within_bound() {
        let terrain = FlatTerrain::new(0.0);
        let mut physics = world();
        let mut manager = ChunkStreamingManager::new(1, 2);
        let ticks = run_until_settled(&mut manager, &[at_chunk(0, 0)], &mut physics, &terrain, 10);
        assert!(ticks <= 5);

        // Teleport far away: 9 loads and 9 unloads, 2 of each per tick.
        let ticks = run_until_settled(&mut manager, &[at_chunk(20, 20)], &mut physics, &terrain, 10);
        assert!(ticks <= 9);
        assert_eq!(physics.body_count(), 9);
    }

    #[test]
    fn test_chunk_required_again_is_never_unloaded() {
        let terrain = FlatTerrain::new(0.0);
        let mut physics = world();
        let mut manager = ChunkStreamingManager::new(1, 1);
        run_until_settled(&mut manager, &[at_chunk(0, 0)], &mut physics, &terrain, 20);

        // Leave, letting unloads queue up, then come back before they drain.
        manager.update(&[at_chunk(10, 0)], &mut physics, &terrain);
        assert_eq!(manager.pending_unloads(), 8);
        let report = manager.update(&[at_chunk(0, 0)], &mut physics, &terrain);
        assert_eq!(report.unloaded, vec![ChunkCoord::new(10, 0)]);
        assert_eq!(report.loaded, vec![ChunkCoord::new(-1, -1)]);
        assert_eq!(manager.pending_unloads(), 0);
        for coord in ChunkCoord::new(0, 0).neighborhood(1) {
            assert!(manager.is_loaded(coord), "{:?} was unloaded", coord);
        }
    }

    #[test]
    fn test_load_is_idempotent() {
        let terrain = FlatTerrain::new(0.0);
        let mut physics = world();
        let mut manager = ChunkStreamingManager::new(0, 2);
        assert_eq!(manager.force_load(at_chunk(3, 3), 0, &mut physics, &terrain), 1);
        assert_eq!(manager.force_load(at_chunk(3, 3), 0, &mut physics, &terrain), 0);
        let report = manager.update(&[at_chunk(3, 3)], &mut physics, &terrain);
        assert!(report.loaded.is_empty());
        assert_eq!(physics.body_count(), 1);
    }

    #[test]
    fn test_force_load_bypasses_budget() {
        let terrain = FlatTerrain::new(0.0);
        let mut physics = world();
        let mut manager = ChunkStreamingManager::new(2, 1);
        let count = manager.force_load(at_chunk(0, 0), 2, &mut physics, &terrain);
        assert_eq!(count, 25);
        assert_eq!(manager.loaded_count(), 25);
    }

    #[test]
    fn test_chunk_data_served_without_loading() {
        let terrain = FlatTerrain::new(4.0);
        let manager = ChunkStreamingManager::new(1, 2);
        let data = manager.chunk_data(ChunkCoord::new(7, -7), &terrain);
        assert_eq!(data.coord(), ChunkCoord::new(7, -7));
        assert!(!manager.is_loaded(ChunkCoord::new(7, -7)));
    }
}
