//! Chunk addressing and deterministic chunk content generation.

use crate::protocol::{BuildingDescriptor, ChunkData, EntityId};
use crate::terrain::{hash2, splitmix64, TerrainSampler};
use crate::{CHUNK_RESOLUTION, CHUNK_SIZE, WORLD_CHUNK_LIMIT};
use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;

/// Lots per chunk side on which buildings may be placed.
const LOTS_PER_SIDE: i32 = 4;
/// Buildings only appear where city influence exceeds this.
pub const CITY_BUILDING_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub z: i32,
}

impl ChunkCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chunk containing a world-space position.
    pub fn from_world(x: f32, z: f32) -> Self {
        Self {
            x: (x / CHUNK_SIZE).floor() as i32,
            z: (z / CHUNK_SIZE).floor() as i32,
        }
    }

    /// World-space corner with the smallest coordinates.
    pub fn origin(&self) -> (f32, f32) {
        (self.x as f32 * CHUNK_SIZE, self.z as f32 * CHUNK_SIZE)
    }

    pub fn center(&self) -> (f32, f32) {
        let (ox, oz) = self.origin();
        (ox + CHUNK_SIZE * 0.5, oz + CHUNK_SIZE * 0.5)
    }

    pub fn chebyshev_distance(&self, other: &ChunkCoord) -> i32 {
        (self.x - other.x).abs().max((self.z - other.z).abs())
    }

    pub fn in_world(&self) -> bool {
        self.x.abs() <= WORLD_CHUNK_LIMIT && self.z.abs() <= WORLD_CHUNK_LIMIT
    }

    /// Square of chunks within `radius` of this one, itself included.
    pub fn neighborhood(self, radius: i32) -> impl Iterator<Item = ChunkCoord> {
        let radius = radius.max(0);
        (-radius..=radius).flat_map(move |dz| {
            (-radius..=radius).map(move |dx| ChunkCoord::new(self.x + dx, self.z + dz))
        })
    }
}

impl From<&ChunkData> for ChunkCoord {
    fn from(data: &ChunkData) -> Self {
        ChunkCoord::new(data.chunk_x, data.chunk_z)
    }
}

/// Distance between neighbouring heightfield samples.
pub fn sample_spacing() -> f32 {
    CHUNK_SIZE / (CHUNK_RESOLUTION - 1) as f32
}

/// Stable id for the building on a given lot of a chunk.
pub fn building_id(coord: ChunkCoord, lot: i32) -> EntityId {
    let packed = (u64::from(coord.x as u32) << 32) | u64::from(coord.z as u32);
    let h = splitmix64(packed ^ ((lot as u64) << 7));
    // High bit set keeps building ids apart from player and vehicle ids.
    (h as u32) | 0x8000_0000
}

/// Generates the heightfield and buildings of a chunk.
///
/// Output depends only on `coord` and the sampler's seed.
pub fn generate_chunk(coord: ChunkCoord, sampler: &dyn TerrainSampler) -> ChunkData {
    let (ox, oz) = coord.origin();
    let spacing = sample_spacing();

    let mut heightmap = Vec::with_capacity(CHUNK_RESOLUTION * CHUNK_RESOLUTION);
    for iz in 0..CHUNK_RESOLUTION {
        for ix in 0..CHUNK_RESOLUTION {
            let x = ox + ix as f32 * spacing;
            let z = oz + iz as f32 * spacing;
            heightmap.push(sampler.height(f64::from(x), f64::from(z)) as f32);
        }
    }

    let (cx, cz) = coord.center();
    ChunkData {
        chunk_x: coord.x,
        chunk_z: coord.z,
        heightmap,
        buildings: generate_buildings(coord, sampler),
        biome: sampler.biome(f64::from(cx), f64::from(cz)),
    }
}

fn generate_buildings(coord: ChunkCoord, sampler: &dyn TerrainSampler) -> Vec<BuildingDescriptor> {
    let (ox, oz) = coord.origin();
    let lot_size = CHUNK_SIZE / LOTS_PER_SIDE as f32;
    let mut buildings = Vec::new();

    for lz in 0..LOTS_PER_SIDE {
        for lx in 0..LOTS_PER_SIDE {
            let lot = lz * LOTS_PER_SIDE + lx;
            let x = ox + (lx as f32 + 0.5) * lot_size;
            let z = oz + (lz as f32 + 0.5) * lot_size;
            let influence = sampler.city_influence(f64::from(x), f64::from(z));
            if influence <= CITY_BUILDING_THRESHOLD {
                continue;
            }

            let h = hash2(
                sampler.seed(),
                i64::from(coord.x) * 16 + i64::from(lx),
                i64::from(coord.z) * 16 + i64::from(lz),
            );
            let chance = (h & 0xffff) as f64 / 65535.0;
            if chance > influence {
                continue;
            }

            let width = 6.0 + ((h >> 16) & 7) as f32;
            let depth = 6.0 + ((h >> 19) & 7) as f32;
            let height = 8.0 + ((h >> 24) & 0xff) as f32 / 255.0 * 40.0 * influence as f32;
            let rotation = ((h >> 40) & 3) as f32 * FRAC_PI_2;
            let ground = sampler.height(f64::from(x), f64::from(z)) as f32;

            buildings.push(BuildingDescriptor {
                id: building_id(coord, lot),
                position: [x, ground, z],
                size: [width, height, depth],
                rotation,
            });
        }
    }

    buildings
}

impl ChunkData {
    pub fn coord(&self) -> ChunkCoord {
        ChunkCoord::from(self)
    }

    /// Height sample at lattice indices, `None` outside the grid.
    pub fn sample(&self, ix: usize, iz: usize) -> Option<f32> {
        if ix >= CHUNK_RESOLUTION || iz >= CHUNK_RESOLUTION {
            return None;
        }
        self.heightmap.get(iz * CHUNK_RESOLUTION + ix).copied()
    }

    pub fn is_well_formed(&self) -> bool {
        self.heightmap.len() == CHUNK_RESOLUTION * CHUNK_RESOLUTION
            && self.heightmap.iter().all(|h| h.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::{FlatTerrain, NoiseTerrain};
    use std::collections::HashSet;

    #[test]
    fn test_from_world_handles_negative_coordinates() {
        assert_eq!(ChunkCoord::from_world(0.0, 0.0), ChunkCoord::new(0, 0));
        assert_eq!(ChunkCoord::from_world(63.9, 64.0), ChunkCoord::new(0, 1));
        assert_eq!(ChunkCoord::from_world(-0.1, -64.1), ChunkCoord::new(-1, -2));
    }

    #[test]
    fn test_neighborhood_is_a_square() {
        let center = ChunkCoord::new(3, -2);
        let cells: HashSet<ChunkCoord> = center.neighborhood(2).collect();
        assert_eq!(cells.len(), 25);
        assert!(cells.iter().all(|c| c.chebyshev_distance(&center) <= 2));
        assert!(cells.contains(&ChunkCoord::new(5, 0)));
        assert_eq!(center.neighborhood(0).count(), 1);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let terrain = NoiseTerrain::new(2024);
        let coord = ChunkCoord::new(-4, 11);
        let a = generate_chunk(coord, &terrain);
        let b = generate_chunk(coord, &NoiseTerrain::new(2024));
        assert_eq!(a, b);
        assert!(a.is_well_formed());
        assert_eq!(a.coord(), coord);
    }

    #[test]
    fn test_neighbouring_chunks_share_edge_samples() {
        let terrain = NoiseTerrain::new(5);
        let left = generate_chunk(ChunkCoord::new(0, 0), &terrain);
        let right = generate_chunk(ChunkCoord::new(1, 0), &terrain);
        for iz in 0..CHUNK_RESOLUTION {
            assert_eq!(
                left.sample(CHUNK_RESOLUTION - 1, iz),
                right.sample(0, iz)
            );
        }
    }

    #[test]
    fn test_no_buildings_outside_cities() {
        let terrain = FlatTerrain::new(0.0);
        let data = generate_chunk(ChunkCoord::new(2, 2), &terrain);
        assert!(data.buildings.is_empty());
    }

    #[test]
    fn test_full_city_places_buildings_inside_chunk() {
        let terrain = FlatTerrain {
            height: 1.0,
            city_influence: 1.0,
        };
        let coord = ChunkCoord::new(1, -1);
        let data = generate_chunk(coord, &terrain);
        assert!(!data.buildings.is_empty());
        let (ox, oz) = coord.origin();
        for building in &data.buildings {
            assert!(building.position[0] > ox && building.position[0] < ox + CHUNK_SIZE);
            assert!(building.position[2] > oz && building.position[2] < oz + CHUNK_SIZE);
            assert_eq!(building.position[1], 1.0);
            assert!(building.id & 0x8000_0000 != 0);
        }
    }

    #[test]
    fn test_sample_out_of_grid() {
        let data = generate_chunk(ChunkCoord::new(0, 0), &FlatTerrain::new(0.0));
        assert!(data.sample(CHUNK_RESOLUTION, 0).is_none());
        assert_eq!(data.sample(0, 0), Some(0.0));
    }
}
