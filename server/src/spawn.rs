//! Spawn point resolution.
//!
//! Searches outward from the world origin for a spot that is either inside a
//! city or flat enough to stand on. The result is computed once per world and
//! each joining player gets a small deterministic offset from it.

use log::{info, warn};
use nalgebra::Vector3;
use shared::terrain::safe_ground_height;
use shared::{TerrainSampler, PLAYER_HALF_HEIGHT, SPAWN_CLEARANCE};

/// Distance of the four flatness samples from the candidate.
pub const FLATNESS_PROBE: f64 = 5.0;
/// Largest height difference to a flatness sample still considered flat.
pub const FLATNESS_BUDGET: f64 = 1.5;
/// City influence above which the flatness test is skipped.
pub const CITY_SPAWN_INFLUENCE: f64 = 0.3;
/// Distance between neighbouring candidates of the ring search.
const CANDIDATE_SPACING: f64 = 24.0;
/// Spiral offsets tried per joining player before standing them on the spawn
/// point itself.
pub const OFFSET_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnReason {
    City,
    Flat,
    /// Nothing within the search budget qualified.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnPoint {
    pub x: f64,
    pub z: f64,
    pub reason: SpawnReason,
}

pub fn is_city(terrain: &dyn TerrainSampler, x: f64, z: f64) -> bool {
    terrain.city_influence(x, z) > CITY_SPAWN_INFLUENCE
}

/// True when the terrain at ±[`FLATNESS_PROBE`] in every cardinal direction
/// stays within [`FLATNESS_BUDGET`] of the centre.
pub fn is_flat(terrain: &dyn TerrainSampler, x: f64, z: f64) -> bool {
    let center = terrain.height(x, z);
    [
        (FLATNESS_PROBE, 0.0),
        (-FLATNESS_PROBE, 0.0),
        (0.0, FLATNESS_PROBE),
        (0.0, -FLATNESS_PROBE),
    ]
    .iter()
    .all(|(dx, dz)| (terrain.height(x + dx, z + dz) - center).abs() < FLATNESS_BUDGET)
}

/// Candidates on square rings of growing Chebyshev radius around the origin.
fn ring_candidates() -> impl Iterator<Item = (f64, f64)> {
    (0i32..).flat_map(|ring| {
        let cells: Vec<(i32, i32)> = if ring == 0 {
            vec![(0, 0)]
        } else {
            (-ring..=ring)
                .flat_map(|dz| (-ring..=ring).map(move |dx| (dx, dz)))
                .filter(|(dx, dz)| dx.abs() == ring || dz.abs() == ring)
                .collect()
        };
        cells.into_iter().map(|(dx, dz)| {
            (
                f64::from(dx) * CANDIDATE_SPACING,
                f64::from(dz) * CANDIDATE_SPACING,
            )
        })
    })
}

pub struct SpawnResolver {
    max_candidates: usize,
    resolved: Option<SpawnPoint>,
    issued: u32,
}

impl SpawnResolver {
    pub fn new(max_candidates: usize) -> Self {
        Self {
            max_candidates: max_candidates.max(1),
            resolved: None,
            issued: 0,
        }
    }

    /// The world's spawn point, searched for on first use.
    pub fn resolve(&mut self, terrain: &dyn TerrainSampler) -> SpawnPoint {
        if let Some(point) = self.resolved {
            return point;
        }
        let point = search(terrain, self.max_candidates);
        match point.reason {
            SpawnReason::Fallback => warn!(
                "No flat spawn within {} candidates, using the origin",
                self.max_candidates
            ),
            reason => info!(
                "Spawn point resolved at ({:.1}, {:.1}) ({:?})",
                point.x, point.z, reason
            ),
        }
        self.resolved = Some(point);
        point
    }

    /// Body position for the next joining player: the spawn point plus a
    /// per-player offset so players do not spawn inside each other. An offset
    /// that leaves the city or the flat area is skipped; after
    /// [`OFFSET_ATTEMPTS`] misses the player gets the spawn point itself.
    pub fn next_position(&mut self, terrain: &dyn TerrainSampler) -> Vector3<f32> {
        let point = self.resolve(terrain);
        let (mut x, mut z) = (point.x as f32, point.z as f32);

        for _ in 0..OFFSET_ATTEMPTS {
            let n = self.issued;
            self.issued = self.issued.wrapping_add(1);
            let (dx, dz) = spiral_offset(n);
            let (cx, cz) = (point.x as f32 + dx, point.z as f32 + dz);
            if qualifies(terrain, point.reason, f64::from(cx), f64::from(cz)) {
                (x, z) = (cx, cz);
                break;
            }
        }

        let y = safe_ground_height(terrain, x, z) + PLAYER_HALF_HEIGHT + SPAWN_CLEARANCE;
        Vector3::new(x, y, z)
    }
}

/// Golden-angle spiral around the spawn point; the first player stands on it.
fn spiral_offset(n: u32) -> (f32, f32) {
    if n == 0 {
        return (0.0, 0.0);
    }
    let angle = n as f32 * 2.399_963;
    let radius = 1.5 + (n % 4) as f32 * 0.75;
    (angle.cos() * radius, angle.sin() * radius)
}

/// Whether a spot passes the same test that picked the spawn point.
fn qualifies(terrain: &dyn TerrainSampler, reason: SpawnReason, x: f64, z: f64) -> bool {
    match reason {
        SpawnReason::City => is_city(terrain, x, z),
        SpawnReason::Flat => is_flat(terrain, x, z),
        SpawnReason::Fallback => true,
    }
}

fn search(terrain: &dyn TerrainSampler, budget: usize) -> SpawnPoint {
    for (x, z) in ring_candidates().take(budget) {
        if is_city(terrain, x, z) {
            return SpawnPoint {
                x,
                z,
                reason: SpawnReason::City,
            };
        }
        if is_flat(terrain, x, z) {
            return SpawnPoint {
                x,
                z,
                reason: SpawnReason::Flat,
            };
        }
    }
    SpawnPoint {
        x: 0.0,
        z: 0.0,
        reason: SpawnReason::Fallback,
    }
}
