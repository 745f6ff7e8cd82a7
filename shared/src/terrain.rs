//! Terrain oracle: height, biome and city influence as pure functions of
//! world position and a seed.

use crate::protocol::Biome;
use crate::{CHUNK_RESOLUTION, CHUNK_SIZE};
use nalgebra::Vector3;

/// Sampling contract every terrain source fulfils.
///
/// Implementations must be pure: the same seed and coordinates always produce
/// the same bits, in any process.
pub trait TerrainSampler: Send + Sync {
    fn seed(&self) -> u32;

    fn height(&self, x: f64, z: f64) -> f64;

    fn biome(&self, x: f64, z: f64) -> Biome;

    /// How strongly a location belongs to a city, in [0, 1].
    fn city_influence(&self, x: f64, z: f64) -> f64;

    /// Surface normal by central differences of [`TerrainSampler::height`].
    fn normal(&self, x: f64, z: f64) -> Vector3<f64> {
        const EPS: f64 = 0.5;
        let left = self.height(x - EPS, z);
        let right = self.height(x + EPS, z);
        let back = self.height(x, z - EPS);
        let front = self.height(x, z + EPS);
        Vector3::new(left - right, 2.0 * EPS, back - front).normalize()
    }
}

/// Terrain height as the heightfield colliders represent it: bilinear
/// interpolation between chunk lattice samples.
pub fn lattice_height(sampler: &dyn TerrainSampler, x: f32, z: f32) -> f32 {
    let spacing = CHUNK_SIZE / (CHUNK_RESOLUTION - 1) as f32;
    let gx = (x / spacing).floor();
    let gz = (z / spacing).floor();
    let tx = x / spacing - gx;
    let tz = z / spacing - gz;
    let sample = |ix: f32, iz: f32| {
        sampler.height(f64::from(ix * spacing), f64::from(iz * spacing)) as f32
    };
    let h00 = sample(gx, gz);
    let h10 = sample(gx + 1.0, gz);
    let h01 = sample(gx, gz + 1.0);
    let h11 = sample(gx + 1.0, gz + 1.0);
    let near = h00 + (h10 - h00) * tx;
    let far = h01 + (h11 - h01) * tx;
    near + (far - near) * tz
}

/// Highest of the oracle height and the collider lattice height, the level
/// anything placed on the ground must clear.
pub fn safe_ground_height(sampler: &dyn TerrainSampler, x: f32, z: f32) -> f32 {
    let exact = sampler.height(f64::from(x), f64::from(z)) as f32;
    exact.max(lattice_height(sampler, x, z))
}

/// Seeded fractal value noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoiseTerrain {
    seed: u32,
}

const CITY_SALT: u32 = 0x00C1_7C17;
const HILL_SALT: u32 = 0x0051_1A11;
const RIDGE_SALT: u32 = 0x0077_0E1D;
const MOISTURE_SALT: u32 = 0x00B1_0E0E;

const BASE_HEIGHT: f64 = 18.0;
const CITY_THRESHOLD: f64 = 0.55;
const CITY_RAMP: f64 = 0.15;

impl NoiseTerrain {
    pub fn new(seed: u32) -> Self {
        Self { seed }
    }

    fn continental(&self, x: f64, z: f64) -> f64 {
        fbm(self.seed, x / 512.0, z / 512.0, 4)
    }
}

impl TerrainSampler for NoiseTerrain {
    fn seed(&self) -> u32 {
        self.seed
    }

    fn height(&self, x: f64, z: f64) -> f64 {
        let continental = self.continental(x, z);
        let base = BASE_HEIGHT + continental * 28.0;
        let hills = fbm(self.seed ^ HILL_SALT, x / 96.0, z / 96.0, 3) * 5.0;
        let ridge = 1.0 - value_noise(self.seed ^ RIDGE_SALT, x / 300.0, z / 300.0).abs();
        let mountains = if continental > 0.2 {
            (continental - 0.2) * ridge * ridge * 60.0
        } else {
            0.0
        };
        let natural = base + hills + mountains;

        // Cities sit on the smooth continental base.
        let city = self.city_influence(x, z);
        natural + (base - natural) * city
    }

    fn biome(&self, x: f64, z: f64) -> Biome {
        if self.city_influence(x, z) > 0.3 {
            return Biome::City;
        }
        let height = self.height(x, z);
        if height > 45.0 {
            return Biome::Tundra;
        }
        if height > 32.0 {
            return Biome::Mountains;
        }
        let moisture = fbm(self.seed ^ MOISTURE_SALT, x / 256.0, z / 256.0, 2);
        if moisture < -0.3 {
            Biome::Desert
        } else if moisture > 0.2 {
            Biome::Forest
        } else {
            Biome::Plains
        }
    }

    fn city_influence(&self, x: f64, z: f64) -> f64 {
        let n = (value_noise(self.seed ^ CITY_SALT, x / 700.0, z / 700.0) + 1.0) * 0.5;
        let t = ((n - CITY_THRESHOLD) / CITY_RAMP).clamp(0.0, 1.0);
        t * t * (3.0 - 2.0 * t)
    }
}

/// Constant terrain, handy wherever noise would only get in the way.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatTerrain {
    pub height: f64,
    pub city_influence: f64,
}

impl FlatTerrain {
    pub fn new(height: f64) -> Self {
        Self {
            height,
            city_influence: 0.0,
        }
    }
}

impl TerrainSampler for FlatTerrain {
    fn seed(&self) -> u32 {
        0
    }

    fn height(&self, _x: f64, _z: f64) -> f64 {
        self.height
    }

    fn biome(&self, _x: f64, _z: f64) -> Biome {
        if self.city_influence > 0.3 {
            Biome::City
        } else {
            Biome::Plains
        }
    }

    fn city_influence(&self, _x: f64, _z: f64) -> f64 {
        self.city_influence
    }

    fn normal(&self, _x: f64, _z: f64) -> Vector3<f64> {
        Vector3::y()
    }
}

pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

pub(crate) fn hash2(seed: u32, x: i64, z: i64) -> u64 {
    let mixed = u64::from(seed)
        ^ (x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (z as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    splitmix64(mixed)
}

/// Lattice value in [-1, 1].
fn lattice(seed: u32, x: i64, z: i64) -> f64 {
    let bits = hash2(seed, x, z) >> 11;
    (bits as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
}

fn fade(t: f64) -> f64 {
    t * t * (3.0 - 2.0 * t)
}

fn value_noise(seed: u32, x: f64, z: f64) -> f64 {
    let x0 = x.floor();
    let z0 = z.floor();
    let tx = fade(x - x0);
    let tz = fade(z - z0);
    let ix = x0 as i64;
    let iz = z0 as i64;
    let v00 = lattice(seed, ix, iz);
    let v10 = lattice(seed, ix + 1, iz);
    let v01 = lattice(seed, ix, iz + 1);
    let v11 = lattice(seed, ix + 1, iz + 1);
    let near = v00 + (v10 - v00) * tx;
    let far = v01 + (v11 - v01) * tx;
    near + (far - near) * tz
}

fn fbm(seed: u32, x: f64, z: f64, octaves: u32) -> f64 {
    let mut total = 0.0;
    let mut amplitude = 1.0;
    let mut frequency = 1.0;
    let mut norm = 0.0;
    for octave in 0..octaves {
        total += value_noise(seed.wrapping_add(octave), x * frequency, z * frequency) * amplitude;
        norm += amplitude;
        amplitude *= 0.5;
        frequency *= 2.0;
    }
    total / norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_height_is_bit_identical_across_instances() {
        let a = NoiseTerrain::new(1337);
        let b = NoiseTerrain::new(1337);
        for i in 0..200 {
            let x = i as f64 * 13.37 - 900.0;
            let z = i as f64 * -7.1 + 250.0;
            assert_eq!(a.height(x, z).to_bits(), b.height(x, z).to_bits());
            assert_eq!(
                a.city_influence(x, z).to_bits(),
                a.city_influence(x, z).to_bits()
            );
            assert_eq!(a.biome(x, z), b.biome(x, z));
        }
    }

    #[test]
    fn test_seed_changes_terrain() {
        let a = NoiseTerrain::new(1);
        let b = NoiseTerrain::new(2);
        let differs = (0..50).any(|i| {
            let x = i as f64 * 31.0;
            a.height(x, x) != b.height(x, x)
        });
        assert!(differs);
    }

    #[test]
    fn test_city_influence_in_unit_range() {
        let terrain = NoiseTerrain::new(7);
        for i in 0..400 {
            let x = (i % 20) as f64 * 250.0 - 2500.0;
            let z = (i / 20) as f64 * 250.0 - 2500.0;
            let influence = terrain.city_influence(x, z);
            assert!((0.0..=1.0).contains(&influence));
        }
    }

    #[test]
    fn test_normal_of_flat_terrain_points_up() {
        let terrain = FlatTerrain::new(4.0);
        assert_eq!(terrain.normal(10.0, -3.0), Vector3::y());
        let noise = NoiseTerrain::new(9);
        let n = noise.normal(100.0, 100.0);
        assert_approx_eq!(n.norm(), 1.0, 1e-9);
        assert!(n.y > 0.0);
    }

    #[test]
    fn test_lattice_height_matches_samples_on_grid() {
        let terrain = NoiseTerrain::new(3);
        let spacing = CHUNK_SIZE / (CHUNK_RESOLUTION - 1) as f32;
        let x = spacing * 5.0;
        let z = spacing * -2.0;
        assert_approx_eq!(
            lattice_height(&terrain, x, z),
            terrain.height(x as f64, z as f64) as f32,
            1e-4
        );
        let flat = FlatTerrain::new(2.5);
        assert_approx_eq!(lattice_height(&flat, 13.3, -71.9), 2.5);
    }

    #[test]
    fn test_safe_ground_height_clears_both_representations() {
        let terrain = NoiseTerrain::new(11);
        for i in 0..50 {
            let x = i as f32 * 3.3 + 0.7;
            let z = i as f32 * -1.9 + 0.2;
            let safe = safe_ground_height(&terrain, x, z);
            assert!(safe >= terrain.height(x as f64, z as f64) as f32);
            assert!(safe >= lattice_height(&terrain, x, z));
        }
    }
}
