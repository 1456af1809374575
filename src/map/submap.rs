//! Grid-tiled static map.
//!
//! The full LiDAR cloud is split once into square tiles on the x-y plane.
//! Tiles are immutable after construction; the local map is assembled by
//! unioning tiles around the camera.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::cloud::{NormalCloud, PointCloud};

/// Integer key of a grid cell.
///
/// The two `i32` cell coordinates are packed into one `u64` (x in the high
/// half, y in the low half), which is a bijection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridKey(pub u64);

impl GridKey {
    pub fn from_cell(x: i32, y: i32) -> Self {
        Self(((x as u32 as u64) << 32) | (y as u32 as u64))
    }

    /// Cell that contains the planar position `(x, y)`.
    pub fn containing(x: f64, y: f64, tile_size: f64) -> Self {
        let (cx, cy) = cell_of(x, y, tile_size);
        Self::from_cell(cx, cy)
    }

    pub fn cell(&self) -> (i32, i32) {
        ((self.0 >> 32) as u32 as i32, self.0 as u32 as i32)
    }
}

impl std::fmt::Display for GridKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (x, y) = self.cell();
        write!(f, "({}, {})", x, y)
    }
}

/// Cell coordinates of a planar position: (floor(x / tile), floor(y / tile)).
pub fn cell_of(x: f64, y: f64, tile_size: f64) -> (i32, i32) {
    let discretize = |v: f64| {
        (v / tile_size)
            .floor()
            .clamp(i32::MIN as f64, i32::MAX as f64) as i32
    };
    (discretize(x), discretize(y))
}

/// Points and normals that fall into one tile.
#[derive(Debug, Clone, Default)]
pub struct Tile {
    pub cloud: PointCloud,
    pub normals: NormalCloud,
}

/// Immutable tiling of the static reference map.
#[derive(Debug, Clone)]
pub struct SubmapStore {
    tile_size: f64,
    tiles: HashMap<GridKey, Tile>,
}

impl SubmapStore {
    /// Partition `cloud` (and the co-indexed `normals`) into tiles.
    ///
    /// When `normals` is shorter than `cloud` the missing entries are stored
    /// as NaN so the tile clouds stay index-aligned.
    pub fn build(cloud: &PointCloud, normals: &NormalCloud, tile_size: f64) -> Self {
        let mut tiles: HashMap<GridKey, Tile> = HashMap::new();
        let missing = Vector3::repeat(f64::NAN);

        for (i, p) in cloud.iter().enumerate() {
            if !p.x.is_finite() || !p.y.is_finite() {
                continue;
            }
            let tile = tiles
                .entry(GridKey::containing(p.x, p.y, tile_size))
                .or_default();
            tile.cloud.push(*p);
            tile.normals.push(normals.get(i).copied().unwrap_or(missing));
        }

        Self { tile_size, tiles }
    }

    pub fn tile_size(&self) -> f64 {
        self.tile_size
    }

    pub fn tile(&self, key: GridKey) -> Option<&Tile> {
        self.tiles.get(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &GridKey> {
        self.tiles.keys()
    }

    /// Number of non-empty tiles.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Total number of stored points.
    pub fn num_points(&self) -> usize {
        self.tiles.values().map(|t| t.cloud.len()).sum()
    }

    /// Keys of the stored tiles whose cell lies within `radius` cells
    /// (Chebyshev distance) of `center`, in row-major order.
    pub fn keys_around(&self, center: (i32, i32), radius: u32) -> Vec<GridKey> {
        let r = radius as i64;
        let mut keys = Vec::new();
        for dx in -r..=r {
            for dy in -r..=r {
                let (Ok(x), Ok(y)) = (
                    i32::try_from(center.0 as i64 + dx),
                    i32::try_from(center.1 as i64 + dy),
                ) else {
                    continue;
                };
                let key = GridKey::from_cell(x, y);
                if self.tiles.contains_key(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// Union of the tiles around `center` into one cloud/normal pair.
    pub fn gather(&self, center: (i32, i32), radius: u32) -> (PointCloud, NormalCloud, usize) {
        let keys = self.keys_around(center, radius);
        let total: usize = keys
            .iter()
            .filter_map(|k| self.tile(*k))
            .map(|t| t.cloud.len())
            .sum();

        let mut cloud = PointCloud::with_capacity(total);
        let mut normals = NormalCloud::with_capacity(total);
        for key in &keys {
            if let Some(tile) = self.tile(*key) {
                cloud.extend_from_slice(&tile.cloud);
                normals.extend_from_slice(&tile.normals);
            }
        }
        (cloud, normals, keys.len())
    }
}
