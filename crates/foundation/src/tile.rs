use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mercator::{MercatorBounds, WEB_MERCATOR_MAX, tile_size_m};

/// Deepest zoom the pyramid math supports.
pub const MAX_ZOOM: u8 = 30;

/// Tile coordinate in ZXY scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Number of tiles along one axis at zoom `z`.
    pub fn tiles_per_side(z: u8) -> u64 {
        1u64 << z
    }

    /// `true` when x and y lie inside the pyramid at this zoom.
    pub fn is_valid(&self) -> bool {
        if self.z > MAX_ZOOM {
            return false;
        }
        let n = Self::tiles_per_side(self.z);
        (self.x as u64) < n && (self.y as u64) < n
    }

    /// EPSG:3857 envelope of this tile.
    pub fn bounds_3857(&self) -> MercatorBounds {
        let size = tile_size_m(self.z);
        let min_x = -WEB_MERCATOR_MAX + self.x as f64 * size;
        let max_y = WEB_MERCATOR_MAX - self.y as f64 * size;
        MercatorBounds::new(min_x, max_y - size, min_x + size, max_y)
    }

    /// Chebyshev distance in tiles; coordinates must share a zoom.
    pub fn chebyshev_distance(&self, other: &TileCoord) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Inclusive rectangle of tiles at one zoom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileRange {
    pub z: u8,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl TileRange {
    /// Builds a range, ordering each axis so `min <= max`.
    pub fn new(z: u8, x0: u32, x1: u32, y0: u32, y1: u32) -> Self {
        Self {
            z,
            min_x: x0.min(x1),
            max_x: x0.max(x1),
            min_y: y0.min(y1),
            max_y: y0.max(y1),
        }
    }

    pub fn single(coord: TileCoord) -> Self {
        Self::new(coord.z, coord.x, coord.x, coord.y, coord.y)
    }

    /// The whole pyramid level.
    pub fn world(z: u8) -> Self {
        let max = (TileCoord::tiles_per_side(z) - 1) as u32;
        Self::new(z, 0, max, 0, max)
    }

    /// Square of `size` tiles, aligned to multiples of `size`, containing `coord`.
    pub fn aligned_block(coord: TileCoord, size: u32) -> Self {
        let size = size.max(1);
        let min_x = coord.x - coord.x % size;
        let min_y = coord.y - coord.y % size;
        Self::new(coord.z, min_x, min_x + size - 1, min_y, min_y + size - 1)
            .clamp_to_world()
    }

    /// Square of `size` tiles roughly centered on `coord`.
    pub fn centered_block(coord: TileCoord, size: u32) -> Self {
        let size = size.max(1);
        let before = (size - 1) / 2;
        let min_x = coord.x.saturating_sub(before);
        let min_y = coord.y.saturating_sub(before);
        Self::new(coord.z, min_x, min_x + size - 1, min_y, min_y + size - 1)
            .clamp_to_world()
    }

    pub fn clamp_to_world(self) -> Self {
        let max = (TileCoord::tiles_per_side(self.z) - 1) as u32;
        Self {
            min_x: self.min_x.min(max),
            max_x: self.max_x.min(max),
            min_y: self.min_y.min(max),
            max_y: self.max_y.min(max),
            ..self
        }
    }

    pub fn contains(&self, coord: &TileCoord) -> bool {
        coord.z == self.z
            && coord.x >= self.min_x
            && coord.x <= self.max_x
            && coord.y >= self.min_y
            && coord.y <= self.max_y
    }

    /// `true` when `other` lies entirely inside this range.
    pub fn contains_range(&self, other: &TileRange) -> bool {
        self.z == other.z
            && other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    /// Overlap of two ranges, `None` when disjoint or at different zooms.
    pub fn intersect(&self, other: &TileRange) -> Option<TileRange> {
        if self.z != other.z {
            return None;
        }
        let min_x = self.min_x.max(other.min_x);
        let max_x = self.max_x.min(other.max_x);
        let min_y = self.min_y.max(other.min_y);
        let max_y = self.max_y.min(other.max_y);
        if min_x > max_x || min_y > max_y {
            return None;
        }
        Some(TileRange {
            z: self.z,
            min_x,
            max_x,
            min_y,
            max_y,
        })
    }

    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    pub fn tile_count(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn center(&self) -> TileCoord {
        TileCoord::new(
            self.z,
            self.min_x + (self.max_x - self.min_x) / 2,
            self.min_y + (self.max_y - self.min_y) / 2,
        )
    }

    /// Shrinks each axis around the center to at most `max_span` tiles.
    pub fn shrink_to(&self, max_span: u32) -> TileRange {
        let max_span = max_span.max(1);
        let center = self.center();
        let axis = |min: u32, max: u32, c: u32| {
            if max - min + 1 <= max_span {
                return (min, max);
            }
            let lo = c.saturating_sub((max_span - 1) / 2).max(min);
            let hi = (lo + max_span - 1).min(max);
            (lo, hi)
        };
        let (min_x, max_x) = axis(self.min_x, self.max_x, center.x);
        let (min_y, max_y) = axis(self.min_y, self.max_y, center.y);
        TileRange {
            z: self.z,
            min_x,
            max_x,
            min_y,
            max_y,
        }
    }

    /// Row-major iteration over every tile in the range.
    pub fn iter(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (self.min_y..=self.max_y)
            .flat_map(move |y| (self.min_x..=self.max_x).map(move |x| TileCoord::new(self.z, x, y)))
    }
}

impl fmt::Display for TileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}-{}",
            self.z, self.min_x, self.max_x, self.min_y, self.max_y
        )
    }
}
