use crate::mercator::{LngLat, clamp_lat, lnglat_to_tile_fraction};
use crate::tile::{TileCoord, TileRange};

/// Pixel size of one tile in the client's world-size math.
pub const VIEW_TILE_SIZE_PX: f64 = 512.0;

/// A flat (unpitched) camera description.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Camera {
    pub center: LngLat,
    pub zoom: f64,
    pub width_px: u32,
    pub height_px: u32,
}

/// Tiles at integer zoom `z` covering the camera's screen rectangle.
pub fn visible_tile_range(camera: &Camera, z: u8) -> TileRange {
    let world = VIEW_TILE_SIZE_PX * camera.zoom.exp2();
    let center = LngLat::new(camera.center.lng, clamp_lat(camera.center.lat));
    let (cfx, cfy) = lnglat_to_tile_fraction(center, 0);
    let (cx, cy) = (cfx * world, cfy * world);
    let half_w = camera.width_px as f64 / 2.0;
    let half_h = camera.height_px as f64 / 2.0;

    // Screen corners in fractional tiles at `z`.
    let scale = z as f64 - camera.zoom;
    let to_tile = |px: f64| px / VIEW_TILE_SIZE_PX * scale.exp2();
    let max = (TileCoord::tiles_per_side(z) - 1) as f64;
    let clamp = |v: f64| v.floor().clamp(0.0, max) as u32;

    TileRange::new(
        z,
        clamp(to_tile(cx - half_w)),
        clamp(to_tile(cx + half_w)),
        clamp(to_tile(cy - half_h)),
        clamp(to_tile(cy + half_h)),
    )
}

/// Tile containing `center` at zoom `z`.
pub fn center_tile(center: LngLat, z: u8) -> TileCoord {
    let (fx, fy) = lnglat_to_tile_fraction(center, z);
    let max = (TileCoord::tiles_per_side(z) - 1) as f64;
    TileCoord::new(z, fx.floor().clamp(0.0, max) as u32, fy.floor().clamp(0.0, max) as u32)
}

/// Euclidean distance, in tiles, from a tile's center to `center`.
pub fn tile_distance(coord: &TileCoord, center: LngLat) -> f64 {
    let (fx, fy) = lnglat_to_tile_fraction(center, coord.z);
    let dx = coord.x as f64 + 0.5 - fx;
    let dy = coord.y as f64 + 0.5 - fy;
    (dx * dx + dy * dy).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf_camera(zoom: f64) -> Camera {
        Camera {
            center: LngLat::new(-122.4194, 37.7749),
            zoom,
            width_px: 1512,
            height_px: 982,
        }
    }

    #[test]
    fn visible_range_contains_center_tile() {
        let cam = sf_camera(17.0);
        let range = visible_tile_range(&cam, 17);
        assert!(range.contains(&center_tile(cam.center, 17)));
        // 1512px / 512px per tile is roughly three tiles wide, plus partial edges.
        assert!(range.width() >= 3 && range.width() <= 5, "{range}");
    }

    #[test]
    fn coarser_tier_covers_fewer_tiles() {
        let cam = sf_camera(16.5);
        let fine = visible_tile_range(&cam, 17);
        let coarse = visible_tile_range(&cam, 15);
        assert!(coarse.tile_count() <= fine.tile_count());
    }

    #[test]
    fn distance_is_zero_near_center() {
        let center = LngLat::new(-122.4194, 37.7749);
        let tile = center_tile(center, 18);
        assert!(tile_distance(&tile, center) < 0.75);
        let far = TileCoord::new(18, tile.x + 10, tile.y);
        assert!(tile_distance(&far, center) > 9.0);
    }
}
