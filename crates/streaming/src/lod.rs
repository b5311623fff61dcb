//! Level-of-detail selection: how coarse a grid tree points snap to before
//! they are aggregated into a tile.

use foundation::{LngLat, TileCoord, center_tile};

/// Grid edge in metres; `0.0` keeps every tree as its own feature.
pub type GridMeters = f64;

/// Fixed grid of the mid tier between the feature table and the icon tiers.
pub const MID_TIER_GRID_M: GridMeters = 2.0;

/// `(max Chebyshev distance, grid)` bands, checked in order.
const Z17_BANDS: [(u32, GridMeters); 3] = [(2, 0.0), (4, 1.5), (7, 3.0)];
const Z17_FAR: GridMeters = 6.0;
const Z18_BANDS: [(u32, GridMeters); 3] = [(3, 0.0), (6, 1.0), (10, 2.0)];
const Z18_FAR: GridMeters = 4.0;

/// Grid for zooms that ignore the viewport.
pub fn zoom_grid(z: u8) -> GridMeters {
    match z {
        0..=11 => 256.0,
        12 => 128.0,
        13 => 64.0,
        14 => 32.0,
        15 => 0.0,
        16 => MID_TIER_GRID_M,
        _ => 0.0,
    }
}

/// Icon-tier grid for a tile `distance` tiles away from the viewport center.
pub fn icon_grid(z: u8, distance: u32) -> GridMeters {
    let (bands, far) = match z {
        17 => (&Z17_BANDS, Z17_FAR),
        18 => (&Z18_BANDS, Z18_FAR),
        _ => return zoom_grid(z),
    };
    bands
        .iter()
        .find(|(max, _)| distance <= *max)
        .map(|(_, grid)| *grid)
        .unwrap_or(far)
}

/// Simplification grid for `coord`, given the viewport center if known.
///
/// Icon tiers coarsen with distance from the center tile; without a center
/// they fall back to full detail.
pub fn simplification_grid(coord: &TileCoord, center: Option<LngLat>) -> GridMeters {
    match coord.z {
        17 | 18 => {
            let distance = center
                .map(|c| center_tile(c, coord.z).chebyshev_distance(coord))
                .unwrap_or(0);
            icon_grid(coord.z, distance)
        }
        z => zoom_grid(z),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coarse_zooms_use_coarser_grids() {
        let grids: Vec<_> = (0..=14).map(zoom_grid).collect();
        assert!(grids.windows(2).all(|w| w[0] >= w[1]), "{grids:?}");
        assert_eq!(zoom_grid(13), 64.0);
        assert_eq!(zoom_grid(14), 32.0);
        assert_eq!(zoom_grid(15), 0.0);
        assert_eq!(zoom_grid(16), 2.0);
        assert_eq!(zoom_grid(21), 0.0);
    }

    #[test]
    fn icon_grids_never_shrink_with_distance() {
        for z in [17u8, 18] {
            let mut prev = 0.0;
            for d in 0..64 {
                let g = icon_grid(z, d);
                assert!(g >= prev, "z{z} d{d}: {g} < {prev}");
                prev = g;
            }
        }
        assert_eq!(icon_grid(17, 2), 0.0);
        assert_eq!(icon_grid(17, 3), 1.5);
        assert_eq!(icon_grid(17, 100), 6.0);
        assert_eq!(icon_grid(18, 10), 2.0);
        assert_eq!(icon_grid(18, 11), 4.0);
    }

    #[test]
    fn unknown_center_is_full_detail() {
        let coord = TileCoord::new(17, 20_964, 50_664);
        assert_eq!(simplification_grid(&coord, None), 0.0);
    }

    #[test]
    fn distance_comes_from_center_tile() {
        let center = LngLat::new(-122.42, 37.77);
        let c = center_tile(center, 18);
        assert_eq!(simplification_grid(&c, Some(center)), 0.0);
        let far = TileCoord::new(18, c.x + 8, c.y);
        assert_eq!(simplification_grid(&far, Some(center)), 2.0);
        let beyond = TileCoord::new(18, c.x, c.y + 40);
        assert_eq!(simplification_grid(&beyond, Some(center)), 4.0);
    }
}
