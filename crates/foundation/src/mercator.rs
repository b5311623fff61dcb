use std::f64::consts::PI;

/// Spherical Web Mercator earth radius (meters).
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;
/// Half the width of the EPSG:3857 world square (meters).
pub const WEB_MERCATOR_MAX: f64 = 20_037_508.342_789_244;
/// Full width of the EPSG:3857 world square (meters).
pub const WEB_MERCATOR_WORLD: f64 = WEB_MERCATOR_MAX * 2.0;
/// Latitude limit of the square Web Mercator world.
pub const WEB_MERCATOR_MAX_LAT: f64 = 85.051_128_78;

/// Longitude/latitude in degrees.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

impl LngLat {
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }
}

/// A point in EPSG:3857 meters.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Mercator {
    pub x: f64,
    pub y: f64,
}

/// Axis-aligned EPSG:3857 rectangle.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MercatorBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl MercatorBounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn contains(&self, p: Mercator) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }
}

pub fn clamp_lat(lat: f64) -> f64 {
    lat.clamp(-WEB_MERCATOR_MAX_LAT, WEB_MERCATOR_MAX_LAT)
}

pub fn lnglat_to_mercator(p: LngLat) -> Mercator {
    let lat_rad = clamp_lat(p.lat).to_radians();
    Mercator {
        x: p.lng * WEB_MERCATOR_MAX / 180.0,
        y: EARTH_RADIUS_M * (PI / 4.0 + lat_rad / 2.0).tan().ln(),
    }
}

pub fn mercator_to_lnglat(m: Mercator) -> LngLat {
    let lng = m.x / WEB_MERCATOR_MAX * 180.0;
    let lat = (2.0 * (m.y / EARTH_RADIUS_M).exp().atan() - PI / 2.0).to_degrees();
    LngLat { lng, lat }
}

/// Edge length of one tile at zoom `z` in meters.
pub fn tile_size_m(z: u8) -> f64 {
    WEB_MERCATOR_WORLD / (1u64 << z) as f64
}

/// Continuous tile-space position of a mercator point (not clamped).
pub fn mercator_to_tile_fraction(m: Mercator, z: u8) -> (f64, f64) {
    let size = tile_size_m(z);
    ((m.x + WEB_MERCATOR_MAX) / size, (WEB_MERCATOR_MAX - m.y) / size)
}

pub fn lnglat_to_tile_fraction(p: LngLat, z: u8) -> (f64, f64) {
    mercator_to_tile_fraction(lnglat_to_mercator(p), z)
}

/// Integer tile column/row containing a mercator point, clamped into the pyramid.
pub fn mercator_to_tile(m: Mercator, z: u8) -> (u32, u32) {
    let (fx, fy) = mercator_to_tile_fraction(m, z);
    (clamp_index(fx, z), clamp_index(fy, z))
}

fn clamp_index(v: f64, z: u8) -> u32 {
    let max = ((1u64 << z) - 1) as f64;
    v.floor().clamp(0.0, max) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, eps: f64) {
        let diff = (a - b).abs();
        assert!(diff <= eps, "expected {a} ~= {b} (diff {diff})");
    }

    #[test]
    fn origin_maps_to_origin() {
        let m = lnglat_to_mercator(LngLat::new(0.0, 0.0));
        assert_close(m.x, 0.0, 1e-6);
        assert_close(m.y, 0.0, 1e-6);
    }

    #[test]
    fn antimeridian_is_world_edge() {
        let m = lnglat_to_mercator(LngLat::new(180.0, 0.0));
        assert_close(m.x, WEB_MERCATOR_MAX, 1e-6);
    }

    #[test]
    fn latitude_is_clamped() {
        let pole = lnglat_to_mercator(LngLat::new(0.0, 90.0));
        let edge = lnglat_to_mercator(LngLat::new(0.0, WEB_MERCATOR_MAX_LAT));
        assert_close(pole.y, edge.y, 1e-6);
        assert_close(edge.y, WEB_MERCATOR_MAX, 1.0);
    }

    #[test]
    fn inverse_recovers_lnglat() {
        let p = LngLat::new(-122.4194, 37.7749);
        let back = mercator_to_lnglat(lnglat_to_mercator(p));
        assert_close(back.lng, p.lng, 1e-9);
        assert_close(back.lat, p.lat, 1e-9);
    }

    #[test]
    fn san_francisco_tile_at_z13() {
        let (x, y) = mercator_to_tile(lnglat_to_mercator(LngLat::new(-122.42, 37.77)), 13);
        assert_eq!((x, y), (1310, 3166));
    }
}
