//! Wire types for the tile-fetch protocol and the control surface.
//!
//! This module defines:
//! - Tile URLs of the custom scheme (`trees://{z}/{x}/{y}`)
//! - Control bodies sent by the viewport layer
//! - Responses reported back to it
//!
//! The types are transport-agnostic; the HTTP server is one consumer.

use foundation::{LngLat, MAX_ZOOM, TileCoord, TileRange};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::prefetch::PrefetchStatus;

pub const DEFAULT_SCHEME: &str = "trees";
pub const MVT_CONTENT_TYPE: &str = "application/vnd.mapbox-vector-tile";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("expected a {expected}:// url, got {url:?}")]
    Scheme { expected: String, url: String },
    #[error("malformed tile path {0:?}")]
    Path(String),
    #[error("tile {0} is outside the pyramid")]
    OutOfRange(TileCoord),
    #[error("zoom {0} is beyond the tile pyramid")]
    Zoom(u8),
}

fn check_zoom(z: u8) -> Result<u8, ProtocolError> {
    if z > MAX_ZOOM {
        return Err(ProtocolError::Zoom(z));
    }
    Ok(z)
}

/// A parsed tile URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileUrl {
    pub coord: TileCoord,
}

impl TileUrl {
    /// Parses `{scheme}://{z}/{x}/{y}` with an optional `.mvt`/`.pbf` suffix.
    pub fn parse(url: &str, scheme: &str) -> Result<Self, ProtocolError> {
        let rest = url
            .strip_prefix(scheme)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| ProtocolError::Scheme {
                expected: scheme.to_string(),
                url: url.to_string(),
            })?;
        let coord = parse_tile_path(rest)?;
        Ok(Self { coord })
    }

    pub fn format(coord: TileCoord, scheme: &str) -> String {
        format!("{scheme}://{}/{}/{}", coord.z, coord.x, coord.y)
    }
}

/// Parses `{z}/{x}/{y}[.mvt|.pbf]`.
pub fn parse_tile_path(path: &str) -> Result<TileCoord, ProtocolError> {
    let malformed = || ProtocolError::Path(path.to_string());
    let trimmed = path.trim_matches('/');
    let trimmed = trimmed
        .strip_suffix(".mvt")
        .or_else(|| trimmed.strip_suffix(".pbf"))
        .unwrap_or(trimmed);

    let mut parts = trimmed.split('/');
    let (Some(z), Some(x), Some(y), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };
    let coord = TileCoord::new(
        z.parse().map_err(|_| malformed())?,
        x.parse().map_err(|_| malformed())?,
        y.parse().map_err(|_| malformed())?,
    );
    if !coord.is_valid() {
        return Err(ProtocolError::OutOfRange(coord));
    }
    Ok(coord)
}

/// Body of `set_base_query` / `set_id_filter`; `None` or blank resets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlBody {
    #[serde(default)]
    pub sql: Option<String>,
}

/// Camera update; any subset of fields may be sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewportUpdate {
    #[serde(default)]
    pub zoom: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub lat: Option<f64>,
    /// With a center and zoom, lets the engine derive visible tile ranges.
    #[serde(default)]
    pub width_px: Option<u32>,
    #[serde(default)]
    pub height_px: Option<u32>,
}

impl ViewportUpdate {
    pub fn center(&self) -> Option<LngLat> {
        Some(LngLat::new(self.lng?, self.lat?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibleRange {
    pub z: u8,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl TryFrom<VisibleRange> for TileRange {
    type Error = ProtocolError;

    fn try_from(r: VisibleRange) -> Result<Self, ProtocolError> {
        let z = check_zoom(r.z)?;
        Ok(TileRange::new(z, r.min_x, r.max_x, r.min_y, r.max_y))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchRequest {
    pub z: u8,
    #[serde(default)]
    pub range: Option<VisibleRange>,
}

impl PrefetchRequest {
    /// The zoom and optional range, both checked against the pyramid.
    pub fn target(&self) -> Result<(u8, Option<TileRange>), ProtocolError> {
        let z = check_zoom(self.z)?;
        let range = self.range.map(TileRange::try_from).transpose()?;
        Ok((z, range))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchResponse {
    pub status: PrefetchStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoFetchRequest {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawQueryRequest {
    pub sql: String,
}

/// Reported after a base-query or filter change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeResponse {
    pub revision: u64,
    pub filter: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
