use std::fmt;
use std::sync::Arc;

use foundation::{TileCoord, TileRange};

/// Filter signature used when no id filter is active.
pub const NO_FILTER: &str = "all";

/// The (revision, filter) pair every cached result belongs to.
///
/// Results computed under one scope are never served under another, so a
/// revision bump or filter change invalidates by construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scope {
    pub revision: u64,
    pub filter: Arc<str>,
}

impl Scope {
    pub fn new(revision: u64, filter: impl Into<Arc<str>>) -> Self {
        Self {
            revision,
            filter: filter.into(),
        }
    }

    pub fn unfiltered(revision: u64) -> Self {
        Self::new(revision, NO_FILTER)
    }

    pub fn is_filtered(&self) -> bool {
        &*self.filter != NO_FILTER
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}:{}", self.revision, self.filter)
    }
}

/// Collapses whitespace runs and strips a trailing `;`.
pub fn normalize_sql(sql: &str) -> String {
    let joined = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    joined.trim_end_matches(';').trim_end().to_string()
}

/// Stable 16-hex-digit token for an id-filter statement.
pub fn filter_signature(sql: &str) -> String {
    let normalized = normalize_sql(sql);
    if normalized.is_empty() {
        return NO_FILTER.to_string();
    }
    let hash = blake3::hash(normalized.as_bytes());
    hash.to_hex()[..16].to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub scope: Scope,
    pub coord: TileCoord,
}

impl CacheKey {
    pub fn new(scope: Scope, coord: TileCoord) -> Self {
        Self { scope, coord }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.coord)
    }
}

/// Identity of a multi-tile query, used for in-flight deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BatchKey {
    ZoomTier { scope: Scope, z: u8 },
    Neighborhood { scope: Scope, range: TileRange },
    FeatureTable { scope: Scope, z: u8 },
}

impl BatchKey {
    pub fn scope(&self) -> &Scope {
        match self {
            BatchKey::ZoomTier { scope, .. }
            | BatchKey::Neighborhood { scope, .. }
            | BatchKey::FeatureTable { scope, .. } => scope,
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchKey::ZoomTier { scope, z } => write!(f, "zoom:{scope}:{z}"),
            BatchKey::Neighborhood { scope, range } => write!(f, "nbhd:{scope}:{range}"),
            BatchKey::FeatureTable { scope, z } => write!(f, "features:{scope}:{z}"),
        }
    }
}
