use std::collections::BTreeMap;

use foundation::MAX_ZOOM;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Engine tuning and dataset wiring.
///
/// Every field has a default, so a partial JSON document is enough to
/// override a single knob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dataset: DatasetConfig,
    pub cache: CacheConfig,
    pub lod: LodConfig,
    pub scheduler: SchedulerConfig,
    pub fast_reject: FastRejectConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetConfig::default(),
            cache: CacheConfig::default(),
            lod: LodConfig::default(),
            scheduler: SchedulerConfig::default(),
            fast_reject: FastRejectConfig::default(),
        }
    }
}

/// Names the engine needs to know about the tree relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Relation behind the default base query.
    pub table: String,
    pub id_column: String,
    /// Projected (EPSG:3857) point columns.
    pub x_column: String,
    pub y_column: String,
    /// Averaged into aggregate cells.
    pub value_column: String,
    /// Extra columns copied into per-tree features.
    pub feature_columns: Vec<String>,
    /// Precomputed per-zoom aggregate tables.
    pub aggregate_tables: BTreeMap<u8, String>,
    pub layer: String,
    pub extent: u32,
    pub buffer: u32,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            table: "trees_fast".to_string(),
            id_column: "tree_id".to_string(),
            x_column: "x_3857".to_string(),
            y_column: "y_3857".to_string(),
            value_column: "dbh".to_string(),
            feature_columns: vec!["dbh".to_string(), "category".to_string()],
            aggregate_tables: BTreeMap::from([
                (13, "agg_z13".to_string()),
                (14, "agg_z14".to_string()),
            ]),
            layer: "trees".to_string(),
            extent: 4096,
            buffer: 64,
        }
    }
}

impl DatasetConfig {
    pub fn default_base_query(&self) -> String {
        format!("SELECT * FROM {}", self.table)
    }

    pub fn tile_x_column(&self, z: u8) -> String {
        format!("xtile_z{z}")
    }

    pub fn tile_y_column(&self, z: u8) -> String {
        format!("ytile_z{z}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of non-empty tiles kept.
    pub capacity: usize,
    /// Tiles at or below this zoom inside the data bounds resist eviction.
    pub pin_max_zoom: u8,
    /// From this zoom on, empty tiles are neither stored nor remembered.
    pub empty_retention_zoom: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1500,
            pin_max_zoom: 14,
            empty_retention_zoom: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    /// Inclusive zoom span resolved by whole-tier batches.
    pub zoom_batch_min: u8,
    pub zoom_batch_max: u8,
    /// Zoom served from the prepared per-scope feature table.
    pub feature_table_zoom: u8,
    /// Deepest zoom with precomputed `xtile_z*`/`ytile_z*` columns.
    pub max_tile_column_zoom: u8,
    /// Neighborhood block edge by starting zoom; each entry holds until the next.
    pub block_sizes: BTreeMap<u8, u32>,
    /// Whole-tier batches covering more tiles than this are skipped.
    pub max_batch_tiles: u64,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            zoom_batch_min: 13,
            zoom_batch_max: 14,
            feature_table_zoom: 15,
            max_tile_column_zoom: 20,
            block_sizes: BTreeMap::from([(15, 8), (16, 8), (17, 6), (18, 4), (19, 1)]),
            max_batch_tiles: 4096,
        }
    }
}

impl LodConfig {
    pub fn is_zoom_batch_tier(&self, z: u8) -> bool {
        (self.zoom_batch_min..=self.zoom_batch_max).contains(&z)
    }

    /// Neighborhood block edge at `z`; 1 disables block batching.
    pub fn block_size(&self, z: u8) -> u32 {
        self.block_sizes
            .range(..=z)
            .next_back()
            .map(|(_, size)| (*size).max(1))
            .unwrap_or(1)
    }

    /// `true` when tiles at `z` are fetched in aligned blocks.
    pub fn batches_neighborhoods(&self, z: u8) -> bool {
        z > self.zoom_batch_max && z <= self.max_tile_column_zoom && self.block_size(z) > 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent tile resolutions drawn from the pending queue.
    pub worker_slots: usize,
    pub zoom_weight: f64,
    pub distance_weight: f64,
    /// Each this many milliseconds of waiting lowers the score by one.
    pub age_unit_ms: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_slots: 3,
            zoom_weight: 1000.0,
            distance_weight: 10.0,
            age_unit_ms: 100.0,
        }
    }
}

/// Drops coarse requests once the viewport has zoomed far past them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastRejectConfig {
    pub max_tile_zoom: u8,
    pub min_viewport_zoom: f64,
}

impl Default for FastRejectConfig {
    fn default() -> Self {
        Self {
            max_tile_zoom: 12,
            min_viewport_zoom: 16.0,
        }
    }
}

impl FastRejectConfig {
    pub fn rejects(&self, z: u8, viewport_zoom: Option<f64>) -> bool {
        viewport_zoom.is_some_and(|zoom| z <= self.max_tile_zoom && zoom >= self.min_viewport_zoom)
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dataset;
        check_identifier("dataset.table", &d.table)?;
        check_identifier("dataset.id_column", &d.id_column)?;
        check_identifier("dataset.x_column", &d.x_column)?;
        check_identifier("dataset.y_column", &d.y_column)?;
        check_identifier("dataset.value_column", &d.value_column)?;
        check_identifier("dataset.layer", &d.layer)?;
        for column in &d.feature_columns {
            check_identifier("dataset.feature_columns", column)?;
        }
        for table in d.aggregate_tables.values() {
            check_identifier("dataset.aggregate_tables", table)?;
        }
        if d.extent == 0 {
            return Err(out_of_range("dataset.extent", "must be positive"));
        }

        if self.cache.capacity == 0 {
            return Err(out_of_range("cache.capacity", "must be positive"));
        }
        if self.scheduler.worker_slots == 0 {
            return Err(out_of_range("scheduler.worker_slots", "must be positive"));
        }
        if !(self.scheduler.age_unit_ms > 0.0) {
            return Err(out_of_range("scheduler.age_unit_ms", "must be positive"));
        }

        let lod = &self.lod;
        if lod.zoom_batch_min > lod.zoom_batch_max {
            return Err(out_of_range(
                "lod.zoom_batch_min",
                "must not exceed lod.zoom_batch_max",
            ));
        }
        if lod.feature_table_zoom <= lod.zoom_batch_max {
            return Err(out_of_range(
                "lod.feature_table_zoom",
                "must be above the zoom-batch tiers",
            ));
        }
        if lod.max_tile_column_zoom > MAX_ZOOM {
            return Err(out_of_range(
                "lod.max_tile_column_zoom",
                format!("must be at most {MAX_ZOOM}"),
            ));
        }
        if lod.block_sizes.values().any(|size| *size == 0) {
            return Err(out_of_range("lod.block_sizes", "sizes must be positive"));
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if is_identifier(value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            field,
            value: value.to_string(),
        })
    }
}

fn out_of_range(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        reason: reason.into(),
    }
}
