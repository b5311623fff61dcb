//! Typed builders for every statement shape the engine issues.
//!
//! Each statement starts with a `-- {kind} z={z} ...` header line naming its
//! shape and target, which keeps engine logs readable and lets test doubles
//! answer without parsing SQL.

use std::fmt;

use foundation::{TileCoord, TileRange};

use crate::config::DatasetConfig;
use crate::keys::Scope;
use crate::lod::GridMeters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    LoadSpatial,
    ProbeAggregates,
    Extent,
    ValidateBase,
    IdFilter,
    IdFilterCount,
    ZoomBatch,
    ZoomBatchAggregate,
    FeatureTable,
    DropTable,
    Neighborhood,
    SingleTile,
    Raw,
}

impl StatementKind {
    pub const ALL: [StatementKind; 13] = [
        StatementKind::LoadSpatial,
        StatementKind::ProbeAggregates,
        StatementKind::Extent,
        StatementKind::ValidateBase,
        StatementKind::IdFilter,
        StatementKind::IdFilterCount,
        StatementKind::ZoomBatch,
        StatementKind::ZoomBatchAggregate,
        StatementKind::FeatureTable,
        StatementKind::DropTable,
        StatementKind::Neighborhood,
        StatementKind::SingleTile,
        StatementKind::Raw,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::LoadSpatial => "load_spatial",
            StatementKind::ProbeAggregates => "probe_aggregates",
            StatementKind::Extent => "extent",
            StatementKind::ValidateBase => "validate_base",
            StatementKind::IdFilter => "id_filter",
            StatementKind::IdFilterCount => "id_filter_count",
            StatementKind::ZoomBatch => "zoom_batch",
            StatementKind::ZoomBatchAggregate => "zoom_batch_agg",
            StatementKind::FeatureTable => "feature_table",
            StatementKind::DropTable => "drop_table",
            StatementKind::Neighborhood => "neighborhood",
            StatementKind::SingleTile => "single_tile",
            StatementKind::Raw => "raw",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub kind: StatementKind,
    pub sql: String,
}

impl Statement {
    fn new(kind: StatementKind, target: Target, body: impl AsRef<str>) -> Self {
        let sql = format!("{}\n{}", header(kind, target), body.as_ref());
        Self { kind, sql }
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    None,
    Zoom(u8),
    Range(TileRange),
    Tile(TileCoord),
}

fn header(kind: StatementKind, target: Target) -> String {
    match target {
        Target::None => format!("-- {kind}"),
        Target::Zoom(z) => format!("-- {kind} z={z}"),
        Target::Range(r) => format!(
            "-- {kind} z={} x={}-{} y={}-{}",
            r.z, r.min_x, r.max_x, r.min_y, r.max_y
        ),
        Target::Tile(c) => format!("-- {kind} z={} x={} y={}", c.z, c.x, c.y),
    }
}

/// The current base query composed with the active id filter.
#[derive(Debug, Clone, Copy)]
pub struct BaseRelation<'a> {
    pub dataset: &'a DatasetConfig,
    pub sql: &'a str,
    pub scope: &'a Scope,
}

impl<'a> BaseRelation<'a> {
    pub fn new(dataset: &'a DatasetConfig, sql: &'a str, scope: &'a Scope) -> Self {
        Self { dataset, sql, scope }
    }

    fn cte(&self) -> String {
        let mut out = format!("WITH base AS (\n  SELECT b.* FROM ({}) AS b", self.sql);
        if self.scope.is_filtered() {
            let id = &self.dataset.id_column;
            out.push_str(&format!(
                "\n  JOIN {} f ON b.{id} = f.{id}",
                id_filter_table(&self.scope.filter)
            ));
        }
        out.push_str("\n)");
        out
    }
}

pub fn id_filter_table(signature: &str) -> String {
    format!("tile_id_filter_{signature}")
}

pub fn feature_table_name(scope: &Scope) -> String {
    format!("tile_features_r{}_{}", scope.revision, scope.filter)
}

pub fn load_spatial() -> Statement {
    Statement::new(StatementKind::LoadSpatial, Target::None, "INSTALL spatial; LOAD spatial;")
}

/// Lists which configured aggregate tables exist.
pub fn probe_aggregates(dataset: &DatasetConfig) -> Statement {
    let names = dataset
        .aggregate_tables
        .values()
        .map(|t| format!("'{t}'"))
        .collect::<Vec<_>>()
        .join(", ");
    Statement::new(
        StatementKind::ProbeAggregates,
        Target::None,
        format!("SELECT table_name FROM information_schema.tables WHERE table_name IN ({names})"),
    )
}

pub fn extent(dataset: &DatasetConfig) -> Statement {
    let (x, y) = (&dataset.x_column, &dataset.y_column);
    Statement::new(
        StatementKind::Extent,
        Target::None,
        format!(
            "SELECT MIN({x}) AS min_x, MIN({y}) AS min_y, MAX({x}) AS max_x, MAX({y}) AS max_y\nFROM {}",
            dataset.table
        ),
    )
}

/// Compiles a base query without reading rows.
pub fn validate_base(sql: &str) -> Statement {
    Statement::new(
        StatementKind::ValidateBase,
        Target::None,
        format!("SELECT * FROM ({sql}) AS base LIMIT 0"),
    )
}

pub fn create_id_filter(dataset: &DatasetConfig, sql: &str, signature: &str) -> Statement {
    let id = &dataset.id_column;
    Statement::new(
        StatementKind::IdFilter,
        Target::None,
        format!(
            "CREATE OR REPLACE TEMP TABLE {} AS\nSELECT DISTINCT {id} FROM ({sql}) AS ids WHERE {id} IS NOT NULL",
            id_filter_table(signature)
        ),
    )
}

pub fn count_id_filter(signature: &str) -> Statement {
    Statement::new(
        StatementKind::IdFilterCount,
        Target::None,
        format!("SELECT COUNT(*) AS n FROM {}", id_filter_table(signature)),
    )
}

pub fn drop_table(name: &str) -> Statement {
    Statement::new(
        StatementKind::DropTable,
        Target::None,
        format!("DROP TABLE IF EXISTS {name}"),
    )
}

/// Whole-tier batch aggregating the base relation on a `grid` metre lattice.
pub fn zoom_batch(rel: &BaseRelation<'_>, range: TileRange, grid: GridMeters) -> Statement {
    Statement::new(
        StatementKind::ZoomBatch,
        Target::Range(range),
        tiles_from_base(rel, range, grid),
    )
}

/// Whole-tier batch read from a precomputed aggregate table
/// (`xtile`, `ytile`, `cx`, `cy`, `tree_count`, `avg_value`).
pub fn zoom_batch_from_aggregate(
    dataset: &DatasetConfig,
    table: &str,
    range: TileRange,
) -> Statement {
    let geom = mvt_geom(dataset, range.z, "xtile", "ytile", "cx", "cy");
    let body = format!(
        "WITH features AS (\n  SELECT xtile, ytile, {{'geom': {geom}, 'count': tree_count, '{value}': avg_value}} AS feature\n  FROM {table}\n  WHERE {pred}\n)\n{encode}",
        value = dataset.value_column,
        pred = range_predicate("xtile", "ytile", range),
        encode = encode_tiles(dataset, "features"),
    );
    Statement::new(StatementKind::ZoomBatchAggregate, Target::Range(range), body)
}

/// Materialises one MVT feature per tree, keyed by its tile at `z`.
pub fn build_feature_table(rel: &BaseRelation<'_>, z: u8) -> Statement {
    let d = rel.dataset;
    let (tx, ty) = (d.tile_x_column(z), d.tile_y_column(z));
    let geom = mvt_geom(d, z, &tx, &ty, &d.x_column, &d.y_column);
    let body = format!(
        "CREATE OR REPLACE TEMP TABLE {table} AS\n{cte}\nSELECT {tx} AS xtile, {ty} AS ytile, {feature} AS feature\nFROM base\nWHERE {tx} IS NOT NULL AND {ty} IS NOT NULL",
        table = feature_table_name(rel.scope),
        cte = rel.cte(),
        feature = point_feature(d, &geom),
    );
    Statement::new(StatementKind::FeatureTable, Target::Zoom(z), body)
}

pub fn neighborhood_from_features(
    dataset: &DatasetConfig,
    table: &str,
    range: TileRange,
) -> Statement {
    let body = format!(
        "SELECT xtile, ytile, ST_AsMVT(feature, '{layer}', {extent}, 'geom') AS mvt\nFROM {table}\nWHERE {pred}\n  AND feature.geom IS NOT NULL AND NOT ST_IsEmpty(feature.geom)\nGROUP BY xtile, ytile",
        layer = dataset.layer,
        extent = dataset.extent,
        pred = range_predicate("xtile", "ytile", range),
    );
    Statement::new(StatementKind::Neighborhood, Target::Range(range), body)
}

pub fn neighborhood_from_base(rel: &BaseRelation<'_>, range: TileRange, grid: GridMeters) -> Statement {
    Statement::new(
        StatementKind::Neighborhood,
        Target::Range(range),
        tiles_from_base(rel, range, grid),
    )
}

/// One tile bounded by its EPSG:3857 envelope; works at any zoom.
pub fn single_tile(rel: &BaseRelation<'_>, coord: TileCoord, grid: GridMeters) -> Statement {
    let d = rel.dataset;
    let b = coord.bounds_3857();
    let (x, y) = (&d.x_column, &d.y_column);
    let bbox = format!(
        "{x} BETWEEN {} AND {} AND {y} BETWEEN {} AND {}",
        b.min_x, b.max_x, b.min_y, b.max_y
    );
    let (tx, ty) = (coord.x.to_string(), coord.y.to_string());
    let features = if grid > 0.0 {
        let geom = mvt_geom(d, coord.z, &tx, &ty, "cx", "cy");
        format!(
            "cells AS (\n  SELECT {cx} AS cx, {cy} AS cy, COUNT(*) AS tree_count, AVG({v}) AS avg_value\n  FROM base\n  WHERE {bbox}\n  GROUP BY 1, 2\n),\nfeatures AS (\n  SELECT {tx} AS xtile, {ty} AS ytile, {feature} AS feature FROM cells\n)",
            cx = snap(x, grid),
            cy = snap(y, grid),
            v = d.value_column,
            feature = cell_feature(d, &geom),
        )
    } else {
        let geom = mvt_geom(d, coord.z, &tx, &ty, x, y);
        format!(
            "features AS (\n  SELECT {tx} AS xtile, {ty} AS ytile, {feature} AS feature\n  FROM base\n  WHERE {bbox}\n)",
            feature = point_feature(d, &geom),
        )
    };
    let body = format!(
        "{},\n{features}\n{}",
        rel.cte(),
        encode_tiles(d, "features")
    );
    Statement::new(StatementKind::SingleTile, Target::Tile(coord), body)
}

/// Passes caller SQL through untouched.
pub fn raw(sql: &str) -> Statement {
    Statement {
        kind: StatementKind::Raw,
        sql: sql.to_string(),
    }
}

fn tiles_from_base(rel: &BaseRelation<'_>, range: TileRange, grid: GridMeters) -> String {
    let d = rel.dataset;
    let z = range.z;
    let (tx, ty) = (d.tile_x_column(z), d.tile_y_column(z));
    let pred = range_predicate(&tx, &ty, range);
    let features = if grid > 0.0 {
        let geom = mvt_geom(d, z, "xtile", "ytile", "cx", "cy");
        format!(
            "cells AS (\n  SELECT {tx} AS xtile, {ty} AS ytile, {cx} AS cx, {cy} AS cy,\n    COUNT(*) AS tree_count, AVG({v}) AS avg_value\n  FROM base\n  WHERE {pred}\n  GROUP BY 1, 2, 3, 4\n),\nfeatures AS (\n  SELECT xtile, ytile, {feature} AS feature FROM cells\n)",
            cx = snap(&d.x_column, grid),
            cy = snap(&d.y_column, grid),
            v = d.value_column,
            feature = cell_feature(d, &geom),
        )
    } else {
        let geom = mvt_geom(d, z, &tx, &ty, &d.x_column, &d.y_column);
        format!(
            "features AS (\n  SELECT {tx} AS xtile, {ty} AS ytile, {feature} AS feature\n  FROM base\n  WHERE {pred}\n)",
            feature = point_feature(d, &geom),
        )
    };
    format!("{},\n{features}\n{}", rel.cte(), encode_tiles(d, "features"))
}

fn range_predicate(x_col: &str, y_col: &str, r: TileRange) -> String {
    format!(
        "{x_col} BETWEEN {} AND {} AND {y_col} BETWEEN {} AND {}",
        r.min_x, r.max_x, r.min_y, r.max_y
    )
}

/// Cell-center expression for a `grid` metre lattice.
fn snap(column: &str, grid: GridMeters) -> String {
    format!("floor({column} / {grid}) * {grid} + {half}", half = grid / 2.0)
}

fn mvt_geom(d: &DatasetConfig, z: u8, tile_x: &str, tile_y: &str, px: &str, py: &str) -> String {
    format!(
        "ST_AsMVTGeom(ST_Point({px}, {py}), ST_Extent(ST_TileEnvelope({z}, {tile_x}, {tile_y})), {}, {}, true)",
        d.extent, d.buffer
    )
}

fn point_feature(d: &DatasetConfig, geom: &str) -> String {
    let mut fields = vec![format!("'geom': {geom}"), format!("'id': {}", d.id_column)];
    fields.extend(d.feature_columns.iter().map(|c| format!("'{c}': {c}")));
    format!("{{{}}}", fields.join(", "))
}

fn cell_feature(d: &DatasetConfig, geom: &str) -> String {
    format!(
        "{{'geom': {geom}, 'count': tree_count, '{}': avg_value}}",
        d.value_column
    )
}

fn encode_tiles(d: &DatasetConfig, from: &str) -> String {
    format!(
        "SELECT xtile, ytile, ST_AsMVT(feature, '{}', {}, 'geom') AS mvt\nFROM {from}\nWHERE feature.geom IS NOT NULL AND NOT ST_IsEmpty(feature.geom)\nGROUP BY xtile, ytile",
        d.layer, d.extent
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> DatasetConfig {
        DatasetConfig::default()
    }

    #[test]
    fn headers_name_kind_and_target() {
        let d = dataset();
        let scope = Scope::unfiltered(1);
        let rel = BaseRelation::new(&d, "SELECT * FROM trees_fast", &scope);

        let s = zoom_batch(&rel, TileRange::new(13, 1307, 1311, 3164, 3168), 64.0);
        assert!(s.sql.starts_with("-- zoom_batch z=13 x=1307-1311 y=3164-3168\n"), "{}", s.sql);

        let s = single_tile(&rel, TileCoord::new(19, 7, 9), 0.0);
        assert!(s.sql.starts_with("-- single_tile z=19 x=7 y=9\n"));
        assert!(s.sql.contains("ST_TileEnvelope(19, 7, 9)"));

        assert!(build_feature_table(&rel, 15).sql.starts_with("-- feature_table z=15\n"));
        assert_eq!(load_spatial().sql, "-- load_spatial\nINSTALL spatial; LOAD spatial;");
    }

    #[test]
    fn kinds_round_trip_through_names() {
        for kind in StatementKind::ALL {
            assert_eq!(StatementKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(StatementKind::parse("nope"), None);
    }

    #[test]
    fn filter_joins_on_id_column() {
        let d = dataset();
        let filtered = Scope::new(2, "0123456789abcdef");
        let rel = BaseRelation::new(&d, "SELECT * FROM trees_fast", &filtered);
        let s = neighborhood_from_base(&rel, TileRange::new(17, 0, 5, 0, 5), 0.0);
        assert!(s.sql.contains("JOIN tile_id_filter_0123456789abcdef f ON b.tree_id = f.tree_id"));

        let unfiltered = Scope::unfiltered(2);
        let rel = BaseRelation::new(&d, "SELECT * FROM trees_fast", &unfiltered);
        let s = neighborhood_from_base(&rel, TileRange::new(17, 0, 5, 0, 5), 0.0);
        assert!(!s.sql.contains("JOIN"));
    }

    #[test]
    fn grid_batches_snap_to_cell_centers() {
        let d = dataset();
        let scope = Scope::unfiltered(0);
        let rel = BaseRelation::new(&d, "SELECT * FROM trees_fast", &scope);
        let s = zoom_batch(&rel, TileRange::new(14, 1, 2, 3, 4), 32.0);
        assert!(s.sql.contains("floor(x_3857 / 32) * 32 + 16 AS cx"), "{}", s.sql);
        assert!(s.sql.contains("xtile_z14 BETWEEN 1 AND 2 AND ytile_z14 BETWEEN 3 AND 4"));
        assert!(s.sql.contains("AVG(dbh) AS avg_value"));
        assert!(s.sql.contains("ST_AsMVT(feature, 'trees', 4096, 'geom') AS mvt"));

        let s = zoom_batch(&rel, TileRange::new(17, 1, 2, 3, 4), 1.5);
        assert!(s.sql.contains("floor(x_3857 / 1.5) * 1.5 + 0.75"));
    }

    #[test]
    fn point_batches_carry_feature_columns() {
        let d = dataset();
        let scope = Scope::unfiltered(0);
        let rel = BaseRelation::new(&d, "SELECT * FROM trees_fast", &scope);
        let s = neighborhood_from_base(&rel, TileRange::new(17, 10, 15, 20, 25), 0.0);
        assert!(s.sql.contains("'id': tree_id, 'dbh': dbh, 'category': category"));
        assert!(s.sql.contains("ST_TileEnvelope(17, xtile_z17, ytile_z17)"));
    }

    #[test]
    fn feature_table_is_named_by_scope() {
        let d = dataset();
        let scope = Scope::new(4, "all");
        let rel = BaseRelation::new(&d, "SELECT * FROM trees_fast", &scope);
        let s = build_feature_table(&rel, 15);
        assert!(s.sql.contains("CREATE OR REPLACE TEMP TABLE tile_features_r4_all AS"));

        let s = neighborhood_from_features(&d, "tile_features_r4_all", TileRange::new(15, 8, 15, 16, 23));
        assert!(s.sql.starts_with("-- neighborhood z=15 x=8-15 y=16-23\n"));
        assert!(s.sql.contains("FROM tile_features_r4_all"));
    }

    #[test]
    fn aggregate_batches_read_precomputed_tables() {
        let d = dataset();
        let s = zoom_batch_from_aggregate(&d, "agg_z13", TileRange::new(13, 1307, 1311, 3164, 3168));
        assert_eq!(s.kind, StatementKind::ZoomBatchAggregate);
        assert!(s.sql.starts_with("-- zoom_batch_agg z=13 x=1307-1311 y=3164-3168\n"));
        assert!(s.sql.contains("FROM agg_z13"));
    }

    #[test]
    fn id_filter_selects_distinct_non_null_ids() {
        let d = dataset();
        let s = create_id_filter(&d, "SELECT tree_id FROM trees_fast WHERE dbh > 30", "abc");
        assert!(s.sql.contains("CREATE OR REPLACE TEMP TABLE tile_id_filter_abc AS"));
        assert!(s.sql.contains("SELECT DISTINCT tree_id FROM (SELECT tree_id FROM trees_fast WHERE dbh > 30) AS ids WHERE tree_id IS NOT NULL"));
        assert_eq!(count_id_filter("abc").sql, "-- id_filter_count\nSELECT COUNT(*) AS n FROM tile_id_filter_abc");
    }

    #[test]
    fn raw_statements_are_untouched() {
        assert_eq!(raw("SELECT 42").sql, "SELECT 42");
    }
}
