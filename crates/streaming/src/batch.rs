//! Tile resolution: which batch answers a tile, and the bookkeeping that
//! keeps each batch to at most one query per scope.
//!
//! Strategies, in order:
//! 1. whole-tier batch for the zoom-batch tiers
//! 2. the prepared per-scope feature table at the feature-table zoom
//! 3. an aligned neighborhood block around the tile
//! 4. a single bounded tile query

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use foundation::{TileCoord, TileRange};
use tracing::{debug, warn};

use crate::error::TileError;
use crate::keys::{BatchKey, CacheKey, Scope};
use crate::lod::simplification_grid;
use crate::pipeline::{SharedTask, TilePipeline, spawn_shared};
use crate::query::{QueryResult, Value};
use crate::sql::{self, BaseRelation};

/// Finished neighborhoods remembered per scope and zoom; the oldest go first.
const READY_RANGES_PER_ZOOM: usize = 256;

/// What a successful write-back proves about tiles it did not store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Tier(u8),
    Neighborhood(TileRange),
}

/// Ready sets and in-flight batches, all keyed by scope.
#[derive(Default)]
pub(crate) struct BatchState {
    ready_tiers: HashSet<(Scope, u8)>,
    ready_feature_tables: HashSet<(Scope, u8)>,
    ready_neighborhoods: HashMap<(Scope, u8), Vec<TileRange>>,
    inflight: HashMap<BatchKey, (u64, SharedTask<()>)>,
}

impl BatchState {
    pub fn clear(&mut self) {
        self.ready_tiers.clear();
        self.ready_feature_tables.clear();
        self.ready_neighborhoods.clear();
        self.inflight.clear();
    }

    pub fn tier_ready(&self, scope: &Scope, z: u8) -> bool {
        self.ready_tiers.contains(&(scope.clone(), z))
    }

    pub fn feature_table_ready(&self, scope: &Scope, z: u8) -> bool {
        self.ready_feature_tables.contains(&(scope.clone(), z))
    }

    pub fn mark_feature_table(&mut self, scope: &Scope, z: u8) {
        self.ready_feature_tables.insert((scope.clone(), z));
    }

    /// `true` when a finished batch resolved `range` entirely.
    pub fn range_ready(&self, scope: &Scope, range: &TileRange) -> bool {
        if self.tier_ready(scope, range.z) {
            return true;
        }
        self.ready_neighborhoods
            .get(&(scope.clone(), range.z))
            .is_some_and(|ranges| ranges.iter().any(|r| r.contains_range(range)))
    }

    pub fn covers(&self, scope: &Scope, coord: &TileCoord) -> bool {
        self.range_ready(scope, &TileRange::single(*coord))
    }

    pub fn mark(&mut self, scope: &Scope, readiness: Readiness) {
        match readiness {
            Readiness::Tier(z) => {
                self.ready_tiers.insert((scope.clone(), z));
            }
            Readiness::Neighborhood(range) => {
                let ranges = self
                    .ready_neighborhoods
                    .entry((scope.clone(), range.z))
                    .or_default();
                ranges.retain(|r| !range.contains_range(r));
                ranges.push(range);
                if ranges.len() > READY_RANGES_PER_ZOOM {
                    ranges.remove(0);
                }
            }
        }
    }

    /// An evicted tile can no longer be inferred empty from readiness.
    pub fn forget(&mut self, key: &CacheKey) {
        let z = key.coord.z;
        self.ready_tiers.remove(&(key.scope.clone(), z));
        if let Some(ranges) = self.ready_neighborhoods.get_mut(&(key.scope.clone(), z)) {
            ranges.retain(|r| !r.contains(&key.coord));
        }
    }

    pub fn inflight(&self, key: &BatchKey) -> Option<SharedTask<()>> {
        self.inflight.get(key).map(|(_, task)| task.clone())
    }

    /// An in-flight neighborhood of `scope` that will resolve all of `need`.
    pub fn inflight_covering(&self, scope: &Scope, need: &TileRange) -> Option<SharedTask<()>> {
        self.inflight.iter().find_map(|(key, (_, task))| match key {
            BatchKey::Neighborhood { scope: s, range } if s == scope && range.contains_range(need) => {
                Some(task.clone())
            }
            _ => None,
        })
    }

    pub fn insert_inflight(&mut self, key: BatchKey, id: u64, task: SharedTask<()>) {
        self.inflight.insert(key, (id, task));
    }

    /// Removes the entry only if it still belongs to task `id`.
    pub fn finish(&mut self, key: &BatchKey, id: u64) {
        if self.inflight.get(key).is_some_and(|(current, _)| *current == id) {
            self.inflight.remove(key);
        }
    }
}

/// Reads `xtile`, `ytile`, `mvt` rows into tile payloads at zoom `z`.
pub(crate) fn decode_tiles(result: &QueryResult, z: u8) -> Result<Vec<(TileCoord, Vec<u8>)>, TileError> {
    let column = |name: &str| {
        result
            .column(name)
            .ok_or_else(|| TileError::Decode(format!("tile result lacks {name}")))
    };
    let (xi, yi, mi) = (column("xtile")?, column("ytile")?, column("mvt")?);

    let index = |row: &[Value], i: usize, what: &str| {
        row.get(i)
            .and_then(Value::as_i64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| TileError::Decode(format!("bad {what} in tile row")))
    };

    let mut tiles = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let coord = TileCoord::new(z, index(row, xi, "xtile")?, index(row, yi, "ytile")?);
        let bytes = match row.get(mi) {
            Some(Value::Blob(bytes)) => bytes.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(TileError::Decode(format!("mvt column holds {other:?}")));
            }
        };
        tiles.push((coord, bytes));
    }
    Ok(tiles)
}

/// Every tile of `range`, with decoded payloads or an empty buffer.
fn fill_range(range: TileRange, decoded: Vec<(TileCoord, Vec<u8>)>) -> Vec<(TileCoord, Vec<u8>)> {
    let mut by_coord: HashMap<TileCoord, Vec<u8>> = decoded
        .into_iter()
        .filter(|(coord, _)| range.contains(coord))
        .collect();
    range
        .iter()
        .map(|coord| {
            let bytes = by_coord.remove(&coord).unwrap_or_default();
            (coord, bytes)
        })
        .collect()
}

impl TilePipeline {
    /// Resolves one tile to MVT bytes, empty when it has no features.
    ///
    /// Concurrent calls for the same tile share one resolution.
    pub async fn ensure_tile(self: &Arc<Self>, coord: TileCoord) -> Result<Vec<u8>, TileError> {
        self.check_failed()?;
        if !coord.is_valid() {
            return Ok(Vec::new());
        }

        let task = {
            let mut st = self.state.lock();
            let key = CacheKey::new(st.scope(), coord);
            let cached = st.lookup(&key);
            if let Some(bytes) = cached {
                drop(st);
                self.count("cache_hits");
                return Ok(bytes);
            }
            if st.bounds.is_some_and(|b| !b.contains(&coord)) {
                drop(st);
                self.count("fast_rejects");
                return Ok(Vec::new());
            }
            if !st.spatial_ready {
                return Ok(Vec::new());
            }
            match st.tiles_inflight.get(&key) {
                Some((_, task)) => task.clone(),
                None => {
                    let id = st.next_task_id();
                    let this = Arc::clone(self);
                    let task_key = key.clone();
                    let task = spawn_shared(async move {
                        let result = this.resolve_tile(task_key.scope.clone(), coord).await;
                        this.finish_tile(&task_key, id);
                        result
                    });
                    st.tiles_inflight.insert(key, (id, task.clone()));
                    task
                }
            }
        };
        self.count("cache_misses");
        task.await.map_err(TileError::escalate)
    }

    fn finish_tile(&self, key: &CacheKey, id: u64) {
        let mut st = self.state.lock();
        if st.tiles_inflight.get(key).is_some_and(|(current, _)| *current == id) {
            st.tiles_inflight.remove(key);
        }
    }

    fn finish_batch(&self, key: &BatchKey, id: u64) {
        self.state.lock().batches.finish(key, id);
    }

    async fn resolve_tile(self: &Arc<Self>, scope: Scope, coord: TileCoord) -> Result<Vec<u8>, TileError> {
        let lod = &self.config.lod;
        let key = CacheKey::new(scope.clone(), coord);

        if lod.is_zoom_batch_tier(coord.z) {
            match self.ensure_zoom_batch(&scope, coord.z).await {
                Ok(()) => {
                    if let Some(bytes) = self.resolved(&key) {
                        return Ok(bytes);
                    }
                }
                Err(err) => self.degrade("zoom batch", err)?,
            }
        }

        if coord.z == lod.feature_table_zoom {
            if let Err(err) = self.ensure_feature_table(&scope, coord.z).await {
                self.degrade("feature table", err)?;
            }
        }

        if lod.batches_neighborhoods(coord.z) {
            let Some(block) = self.neighborhood_block(coord) else {
                debug!(%coord, "tile outside the visible block; resolving empty");
                return Ok(Vec::new());
            };
            match self
                .ensure_neighborhood(&scope, block, TileRange::single(coord))
                .await
            {
                Ok(()) => {
                    if let Some(bytes) = self.resolved(&key) {
                        return Ok(bytes);
                    }
                }
                Err(err) => self.degrade("neighborhood batch", err)?,
            }
        }

        self.fetch_single_tile(&scope, coord).await
    }

    /// Result for `key` after a batch; stale scopes resolve empty.
    fn resolved(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let mut st = self.state.lock();
        if !st.is_current(&key.scope) {
            return Some(Vec::new());
        }
        st.lookup(key)
    }

    /// Logs a failed strategy so resolution can fall through, unless the
    /// engine itself is gone.
    pub(crate) fn degrade(&self, strategy: &'static str, err: TileError) -> Result<(), TileError> {
        if err.is_fatal() {
            return Err(err.escalate());
        }
        warn!(strategy, %err, "batch failed; falling back");
        Ok(())
    }

    /// Stores batch results under `scope`, unless the scope is stale.
    pub(crate) fn write_back(
        &self,
        scope: &Scope,
        tiles: Vec<(TileCoord, Vec<u8>)>,
        readiness: Option<Readiness>,
    ) -> bool {
        let mut st = self.state.lock();
        if !st.is_current(scope) {
            drop(st);
            self.count("stale_discards");
            debug!(%scope, tiles = tiles.len(), "discarding stale result");
            return false;
        }

        // Mark first so evictions below can retract readiness they break.
        if let Some(readiness) = readiness {
            st.batches.mark(scope, readiness);
        }
        let pin_max_zoom = self.config.cache.pin_max_zoom;
        let bounds = st.bounds;
        let mut evicted = 0u64;
        for (coord, bytes) in tiles {
            let pinned = coord.z <= pin_max_zoom && bounds.is_some_and(|b| b.contains(&coord));
            let gone = st.cache.set(CacheKey::new(scope.clone(), coord), bytes, pinned);
            for key in gone {
                st.batches.forget(&key);
                evicted += 1;
            }
        }
        drop(st);

        if evicted > 0 {
            self.metrics_add("evictions", evicted);
        }
        true
    }

    /// Whole-tier batch bounded to the tier's data range.
    pub(crate) async fn ensure_zoom_batch(self: &Arc<Self>, scope: &Scope, z: u8) -> Result<(), TileError> {
        let key = BatchKey::ZoomTier {
            scope: scope.clone(),
            z,
        };
        let task = {
            let mut st = self.state.lock();
            if !st.is_current(scope) || st.batches.tier_ready(scope, z) {
                return Ok(());
            }
            match st.batches.inflight(&key) {
                Some(task) => task,
                None => {
                    let Some(range) = st.bounds.map(|b| b.range_at(z)) else {
                        return Ok(());
                    };
                    if range.tile_count() > self.config.lod.max_batch_tiles {
                        debug!(z, tiles = range.tile_count(), "tier too large to batch");
                        return Ok(());
                    }
                    let dataset = &self.config.dataset;
                    let aggregate = dataset
                        .aggregate_tables
                        .get(&z)
                        .filter(|_| st.base_is_default && !scope.is_filtered())
                        .filter(|_| st.aggregate_tiers.contains(&z));
                    let stmt = match aggregate {
                        Some(table) => sql::zoom_batch_from_aggregate(dataset, table, range),
                        None => {
                            let rel = BaseRelation::new(dataset, &st.base_sql, scope);
                            let grid = simplification_grid(&range.center(), None);
                            sql::zoom_batch(&rel, range, grid)
                        }
                    };

                    let id = st.next_task_id();
                    let this = Arc::clone(self);
                    let scope = scope.clone();
                    let task_key = key.clone();
                    let task = spawn_shared(async move {
                        this.count("zoom_batches");
                        let outcome = async {
                            let result = this.execute(stmt).await?;
                            let tiles = decode_tiles(&result, z)?;
                            debug!(%scope, z, tiles = tiles.len(), "zoom batch resolved");
                            this.write_back(&scope, fill_range(range, tiles), Some(Readiness::Tier(z)));
                            Ok::<(), TileError>(())
                        }
                        .await;
                        this.finish_batch(&task_key, id);
                        outcome
                    });
                    st.batches.insert_inflight(key, id, task.clone());
                    task
                }
            }
        };
        task.await
    }

    /// Builds the per-scope feature table at `z` once.
    ///
    /// A build that finishes after its scope went stale drops its own table.
    pub(crate) async fn ensure_feature_table(self: &Arc<Self>, scope: &Scope, z: u8) -> Result<(), TileError> {
        let key = BatchKey::FeatureTable {
            scope: scope.clone(),
            z,
        };
        let task = {
            let mut st = self.state.lock();
            if !st.is_current(scope) || st.batches.feature_table_ready(scope, z) {
                return Ok(());
            }
            match st.batches.inflight(&key) {
                Some(task) => task,
                None => {
                    let rel = BaseRelation::new(&self.config.dataset, &st.base_sql, scope);
                    let stmt = sql::build_feature_table(&rel, z);
                    let table = sql::feature_table_name(scope);

                    let id = st.next_task_id();
                    let this = Arc::clone(self);
                    let scope = scope.clone();
                    let task_key = key.clone();
                    let task = spawn_shared(async move {
                        this.count("feature_tables");
                        let outcome = match this.execute(stmt).await {
                            Ok(_) => {
                                this.adopt_feature_table(&scope, z, table).await;
                                Ok(())
                            }
                            Err(err) => Err(TileError::from(err)),
                        };
                        this.finish_batch(&task_key, id);
                        outcome
                    });
                    st.batches.insert_inflight(key, id, task.clone());
                    task
                }
            }
        };
        task.await
    }

    async fn adopt_feature_table(&self, scope: &Scope, z: u8, table: String) {
        let adopted = {
            let mut st = self.state.lock();
            if st.is_current(scope) {
                st.batches.mark_feature_table(scope, z);
                if !st.feature_tables.contains(&table) {
                    st.feature_tables.push(table.clone());
                }
                true
            } else {
                false
            }
        };
        if adopted {
            debug!(%scope, %table, "feature table ready");
            return;
        }
        self.count("stale_discards");
        debug!(%scope, %table, "dropping stale feature table");
        if let Err(err) = self.execute(sql::drop_table(&table)).await {
            warn!(%table, %err, "failed to drop stale feature table");
        }
    }

    /// Aligned block around `coord`, cut to the visible range and data bounds.
    ///
    /// `None` when the visible range leaves nothing of the block, which means
    /// the tile is off screen and resolves empty.
    fn neighborhood_block(&self, coord: TileCoord) -> Option<TileRange> {
        let st = self.state.lock();
        let size = self.config.lod.block_size(coord.z);
        let mut block = TileRange::aligned_block(coord, size);
        if let Some(bounds) = st.bounds {
            block = block.intersect(&bounds.range_at(coord.z))?;
        }
        if let Some(visible) = st.viewport.visible.get(&coord.z) {
            let cut = block.intersect(visible)?;
            // A stale visible range must not strand the tile itself.
            if cut.contains(&coord) {
                block = cut;
            }
        }
        Some(block)
    }

    /// Makes sure `need` is resolved, fetching `range` if nothing finished or
    /// in flight already covers it.
    pub(crate) async fn ensure_neighborhood(
        self: &Arc<Self>,
        scope: &Scope,
        range: TileRange,
        need: TileRange,
    ) -> Result<(), TileError> {
        let key = BatchKey::Neighborhood {
            scope: scope.clone(),
            range,
        };
        let task = {
            let mut st = self.state.lock();
            if !st.is_current(scope) || st.batches.range_ready(scope, &need) {
                return Ok(());
            }
            match st.batches.inflight_covering(scope, &need) {
                Some(task) => task,
                None => {
                    let dataset = &self.config.dataset;
                    let z = range.z;
                    let stmt = if z == self.config.lod.feature_table_zoom
                        && st.batches.feature_table_ready(scope, z)
                    {
                        sql::neighborhood_from_features(dataset, &sql::feature_table_name(scope), range)
                    } else {
                        let rel = BaseRelation::new(dataset, &st.base_sql, scope);
                        let grid = simplification_grid(&range.center(), st.viewport.center);
                        sql::neighborhood_from_base(&rel, range, grid)
                    };

                    let id = st.next_task_id();
                    let this = Arc::clone(self);
                    let scope = scope.clone();
                    let task_key = key.clone();
                    let task = spawn_shared(async move {
                        this.count("neighborhood_batches");
                        let outcome = async {
                            let result = this.execute(stmt).await?;
                            let tiles = decode_tiles(&result, z)?;
                            debug!(%scope, %range, tiles = tiles.len(), "neighborhood resolved");
                            this.write_back(
                                &scope,
                                fill_range(range, tiles),
                                Some(Readiness::Neighborhood(range)),
                            );
                            Ok::<(), TileError>(())
                        }
                        .await;
                        this.finish_batch(&task_key, id);
                        outcome
                    });
                    st.batches.insert_inflight(key, id, task.clone());
                    task
                }
            }
        };
        task.await
    }

    async fn fetch_single_tile(self: &Arc<Self>, scope: &Scope, coord: TileCoord) -> Result<Vec<u8>, TileError> {
        let stmt = {
            let st = self.state.lock();
            if !st.is_current(scope) {
                return Ok(Vec::new());
            }
            let rel = BaseRelation::new(&self.config.dataset, &st.base_sql, scope);
            let grid = simplification_grid(&coord, st.viewport.center);
            sql::single_tile(&rel, coord, grid)
        };
        self.count("single_tile_queries");
        let result = self.execute(stmt).await?;
        let bytes = decode_tiles(&result, coord.z)?
            .into_iter()
            .find(|(c, _)| *c == coord)
            .map(|(_, bytes)| bytes)
            .unwrap_or_default();
        self.write_back(scope, vec![(coord, bytes.clone())], None);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::query::QueryError;
    use crate::sql::StatementKind;
    use crate::testing::{MockEngine, ready_pipeline};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn z13_tile_resolves_through_zoom_batch_once() {
        let engine = MockEngine::new();
        let pipeline = ready_pipeline(&engine).await;
        let coord = TileCoord::new(13, 1310, 3166);

        let tile = pipeline.ensure_tile(coord).await.unwrap();
        assert_eq!(tile, MockEngine::payload(coord, 0));
        assert_eq!(engine.kinds(), vec![StatementKind::ZoomBatchAggregate]);

        engine.reset();
        assert_eq!(pipeline.ensure_tile(coord).await.unwrap(), tile);
        assert_eq!(pipeline.request_tile(coord).await.unwrap(), tile);
        assert_eq!(engine.query_count(), 0);

        // The whole tier came back with that one query, pinned in bounds.
        let neighbour = TileCoord::new(13, 1307, 3164);
        assert_eq!(pipeline.ensure_tile(neighbour).await.unwrap(), MockEngine::payload(neighbour, 0));
        assert_eq!(engine.query_count(), 0);
        assert_eq!(pipeline.stats().cache_pinned, 25);
    }

    #[tokio::test]
    async fn empty_tiles_in_a_tier_are_remembered() {
        let engine = MockEngine::new();
        let empty = TileCoord::new(14, 2620, 6333);
        engine.set_empty(empty);
        let pipeline = ready_pipeline(&engine).await;

        assert!(pipeline.ensure_tile(empty).await.unwrap().is_empty());
        engine.reset();
        assert!(pipeline.ensure_tile(empty).await.unwrap().is_empty());
        assert_eq!(engine.query_count(), 0);
        assert!(pipeline.stats().cache_empties >= 1);
    }

    #[tokio::test]
    async fn z17_block_serves_all_36_tiles_with_one_query() {
        let engine = MockEngine::new();
        let pipeline = ready_pipeline(&engine).await;
        let coord = TileCoord::new(17, 20964, 50664);

        pipeline.ensure_tile(coord).await.unwrap();
        assert_eq!(engine.kinds(), vec![StatementKind::Neighborhood]);
        let sql = &engine.statements(StatementKind::Neighborhood)[0];
        assert!(sql.starts_with("-- neighborhood z=17 x=20964-20969 y=50664-50669\n"), "{sql}");

        engine.reset();
        for other in TileRange::aligned_block(coord, 6).iter() {
            let tile = pipeline.ensure_tile(other).await.unwrap();
            assert_eq!(tile, MockEngine::payload(other, 0));
        }
        assert_eq!(engine.query_count(), 0);
    }

    #[tokio::test]
    async fn empty_z17_tiles_in_a_ready_block_need_no_query() {
        let engine = MockEngine::new();
        let hole = TileCoord::new(17, 20966, 50667);
        engine.set_empty(hole);
        let pipeline = ready_pipeline(&engine).await;

        pipeline.ensure_tile(TileCoord::new(17, 20964, 50664)).await.unwrap();
        engine.reset();
        assert!(pipeline.ensure_tile(hole).await.unwrap().is_empty());
        assert_eq!(engine.query_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_batch() {
        let engine = MockEngine::new();
        let pipeline = ready_pipeline(&engine).await;
        let coord = TileCoord::new(17, 20964, 50664);

        let requests: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&pipeline);
                tokio::spawn(async move { p.ensure_tile(coord).await })
            })
            .collect();
        let mut tiles = Vec::new();
        for handle in requests {
            tiles.push(handle.await.unwrap().unwrap());
        }
        assert!(tiles.iter().all(|t| *t == tiles[0]));
        assert_eq!(engine.query_count(), 1);
    }

    #[tokio::test]
    async fn neighbours_join_an_inflight_block() {
        let engine = MockEngine::new();
        let pipeline = ready_pipeline(&engine).await;
        let a = TileCoord::new(17, 20964, 50664);
        let b = TileCoord::new(17, 20969, 50669);

        let (ta, tb) = tokio::join!(pipeline.ensure_tile(a), pipeline.ensure_tile(b));
        assert_eq!(ta.unwrap(), MockEngine::payload(a, 0));
        assert_eq!(tb.unwrap(), MockEngine::payload(b, 0));
        assert_eq!(engine.query_count(), 1);
    }

    #[tokio::test]
    async fn out_of_bounds_tiles_never_query() {
        let engine = MockEngine::new();
        let pipeline = ready_pipeline(&engine).await;

        for coord in [
            TileCoord::new(13, 0, 0),
            TileCoord::new(15, 100, 100),
            TileCoord::new(17, 20990, 50664),
            TileCoord::new(21, 1, 1),
            TileCoord::new(3, 9, 0),
        ] {
            assert!(pipeline.ensure_tile(coord).await.unwrap().is_empty(), "{coord}");
        }
        assert_eq!(engine.query_count(), 0);
    }

    #[tokio::test]
    async fn z15_builds_feature_table_then_reads_it() {
        let engine = MockEngine::new();
        let pipeline = ready_pipeline(&engine).await;
        let coord = TileCoord::new(15, 5241, 12666);

        let tile = pipeline.ensure_tile(coord).await.unwrap();
        assert_eq!(tile, MockEngine::payload(coord, 0));
        assert_eq!(
            engine.kinds(),
            vec![StatementKind::FeatureTable, StatementKind::Neighborhood]
        );
        let sql = &engine.statements(StatementKind::Neighborhood)[0];
        assert!(sql.contains("FROM tile_features_r0_all"));

        // A second block reuses the table.
        engine.reset();
        pipeline.ensure_tile(TileCoord::new(15, 5232, 12660)).await.unwrap();
        assert_eq!(engine.kinds(), vec![StatementKind::Neighborhood]);
    }

    #[tokio::test]
    async fn failed_batch_falls_back_to_single_tile() {
        let engine = MockEngine::new();
        engine.fail_on(StatementKind::Neighborhood, QueryError::Sql("out of memory".into()));
        let pipeline = ready_pipeline(&engine).await;
        let coord = TileCoord::new(18, 41928, 101328);

        let tile = pipeline.ensure_tile(coord).await.unwrap();
        assert_eq!(tile, MockEngine::payload(coord, 0));
        assert_eq!(
            engine.kinds(),
            vec![StatementKind::Neighborhood, StatementKind::SingleTile]
        );
    }

    #[tokio::test]
    async fn deep_zooms_use_single_tile_queries() {
        let engine = MockEngine::new();
        let pipeline = ready_pipeline(&engine).await;
        let coord = TileCoord::new(19, 83857, 202657);

        let tile = pipeline.ensure_tile(coord).await.unwrap();
        assert_eq!(tile, MockEngine::payload(coord, 0));
        assert_eq!(engine.kinds(), vec![StatementKind::SingleTile]);
    }

    #[tokio::test]
    async fn visible_range_trims_the_block() {
        let engine = MockEngine::new();
        let pipeline = ready_pipeline(&engine).await;
        pipeline.set_visible_tile_range(TileRange::new(17, 20966, 20975, 50666, 50675));

        pipeline.ensure_tile(TileCoord::new(17, 20967, 50667)).await.unwrap();
        let sql = &engine.statements(StatementKind::Neighborhood)[0];
        assert!(sql.starts_with("-- neighborhood z=17 x=20966-20969 y=50666-50669\n"), "{sql}");

        // A block with no visible tiles resolves empty without a query.
        engine.reset();
        pipeline.set_visible_tile_range(TileRange::new(17, 20980, 20985, 50680, 50685));
        let tile = pipeline.ensure_tile(TileCoord::new(17, 20952, 50652)).await.unwrap();
        assert!(tile.is_empty());
        assert_eq!(engine.query_count(), 0);
    }

    #[tokio::test]
    async fn stale_results_are_discarded() {
        let engine = MockEngine::new();
        let pipeline = ready_pipeline(&engine).await;
        let coord = TileCoord::new(17, 20964, 50664);
        let old_scope = pipeline.scope();

        pipeline
            .set_base_query(Some("SELECT * FROM trees_fast WHERE dbh > 5"))
            .await
            .unwrap();
        assert!(!pipeline.write_back(&old_scope, vec![(coord, vec![1, 2, 3])], None));
        assert_eq!(pipeline.stats().metrics.counters["stale_discards"], 1);
        assert_eq!(pipeline.stats().cache_entries, 0);
    }

    /// Pipeline on a custom base query, so going back to the default bumps
    /// the revision without touching the connection.
    async fn custom_base_pipeline(engine: &Arc<MockEngine>) -> Arc<TilePipeline> {
        let pipeline = ready_pipeline(engine).await;
        pipeline
            .set_base_query(Some("SELECT * FROM trees_fast WHERE dbh > 5"))
            .await
            .unwrap();
        engine.reset();
        pipeline
    }

    async fn revision_change_during(kind: StatementKind, coord: TileCoord) {
        let engine = MockEngine::new();
        let pipeline = custom_base_pipeline(&engine).await;

        engine.hold(kind);
        let pending = {
            let p = Arc::clone(&pipeline);
            tokio::spawn(async move { p.ensure_tile(coord).await })
        };
        engine.issued(kind).await;
        assert_eq!(pipeline.set_base_query(None).await.unwrap(), 2);
        engine.release(kind);

        assert!(pending.await.unwrap().unwrap().is_empty());
        let stats = pipeline.stats();
        assert_eq!(stats.metrics.counters["stale_discards"], 1);
        assert_eq!(stats.cache_entries, 0);

        // The new revision queries for itself.
        engine.reset();
        assert_eq!(pipeline.ensure_tile(coord).await.unwrap(), MockEngine::payload(coord, 1));
        assert_eq!(engine.query_count(), 1);
    }

    #[tokio::test]
    async fn neighborhood_finishing_after_revision_change_is_dropped() {
        revision_change_during(StatementKind::Neighborhood, TileCoord::new(17, 20964, 50664)).await;
    }

    #[tokio::test]
    async fn zoom_batch_finishing_after_revision_change_is_dropped() {
        revision_change_during(StatementKind::ZoomBatch, TileCoord::new(13, 1310, 3166)).await;
    }

    #[tokio::test]
    async fn stale_feature_table_is_dropped() {
        let engine = MockEngine::new();
        let pipeline = custom_base_pipeline(&engine).await;
        let old_scope = pipeline.scope();

        engine.hold(StatementKind::FeatureTable);
        let pending = {
            let (p, scope) = (Arc::clone(&pipeline), old_scope.clone());
            tokio::spawn(async move { p.ensure_feature_table(&scope, 15).await })
        };
        engine.issued(StatementKind::FeatureTable).await;
        pipeline.set_base_query(None).await.unwrap();
        engine.release(StatementKind::FeatureTable);
        pending.await.unwrap().unwrap();

        let drops = engine.statements(StatementKind::DropTable);
        assert_eq!(drops.len(), 1);
        assert!(drops[0].contains(&sql::feature_table_name(&old_scope)), "{}", drops[0]);
        let st = pipeline.state.lock();
        assert!(!st.batches.feature_table_ready(&old_scope, 15));
        assert!(!st.batches.feature_table_ready(&st.scope(), 15));
        assert!(st.feature_tables.is_empty());
    }

    #[tokio::test]
    async fn eviction_retracts_block_readiness() {
        let engine = MockEngine::new();
        let mut config = EngineConfig::default();
        config.cache.capacity = 8;
        let pipeline = TilePipeline::new(config, engine.clone()).unwrap();
        pipeline.initialize().await.unwrap();
        engine.reset();

        let last = TileCoord::new(17, 20969, 50669);
        assert_eq!(pipeline.ensure_tile(last).await.unwrap(), MockEngine::payload(last, 0));
        assert_eq!(engine.query_count(), 1);
        assert!(pipeline.stats().cache_entries <= 8);

        // The first tile of the block was evicted, so it has to be fetched
        // again rather than inferred empty.
        engine.reset();
        let first = TileCoord::new(17, 20964, 50664);
        assert_eq!(pipeline.ensure_tile(first).await.unwrap(), MockEngine::payload(first, 0));
        assert!(engine.query_count() > 0);
    }

    #[test]
    fn ready_neighborhoods_are_bounded() {
        let scope = Scope::new(0, "all");
        let block = |i: u32| TileRange::new(17, i * 6, i * 6 + 5, 0, 5);
        let mut batches = BatchState::default();
        for i in 0..READY_RANGES_PER_ZOOM as u32 + 10 {
            batches.mark(&scope, Readiness::Neighborhood(block(i)));
        }

        assert_eq!(batches.ready_neighborhoods[&(scope.clone(), 17)].len(), READY_RANGES_PER_ZOOM);
        assert!(!batches.range_ready(&scope, &block(0)));
        assert!(!batches.range_ready(&scope, &block(9)));
        assert!(batches.range_ready(&scope, &block(10)));
        assert!(batches.range_ready(&scope, &block(READY_RANGES_PER_ZOOM as u32 + 9)));
    }

    #[test]
    fn decode_rejects_missing_columns() {
        let result = QueryResult::new(vec!["xtile".into()], vec![]);
        assert!(matches!(decode_tiles(&result, 13), Err(TileError::Decode(_))));
    }

    #[test]
    fn fill_range_writes_explicit_empties() {
        let range = TileRange::new(13, 0, 1, 0, 1);
        let filled = fill_range(range, vec![(TileCoord::new(13, 1, 1), vec![7]), (TileCoord::new(13, 9, 9), vec![8])]);
        assert_eq!(filled.len(), 4);
        assert_eq!(filled[3], (TileCoord::new(13, 1, 1), vec![7]));
        assert!(filled[..3].iter().all(|(_, b)| b.is_empty()));
    }
}
