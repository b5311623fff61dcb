use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use foundation::{Camera, DataBounds, LngLat, MercatorBounds, TileRange, visible_tile_range};
use futures_util::FutureExt;
use futures_util::future::Shared;
use parking_lot::Mutex;
use runtime::{Metrics, MetricsSnapshot};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::batch::BatchState;
use crate::cache::{CacheLookup, TileCache};
use crate::config::EngineConfig;
use crate::error::{ConfigError, TileError};
use crate::keys::{CacheKey, NO_FILTER, Scope, filter_signature, normalize_sql};
use crate::query::{BoxFuture, QueryEngine, QueryError, QueryResult, Value};
use crate::queue::{Priority, TileQueue};
use crate::sql::{self, Statement};

/// A spawned unit of work any number of callers can await.
pub(crate) type SharedTask<T> = Shared<BoxFuture<'static, Result<T, TileError>>>;

/// Runs `work` on the runtime so it finishes even if every caller goes away,
/// and hands back a cloneable handle to its result.
pub(crate) fn spawn_shared<T, F>(work: F) -> SharedTask<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T, TileError>> + Send + 'static,
{
    let handle = tokio::spawn(work);
    async move {
        match handle.await {
            Ok(result) => result,
            Err(err) => {
                warn!(%err, "tile task aborted");
                Err(TileError::Canceled)
            }
        }
    }
    .boxed()
    .shared()
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ViewportState {
    pub zoom: Option<f64>,
    pub center: Option<LngLat>,
    pub visible: HashMap<u8, TileRange>,
}

pub(crate) struct EngineState {
    pub revision: u64,
    pub base_sql: String,
    pub base_is_default: bool,
    pub filter: Arc<str>,
    pub viewport: ViewportState,
    pub cache: TileCache,
    pub bounds: Option<DataBounds>,
    pub spatial_ready: bool,
    pub init_error: Option<String>,
    pub aggregate_tiers: HashSet<u8>,
    pub batches: BatchState,
    pub tiles_inflight: HashMap<CacheKey, (u64, SharedTask<Vec<u8>>)>,
    pub prefetched: HashSet<String>,
    pub prewarm: Option<(u64, SharedTask<()>)>,
    pub auto_fetch: bool,
    pub failed: Option<String>,
    pub feature_tables: Vec<String>,
    next_task_id: u64,
}

impl EngineState {
    fn new(config: &EngineConfig) -> Self {
        Self {
            revision: 0,
            base_sql: config.dataset.default_base_query(),
            base_is_default: true,
            filter: NO_FILTER.into(),
            viewport: ViewportState::default(),
            cache: TileCache::new(config.cache.capacity, config.cache.empty_retention_zoom),
            bounds: None,
            spatial_ready: false,
            init_error: None,
            aggregate_tiers: HashSet::new(),
            batches: BatchState::default(),
            tiles_inflight: HashMap::new(),
            prefetched: HashSet::new(),
            prewarm: None,
            auto_fetch: true,
            failed: None,
            feature_tables: Vec::new(),
            next_task_id: 0,
        }
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.revision, Arc::clone(&self.filter))
    }

    pub fn is_current(&self, scope: &Scope) -> bool {
        scope.revision == self.revision && scope.filter == self.filter
    }

    pub fn next_task_id(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    /// Cached bytes, or an empty buffer for tiles a finished batch covered.
    pub fn lookup(&mut self, key: &CacheKey) -> Option<Vec<u8>> {
        match self.cache.get(key) {
            CacheLookup::Hit(bytes) => Some(bytes),
            CacheLookup::Empty => Some(Vec::new()),
            CacheLookup::Miss if self.batches.covers(&key.scope, &key.coord) => Some(Vec::new()),
            CacheLookup::Miss => None,
        }
    }

    /// Forgets every per-scope result and pending batch.
    fn reset_batches(&mut self) {
        self.batches.clear();
        self.tiles_inflight.clear();
        self.prefetched.clear();
    }
}

/// Point-in-time engine summary for logs and `/stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub revision: u64,
    pub filter: String,
    pub default_base_query: bool,
    pub cache_entries: usize,
    pub cache_pinned: usize,
    pub cache_empties: usize,
    pub cache_capacity: usize,
    pub queued: usize,
    pub active_workers: usize,
    pub spatial_ready: bool,
    pub auto_fetch: bool,
    pub viewport_zoom: Option<f64>,
    pub init_error: Option<String>,
    pub failed: Option<String>,
    pub metrics: MetricsSnapshot,
}

/// The tile engine: owns the cache, batch bookkeeping, scheduler backlog and
/// the single connection to the query engine.
///
/// Lock discipline: `state`, `queue` and `metrics` are never held together
/// and never across an `.await`; `connection` serialises every statement.
pub struct TilePipeline {
    pub(crate) config: EngineConfig,
    engine: Arc<dyn QueryEngine>,
    connection: tokio::sync::Mutex<()>,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) queue: Mutex<TileQueue>,
    metrics: Mutex<Metrics>,
}

impl TilePipeline {
    pub fn new(config: EngineConfig, engine: Arc<dyn QueryEngine>) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let state = EngineState::new(&config);
        Ok(Arc::new(Self {
            config,
            engine,
            connection: tokio::sync::Mutex::new(()),
            state: Mutex::new(state),
            queue: Mutex::new(TileQueue::new()),
            metrics: Mutex::new(Metrics::new()),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scope(&self) -> Scope {
        self.state.lock().scope()
    }

    pub fn data_bounds(&self) -> Option<DataBounds> {
        self.state.lock().bounds
    }

    /// Loads the spatial extension, measures the dataset extent and probes for
    /// precomputed aggregate tables.
    ///
    /// Failures other than losing the engine are recorded in `init_error` and
    /// degrade tile resolution instead of failing.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), TileError> {
        self.check_failed()?;
        let mut problems = Vec::new();

        let spatial_ready = match self.execute(sql::load_spatial()).await {
            Ok(_) => true,
            Err(err @ QueryError::Unavailable(_)) => return Err(TileError::from(err).escalate()),
            Err(err) => {
                warn!(%err, "spatial extension unavailable; spatial tiles will resolve empty");
                problems.push(format!("spatial extension: {err}"));
                false
            }
        };

        let bounds = match self.execute(sql::extent(&self.config.dataset)).await {
            Ok(result) => match decode_extent(&result) {
                Ok(bounds) => bounds,
                Err(err) => {
                    warn!(%err, "could not read dataset extent");
                    problems.push(format!("extent: {err}"));
                    None
                }
            },
            Err(err @ QueryError::Unavailable(_)) => return Err(TileError::from(err).escalate()),
            Err(err) => {
                warn!(%err, "extent query failed; tiles are not bounds-checked");
                problems.push(format!("extent: {err}"));
                None
            }
        };

        let mut aggregate_tiers = HashSet::new();
        if !self.config.dataset.aggregate_tables.is_empty() {
            match self.execute(sql::probe_aggregates(&self.config.dataset)).await {
                Ok(result) => {
                    let found: HashSet<&str> =
                        result.rows.iter().filter_map(|row| row.first()?.as_str()).collect();
                    aggregate_tiers = self
                        .config
                        .dataset
                        .aggregate_tables
                        .iter()
                        .filter(|(_, table)| found.contains(table.as_str()))
                        .map(|(z, _)| *z)
                        .collect();
                }
                Err(err @ QueryError::Unavailable(_)) => {
                    return Err(TileError::from(err).escalate());
                }
                Err(err) => warn!(%err, "aggregate table probe failed"),
            }
        }

        let init_error = (!problems.is_empty()).then(|| problems.join("; "));
        {
            let mut st = self.state.lock();
            st.spatial_ready = spatial_ready;
            st.bounds = bounds;
            st.aggregate_tiers = aggregate_tiers.clone();
            st.init_error = init_error;
        }
        info!(
            spatial_ready,
            bounded = bounds.is_some(),
            aggregate_tiers = ?aggregate_tiers,
            "tile engine initialized"
        );
        Ok(())
    }

    /// Replaces the base query; blank or `None` restores the default.
    ///
    /// Custom SQL is compiled first and a rejection leaves everything as it
    /// was. Otherwise the revision advances and every per-revision structure
    /// is dropped. Returns the active revision.
    pub async fn set_base_query(self: &Arc<Self>, sql: Option<&str>) -> Result<u64, TileError> {
        self.check_failed()?;
        let default_sql = self.config.dataset.default_base_query();
        let requested = sql.map(normalize_sql).filter(|s| !s.is_empty());
        let (next_sql, is_default) = match requested {
            Some(s) if s != default_sql => (s, false),
            _ => (default_sql, true),
        };

        {
            let st = self.state.lock();
            if st.base_sql == next_sql {
                return Ok(st.revision);
            }
        }

        if !is_default {
            self.execute(sql::validate_base(&next_sql))
                .await
                .map_err(|err| TileError::from(err).escalate())?;
        }

        let (revision, stale_tables, cleared) = {
            let mut st = self.state.lock();
            st.revision += 1;
            st.base_sql = next_sql;
            st.base_is_default = is_default;
            let cleared = st.cache.clear();
            st.reset_batches();
            st.prewarm = None;
            (st.revision, std::mem::take(&mut st.feature_tables), cleared)
        };
        info!(revision, cleared, default = is_default, "base query changed");

        for table in stale_tables {
            if let Err(err) = self.execute(sql::drop_table(&table)).await {
                warn!(%table, %err, "failed to drop feature table");
            }
        }
        Ok(revision)
    }

    /// Restricts the map to ids returned by `sql`; blank or `None` clears.
    ///
    /// A statement matching zero ids counts as no filter at all.
    pub async fn set_id_filter(self: &Arc<Self>, sql: Option<&str>) -> Result<Scope, TileError> {
        self.check_failed()?;
        let requested = sql.map(normalize_sql).filter(|s| !s.is_empty());
        let signature: Arc<str> = match requested {
            None => NO_FILTER.into(),
            Some(filter_sql) => {
                let signature = filter_signature(&filter_sql);
                self.execute(sql::create_id_filter(&self.config.dataset, &filter_sql, &signature))
                    .await
                    .map_err(|err| TileError::from(err).escalate())?;
                let count = self
                    .execute(sql::count_id_filter(&signature))
                    .await
                    .map_err(|err| TileError::from(err).escalate())?;
                let ids = count
                    .scalar()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| TileError::Decode("id filter count is not a number".into()))?;
                if ids == 0 {
                    info!("id filter matched no rows; showing every tree");
                    NO_FILTER.into()
                } else {
                    debug!(ids, %signature, "id filter materialized");
                    signature.into()
                }
            }
        };

        let scope = {
            let mut st = self.state.lock();
            if st.filter != signature {
                st.filter = signature;
                st.reset_batches();
            }
            st.scope()
        };
        info!(%scope, "id filter applied");
        Ok(scope)
    }

    pub fn set_viewport_zoom(&self, zoom: f64) {
        if zoom.is_finite() {
            self.state.lock().viewport.zoom = Some(zoom);
        }
    }

    pub fn set_viewport_center(&self, center: LngLat) {
        if center.lng.is_finite() && center.lat.is_finite() {
            self.state.lock().viewport.center = Some(center);
        }
    }

    /// Records the client's visible range at `range.z`; zooms without tile
    /// columns are ignored and reported as `false`.
    pub fn set_visible_tile_range(&self, range: TileRange) -> bool {
        if range.z > self.config.lod.max_tile_column_zoom {
            debug!(z = range.z, "ignoring visible range beyond the tiled zooms");
            return false;
        }
        let range = range.clamp_to_world();
        self.state.lock().viewport.visible.insert(range.z, range);
        true
    }

    /// Sets zoom and center, and derives the visible range of every zoom that
    /// has tile columns.
    pub fn set_camera(&self, camera: &Camera) {
        if !camera.zoom.is_finite() || camera.width_px == 0 || camera.height_px == 0 {
            return;
        }
        let ranges: Vec<_> = (0..=self.config.lod.max_tile_column_zoom)
            .map(|z| visible_tile_range(camera, z))
            .collect();
        let mut st = self.state.lock();
        st.viewport.zoom = Some(camera.zoom);
        st.viewport.center = Some(camera.center);
        for range in ranges {
            st.viewport.visible.insert(range.z, range);
        }
    }

    /// While disabled, organic tile requests are answered from cache or empty.
    pub fn set_auto_fetch_enabled(&self, enabled: bool) {
        let mut st = self.state.lock();
        if st.auto_fetch != enabled {
            debug!(enabled, "auto fetch toggled");
        }
        st.auto_fetch = enabled;
    }

    /// Pass-through query on the shared connection.
    pub async fn run_raw_query(&self, sql: &str) -> Result<QueryResult, TileError> {
        self.check_failed()?;
        self.execute(sql::raw(sql))
            .await
            .map_err(|err| TileError::from(err).escalate())
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = {
            let st = self.state.lock();
            EngineStats {
                revision: st.revision,
                filter: st.filter.to_string(),
                default_base_query: st.base_is_default,
                cache_entries: st.cache.len(),
                cache_pinned: st.cache.pinned_len(),
                cache_empties: st.cache.empty_len(),
                cache_capacity: st.cache.capacity(),
                queued: 0,
                active_workers: 0,
                spatial_ready: st.spatial_ready,
                auto_fetch: st.auto_fetch,
                viewport_zoom: st.viewport.zoom,
                init_error: st.init_error.clone(),
                failed: st.failed.clone(),
                metrics: MetricsSnapshot::default(),
            }
        };
        {
            let q = self.queue.lock();
            stats.queued = q.len();
            stats.active_workers = q.active_workers();
        }
        stats.metrics = self.metrics.lock().snapshot();
        stats
    }

    /// Runs one statement on the shared connection.
    pub(crate) async fn execute(&self, stmt: Statement) -> Result<QueryResult, QueryError> {
        let _connection = self.connection.lock().await;
        let started = Instant::now();
        let result = self.engine.execute(&stmt.sql).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut m = self.metrics.lock();
            m.incr("queries");
            m.observe_ms("query_ms", elapsed_ms);
            if result.is_err() {
                m.incr("query_errors");
            }
        }

        match &result {
            Ok(rows) => debug!(kind = %stmt.kind, rows = rows.row_count(), elapsed_ms, "query finished"),
            Err(QueryError::Unavailable(reason)) => {
                error!(kind = %stmt.kind, %reason, "query engine unavailable");
                self.fail(reason.clone());
            }
            Err(err) => debug!(kind = %stmt.kind, %err, elapsed_ms, "query rejected"),
        }
        result
    }

    /// Marks the engine as failed and rejects the whole backlog.
    pub(crate) fn fail(&self, reason: String) {
        let first = {
            let mut st = self.state.lock();
            let first = st.failed.is_none();
            if first {
                st.failed = Some(reason.clone());
            }
            first
        };
        let pending = self.queue.lock().drain();
        if first {
            error!(%reason, pending = pending.len(), "tile engine failed");
        }
        for req in pending {
            req.complete(Err(TileError::EngineFailed(reason.clone())));
        }
    }

    pub(crate) fn check_failed(&self) -> Result<(), TileError> {
        match &self.state.lock().failed {
            Some(reason) => Err(TileError::EngineFailed(reason.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn count(&self, name: &'static str) {
        self.metrics.lock().incr(name);
    }

    pub(crate) fn metrics_add(&self, name: &'static str, by: u64) {
        self.metrics.lock().add(name, by);
    }

    pub(crate) fn set_gauge(&self, name: &'static str, value: usize) {
        self.metrics.lock().set_gauge(name, value as i64);
    }

    pub(crate) fn priority(&self) -> Priority {
        let st = self.state.lock();
        Priority {
            zoom: st.viewport.zoom,
            center: st.viewport.center,
            weights: self.config.scheduler.clone(),
        }
    }
}

fn decode_extent(result: &QueryResult) -> Result<Option<DataBounds>, TileError> {
    let column = |name: &str| {
        result
            .column(name)
            .ok_or_else(|| TileError::Decode(format!("extent result lacks {name}")))
    };
    let idx = [column("min_x")?, column("min_y")?, column("max_x")?, column("max_y")?];
    let Some(row) = result.rows.first() else {
        return Ok(None);
    };
    let mut values = [0.0; 4];
    for (slot, i) in values.iter_mut().zip(idx) {
        match row.get(i).and_then(Value::as_f64) {
            Some(v) => *slot = v,
            // No rows in the dataset yields NULL extents.
            None => return Ok(None),
        }
    }
    let [min_x, min_y, max_x, max_y] = values;
    Ok(Some(DataBounds::new(MercatorBounds::new(min_x, min_y, max_x, max_y))))
}
