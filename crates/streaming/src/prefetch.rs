//! Viewport-driven warm-up: explicit prefetch of the visible range and a
//! once-per-revision prewarm of the tiers a session is about to need.

use std::sync::Arc;

use foundation::{TileCoord, TileRange, center_tile};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::TileError;
use crate::keys::Scope;
use crate::pipeline::{TilePipeline, spawn_shared};

/// Deepest zoom prewarm focuses on.
const PREWARM_MAX_ZOOM: u8 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchStatus {
    Executed,
    /// The same range was already prefetched in this scope.
    Deduped,
    Skipped,
}

impl TilePipeline {
    /// Batches the visible range at `z` ahead of the tile requests for it.
    ///
    /// A supplied range also becomes the visible range for `z`. Batch errors
    /// are logged; only losing the engine is returned.
    pub async fn prefetch_visible(
        self: &Arc<Self>,
        z: u8,
        range: Option<TileRange>,
    ) -> Result<PrefetchStatus, TileError> {
        self.check_failed()?;
        let lod = &self.config.lod;
        if z < lod.feature_table_zoom || z > lod.max_tile_column_zoom {
            return Ok(PrefetchStatus::Skipped);
        }
        if let Some(range) = range.filter(|r| r.z == z) {
            self.set_visible_tile_range(range);
        }

        let (scope, target, signature) = {
            let st = self.state.lock();
            if !st.spatial_ready {
                return Ok(PrefetchStatus::Skipped);
            }
            let Some(visible) = st.viewport.visible.get(&z).copied() else {
                return Ok(PrefetchStatus::Skipped);
            };
            let Some(target) = self.batch_target(visible, st.bounds.map(|b| b.range_at(z))) else {
                return Ok(PrefetchStatus::Skipped);
            };
            let scope = st.scope();
            let signature = format!("{scope}:{z}:{target}");
            if st.prefetched.contains(&signature) {
                return Ok(PrefetchStatus::Deduped);
            }
            (scope, target, signature)
        };

        debug!(%scope, %target, "prefetching visible range");
        let mut complete = true;
        if z == lod.feature_table_zoom {
            if let Err(err) = self.ensure_feature_table(&scope, z).await {
                self.degrade("prefetch feature table", err)?;
                complete = false;
            }
        }
        if let Err(err) = self.ensure_neighborhood(&scope, target, target).await {
            self.degrade("prefetch neighborhood", err)?;
            complete = false;
        }
        // Only a prefetch that cached its range may dedupe the next one.
        if complete {
            let mut st = self.state.lock();
            if st.is_current(&scope) {
                st.prefetched.insert(signature);
            }
        }
        Ok(PrefetchStatus::Executed)
    }

    /// Warms the focus zooms, the feature table and the zoom-batch tiers.
    ///
    /// Runs once per revision; concurrent callers wait on the same run.
    pub async fn prewarm(self: &Arc<Self>) -> Result<(), TileError> {
        self.check_failed()?;
        let task = {
            let mut st = self.state.lock();
            if !st.spatial_ready {
                return Ok(());
            }
            let revision = st.revision;
            let existing = st
                .prewarm
                .as_ref()
                .filter(|(rev, _)| *rev == revision)
                .map(|(_, task)| task.clone());
            match existing {
                Some(task) => task,
                None => {
                    let this = Arc::clone(self);
                    let scope = st.scope();
                    let task = spawn_shared(async move { this.run_prewarm(scope).await });
                    st.prewarm = Some((revision, task.clone()));
                    task
                }
            }
        };
        task.await
    }

    async fn run_prewarm(self: Arc<Self>, scope: Scope) -> Result<(), TileError> {
        let lod = &self.config.lod;
        let base = lod.feature_table_zoom;
        let focus = {
            let st = self.state.lock();
            let zoom = st.viewport.zoom.unwrap_or(base as f64).round();
            zoom.clamp(base as f64, PREWARM_MAX_ZOOM as f64) as u8
        };
        info!(%scope, focus, "prewarm started");

        let mut zooms = vec![focus];
        if focus > base {
            zooms.push(focus - 1);
        }
        for z in zooms.into_iter().filter(|z| *z != base) {
            if let Some(range) = self.prewarm_target(z) {
                if let Err(err) = self.ensure_neighborhood(&scope, range, range).await {
                    self.degrade("prewarm neighborhood", err)?;
                }
            }
        }

        if let Err(err) = self.ensure_feature_table(&scope, base).await {
            self.degrade("prewarm feature table", err)?;
        }
        if let Some(range) = self.prewarm_target(base) {
            if let Err(err) = self.ensure_neighborhood(&scope, range, range).await {
                self.degrade("prewarm neighborhood", err)?;
            }
        }

        for z in (lod.zoom_batch_min..=lod.zoom_batch_max).rev() {
            if let Err(err) = self.ensure_zoom_batch(&scope, z).await {
                self.degrade("prewarm zoom batch", err)?;
            }
        }
        info!(%scope, "prewarm finished");
        Ok(())
    }

    /// Visible range at `z`, else a block around the viewport center, else
    /// the middle of the data.
    fn prewarm_target(&self, z: u8) -> Option<TileRange> {
        let st = self.state.lock();
        let bounds = st.bounds.map(|b| b.range_at(z));
        let span = 2 * self.config.lod.block_size(z);
        let around = |coord: TileCoord| TileRange::centered_block(coord, span);
        let wanted = match (st.viewport.visible.get(&z), st.viewport.center, bounds) {
            (Some(visible), _, _) => *visible,
            (None, Some(center), _) => around(center_tile(center, z)),
            (None, None, Some(bounds)) => around(bounds.center()),
            (None, None, None) => return None,
        };
        self.batch_target(wanted, bounds)
    }

    /// `range` cut to the data and shrunk to two blocks per side.
    fn batch_target(&self, range: TileRange, bounds: Option<TileRange>) -> Option<TileRange> {
        let range = match bounds {
            Some(bounds) => range.intersect(&bounds)?,
            None => range,
        };
        Some(range.shrink_to(2 * self.config.lod.block_size(range.z)))
    }
}
