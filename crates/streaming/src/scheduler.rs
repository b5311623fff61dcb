//! Organic tile requests: admission checks, the priority backlog and the
//! bounded worker pool draining it.

use std::sync::Arc;

use foundation::TileCoord;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::TileError;
use crate::keys::CacheKey;
use crate::pipeline::TilePipeline;
use crate::request::QueuedTileRequest;

impl TilePipeline {
    /// Entry point for tiles the map asks for on its own.
    ///
    /// Cache hits return immediately. Tiles that can never hold data, coarse
    /// tiles the viewport has zoomed far past, and every miss while
    /// auto-fetch is off resolve empty. Anything else waits in the backlog.
    pub async fn request_tile(self: &Arc<Self>, coord: TileCoord) -> Result<Vec<u8>, TileError> {
        self.check_failed()?;
        if !coord.is_valid() {
            return Ok(Vec::new());
        }

        {
            let mut st = self.state.lock();
            let key = CacheKey::new(st.scope(), coord);
            let cached = st.lookup(&key);
            if let Some(bytes) = cached {
                drop(st);
                self.count("cache_hits");
                return Ok(bytes);
            }
            let out_of_bounds = st.bounds.is_some_and(|b| !b.contains(&coord));
            if out_of_bounds || self.config.fast_reject.rejects(coord.z, st.viewport.zoom) {
                drop(st);
                trace!(%coord, "fast reject");
                self.count("fast_rejects");
                return Ok(Vec::new());
            }
            if !st.auto_fetch {
                return Ok(Vec::new());
            }
        }

        let (req, rx) = QueuedTileRequest::new(coord);
        let queued = {
            let mut q = self.queue.lock();
            q.push(req);
            q.len()
        };
        self.count("requests_queued");
        trace!(%coord, queued, "tile queued");
        self.pump();
        self.publish_backlog();

        rx.await.unwrap_or(Err(TileError::Canceled))
    }

    /// Starts workers until the slots are full or the backlog is empty.
    fn pump(self: &Arc<Self>) {
        let slots = self.config.scheduler.worker_slots;
        while self.queue.lock().try_claim_worker(slots) {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.worker_loop().await });
        }
    }

    /// Mirrors backlog depth and busy slots into the gauges.
    fn publish_backlog(&self) {
        let (queued, active) = {
            let q = self.queue.lock();
            (q.len(), q.active_workers())
        };
        self.set_gauge("queued", queued);
        self.set_gauge("active_workers", active);
    }

    /// Holds one slot, resolving the most urgent request until none remain.
    async fn worker_loop(self: Arc<Self>) {
        loop {
            let priority = self.priority();
            let next = {
                let mut q = self.queue.lock();
                let next = q.pop_next(&priority, Instant::now());
                if next.is_none() {
                    q.release_worker();
                }
                next
            };
            self.publish_backlog();
            let Some(req) = next else {
                return;
            };

            let waited_ms = req.enqueued_at.elapsed().as_secs_f64() * 1000.0;
            debug!(coord = %req.coord, waited_ms, "resolving queued tile");
            let result = self.ensure_tile(req.coord).await;
            req.complete(result);
        }
    }
}
