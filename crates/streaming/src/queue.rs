use std::time::Duration;

use foundation::{LngLat, TileCoord, tile_distance};
use runtime::work_queue::{WorkId, WorkQueue};
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::request::QueuedTileRequest;

/// Viewport snapshot used to rank pending tiles.
#[derive(Debug, Clone)]
pub struct Priority {
    pub zoom: Option<f64>,
    pub center: Option<LngLat>,
    pub weights: SchedulerConfig,
}

impl Priority {
    /// Lower is more urgent: tiles at the viewport zoom, near its center, and
    /// waiting longest win.
    pub fn score(&self, coord: &TileCoord, age: Duration) -> f64 {
        let zoom_term = self
            .zoom
            .map(|zoom| (coord.z as f64 - zoom.round()).abs())
            .unwrap_or(0.0);
        let distance_term = self
            .center
            .map(|center| tile_distance(coord, center))
            .unwrap_or(0.0);
        let age_term = age.as_secs_f64() * 1000.0 / self.weights.age_unit_ms;
        self.weights.zoom_weight * zoom_term + self.weights.distance_weight * distance_term
            - age_term
    }
}

/// Tile backlog with a bounded set of worker slots.
///
/// This is a thin wrapper over `runtime::WorkQueue` so streaming owns its
/// scheduling policy without duplicating queue logic.
#[derive(Debug, Default)]
pub struct TileQueue {
    inner: WorkQueue<QueuedTileRequest>,
    active_workers: usize,
}

impl TileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers
    }

    pub fn push(&mut self, req: QueuedTileRequest) -> WorkId {
        self.inner.push(req)
    }

    pub fn pop_next(&mut self, priority: &Priority, now: Instant) -> Option<QueuedTileRequest> {
        self.inner
            .pop_best_by(|req| priority.score(&req.coord, now.saturating_duration_since(req.enqueued_at)))
            .map(|(_, req)| req)
    }

    pub fn drain(&mut self) -> Vec<QueuedTileRequest> {
        self.inner.drain()
    }

    /// Reserves a worker slot when work is waiting and a slot is free.
    pub fn try_claim_worker(&mut self, max_workers: usize) -> bool {
        if self.inner.is_empty() || self.active_workers >= max_workers {
            return false;
        }
        self.active_workers += 1;
        true
    }

    pub fn release_worker(&mut self) {
        self.active_workers = self.active_workers.saturating_sub(1);
    }
}
