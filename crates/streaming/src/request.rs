use foundation::TileCoord;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::TileError;

pub type TileResult = Result<Vec<u8>, TileError>;

/// A tile request parked in the scheduler backlog.
///
/// The reply channel is consumed on completion, so each request is answered
/// exactly once.
#[derive(Debug)]
pub struct QueuedTileRequest {
    pub coord: TileCoord,
    pub enqueued_at: Instant,
    reply: oneshot::Sender<TileResult>,
}

impl QueuedTileRequest {
    pub fn new(coord: TileCoord) -> (Self, oneshot::Receiver<TileResult>) {
        let (reply, rx) = oneshot::channel();
        let req = Self {
            coord,
            enqueued_at: Instant::now(),
            reply,
        };
        (req, rx)
    }

    /// Delivers the result; a caller that stopped waiting is ignored.
    pub fn complete(self, result: TileResult) {
        let _ = self.reply.send(result);
    }
}
