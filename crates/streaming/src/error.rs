use thiserror::Error;

use crate::query::QueryError;

/// Errors surfaced by tile resolution and the control surface.
///
/// `Clone` so one failure can be handed to every caller joined on a shared
/// in-flight future.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TileError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("tile engine failed: {0}")]
    EngineFailed(String),
    #[error("tile request was dropped before completion")]
    Canceled,
    #[error("unexpected query result: {0}")]
    Decode(String),
}

impl TileError {
    /// `true` when the engine can no longer serve anything.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TileError::EngineFailed(_) | TileError::Query(QueryError::Unavailable(_))
        )
    }

    /// Reports engine loss uniformly as `EngineFailed`.
    pub fn escalate(self) -> Self {
        match self {
            TileError::Query(QueryError::Unavailable(reason)) => TileError::EngineFailed(reason),
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be a plain SQL identifier, got {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },
    #[error("{field} is out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}
