mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod keys;
pub mod lod;
pub mod pipeline;
pub mod prefetch;
pub mod protocol;
pub mod query;
pub mod queue;
pub mod request;
mod scheduler;
pub mod sql;

#[cfg(test)]
mod testing;

pub use cache::*;
pub use config::*;
pub use error::*;
pub use keys::*;
pub use pipeline::{EngineStats, TilePipeline};
pub use prefetch::PrefetchStatus;
pub use query::*;
pub use queue::*;
pub use request::*;
