pub mod bounds;
pub mod mercator;
pub mod tile;
pub mod viewport;

// Foundation crate: pure tile and projection math, no I/O.
pub use bounds::*;
pub use mercator::*;
pub use tile::*;
pub use viewport::*;
