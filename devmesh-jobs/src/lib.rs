pub mod access_tracker;
pub mod eviction;

pub use access_tracker::{AccessTracker, RecencySink};
pub use eviction::{EvictionError, EvictionManager};
