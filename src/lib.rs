pub mod cache;
pub mod dedup;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sweeper;
pub mod wal;

pub use engine::{Engine, EngineError};
