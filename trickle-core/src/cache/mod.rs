//! Memory-bounded piece caching

pub mod piece_cache;
pub mod recency;

pub use piece_cache::{
    EngineEvictionHook, EvictionHook, PieceCache, PieceCacheStats, capacity_for,
};
pub use recency::RecencyCache;
