//! Caching layers: the persisted content cache and in-process memoization

mod content;
mod memo;

pub use content::{CacheKey, ContentCache, parse_ttl};
pub use memo::Memoized;
