//! Query result caching: key derivation and a TTL store.

pub mod key;
pub mod ttl;

pub use key::{derive_key, CacheKey};
pub use ttl::{CacheEntry, CacheSettings, CacheStats, TtlCache};
