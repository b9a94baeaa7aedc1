//! Cache key derivation for registry queries.

use std::fmt;

use serde_json::Value;

/// Opaque cache key for a `(query_id, params)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log fields.
    pub(crate) fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(32)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build a deterministic cache key: `<id length>:<id>:<params as JSON array>`.
///
/// The length prefix keeps the identifier/params boundary unambiguous even
/// when the identifier itself contains `:` or `[`, and JSON array encoding is
/// order-preserving, so distinct inputs never share a key.
pub fn derive_key(query_id: &str, params: &[Value]) -> CacheKey {
    // Serializing a slice of Values cannot fail.
    let encoded = serde_json::to_string(params).unwrap_or_else(|_| "[]".to_string());
    CacheKey(format!("{}:{}:{}", query_id.len(), query_id, encoded))
}
