//! The cache manager contract consumed by request promises

use crate::error::Result;
use bytes::Bytes;

/// Identifiers starting with this prefix are private to cache manager
/// implementations and never collide with caller-supplied identifiers.
pub const RESERVED_IDENTIFIER_PREFIX: &str = "__";

/// Whether `identifier` is reserved for cache manager internals.
pub fn is_reserved_identifier(identifier: &str) -> bool {
    identifier.starts_with(RESERVED_IDENTIFIER_PREFIX)
}

/// Persistent store keyed by identifier, tracking a revision per entry.
///
/// Every method may be called from many threads at once and may block.
/// Identifiers are opaque and of arbitrary length; revisions are opaque and
/// only ever compared for inequality.
///
/// When a request promise serves a request from the cache (offline, or with
/// the cache authoritative) any error returned here fails the request, and
/// the promise calls [`remove_cache`](Self::remove_cache) for the identifier.
pub trait CacheManager: Send + Sync {
    /// The last recorded revision for `identifier`, or `None` if nothing is cached.
    fn revision_for(&self, identifier: &str) -> Option<String>;

    /// Persist `data` under `identifier` with `revision`.
    ///
    /// Readers never observe a partially written entry.
    fn cache(&self, data: &[u8], identifier: &str, revision: &str) -> Result<()>;

    /// The cached bytes for `identifier`; `Ok(None)` when nothing is cached.
    fn cached_data(&self, identifier: &str) -> Result<Option<Bytes>>;

    /// Delete all state for `identifier`.
    fn remove_cache(&self, identifier: &str) -> Result<()>;

    /// Delete everything.
    fn remove_all_cache(&self) -> Result<()>;
}
