use crate::error::{CacheError, Result};
use crate::manager::CacheManager;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// A cached payload and its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCacheItem {
    pub data: Bytes,
    pub revision: String,
}

impl MemoryCacheItem {
    pub fn new(data: impl Into<Bytes>, revision: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            revision: revision.into(),
        }
    }
}

/// How many times each cache manager method was called.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub revision_for: usize,
    pub cache: usize,
    pub cached_data: usize,
    pub remove_cache: usize,
    pub remove_all_cache: usize,
}

#[derive(Default)]
struct State {
    items: HashMap<String, MemoryCacheItem>,
    errors: HashMap<String, CacheError>,
    calls: CallCounts,
}

/// In-memory cache manager with deterministic failure injection.
///
/// A single lock guards every operation. Besides serving as a lightweight
/// cache, it records how it was called so tests can assert on the request
/// promise's cache traffic.
#[derive(Default)]
pub struct MemoryCacheManager {
    state: Mutex<State>,
}

impl MemoryCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepopulate the cache without touching the call counters.
    pub fn with_items<I, K>(items: I) -> Self
    where
        I: IntoIterator<Item = (K, MemoryCacheItem)>,
        K: Into<String>,
    {
        let manager = Self::new();
        manager.lock().items = items.into_iter().map(|(k, v)| (k.into(), v)).collect();
        manager
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report `error` whenever `identifier` is read or written.
    ///
    /// Removing the identifier's cache clears the error along with the entry.
    pub fn set_error(&self, identifier: impl Into<String>, error: CacheError) {
        self.lock().errors.insert(identifier.into(), error);
    }

    pub fn clear_error(&self, identifier: &str) {
        self.lock().errors.remove(identifier);
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    pub fn item(&self, identifier: &str) -> Option<MemoryCacheItem> {
        self.lock().items.get(identifier).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheManager for MemoryCacheManager {
    fn revision_for(&self, identifier: &str) -> Option<String> {
        let mut state = self.lock();
        state.calls.revision_for += 1;
        if state.errors.contains_key(identifier) {
            return None;
        }
        state.items.get(identifier).map(|item| item.revision.clone())
    }

    fn cache(&self, data: &[u8], identifier: &str, revision: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.cache += 1;
        if let Some(error) = state.errors.get(identifier) {
            return Err(error.clone());
        }
        trace!(identifier = %identifier, revision = %revision, bytes = data.len(), "Caching in memory");
        state.items.insert(
            identifier.to_string(),
            MemoryCacheItem::new(Bytes::copy_from_slice(data), revision),
        );
        Ok(())
    }

    fn cached_data(&self, identifier: &str) -> Result<Option<Bytes>> {
        let mut state = self.lock();
        state.calls.cached_data += 1;
        if let Some(error) = state.errors.get(identifier) {
            return Err(error.clone());
        }
        Ok(state.items.get(identifier).map(|item| item.data.clone()))
    }

    fn remove_cache(&self, identifier: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.remove_cache += 1;
        state.errors.remove(identifier);
        state.items.remove(identifier);
        Ok(())
    }

    fn remove_all_cache(&self) -> Result<()> {
        let mut state = self.lock();
        state.calls.remove_all_cache += 1;
        state.errors.clear();
        state.items.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepopulated_items_do_not_count_as_calls() {
        let manager = MemoryCacheManager::with_items([("x", MemoryCacheItem::new("data", "r1"))]);
        assert_eq!(manager.calls(), CallCounts::default());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_injected_error_applies_to_reads_and_writes() {
        let manager = MemoryCacheManager::with_items([("y", MemoryCacheItem::new("data", "r1"))]);
        manager.set_error("y", CacheError::injected("disk on fire"));

        assert!(manager.cached_data("y").is_err());
        assert!(manager.cache(b"new", "y", "r2").is_err());
        assert_eq!(manager.revision_for("y"), None);

        let calls = manager.calls();
        assert_eq!(calls.cached_data, 1);
        assert_eq!(calls.cache, 1);
        assert_eq!(calls.revision_for, 1);
    }

    #[test]
    fn test_remove_cache_heals_injected_error() {
        let manager = MemoryCacheManager::new();
        manager.set_error("y", CacheError::injected("broken"));
        manager.remove_cache("y").unwrap();

        assert_eq!(manager.cached_data("y").unwrap(), None);
        assert_eq!(manager.calls().remove_cache, 1);
    }

    #[test]
    fn test_other_identifiers_unaffected_by_error() {
        let manager = MemoryCacheManager::new();
        manager.set_error("bad", CacheError::injected("broken"));
        manager.cache(b"fine", "good", "r1").unwrap();
        assert_eq!(manager.cached_data("good").unwrap().as_deref(), Some(&b"fine"[..]));
    }
}
