//! Pinna Cache
//!
//! Revision-aware cache managers consumed by request promises.
//!
//! # Features
//!
//! - **Contract**: the [`CacheManager`] trait (revision lookup, write, read,
//!   remove, remove all), callable from any thread
//! - **File system**: [`FileSystemCacheManager`] with atomic writes, a JSON
//!   manifest of revisions and size-bounded eviction
//! - **In memory**: [`MemoryCacheManager`] with per-identifier failure
//!   injection and call counters for tests
//!
//! # Example
//!
//! ```no_run
//! use pinna_cache::{CacheManager, FileSystemCacheManager, DEFAULT_MAX_CACHE_SIZE};
//!
//! let cache = FileSystemCacheManager::new("/tmp/pinna-cache", DEFAULT_MAX_CACHE_SIZE)?;
//! cache.cache(b"{\"songs\":[]}", "trending", "etag-1")?;
//!
//! assert_eq!(cache.revision_for("trending").as_deref(), Some("etag-1"));
//! # Ok::<(), pinna_cache::CacheError>(())
//! ```

mod error;
mod filesystem;
mod manager;
mod memory;

// Re-export public API
pub use error::{CacheError, Result};
pub use filesystem::{payload_file_name, FileSystemCacheManager, DEFAULT_MAX_CACHE_SIZE};
pub use manager::{is_reserved_identifier, CacheManager, RESERVED_IDENTIFIER_PREFIX};
pub use memory::{CallCounts, MemoryCacheItem, MemoryCacheManager};
