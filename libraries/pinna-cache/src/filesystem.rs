//! Persistent, size-bounded cache manager backed by the file system.
//!
//! Layout inside the cache directory:
//!
//! - `<sha256(identifier)>.cache`: one payload file per identifier. Hashing
//!   keeps arbitrary identifiers within file name limits.
//! - `__manifest.json`: identifier → revision, size and modification time.
//!
//! Payloads and the manifest are written to a temporary file and renamed into
//! place. The rename and the manifest update happen under the manifest's write
//! lock, and readers hold the read lock while reading the payload, so a payload
//! is only ever observed together with its own revision and size.

use crate::error::{CacheError, Result};
use crate::manager::{is_reserved_identifier, CacheManager};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Default maximum cache size (30MB)
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 30 * 1024 * 1024;

const MANIFEST_FILE_NAME: &str = "__manifest.json";
const PAYLOAD_EXTENSION: &str = "cache";
const TEMP_EXTENSION: &str = "tmp";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    revision: String,
    size: u64,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: HashMap<String, ManifestEntry>,
}

impl Manifest {
    fn total_size(&self) -> u64 {
        self.entries.values().map(|entry| entry.size).sum()
    }
}

/// File name used to store the payload for `identifier`.
pub fn payload_file_name(identifier: &str) -> String {
    let digest = Sha256::digest(identifier.as_bytes());
    format!("{}.{}", hex::encode(digest), PAYLOAD_EXTENSION)
}

/// Cache manager persisting one file per identifier plus a manifest.
pub struct FileSystemCacheManager {
    directory: PathBuf,
    manifest: RwLock<Manifest>,
    max_cache_size: AtomicU64,
}

impl FileSystemCacheManager {
    /// Open (or create) a cache in `directory`.
    ///
    /// An unreadable manifest is discarded and the cache starts empty;
    /// manifest entries whose payload file is gone are dropped.
    pub fn new(directory: impl Into<PathBuf>, max_cache_size: u64) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;

        let mut manifest = Self::load_manifest(&directory);
        let before = manifest.entries.len();
        manifest
            .entries
            .retain(|identifier, _| directory.join(payload_file_name(identifier)).exists());
        if manifest.entries.len() != before {
            warn!(
                dropped = before - manifest.entries.len(),
                "Dropped manifest entries without payload files"
            );
        }

        info!(
            directory = %directory.display(),
            entries = manifest.entries.len(),
            size = manifest.total_size(),
            "Opened file system cache"
        );

        Ok(Self {
            directory,
            manifest: RwLock::new(manifest),
            max_cache_size: AtomicU64::new(max_cache_size),
        })
    }

    fn load_manifest(directory: &Path) -> Manifest {
        let path = directory.join(MANIFEST_FILE_NAME);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Discarding unreadable cache manifest");
                Manifest::default()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Manifest::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read cache manifest");
                Manifest::default()
            }
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Estimated size of all cached payloads in bytes.
    pub fn cache_size(&self) -> u64 {
        self.read_manifest().total_size()
    }

    pub fn max_cache_size(&self) -> u64 {
        self.max_cache_size.load(Ordering::Relaxed)
    }

    /// Change the size limit. Takes effect on the next maintenance pass.
    pub fn set_max_cache_size(&self, max_cache_size: u64) {
        self.max_cache_size.store(max_cache_size, Ordering::Relaxed);
    }

    /// Evict least recently written entries until the cache fits its limit.
    ///
    /// Returns how many entries were evicted. If a payload file cannot be
    /// removed, the entries evicted so far are persisted before the error is
    /// returned and the failing entry stays in the manifest.
    pub fn perform_maintenance(&self) -> Result<usize> {
        let mut manifest = self.write_manifest();
        self.evict_over_limit(&mut manifest)
    }

    // Callers hold the manifest write lock.
    fn evict_over_limit(&self, manifest: &mut Manifest) -> Result<usize> {
        let limit = self.max_cache_size();
        if manifest.total_size() <= limit {
            return Ok(0);
        }

        let mut by_age: Vec<(String, DateTime<Utc>)> = manifest
            .entries
            .iter()
            .map(|(identifier, entry)| (identifier.clone(), entry.modified))
            .collect();
        by_age.sort_by_key(|(_, modified)| *modified);

        let mut evicted = 0;
        for (identifier, _) in by_age {
            if manifest.total_size() <= limit {
                break;
            }
            if let Err(e) = self.remove_file(&self.payload_path(&identifier)) {
                warn!(identifier = %identifier, error = %e, "Cannot evict cache entry");
                self.persist_manifest(manifest)?;
                return Err(e);
            }
            manifest.entries.remove(&identifier);
            evicted += 1;
        }

        self.persist_manifest(manifest)?;
        debug!(evicted, size = manifest.total_size(), limit, "Cache maintenance complete");
        Ok(evicted)
    }

    fn payload_path(&self, identifier: &str) -> PathBuf {
        self.directory.join(payload_file_name(identifier))
    }

    fn read_manifest(&self) -> RwLockReadGuard<'_, Manifest> {
        self.manifest.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_manifest(&self) -> RwLockWriteGuard<'_, Manifest> {
        self.manifest.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `data` to a uniquely named file next to `destination`.
    fn write_temp(&self, destination: &Path, data: &[u8]) -> Result<PathBuf> {
        let temp_path = destination.with_extension(format!("{}.{}", uuid::Uuid::new_v4(), TEMP_EXTENSION));
        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()
        })();

        match result {
            Ok(()) => Ok(temp_path),
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                Err(e.into())
            }
        }
    }

    fn commit(&self, temp_path: &Path, destination: &Path) -> Result<()> {
        fs::rename(temp_path, destination).map_err(|e| {
            let _ = fs::remove_file(temp_path);
            e.into()
        })
    }

    fn persist_manifest(&self, manifest: &Manifest) -> Result<()> {
        let path = self.directory.join(MANIFEST_FILE_NAME);
        let temp_path = self.write_temp(&path, &serde_json::to_vec(manifest)?)?;
        self.commit(&temp_path, &path)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl CacheManager for FileSystemCacheManager {
    fn revision_for(&self, identifier: &str) -> Option<String> {
        self.read_manifest()
            .entries
            .get(identifier)
            .map(|entry| entry.revision.clone())
    }

    fn cache(&self, data: &[u8], identifier: &str, revision: &str) -> Result<()> {
        if is_reserved_identifier(identifier) {
            return Err(CacheError::ReservedIdentifier(identifier.to_string()));
        }

        let size = data.len() as u64;
        let limit = self.max_cache_size();
        if size > limit {
            warn!(identifier = %identifier, size, limit, "Payload exceeds the cache size limit");
            return Err(CacheError::TooLarge {
                identifier: identifier.to_string(),
                size,
                limit,
            });
        }

        // Only the rename needs the lock; the payload bytes are written first.
        let path = self.payload_path(identifier);
        let temp_path = self.write_temp(&path, data)?;

        let mut manifest = self.write_manifest();
        self.commit(&temp_path, &path)?;
        manifest.entries.insert(
            identifier.to_string(),
            ManifestEntry {
                revision: revision.to_string(),
                size,
                modified: Utc::now(),
            },
        );

        if manifest.total_size() > limit {
            self.evict_over_limit(&mut manifest)?;
        } else {
            self.persist_manifest(&manifest)?;
        }

        debug!(identifier = %identifier, revision = %revision, bytes = size, "Cached payload");
        Ok(())
    }

    fn cached_data(&self, identifier: &str) -> Result<Option<Bytes>> {
        let manifest = self.read_manifest();
        let expected_size = match manifest.entries.get(identifier) {
            Some(entry) => entry.size,
            None => return Ok(None),
        };

        let data = match fs::read(self.payload_path(identifier)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CacheError::corrupt(identifier, "payload file is missing"));
            }
            Err(e) => return Err(e.into()),
        };

        if data.len() as u64 != expected_size {
            return Err(CacheError::corrupt(
                identifier,
                format!("expected {} bytes, found {}", expected_size, data.len()),
            ));
        }

        Ok(Some(Bytes::from(data)))
    }

    fn remove_cache(&self, identifier: &str) -> Result<()> {
        let mut manifest = self.write_manifest();
        self.remove_file(&self.payload_path(identifier))?;
        manifest.entries.remove(identifier);
        self.persist_manifest(&manifest)?;
        debug!(identifier = %identifier, "Removed cache entry");
        Ok(())
    }

    fn remove_all_cache(&self) -> Result<()> {
        let mut manifest = self.write_manifest();
        manifest.entries.clear();

        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            let is_ours = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == PAYLOAD_EXTENSION || ext == TEMP_EXTENSION);
            if is_ours {
                self.remove_file(&path)?;
            }
        }

        self.persist_manifest(&manifest)?;
        info!(directory = %self.directory.display(), "Removed all cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> FileSystemCacheManager {
        FileSystemCacheManager::new(dir.path(), DEFAULT_MAX_CACHE_SIZE).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);

        cache.cache(b"payload", "x", "r1").unwrap();

        assert_eq!(cache.cached_data("x").unwrap().as_deref(), Some(&b"payload"[..]));
        assert_eq!(cache.revision_for("x").as_deref(), Some("r1"));
    }

    #[test]
    fn test_missing_entry_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        assert_eq!(cache.cached_data("nothing").unwrap(), None);
        assert_eq!(cache.revision_for("nothing"), None);
    }

    #[test]
    fn test_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);

        cache.cache(b"first", "id", "r1").unwrap();
        cache.cache(b"second", "id", "r2").unwrap();

        assert_eq!(cache.revision_for("id").as_deref(), Some("r2"));
        assert_eq!(cache.cached_data("id").unwrap().as_deref(), Some(&b"second"[..]));
        assert_eq!(cache.cache_size(), 6);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        manager(&dir).cache(b"persisted", "songs", "etag-1").unwrap();

        let reopened = manager(&dir);
        assert_eq!(reopened.revision_for("songs").as_deref(), Some("etag-1"));
        assert_eq!(
            reopened.cached_data("songs").unwrap().as_deref(),
            Some(&b"persisted"[..])
        );
    }

    #[test]
    fn test_missing_payload_is_corruption() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        cache.cache(b"payload", "x", "r1").unwrap();

        fs::remove_file(dir.path().join(payload_file_name("x"))).unwrap();

        assert!(matches!(
            cache.cached_data("x"),
            Err(CacheError::Corrupt { .. })
        ));
        cache.remove_cache("x").unwrap();
        assert_eq!(cache.cached_data("x").unwrap(), None);
    }

    #[test]
    fn test_truncated_payload_is_corruption() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        cache.cache(b"payload", "x", "r1").unwrap();

        fs::write(dir.path().join(payload_file_name("x")), b"pay").unwrap();

        assert!(matches!(
            cache.cached_data("x"),
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_unreadable_manifest_starts_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE_NAME), b"{not json").unwrap();

        let cache = manager(&dir);
        assert_eq!(cache.cache_size(), 0);
        cache.cache(b"ok", "x", "r1").unwrap();
        assert_eq!(cache.revision_for("x").as_deref(), Some("r1"));
    }

    #[test]
    fn test_reserved_identifiers_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        assert!(matches!(
            cache.cache(b"x", "__manifest", "r1"),
            Err(CacheError::ReservedIdentifier(_))
        ));
    }

    #[test]
    fn test_remove_all_cache() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        cache.cache(b"a", "a", "r1").unwrap();
        cache.cache(b"b", "b", "r1").unwrap();

        cache.remove_all_cache().unwrap();

        assert_eq!(cache.cache_size(), 0);
        assert_eq!(cache.cached_data("a").unwrap(), None);
        assert!(!dir.path().join(payload_file_name("b")).exists());
    }

    #[test]
    fn test_maintenance_evicts_oldest_first() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCacheManager::new(dir.path(), 10).unwrap();

        cache.cache(b"12345", "old", "r1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.cache(b"12345", "new", "r1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        // Pushes the cache over 10 bytes; "old" goes first
        cache.cache(b"12", "newest", "r1").unwrap();

        assert_eq!(cache.revision_for("old"), None);
        assert!(cache.revision_for("new").is_some());
        assert!(cache.revision_for("newest").is_some());
        assert!(cache.cache_size() <= 10);
    }

    #[test]
    fn test_lowering_limit_applies_on_maintenance() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        cache.cache(&[0u8; 100], "big", "r1").unwrap();

        cache.set_max_cache_size(50);
        assert_eq!(cache.revision_for("big").as_deref(), Some("r1"));

        assert_eq!(cache.perform_maintenance().unwrap(), 1);
        assert_eq!(cache.revision_for("big"), None);
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCacheManager::new(dir.path(), 10).unwrap();
        cache.cache(b"small", "x", "r1").unwrap();

        assert!(matches!(
            cache.cache(&[1u8; 11], "x", "r2"),
            Err(CacheError::TooLarge { size: 11, limit: 10, .. })
        ));
        // The earlier entry is untouched
        assert_eq!(cache.revision_for("x").as_deref(), Some("r1"));
        assert_eq!(cache.cached_data("x").unwrap().as_deref(), Some(&b"small"[..]));
    }

    #[test]
    fn test_failed_eviction_keeps_manifest_consistent() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir);
        cache.cache(b"12345", "old", "r1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.cache(b"12345", "stuck", "r1").unwrap();

        // A non-empty directory in place of the payload cannot be removed as a file
        let stuck = dir.path().join(payload_file_name("stuck"));
        fs::remove_file(&stuck).unwrap();
        fs::create_dir(&stuck).unwrap();
        fs::write(stuck.join("pinned"), b"x").unwrap();

        cache.set_max_cache_size(0);
        assert!(cache.perform_maintenance().is_err());

        assert_eq!(cache.revision_for("old"), None);
        assert_eq!(cache.revision_for("stuck").as_deref(), Some("r1"));

        let reopened = manager(&dir);
        assert_eq!(reopened.revision_for("old"), None);
        assert_eq!(reopened.revision_for("stuck").as_deref(), Some("r1"));
    }

    #[test]
    fn test_concurrent_writes_keep_payload_and_revision_together() {
        let dir = TempDir::new().unwrap();
        let cache = std::sync::Arc::new(manager(&dir));

        for round in 0..50 {
            let writers: Vec<_> = (0..4u8)
                .map(|i| {
                    let cache = std::sync::Arc::clone(&cache);
                    std::thread::spawn(move || {
                        let payload = vec![i; 64 + usize::from(i) * 97];
                        for _ in 0..5 {
                            cache.cache(&payload, "shared", &format!("r{}", i)).unwrap();
                        }
                    })
                })
                .collect();

            let reader = {
                let cache = std::sync::Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        cache.cached_data("shared").unwrap();
                    }
                })
            };

            for writer in writers {
                writer.join().unwrap();
            }
            reader.join().unwrap();

            let data = cache.cached_data("shared").unwrap().unwrap();
            let revision = cache.revision_for("shared").unwrap();
            assert_eq!(revision, format!("r{}", data[0]), "round {}", round);
            assert_eq!(data.len(), 64 + usize::from(data[0]) * 97);
        }
    }

    proptest! {
        #[test]
        fn test_payload_file_names_are_portable(identifier in ".{0,600}") {
            let name = payload_file_name(&identifier);
            prop_assert!(name.len() <= 255);
            prop_assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '.'));
            prop_assert!(!name.starts_with("__"));
        }
    }
}
