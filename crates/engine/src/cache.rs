//! Content-addressable training cache.
//!
//! Entries are keyed by node fingerprint. Because a fingerprint changes
//! whenever anything upstream changes, an entry is never stale for its key,
//! and re-storing an existing key is a no-op as long as the stored entry
//! still reads back intact. Damaged entries are replaced on the next put.

use crate::errors::{EngineError, Result};
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const META_FILE: &str = "meta.json";
const OUTPUT_FILE: &str = "output.json";
const RESOURCE_DIR: &str = "resource";

/// In-memory copy of the files a node persisted into model storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    files: BTreeMap<String, Vec<u8>>,
}

impl ResourceSnapshot {
    /// Read every file below `dir` (recursively). A missing directory is empty.
    pub fn capture(dir: &Path) -> io::Result<Self> {
        let mut files = BTreeMap::new();
        if dir.is_dir() {
            collect_files(dir, dir, &mut files)?;
        }
        Ok(Self { files })
    }

    /// Write the snapshot below `dir`, creating directories as needed.
    pub fn restore(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        for (relative, bytes) in &self.files {
            let path = dir.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, bytes)?;
        }
        Ok(())
    }

    pub fn files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.files
    }

    pub fn insert(&mut self, relative: impl Into<String>, bytes: Vec<u8>) {
        self.files.insert(relative.into(), bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

}

pub(crate) fn collect_files(
    root: &Path,
    dir: &Path,
    files: &mut BTreeMap<String, Vec<u8>>,
) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, files)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            files.insert(relative, fs::read(&path)?);
        }
    }
    Ok(())
}

/// Metadata stored next to every cached output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub fingerprint: Fingerprint,
    /// Node that produced the output.
    pub node_name: String,
    /// Component kind of the producing node.
    pub node_kind: String,
    pub created_at: DateTime<Utc>,
}

/// A cached node output plus its persisted resource, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub meta: CacheEntryMeta,
    /// Canonical JSON encoding of the node output.
    pub output: Vec<u8>,
    pub resource: Option<ResourceSnapshot>,
}

impl CacheEntry {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.meta.fingerprint
    }
}

/// Trait for training cache backends.
///
/// Implementations must tolerate concurrent readers and writers. A put for a
/// fingerprint that is already present must succeed without changing an
/// intact entry; backends that can hold damaged entries repair them instead.
pub trait TrainingCache: Send + Sync {
    /// Look up an entry. A miss is `Ok(None)`.
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>>;

    /// Store an entry under its fingerprint.
    fn put(&self, entry: CacheEntry) -> Result<()>;

    /// Check whether an entry exists.
    fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.get(fingerprint)?.is_some())
    }

    /// Count stored entries.
    fn len(&self) -> Result<usize>;
}

/// Cache stored as one directory per fingerprint.
#[derive(Debug, Clone)]
pub struct LocalTrainingCache {
    root: PathBuf,
}

impl LocalTrainingCache {
    /// Open (or create) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(fingerprint.to_hex())
    }

    /// Whether the stored entry reads back with the same output and resource.
    fn holds_intact(&self, entry: &CacheEntry) -> bool {
        match self.get(entry.fingerprint()) {
            Ok(Some(stored)) => stored.output == entry.output && stored.resource == entry.resource,
            Ok(None) => false,
            Err(err) => {
                debug!(fingerprint = %entry.fingerprint().short(), error = %err, "cache entry unreadable");
                false
            }
        }
    }

    /// Move a damaged entry out of the way and delete it.
    fn discard(&self, dir: &Path) -> Result<()> {
        let trash = tempfile::Builder::new()
            .prefix(".discarded-")
            .tempdir_in(&self.root)?;
        match fs::rename(dir, trash.path().join("entry")) {
            Ok(()) => Ok(()),
            // Another run already replaced or removed it.
            Err(_) if !dir.is_dir() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl TrainingCache for LocalTrainingCache {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let dir = self.entry_dir(fingerprint);
        if !dir.is_dir() {
            return Ok(None);
        }

        let meta: CacheEntryMeta = serde_json::from_slice(&fs::read(dir.join(META_FILE))?)?;
        if meta.fingerprint != *fingerprint {
            return Err(EngineError::Cache(format!(
                "entry {} is labelled with fingerprint {}",
                dir.display(),
                meta.fingerprint
            )));
        }
        let output = fs::read(dir.join(OUTPUT_FILE))?;
        let resource_dir = dir.join(RESOURCE_DIR);
        let resource = if resource_dir.is_dir() {
            Some(ResourceSnapshot::capture(&resource_dir)?)
        } else {
            None
        };

        Ok(Some(CacheEntry {
            meta,
            output,
            resource,
        }))
    }

    fn put(&self, entry: CacheEntry) -> Result<()> {
        let target = self.entry_dir(entry.fingerprint());
        if target.is_dir() {
            if self.holds_intact(&entry) {
                debug!(fingerprint = %entry.fingerprint().short(), "cache entry already present");
                return Ok(());
            }
            warn!(fingerprint = %entry.fingerprint().short(), "replacing damaged cache entry");
            self.discard(&target)?;
        }

        // Stage the entry next to its final location and publish it with a
        // single rename so readers never observe a partial entry.
        let staging = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempdir_in(&self.root)?;
        fs::write(staging.path().join(META_FILE), serde_json::to_vec(&entry.meta)?)?;
        fs::write(staging.path().join(OUTPUT_FILE), &entry.output)?;
        if let Some(resource) = &entry.resource {
            resource.restore(&staging.path().join(RESOURCE_DIR))?;
        }

        match fs::rename(staging.path(), &target) {
            Ok(()) => Ok(()),
            // Another run published the same fingerprint first.
            Err(_) if target.is_dir() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn len(&self) -> Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if entry.file_type()?.is_dir() && !name.to_string_lossy().starts_with('.') {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// In-memory cache (for tests and single-process use).
#[derive(Clone, Default)]
pub struct MemoryTrainingCache {
    entries: Arc<RwLock<HashMap<Fingerprint, CacheEntry>>>,
}

impl MemoryTrainingCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrainingCache for MemoryTrainingCache {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        Ok(self.entries.read().get(fingerprint).cloned())
    }

    fn put(&self, entry: CacheEntry) -> Result<()> {
        self.entries
            .write()
            .entry(*entry.fingerprint())
            .or_insert(entry);
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.read().len())
    }
}

/// Cache that never stores anything; used when caching is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCache;

impl TrainingCache for DisabledCache {
    fn get(&self, _fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        Ok(None)
    }

    fn put(&self, _entry: CacheEntry) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Wrapper that never serves entries but still stores new ones.
///
/// Used for forced runs: every node recomputes, and the results stay
/// available to later runs.
#[derive(Clone)]
pub struct WriteOnlyCache {
    inner: Arc<dyn TrainingCache>,
}

impl WriteOnlyCache {
    pub fn new(inner: Arc<dyn TrainingCache>) -> Self {
        Self { inner }
    }
}

impl TrainingCache for WriteOnlyCache {
    fn get(&self, _fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        Ok(None)
    }

    fn put(&self, entry: CacheEntry) -> Result<()> {
        self.inner.put(entry)
    }

    fn len(&self) -> Result<usize> {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(seed: &[u8], resource: Option<ResourceSnapshot>) -> CacheEntry {
        CacheEntry {
            meta: CacheEntryMeta {
                fingerprint: Fingerprint::of_bytes(seed),
                node_name: "train_Classifier0".into(),
                node_kind: "Classifier".into(),
                created_at: Utc::now(),
            },
            output: br#"{"type":"resource"}"#.to_vec(),
            resource,
        }
    }

    #[test]
    fn local_cache_round_trip_with_resource() {
        let dir = TempDir::new().unwrap();
        let cache = LocalTrainingCache::open(dir.path().join("cache")).unwrap();

        let mut resource = ResourceSnapshot::default();
        resource.insert("weights.json", b"[1,2,3]".to_vec());
        resource.insert("nested/vocab.json", b"{}".to_vec());
        let stored = entry(b"a", Some(resource));

        assert!(cache.get(stored.fingerprint()).unwrap().is_none());
        cache.put(stored.clone()).unwrap();

        let loaded = cache.get(stored.fingerprint()).unwrap().unwrap();
        assert_eq!(loaded, stored);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn local_cache_put_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = LocalTrainingCache::open(dir.path()).unwrap();
        let stored = entry(b"a", None);

        for _ in 0..3 {
            cache.put(stored.clone()).unwrap();
        }
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.get(stored.fingerprint()).unwrap().unwrap().output, stored.output);
    }

    #[test]
    fn local_cache_put_repairs_damaged_entries() {
        let dir = TempDir::new().unwrap();
        let cache = LocalTrainingCache::open(dir.path()).unwrap();
        let mut resource = ResourceSnapshot::default();
        resource.insert("weights.json", b"[1,2,3]".to_vec());
        let stored = entry(b"a", Some(resource));
        let entry_dir = dir.path().join(stored.fingerprint().to_hex());

        cache.put(stored.clone()).unwrap();
        fs::remove_file(entry_dir.join(OUTPUT_FILE)).unwrap();
        assert!(cache.get(stored.fingerprint()).is_err());
        cache.put(stored.clone()).unwrap();
        assert_eq!(cache.get(stored.fingerprint()).unwrap().unwrap(), stored);

        fs::write(entry_dir.join(META_FILE), b"not json").unwrap();
        cache.put(stored.clone()).unwrap();
        assert_eq!(cache.get(stored.fingerprint()).unwrap().unwrap(), stored);

        fs::write(entry_dir.join(RESOURCE_DIR).join("weights.json"), b"[1,2").unwrap();
        cache.put(stored.clone()).unwrap();
        assert_eq!(cache.get(stored.fingerprint()).unwrap().unwrap(), stored);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn memory_cache_keeps_first_entry() {
        let cache = MemoryTrainingCache::new();
        let first = entry(b"k", None);
        let mut second = first.clone();
        second.output = b"{}".to_vec();

        cache.put(first.clone()).unwrap();
        cache.put(second).unwrap();
        assert_eq!(cache.get(first.fingerprint()).unwrap().unwrap().output, first.output);
    }

    #[test]
    fn disabled_cache_always_misses() {
        let cache = DisabledCache;
        let stored = entry(b"x", None);
        cache.put(stored.clone()).unwrap();
        assert!(!cache.contains(stored.fingerprint()).unwrap());
    }

    #[test]
    fn write_only_cache_stores_but_misses() {
        let inner = Arc::new(MemoryTrainingCache::new());
        let cache = WriteOnlyCache::new(inner.clone());
        let stored = entry(b"forced", None);
        let fingerprint = *stored.fingerprint();
        cache.put(stored).unwrap();
        assert!(cache.get(&fingerprint).unwrap().is_none());
        assert!(inner.get(&fingerprint).unwrap().is_some());
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn snapshot_capture_and_restore() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("sub")).unwrap();
        fs::write(src.path().join("a.txt"), b"a").unwrap();
        fs::write(src.path().join("sub/b.txt"), b"b").unwrap();

        let snapshot = ResourceSnapshot::capture(src.path()).unwrap();
        assert_eq!(snapshot.files().len(), 2);

        let dst = TempDir::new().unwrap();
        snapshot.restore(dst.path()).unwrap();
        assert_eq!(fs::read(dst.path().join("sub/b.txt")).unwrap(), b"b");
        assert_eq!(ResourceSnapshot::capture(dst.path()).unwrap(), snapshot);
    }
}
