//! Archive index: which archives exist in an output location.
//!
//! The trainer never scans directories itself; it asks an injected index for
//! the latest archive and reports newly packaged ones back to it.

use crate::archive::{ArchiveRef, ARCHIVE_EXTENSION};
use crate::errors::Result;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Trait for archive index backends.
pub trait ArchiveIndex: Send + Sync {
    /// Directory new archives are packaged into.
    fn output_dir(&self) -> &Path;

    /// Most recently packaged archive, if any.
    fn latest(&self) -> Result<Option<ArchiveRef>>;

    /// Record a freshly packaged archive.
    fn packaged(&self, archive: ArchiveRef) -> Result<ArchiveRef>;
}

/// Index backed by the files of an output directory.
#[derive(Debug, Clone)]
pub struct DirectoryArchiveIndex {
    dir: PathBuf,
}

impl DirectoryArchiveIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// All archives in the directory, oldest first.
    pub fn list(&self) -> Result<Vec<ArchiveRef>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut found: Vec<(SystemTime, String, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_archive = path.extension().map_or(false, |ext| ext == ARCHIVE_EXTENSION);
            if !entry.file_type()?.is_file() || !is_archive || name.starts_with('.') {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            found.push((modified, name, path));
        }
        found.sort();
        Ok(found.into_iter().map(|(_, _, path)| ArchiveRef::new(path)).collect())
    }
}

impl ArchiveIndex for DirectoryArchiveIndex {
    fn output_dir(&self) -> &Path {
        &self.dir
    }

    fn latest(&self) -> Result<Option<ArchiveRef>> {
        let latest = self.list()?.pop();
        debug!(dir = %self.dir.display(), latest = ?latest.as_ref().map(|a| a.name()), "resolved latest archive");
        Ok(latest)
    }

    fn packaged(&self, archive: ArchiveRef) -> Result<ArchiveRef> {
        Ok(archive)
    }
}

/// In-memory index (for tests).
#[derive(Debug, Clone)]
pub struct MemoryArchiveIndex {
    dir: PathBuf,
    archives: Arc<RwLock<Vec<ArchiveRef>>>,
}

impl MemoryArchiveIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            archives: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Pretend an archive was packaged earlier.
    pub fn seed(&self, archive: ArchiveRef) {
        self.archives.write().push(archive);
    }

    pub fn all(&self) -> Vec<ArchiveRef> {
        self.archives.read().clone()
    }
}

impl ArchiveIndex for MemoryArchiveIndex {
    fn output_dir(&self) -> &Path {
        &self.dir
    }

    fn latest(&self) -> Result<Option<ArchiveRef>> {
        Ok(self.archives.read().last().cloned())
    }

    fn packaged(&self, archive: ArchiveRef) -> Result<ArchiveRef> {
        self.archives.write().push(archive.clone());
        Ok(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn directory_index_picks_newest_archive() {
        let dir = TempDir::new().unwrap();
        let index = DirectoryArchiveIndex::new(dir.path());
        assert!(index.latest().unwrap().is_none());

        fs::write(dir.path().join("20240101-000000_old-otter.bundle"), b"x").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::write(dir.path().join("core-20240102-000000_new-heron.bundle"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::write(dir.path().join(".packaging-abc"), b"x").unwrap();

        let latest = index.latest().unwrap().unwrap();
        assert_eq!(latest.name(), "core-20240102-000000_new-heron.bundle");
        assert_eq!(index.list().unwrap().len(), 2);
    }

    #[test]
    fn missing_directory_has_no_archives() {
        let index = DirectoryArchiveIndex::new("/definitely/not/here");
        assert!(index.latest().unwrap().is_none());
    }

    #[test]
    fn memory_index_tracks_packaged_archives() {
        let index = MemoryArchiveIndex::new("models");
        index.seed(ArchiveRef::new("models/a.bundle"));
        index.packaged(ArchiveRef::new("models/b.bundle")).unwrap();
        assert_eq!(index.latest().unwrap().unwrap().name(), "b.bundle");
        assert_eq!(index.all().len(), 2);
    }
}
