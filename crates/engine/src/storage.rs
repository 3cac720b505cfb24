//! Ephemeral model storage for a single training run.
//!
//! Nodes persist their resources into `<root>/<stage>/<node>`. The root is a
//! temporary directory owned exclusively by the run and removed when the
//! storage is dropped, whether the run succeeded or failed.

use crate::archive::{write_archive, ArchiveNamePolicy, ArchiveRef, UnpackedArchive};
use crate::cache::ResourceSnapshot;
use crate::errors::Result;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Working directory of one training run.
#[derive(Debug)]
pub struct ModelStorage {
    dir: TempDir,
}

impl ModelStorage {
    /// Create storage in the system temp directory.
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("parley-train-").tempdir()?;
        debug!(path = %dir.path().display(), "created model storage");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path of a resource directory (may not exist yet).
    pub fn resource_dir(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Create (if needed) and return a resource directory for writing.
    pub fn write_to(&self, relative: &str) -> Result<PathBuf> {
        let dir = self.resource_dir(relative);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Snapshot a resource for caching.
    pub fn snapshot(&self, relative: &str) -> Result<ResourceSnapshot> {
        Ok(ResourceSnapshot::capture(&self.resource_dir(relative))?)
    }

    /// Restore a cached resource into this storage.
    pub fn restore(&self, relative: &str, snapshot: &ResourceSnapshot) -> Result<()> {
        Ok(snapshot.restore(&self.resource_dir(relative))?)
    }

    /// Copy every resource of an unpacked archive into this storage.
    pub fn import_archive(&self, unpacked: &UnpackedArchive) -> Result<()> {
        ResourceSnapshot::capture(unpacked.path())?.restore(self.dir.path())?;
        Ok(())
    }

    /// Package the storage content into an archive in `output_dir`.
    pub fn package<M: Serialize>(
        &self,
        output_dir: &Path,
        policy: &ArchiveNamePolicy,
        metadata: &M,
    ) -> Result<ArchiveRef> {
        write_archive(self.dir.path(), output_dir, policy, metadata)
    }
}
