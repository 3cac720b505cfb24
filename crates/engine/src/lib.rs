//! Incremental training engine
//!
//! Provides the content-addressed machinery behind incremental model
//! training: graph schemas, fingerprints, a training cache, a cached graph
//! runner, and self-describing model archives.
//!
//! Modules:
//! - `schema`: Validated DAG of component nodes
//! - `fingerprint`: BLAKE3 fingerprints over canonical JSON
//! - `serialization`: Canonical JSON helpers
//! - `cache`: Training cache backends (local directory, memory, disabled)
//! - `runner`: Wave-based graph execution on a bounded worker pool
//! - `storage`: Per-run model storage
//! - `archive`: Model archive packaging and verification
//! - `index`: Lookup of previously packaged archives

pub mod archive;
pub mod cache;
pub mod errors;
pub mod fingerprint;
pub mod index;
pub mod runner;
pub mod schema;
pub mod serialization;
pub mod storage;

pub use archive::{
    read_archive_metadata, unpack_archive, write_archive, ArchiveEntry, ArchiveNamePolicy,
    ArchiveRef, UnpackedArchive, ARCHIVE_EXTENSION,
};
pub use cache::{
    CacheEntry, CacheEntryMeta, DisabledCache, LocalTrainingCache, MemoryTrainingCache,
    ResourceSnapshot, TrainingCache, WriteOnlyCache,
};
pub use errors::{EngineError, Result};
pub use fingerprint::Fingerprint;
pub use index::{ArchiveIndex, DirectoryArchiveIndex, MemoryArchiveIndex};
pub use runner::{
    CancellationToken, ExecutionContext, GraphRunner, NodeExecutor, NodeInputs, RunReport,
    RunRequest,
};
pub use schema::{ComponentKind, GraphSchema, SchemaNode};
pub use storage::ModelStorage;

/// Crate version string recorded in archive metadata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
