//! Model archive bundles.
//!
//! An archive is a single file:
//!
//! ```text
//! MAGIC (8 bytes) | header (bincode) | zstd(file bytes, in header order)
//! ```
//!
//! The header carries the canonical JSON metadata and an entry table with the
//! size and BLAKE3 digest of every file, so the metadata can be read without
//! touching the payload and unpacking can verify every decompressed byte.
//! Entry sizes come from the file and are never trusted for allocation.

use crate::cache::collect_files;
use crate::errors::{EngineError, Result};
use crate::serialization::canonical_json_string;
use bincode::Options;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info};

/// File extension of packaged archives.
pub const ARCHIVE_EXTENSION: &str = "bundle";

const ARCHIVE_MAGIC: &[u8; 8] = b"PRLYMDL\x01";
const ARCHIVE_FORMAT_VERSION: u32 = 2;
const ARCHIVE_COMPRESSION_LEVEL: i32 = 3;
const MAX_HEADER_BYTES: u64 = 64 * 1024 * 1024;
const MAX_NAME_ATTEMPTS: usize = 32;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "crisp", "dapper", "eager", "fancy", "gentle",
    "glad", "golden", "hasty", "humble", "jolly", "keen", "lively", "lucky", "mellow", "nimble",
    "proud", "quiet", "rapid", "silent", "sunny", "swift", "tidy", "vivid", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "anchor", "badger", "beacon", "canyon", "cedar", "comet", "delta", "ember", "falcon", "fjord",
    "glacier", "harbor", "heron", "island", "lantern", "maple", "meadow", "otter", "pebble",
    "quartz", "raven", "river", "saddle", "sparrow", "summit", "thistle", "tundra", "walrus",
    "willow", "zephyr",
];

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_HEADER_BYTES)
}

/// One file stored in an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Path relative to the archive root, `/`-separated.
    pub path: String,
    pub size_bytes: u64,
    /// BLAKE3 hex digest of the file bytes.
    pub blake3: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveHeader {
    format_version: u32,
    metadata: String,
    entries: Vec<ArchiveEntry>,
}

/// Handle to a packaged archive on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveRef {
    pub path: PathBuf,
}

impl ArchiveRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the archive.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Read the embedded metadata without unpacking the payload.
    pub fn metadata<M: DeserializeOwned>(&self) -> Result<M> {
        read_archive_metadata(&self.path)
    }
}

/// How a new archive is named inside the output directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveNamePolicy {
    /// Prefix such as `core-` or `nlu-` for single-stage archives.
    pub prefix: Option<String>,
    /// Caller-chosen name; overwrites an existing archive of that name.
    pub fixed_name: Option<String>,
}

impl ArchiveNamePolicy {
    /// `<timestamp>_<adjective-noun>.bundle`
    pub fn generated() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            fixed_name: None,
        }
    }

    /// Use `fixed_name` if given, otherwise keep the current policy.
    pub fn fixed_or(mut self, fixed_name: Option<&str>) -> Self {
        if let Some(name) = fixed_name {
            self.fixed_name = Some(name.to_string());
        }
        self
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed_name.is_some()
    }

    /// Produce a candidate file name.
    pub fn candidate<R: Rng>(&self, rng: &mut R) -> String {
        if let Some(fixed) = &self.fixed_name {
            return with_archive_extension(fixed);
        }
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("plain");
        let noun = NOUNS.choose(rng).copied().unwrap_or("model");
        format!(
            "{}{timestamp}_{adjective}-{noun}.{ARCHIVE_EXTENSION}",
            self.prefix.as_deref().unwrap_or("")
        )
    }
}

fn with_archive_extension(name: &str) -> String {
    if name.ends_with(&format!(".{ARCHIVE_EXTENSION}")) {
        name.to_string()
    } else {
        format!("{name}.{ARCHIVE_EXTENSION}")
    }
}

/// Bundle every file below `source_dir` into a new archive in `output_dir`.
///
/// The archive is written to a temporary file in `output_dir` and renamed into
/// place, so concurrent packagers never observe or produce a partial archive.
pub fn write_archive<M: Serialize>(
    source_dir: &Path,
    output_dir: &Path,
    policy: &ArchiveNamePolicy,
    metadata: &M,
) -> Result<ArchiveRef> {
    fs::create_dir_all(output_dir)?;

    let mut files = BTreeMap::new();
    collect_files(source_dir, source_dir, &mut files)?;
    let entries = files
        .iter()
        .map(|(path, bytes)| ArchiveEntry {
            path: path.clone(),
            size_bytes: bytes.len() as u64,
            blake3: blake3::hash(bytes).to_hex().to_string(),
        })
        .collect();
    let header = ArchiveHeader {
        format_version: ARCHIVE_FORMAT_VERSION,
        metadata: canonical_json_string(metadata)?,
        entries,
    };

    let staged = tempfile::Builder::new()
        .prefix(".packaging-")
        .tempfile_in(output_dir)?;
    {
        let mut writer = BufWriter::new(staged.as_file());
        writer.write_all(ARCHIVE_MAGIC)?;
        codec().serialize_into(&mut writer, &header)?;
        let mut payload = zstd::stream::write::Encoder::new(&mut writer, ARCHIVE_COMPRESSION_LEVEL)?;
        payload.include_checksum(true)?;
        for bytes in files.values() {
            payload.write_all(bytes)?;
        }
        payload.finish()?;
        writer.flush()?;
    }
    staged.as_file().sync_all()?;

    let path = persist(staged, output_dir, policy)?;
    info!(
        archive = %path.display(),
        files = files.len(),
        "packaged model archive"
    );
    Ok(ArchiveRef::new(path))
}

fn persist(mut staged: NamedTempFile, output_dir: &Path, policy: &ArchiveNamePolicy) -> Result<PathBuf> {
    let mut rng = rand::thread_rng();
    if policy.is_fixed() {
        let path = output_dir.join(policy.candidate(&mut rng));
        staged.persist(&path).map_err(|err| err.error)?;
        return Ok(path);
    }

    for _ in 0..MAX_NAME_ATTEMPTS {
        let path = output_dir.join(policy.candidate(&mut rng));
        match staged.persist_noclobber(&path) {
            Ok(_) => return Ok(path),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(candidate = %path.display(), "archive name taken, retrying");
                staged = err.file;
            }
            Err(err) => return Err(err.error.into()),
        }
    }
    Err(EngineError::ArchiveNameExhausted(output_dir.display().to_string()))
}

fn read_header(path: &Path, reader: &mut impl Read) -> Result<ArchiveHeader> {
    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .map_err(|_| EngineError::invalid_archive(path, "file too short"))?;
    if &magic != ARCHIVE_MAGIC {
        return Err(EngineError::invalid_archive(path, "not a model archive"));
    }
    let header: ArchiveHeader = codec()
        .deserialize_from(reader)
        .map_err(|err| EngineError::invalid_archive(path, format!("corrupt header: {err}")))?;
    if header.format_version != ARCHIVE_FORMAT_VERSION {
        return Err(EngineError::invalid_archive(
            path,
            format!("unsupported format version {}", header.format_version),
        ));
    }
    Ok(header)
}

/// Read only the embedded metadata of an archive.
pub fn read_archive_metadata<M: DeserializeOwned>(path: &Path) -> Result<M> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = read_header(path, &mut reader)?;
    Ok(serde_json::from_str(&header.metadata)?)
}

fn safe_relative_path(archive: &Path, entry: &str) -> Result<PathBuf> {
    let relative = PathBuf::from(entry);
    let escapes = relative
        .components()
        .any(|part| !matches!(part, Component::Normal(_)));
    if entry.is_empty() || escapes {
        return Err(EngineError::invalid_archive(
            archive,
            format!("entry '{entry}' escapes the archive root"),
        ));
    }
    Ok(relative)
}

/// An archive extracted into a scoped temporary directory.
///
/// The directory is removed when the value is dropped, on every exit path.
#[derive(Debug)]
pub struct UnpackedArchive {
    dir: TempDir,
    source: ArchiveRef,
    metadata: String,
    entries: Vec<ArchiveEntry>,
}

impl UnpackedArchive {
    /// Root of the extracted files.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source(&self) -> &ArchiveRef {
        &self.source
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn metadata<M: DeserializeOwned>(&self) -> Result<M> {
        Ok(serde_json::from_str(&self.metadata)?)
    }

    /// Directory of a persisted resource (`<stage>/<node>`), if present.
    pub fn resource_dir(&self, relative: &str) -> Option<PathBuf> {
        let dir = self.dir.path().join(relative);
        dir.is_dir().then_some(dir)
    }
}

/// Extract an archive, verifying each entry's size and digest.
pub fn unpack_archive(archive: &ArchiveRef) -> Result<UnpackedArchive> {
    let path = archive.path();
    let mut reader = BufReader::new(File::open(path)?);
    let header = read_header(path, &mut reader)?;
    let dir = tempfile::Builder::new().prefix("parley-unpacked-").tempdir()?;
    let corrupt = |err: io::Error| EngineError::invalid_archive(path, format!("corrupt payload: {err}"));
    let mut payload = zstd::stream::read::Decoder::with_buffer(&mut reader).map_err(corrupt)?;

    for entry in &header.entries {
        let relative = safe_relative_path(path, &entry.path)?;
        let mut bytes = Vec::new();
        (&mut payload)
            .take(entry.size_bytes)
            .read_to_end(&mut bytes)
            .map_err(corrupt)?;
        if bytes.len() as u64 != entry.size_bytes {
            return Err(EngineError::invalid_archive(
                path,
                format!("entry '{}' is truncated", entry.path),
            ));
        }
        if blake3::hash(&bytes).to_hex().as_str() != entry.blake3 {
            return Err(EngineError::invalid_archive(
                path,
                format!("entry '{}' fails digest verification", entry.path),
            ));
        }

        let target = dir.path().join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, bytes)?;
    }

    // Draining the frame also checks its trailing checksum.
    let trailing = io::copy(&mut payload, &mut io::sink()).map_err(corrupt)?;
    if trailing != 0 {
        return Err(EngineError::invalid_archive(
            path,
            format!("{trailing} bytes of payload after the last entry"),
        ));
    }

    debug!(archive = %path.display(), entries = header.entries.len(), "unpacked archive");
    Ok(UnpackedArchive {
        dir,
        source: archive.clone(),
        metadata: header.metadata,
        entries: header.entries,
    })
}
