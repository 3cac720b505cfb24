//! Error types for the graph engine

use thiserror::Error;

/// Errors that can occur while building, running or packaging a training graph
#[derive(Error, Debug)]
pub enum EngineError {
    /// Schema is malformed (duplicate node, dangling edge, forward reference)
    #[error("Invalid graph schema at node '{node}': {reason}")]
    InvalidSchema { node: String, reason: String },

    /// Schema contains a dependency cycle
    #[error("Graph schema contains a cycle through node '{node}'")]
    Cycle { node: String },

    /// Requested target is not part of the schema
    #[error("Unknown target node: {0}")]
    UnknownTarget(String),

    /// A node failed during execution; the run was aborted
    #[error("Node '{node}' failed: {source:#}")]
    NodeFailed {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    /// The run was cancelled before all nodes were dispatched
    #[error("Graph run cancelled before node '{0}' was dispatched")]
    Cancelled(String),

    /// Worker pool could not be created
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Model archive is malformed or fails verification
    #[error("Invalid model archive {path}: {reason}")]
    InvalidArchive { path: String, reason: String },

    /// Archive naming could not produce a free file name
    #[error("Could not allocate an archive name in {0}")]
    ArchiveNameExhausted(String),

    /// Cache backend error
    #[error("Cache error: {0}")]
    Cache(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl EngineError {
    /// Helper for schema errors tied to a node name.
    pub fn invalid_schema(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchema {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Helper for archive verification errors.
    pub fn invalid_archive(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::InvalidArchive {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Name of the node the error points at, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::InvalidSchema { node, .. } | Self::Cycle { node } | Self::NodeFailed { node, .. } => {
                Some(node)
            }
            Self::UnknownTarget(node) | Self::Cancelled(node) => Some(node),
            _ => None,
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
