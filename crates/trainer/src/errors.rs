use parley_engine::EngineError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the trainer.
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown recipe '{0}'")]
    UnknownRecipe(String),

    #[error("unknown component '{component}' requested for node '{node}'")]
    UnknownComponent { node: String, component: String },

    #[error("invalid parameter '{param}' for node '{node}': {reason}")]
    InvalidParameter {
        node: String,
        param: String,
        reason: String,
    },

    #[error("invalid pipeline at node '{node}': {reason}")]
    InvalidPipeline { node: String, reason: String },

    #[error("training data error: {0}")]
    Data(String),

    #[error("no model for finetuning found at '{}'", .0.display())]
    FinetuneModelNotFound(PathBuf),

    #[error("model '{archive}' can not be finetuned: {reason}")]
    FinetuneIncompatible { archive: String, reason: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl TrainerError {
    /// Name of the graph node the error points at, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::UnknownComponent { node, .. }
            | Self::InvalidParameter { node, .. }
            | Self::InvalidPipeline { node, .. } => Some(node),
            Self::Engine(err) => err.node(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TrainerError>;
