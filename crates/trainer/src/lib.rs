//! Parley Trainer - incremental training of dialogue and NLU models
//!
//! Decides from content fingerprints which parts of a project changed since
//! the last packaged model, and retrains only those, reusing cached node
//! outputs from earlier runs.
//!
//! Modules:
//! - `data`: Domain, stories, NLU examples and model config
//! - `importer`: Sources of training data
//! - `fingerprint`: Per-section project fingerprints
//! - `comparison`: Retrain decision and dry-run result codes
//! - `recipe`: Model config to training/prediction schemas
//! - `components`: Tokenizer, featurizer, classifier and policies
//! - `executor`: Graph node execution
//! - `finetune`: Continuing training from an existing model
//! - `model_training`: Training entry points
//! - `config`: Trainer settings

pub mod comparison;
pub mod components;
pub mod config;
pub mod data;
pub mod deterministic;
pub mod errors;
pub mod executor;
pub mod finetune;
pub mod fingerprint;
pub mod importer;
pub mod metadata;
pub mod model_training;
pub mod recipe;

pub use comparison::{
    dry_run_result, should_retrain, DryRunResult, FingerprintComparisonResult,
    CODE_CORE_NEEDS_TO_BE_RETRAINED, CODE_FORCED_TRAINING, CODE_NLG_NEEDS_TO_BE_RETRAINED,
    CODE_NLU_NEEDS_TO_BE_RETRAINED,
};
pub use components::{Component, NodeOutput};
pub use config::TrainerConfig;
pub use data::{
    ComponentConfig, Domain, Message, ModelConfig, ResponseVariation, Story, StoryGraph, StoryStep,
    TrainingData,
};
pub use errors::{Result, TrainerError};
pub use executor::{ProjectData, TrainingExecutor};
pub use finetune::{can_finetune, resolve_finetune, FinetuneCandidate, FinetuneRequest};
pub use fingerprint::{ProjectFingerprint, Section};
pub use importer::{DataScope, FileImporter, InMemoryImporter, TrainingDataImporter};
pub use metadata::{ModelMetadata, Stage, TrainingStages};
pub use model_training::{ModelTrainer, TrainingRequest, TrainingResult};
pub use recipe::{Recipe, RecipeOptions, RecipeSchemas};

/// Library version, recorded in fingerprints and archive metadata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
