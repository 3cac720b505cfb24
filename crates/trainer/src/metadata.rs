//! Metadata embedded in every model archive.

use crate::components::Component;
use crate::errors::Result;
use crate::fingerprint::ProjectFingerprint;
use chrono::{DateTime, Utc};
use parley_engine::{ArchiveRef, Fingerprint, GraphSchema, SchemaNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Major training phase; also the archive subdirectory holding its artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Core,
    Nlu,
    Nlg,
}

impl Stage {
    pub fn dir(self) -> &'static str {
        match self {
            Stage::Core => "core",
            Stage::Nlu => "nlu",
            Stage::Nlg => "nlg",
        }
    }
}

/// Which stages a training run builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingStages {
    pub core: bool,
    pub nlu: bool,
}

impl TrainingStages {
    pub fn all() -> Self {
        Self { core: true, nlu: true }
    }

    pub fn core_only() -> Self {
        Self { core: true, nlu: false }
    }

    pub fn nlu_only() -> Self {
        Self { core: false, nlu: true }
    }

    /// Stages present in the resulting archive; responses travel with core.
    pub fn stages(self) -> BTreeSet<Stage> {
        let mut stages = BTreeSet::new();
        if self.core {
            stages.insert(Stage::Core);
            stages.insert(Stage::Nlg);
        }
        if self.nlu {
            stages.insert(Stage::Nlu);
        }
        stages
    }
}

/// Everything a later run needs to know about an archive without unpacking it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub version: String,
    pub trained_at: DateTime<Utc>,
    pub recipe: String,
    pub fingerprint: ProjectFingerprint,
    pub stages: BTreeSet<Stage>,
    pub train_schema: GraphSchema<Component>,
    pub predict_schema: GraphSchema<Component>,
    pub node_fingerprints: BTreeMap<String, Fingerprint>,
    /// Combined fingerprint of the archive this model was fine-tuned from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finetuned_from: Option<String>,
}

impl ModelMetadata {
    /// Read and validate the metadata header of an archive.
    pub fn from_archive(archive: &ArchiveRef) -> Result<Self> {
        let metadata: ModelMetadata = archive.metadata()?;
        metadata.train_schema.validate()?;
        metadata.predict_schema.validate()?;
        Ok(metadata)
    }

    pub fn has_stage(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    /// Training node that persisted the response templates.
    pub fn responses_node(&self) -> Option<&SchemaNode<Component>> {
        self.train_schema
            .nodes()
            .iter()
            .find(|node| node.kind == Component::ResponsesProvider && node.persists)
    }
}
