//! Project fingerprint: one digest per training-relevant input section.

use crate::data::{Domain, ModelConfig, StoryGraph, TrainingData};
use crate::errors::Result;
use crate::importer::TrainingDataImporter;
use parley_engine::Fingerprint;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Oldest archive version whose artifacts this build can still load.
pub const MINIMUM_COMPATIBLE_VERSION: &str = "0.1.0";

/// Per-section digests of a project's training inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFingerprint {
    /// Config minus pipeline and policies.
    pub config: Fingerprint,
    pub config_core: Fingerprint,
    pub config_nlu: Fingerprint,
    pub config_without_epochs: Fingerprint,
    /// Domain without responses.
    pub domain: Fingerprint,
    /// Domain responses.
    pub nlg: Fingerprint,
    pub stories: Fingerprint,
    pub nlu: Fingerprint,
    pub nlu_labels: Fingerprint,
    /// Version of the trainer that produced the fingerprint.
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintKey {
    Config,
    ConfigCore,
    ConfigNlu,
    ConfigWithoutEpochs,
    Domain,
    Nlg,
    Stories,
    Nlu,
    NluLabels,
    Version,
}

impl FingerprintKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::ConfigCore => "config_core",
            Self::ConfigNlu => "config_nlu",
            Self::ConfigWithoutEpochs => "config_without_epochs",
            Self::Domain => "domain",
            Self::Nlg => "nlg",
            Self::Stories => "stories",
            Self::Nlu => "nlu",
            Self::NluLabels => "nlu_labels",
            Self::Version => "version",
        }
    }
}

/// Groups of fingerprint keys that decide whether a stage must retrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Core,
    Nlu,
    Nlg,
}

impl Section {
    pub fn keys(self) -> &'static [FingerprintKey] {
        use FingerprintKey::*;
        match self {
            Section::Core => &[Config, ConfigCore, Domain, Stories, Version],
            Section::Nlu => &[Config, ConfigNlu, Nlu, Version],
            Section::Nlg => &[Nlg],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Section::Core => "core",
            Section::Nlu => "nlu",
            Section::Nlg => "nlg",
        }
    }
}

impl ProjectFingerprint {
    /// Fingerprint everything an importer provides.
    pub fn compute(importer: &dyn TrainingDataImporter) -> Result<Self> {
        Self::from_parts(
            &importer.get_config()?,
            &importer.get_domain()?,
            &importer.get_stories()?,
            &importer.get_nlu_data()?,
        )
    }

    pub fn from_parts(
        config: &ModelConfig,
        domain: &Domain,
        stories: &StoryGraph,
        nlu: &TrainingData,
    ) -> Result<Self> {
        Ok(Self {
            config: Fingerprint::of(&config.general_section())?,
            config_core: Fingerprint::of(&config.core_section())?,
            config_nlu: Fingerprint::of(&config.nlu_section())?,
            config_without_epochs: Fingerprint::of(&config.without_epochs())?,
            domain: Fingerprint::of(&domain.without_responses())?,
            nlg: Fingerprint::of(&domain.responses)?,
            stories: Fingerprint::of(stories)?,
            nlu: Fingerprint::of(nlu)?,
            nlu_labels: Fingerprint::of(&nlu.labels())?,
            version: crate::VERSION.to_string(),
        })
    }

    /// Single digest over all sections.
    pub fn combined(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::of(self)?)
    }

    /// Printable value of one key.
    pub fn value(&self, key: FingerprintKey) -> String {
        let fingerprint = match key {
            FingerprintKey::Config => &self.config,
            FingerprintKey::ConfigCore => &self.config_core,
            FingerprintKey::ConfigNlu => &self.config_nlu,
            FingerprintKey::ConfigWithoutEpochs => &self.config_without_epochs,
            FingerprintKey::Domain => &self.domain,
            FingerprintKey::Nlg => &self.nlg,
            FingerprintKey::Stories => &self.stories,
            FingerprintKey::Nlu => &self.nlu,
            FingerprintKey::NluLabels => &self.nlu_labels,
            FingerprintKey::Version => return self.version.clone(),
        };
        fingerprint.to_hex()
    }

    /// Keys of `section` whose values differ between `self` and `other`.
    pub fn changed_keys(&self, other: &ProjectFingerprint, section: Section) -> Vec<FingerprintKey> {
        section
            .keys()
            .iter()
            .copied()
            .filter(|key| self.value(*key) != other.value(*key))
            .collect()
    }
}

/// Whether any key of `section` differs between two fingerprints.
pub fn did_section_change(old: &ProjectFingerprint, new: &ProjectFingerprint, section: Section) -> bool {
    let changed = old.changed_keys(new, section);
    if !changed.is_empty() {
        debug!(
            section = section.name(),
            keys = ?changed.iter().map(|key| key.as_str()).collect::<Vec<_>>(),
            "fingerprint section changed"
        );
    }
    !changed.is_empty()
}

pub(crate) fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let core = version.split(['-', '+']).next()?;
    let mut parts = core.split('.').map(|part| part.parse::<u64>().ok());
    Some((parts.next()??, parts.next().flatten().unwrap_or(0), parts.next().flatten().unwrap_or(0)))
}

/// Whether artifacts written by `version` can be loaded by this build.
pub fn is_version_compatible(version: &str) -> bool {
    match (parse_version(version), parse_version(MINIMUM_COMPATIBLE_VERSION)) {
        (Some(found), Some(minimum)) => found >= minimum,
        _ => false,
    }
}
