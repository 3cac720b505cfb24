//! Resolving and validating a prior model to fine-tune from.

use crate::errors::{Result, TrainerError};
use crate::fingerprint::{is_version_compatible, FingerprintKey, ProjectFingerprint, MINIMUM_COMPATIBLE_VERSION};
use crate::metadata::{ModelMetadata, TrainingStages};
use parley_engine::{unpack_archive, ArchiveRef, DirectoryArchiveIndex, UnpackedArchive};
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Caller's request to continue training from an existing model.
#[derive(Debug, Clone, PartialEq)]
pub struct FinetuneRequest {
    /// An archive, or a directory whose latest archive is used.
    pub model: PathBuf,
    pub epoch_fraction: f64,
}

impl FinetuneRequest {
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            epoch_fraction: 1.0,
        }
    }

    pub fn with_epoch_fraction(mut self, epoch_fraction: f64) -> Self {
        self.epoch_fraction = epoch_fraction;
        self
    }
}

/// A compatible prior model, unpacked for the duration of a training run.
#[derive(Debug)]
pub struct FinetuneCandidate {
    pub metadata: ModelMetadata,
    pub epoch_fraction: f64,
    unpacked: UnpackedArchive,
}

impl FinetuneCandidate {
    pub fn archive(&self) -> &ArchiveRef {
        self.unpacked.source()
    }

    /// Resource persisted under `relative` (`<stage>/<node>`) in the prior model.
    pub fn resource_dir(&self, relative: &str) -> Option<PathBuf> {
        self.unpacked.resource_dir(relative)
    }

    /// Combined fingerprint of the prior model, as hex.
    pub fn fingerprint_hex(&self) -> Result<String> {
        Ok(self.metadata.fingerprint.combined()?.to_hex())
    }
}

/// Epochs to run when fine-tuning: `ceil(epochs * fraction)`, at least one.
pub fn finetune_epochs(epochs: u64, fraction: f64) -> u64 {
    let scaled = (epochs as f64 * fraction).ceil();
    if scaled.is_finite() && scaled >= 1.0 {
        scaled as u64
    } else {
        1
    }
}

/// Why a prior model can not be fine-tuned, or `Ok` if it can.
pub fn can_finetune(
    old: &ProjectFingerprint,
    old_version: &str,
    new: &ProjectFingerprint,
    stages: TrainingStages,
) -> std::result::Result<(), String> {
    if !is_version_compatible(old_version) {
        return Err(format!(
            "it was trained with version {old_version}, older than the minimum compatible version {MINIMUM_COMPATIBLE_VERSION}"
        ));
    }

    let mut keys = vec![FingerprintKey::ConfigWithoutEpochs];
    if stages.core {
        keys.push(FingerprintKey::Domain);
    }
    if stages.nlu {
        keys.push(FingerprintKey::NluLabels);
    }
    let changed: Vec<&str> = keys
        .into_iter()
        .filter(|key| old.value(*key) != new.value(*key))
        .map(FingerprintKey::as_str)
        .collect();
    if changed.is_empty() {
        Ok(())
    } else {
        Err(format!("the following inputs changed: {}", changed.join(", ")))
    }
}

fn locate(model: &Path) -> Result<ArchiveRef> {
    if model.is_file() {
        return Ok(ArchiveRef::new(model));
    }
    if model.is_dir() {
        if let Some(latest) = DirectoryArchiveIndex::new(model).list()?.pop() {
            return Ok(latest);
        }
    }
    Err(TrainerError::FinetuneModelNotFound(model.to_path_buf()))
}

/// Find, unpack and validate the model named by `request`.
#[instrument(skip_all, fields(model = %request.model.display()))]
pub fn resolve_finetune(
    request: &FinetuneRequest,
    new_fingerprint: &ProjectFingerprint,
    stages: TrainingStages,
) -> Result<FinetuneCandidate> {
    if !(request.epoch_fraction.is_finite() && request.epoch_fraction > 0.0) {
        return Err(TrainerError::Config(format!(
            "epoch fraction must be a positive number, got {}",
            request.epoch_fraction
        )));
    }

    let archive = locate(&request.model)?;
    let incompatible = |reason: String| TrainerError::FinetuneIncompatible {
        archive: archive.name(),
        reason,
    };
    let metadata = ModelMetadata::from_archive(&archive).map_err(|err| incompatible(err.to_string()))?;
    can_finetune(&metadata.fingerprint, &metadata.version, new_fingerprint, stages).map_err(incompatible)?;

    let unpacked = unpack_archive(&archive)?;
    info!(archive = %archive.name(), epoch_fraction = request.epoch_fraction, "fine-tuning from existing model");
    Ok(FinetuneCandidate {
        metadata,
        epoch_fraction: request.epoch_fraction,
        unpacked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ComponentConfig, Domain, Message, ModelConfig, StoryGraph, TrainingData};
    use serde_json::json;

    fn fingerprint(config: &ModelConfig, domain: &Domain, nlu: &TrainingData) -> ProjectFingerprint {
        ProjectFingerprint::from_parts(config, domain, &StoryGraph::default(), nlu).unwrap()
    }

    #[test]
    fn epochs_round_up_with_minimum_one() {
        assert_eq!(finetune_epochs(10, 0.25), 3);
        assert_eq!(finetune_epochs(10, 1.0), 10);
        assert_eq!(finetune_epochs(3, 0.01), 1);
        assert_eq!(finetune_epochs(0, 0.5), 1);
    }

    #[test]
    fn epoch_changes_are_compatible() {
        let mut config = ModelConfig::default();
        config.policies.push(ComponentConfig::new("TransitionPolicy").with_param("epochs", json!(10)));
        let old = fingerprint(&config, &Domain::default(), &TrainingData::default());
        config.policies[0] = ComponentConfig::new("TransitionPolicy").with_param("epochs", json!(50));
        let new = fingerprint(&config, &Domain::default(), &TrainingData::default());
        assert!(can_finetune(&old, crate::VERSION, &new, TrainingStages::all()).is_ok());
    }

    #[test]
    fn label_and_domain_changes_are_not() {
        let config = ModelConfig::default();
        let old = fingerprint(&config, &Domain::default(), &TrainingData::default());
        let nlu = TrainingData::new(vec![Message::new("hi", Some("greet"))]);
        let new = fingerprint(&config, &Domain::default(), &nlu);

        let reason = can_finetune(&old, crate::VERSION, &new, TrainingStages::nlu_only()).unwrap_err();
        assert!(reason.contains("nlu_labels"));
        assert!(can_finetune(&old, crate::VERSION, &new, TrainingStages::core_only()).is_ok());

        let domain = Domain {
            intents: vec!["greet".into()],
            ..Domain::default()
        };
        let new = fingerprint(&config, &domain, &TrainingData::default());
        assert!(can_finetune(&old, crate::VERSION, &new, TrainingStages::core_only()).is_err());
    }

    #[test]
    fn old_versions_are_rejected() {
        let fp = fingerprint(&ModelConfig::default(), &Domain::default(), &TrainingData::default());
        let reason = can_finetune(&fp, "0.0.9", &fp, TrainingStages::all()).unwrap_err();
        assert!(reason.contains("0.0.9"));
    }

    #[test]
    fn missing_model_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let fp = fingerprint(&ModelConfig::default(), &Domain::default(), &TrainingData::default());
        for model in [dir.path().to_path_buf(), dir.path().join("missing.bundle")] {
            let err = resolve_finetune(&FinetuneRequest::new(&model), &fp, TrainingStages::all()).unwrap_err();
            assert!(matches!(err, TrainerError::FinetuneModelNotFound(path) if path == model));
        }
    }
}
