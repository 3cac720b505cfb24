//! Retrain decision: compare a new fingerprint with the latest archive.

use crate::fingerprint::{did_section_change, ProjectFingerprint, Section};
use crate::metadata::{ModelMetadata, Stage};
use parley_engine::ArchiveRef;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CODE_CORE_NEEDS_TO_BE_RETRAINED: i32 = 0b0001;
pub const CODE_NLU_NEEDS_TO_BE_RETRAINED: i32 = 0b0010;
pub const CODE_NLG_NEEDS_TO_BE_RETRAINED: i32 = 0b0100;
pub const CODE_FORCED_TRAINING: i32 = 0b1000;

/// Which stages changed since the previous model.
///
/// The default (no previous model to compare with) marks every stage as
/// changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintComparisonResult {
    pub core: bool,
    pub nlu: bool,
    pub nlg: bool,
    pub force_training: bool,
}

impl Default for FingerprintComparisonResult {
    fn default() -> Self {
        Self {
            core: true,
            nlu: true,
            nlg: true,
            force_training: false,
        }
    }
}

impl FingerprintComparisonResult {
    pub fn forced() -> Self {
        Self {
            force_training: true,
            ..Self::default()
        }
    }

    pub fn unchanged() -> Self {
        Self {
            core: false,
            nlu: false,
            nlg: false,
            force_training: false,
        }
    }

    pub fn is_training_required(&self) -> bool {
        self.core || self.nlu || self.nlg || self.force_training
    }

    pub fn should_retrain_core(&self) -> bool {
        self.force_training || self.core
    }

    pub fn should_retrain_nlu(&self) -> bool {
        self.force_training || self.nlu
    }

    /// Retraining core always rewrites the responses as well.
    pub fn should_retrain_nlg(&self) -> bool {
        self.should_retrain_core() || self.nlg
    }

    /// Only the response templates need updating.
    pub fn is_responses_only(&self) -> bool {
        self.nlg && !self.should_retrain_core() && !self.should_retrain_nlu()
    }
}

/// Decide which stages must retrain.
///
/// An unreadable previous archive is treated like a missing one. A stage the
/// previous archive does not contain must be trained even if its inputs are
/// unchanged.
pub fn should_retrain(
    new_fingerprint: &ProjectFingerprint,
    previous: Option<&ArchiveRef>,
    force_training: bool,
    has_e2e_examples: bool,
) -> FingerprintComparisonResult {
    if force_training {
        return FingerprintComparisonResult::forced();
    }
    let Some(previous) = previous else {
        return FingerprintComparisonResult::default();
    };
    let metadata = match ModelMetadata::from_archive(previous) {
        Ok(metadata) => metadata,
        Err(err) => {
            warn!(archive = %previous.name(), error = %err, "could not read previous model, retraining everything");
            return FingerprintComparisonResult::default();
        }
    };

    let old = &metadata.fingerprint;
    let mut result = FingerprintComparisonResult {
        core: did_section_change(old, new_fingerprint, Section::Core),
        nlu: did_section_change(old, new_fingerprint, Section::Nlu),
        nlg: did_section_change(old, new_fingerprint, Section::Nlg),
        force_training: false,
    };

    // End-to-end stories are featurized with the NLU pipeline.
    if has_e2e_examples && result.should_retrain_nlu() {
        result.core = true;
    }
    if !result.core && !metadata.has_stage(Stage::Core) {
        result.core = true;
    }
    if !result.nlg && !metadata.has_stage(Stage::Nlg) {
        result.nlg = true;
    }
    if !result.nlu && !metadata.has_stage(Stage::Nlu) {
        result.nlu = true;
    }

    debug!(archive = %previous.name(), ?result, "compared fingerprints");
    result
}

/// Outcome of a dry run: a result code and the reasons behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunResult {
    pub code: i32,
    pub texts: Vec<String>,
}

impl DryRunResult {
    pub fn nothing_to_do() -> Self {
        Self {
            code: 0,
            texts: vec!["No training required.".to_string()],
        }
    }
}

pub fn dry_run_result(comparison: &FingerprintComparisonResult) -> DryRunResult {
    if comparison.force_training {
        return DryRunResult {
            code: CODE_FORCED_TRAINING,
            texts: vec!["The training was forced.".to_string()],
        };
    }

    let mut code = 0;
    let mut texts = Vec::new();
    if comparison.core {
        code += CODE_CORE_NEEDS_TO_BE_RETRAINED;
        texts.push("Core model should be retrained.".to_string());
    }
    if comparison.nlu {
        code += CODE_NLU_NEEDS_TO_BE_RETRAINED;
        texts.push("NLU model should be retrained.".to_string());
    }
    if comparison.nlg {
        code += CODE_NLG_NEEDS_TO_BE_RETRAINED;
        texts.push("Responses in the domain should be updated.".to_string());
    }

    if code == 0 {
        return DryRunResult::nothing_to_do();
    }
    DryRunResult { code, texts }
}
