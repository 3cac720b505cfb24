//! Training entry points.
//!
//! [`ModelTrainer::train`] decides what has to be (re)built by comparing the
//! project fingerprint with the latest archive, and then either returns the
//! previous archive, patches its responses, or runs the training graph. The
//! graph runner's cache makes sure that even a full run only executes the
//! nodes whose inputs changed.

use crate::comparison::{dry_run_result, should_retrain, DryRunResult};
use crate::errors::Result;
use crate::executor::{ProjectData, TrainingExecutor, RESPONSES_FILE};
use crate::finetune::{resolve_finetune, FinetuneRequest};
use crate::fingerprint::ProjectFingerprint;
use crate::importer::TrainingDataImporter;
use crate::metadata::{ModelMetadata, TrainingStages};
use crate::recipe::{FinetuneParams, Recipe, RecipeOptions};
use chrono::Utc;
use parley_engine::serialization::canonical_json_bytes;
use parley_engine::{
    unpack_archive, ArchiveIndex, ArchiveNamePolicy, ArchiveRef, CancellationToken, GraphRunner, ModelStorage,
    RunRequest, TrainingCache, WriteOnlyCache,
};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Options of a single training invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingRequest {
    /// Only report what would be trained.
    pub dry_run: bool,
    pub force_training: bool,
    /// Archive name to use instead of a generated one.
    pub fixed_model_name: Option<String>,
    pub persist_nlu_training_data: bool,
    pub finetune: Option<FinetuneRequest>,
}

impl TrainingRequest {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn forced() -> Self {
        Self {
            force_training: true,
            ..Self::default()
        }
    }

    pub fn with_fixed_model_name(mut self, name: impl Into<String>) -> Self {
        self.fixed_model_name = Some(name.into());
        self
    }

    pub fn with_finetune(mut self, finetune: FinetuneRequest) -> Self {
        self.finetune = Some(finetune);
        self
    }

    pub fn with_persisted_nlu_data(mut self) -> Self {
        self.persist_nlu_training_data = true;
        self
    }
}

/// Outcome of a training invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingResult {
    /// New archive, the unchanged previous archive, or `None` when nothing
    /// could be trained.
    pub model: Option<ArchiveRef>,
    /// Dry-run result code; `0` for real runs.
    pub code: i32,
    pub dry_run: Option<DryRunResult>,
    /// Graph nodes that executed.
    pub executed: Vec<String>,
    /// Graph nodes restored from the training cache.
    pub cache_hits: Vec<String>,
}

impl TrainingResult {
    fn nothing() -> Self {
        Self::default()
    }

    fn reused(archive: ArchiveRef) -> Self {
        Self {
            model: Some(archive),
            ..Self::default()
        }
    }
}

/// Trains models into the output location of an [`ArchiveIndex`].
pub struct ModelTrainer {
    index: Arc<dyn ArchiveIndex>,
    cache: Arc<dyn TrainingCache>,
    num_workers: usize,
    cancel: CancellationToken,
}

impl ModelTrainer {
    pub fn new(index: Arc<dyn ArchiveIndex>, cache: Arc<dyn TrainingCache>) -> Self {
        Self {
            index,
            cache,
            num_workers: 4,
            cancel: CancellationToken::default(),
        }
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Cancelling the token stops dispatching graph nodes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn index(&self) -> &Arc<dyn ArchiveIndex> {
        &self.index
    }

    /// Forced runs recompute every node but still fill the cache.
    fn runner(&self, force: bool) -> Result<GraphRunner> {
        let cache: Arc<dyn TrainingCache> = if force {
            Arc::new(WriteOnlyCache::new(self.cache.clone()))
        } else {
            self.cache.clone()
        };
        Ok(GraphRunner::new(cache, self.num_workers)?.with_cancellation(self.cancel.clone()))
    }

    /// Train core and NLU, reusing as much of the previous model as possible.
    #[instrument(skip_all, fields(output = %self.index.output_dir().display()))]
    pub fn train(&self, importer: &dyn TrainingDataImporter, request: &TrainingRequest) -> Result<TrainingResult> {
        let project = ProjectData::load(importer)?;
        let fingerprint = ProjectFingerprint::from_parts(&project.config, &project.domain, &project.stories, &project.nlu)?;
        let previous = self.index.latest()?;
        let has_e2e = project.nlu.has_e2e_examples();

        if request.dry_run {
            return Ok(Self::dry_run(&project, &fingerprint, previous.as_ref(), request.force_training));
        }

        if project.domain.is_empty() {
            if project.nlu.contains_no_pure_nlu_data() {
                error!("No training data given. Please provide NLU data or a domain with stories.");
                return Ok(TrainingResult::nothing());
            }
            let result = self.train_stages(&project, &fingerprint, request, TrainingStages::nlu_only(), Some("nlu-"))?;
            warn!(
                "Core training was skipped because no valid domain was found. Only an NLU model was created. \
                 Please specify a valid domain using the '--domain' argument."
            );
            return Ok(result);
        }

        if has_e2e {
            info!("end-to-end training is experimental");
        }
        if project.stories.is_empty() && project.nlu.contains_no_pure_nlu_data() {
            error!(
                "No training data given. Please provide stories and NLU data in order to train a model \
                 using the '--data' argument."
            );
            return Ok(TrainingResult::nothing());
        }
        if project.stories.is_empty() {
            warn!("No stories present. Just an NLU model will be trained.");
            return self.train_stages(&project, &fingerprint, request, TrainingStages::nlu_only(), Some("nlu-"));
        }
        if project.nlu.contains_no_pure_nlu_data() && !has_e2e {
            warn!("No NLU data present. Just a core model will be trained.");
            return self.train_stages(&project, &fingerprint, request, TrainingStages::core_only(), Some("core-"));
        }

        let comparison = should_retrain(&fingerprint, previous.as_ref(), request.force_training, has_e2e);
        if let Some(previous) = &previous {
            if !comparison.is_training_required() {
                info!(
                    archive = %previous.path().display(),
                    "Nothing changed. You can use the old model."
                );
                return Ok(TrainingResult::reused(previous.clone()));
            }
            if comparison.is_responses_only() && request.finetune.is_none() {
                if let Some(result) = self.update_responses(&project, &fingerprint, previous, request)? {
                    return Ok(result);
                }
            }
        }

        self.train_stages(&project, &fingerprint, request, TrainingStages::all(), None)
    }

    /// Train only the dialogue policies.
    #[instrument(skip_all, fields(output = %self.index.output_dir().display()))]
    pub fn train_core(&self, importer: &dyn TrainingDataImporter, request: &TrainingRequest) -> Result<TrainingResult> {
        let project = ProjectData::load(importer)?;
        if project.nlu.has_e2e_examples() {
            error!("Stories contain end-to-end examples. Please train core and NLU together so the NLU model is trained as well.");
            return Ok(TrainingResult::nothing());
        }
        if project.domain.is_empty() {
            error!(
                "Core training was skipped because no valid domain was found. \
                 Please specify a valid domain using the '--domain' argument."
            );
            return Ok(TrainingResult::nothing());
        }
        if project.stories.is_empty() {
            error!("No stories given. Please provide stories in order to train a core model.");
            return Ok(TrainingResult::nothing());
        }
        let fingerprint = ProjectFingerprint::from_parts(&project.config, &project.domain, &project.stories, &project.nlu)?;
        self.train_stages(&project, &fingerprint, request, TrainingStages::core_only(), Some("core-"))
    }

    /// Train only the NLU pipeline.
    #[instrument(skip_all, fields(output = %self.index.output_dir().display()))]
    pub fn train_nlu(&self, importer: &dyn TrainingDataImporter, request: &TrainingRequest) -> Result<TrainingResult> {
        let project = ProjectData::load(importer)?;
        if project.nlu.contains_no_pure_nlu_data() {
            error!("The training data doesn't contain valid NLU data. The NLU model training will be skipped now.");
            return Ok(TrainingResult::nothing());
        }
        let fingerprint = ProjectFingerprint::from_parts(&project.config, &project.domain, &project.stories, &project.nlu)?;
        self.train_stages(&project, &fingerprint, request, TrainingStages::nlu_only(), Some("nlu-"))
    }

    fn dry_run(
        project: &ProjectData,
        fingerprint: &ProjectFingerprint,
        previous: Option<&ArchiveRef>,
        force_training: bool,
    ) -> TrainingResult {
        let nothing_trainable = project.stories.is_empty() && project.nlu.contains_no_pure_nlu_data();
        let result = if nothing_trainable && !force_training {
            DryRunResult::nothing_to_do()
        } else {
            let comparison = should_retrain(fingerprint, previous, force_training, project.nlu.has_e2e_examples());
            dry_run_result(&comparison)
        };
        for text in &result.texts {
            if result.code > 0 {
                warn!("{text}");
            } else {
                info!("{text}");
            }
        }
        TrainingResult {
            code: result.code,
            dry_run: Some(result),
            ..TrainingResult::default()
        }
    }

    fn train_stages(
        &self,
        project: &ProjectData,
        fingerprint: &ProjectFingerprint,
        request: &TrainingRequest,
        stages: TrainingStages,
        prefix: Option<&str>,
    ) -> Result<TrainingResult> {
        let recipe = Recipe::from_config(&project.config)?;
        let finetune = request
            .finetune
            .as_ref()
            .map(|finetune| resolve_finetune(finetune, fingerprint, stages))
            .transpose()?;
        let finetune_params = match &finetune {
            Some(candidate) => Some(FinetuneParams {
                from: candidate.fingerprint_hex()?,
                epoch_fraction: candidate.epoch_fraction,
            }),
            None => None,
        };
        let options = RecipeOptions {
            stages,
            persist_nlu_training_data: request.persist_nlu_training_data,
            finetune: finetune_params,
        };
        let schemas = recipe.schemas_for_config(&project.config, &options)?;

        info!(recipe = recipe.name(), nodes = schemas.train.len(), "training model");
        let storage = ModelStorage::create()?;
        let executor = TrainingExecutor::new(project, finetune.as_ref());
        let report = self
            .runner(request.force_training)?
            .run(&schemas.train, RunRequest::default(), &executor, &storage)?;

        let metadata = ModelMetadata {
            version: crate::VERSION.to_string(),
            trained_at: Utc::now(),
            recipe: recipe.name().to_string(),
            fingerprint: fingerprint.clone(),
            stages: stages.stages(),
            train_schema: schemas.train,
            predict_schema: schemas.predict,
            node_fingerprints: report.fingerprints,
            finetuned_from: options.finetune.map(|params| params.from),
        };
        let policy = prefix
            .map(ArchiveNamePolicy::with_prefix)
            .unwrap_or_else(ArchiveNamePolicy::generated)
            .fixed_or(request.fixed_model_name.as_deref());
        let archive = self
            .index
            .packaged(storage.package(self.index.output_dir(), &policy, &metadata)?)?;

        info!(
            archive = %archive.path().display(),
            executed = report.executed.len(),
            cache_hits = report.cache_hits.len(),
            "Your model is trained and saved"
        );
        Ok(TrainingResult {
            model: Some(archive),
            code: 0,
            dry_run: None,
            executed: report.executed,
            cache_hits: report.cache_hits,
        })
    }

    /// Repackage `previous` with new response templates; nothing executes.
    ///
    /// Returns `None` if the previous archive has no responses resource.
    fn update_responses(
        &self,
        project: &ProjectData,
        fingerprint: &ProjectFingerprint,
        previous: &ArchiveRef,
        request: &TrainingRequest,
    ) -> Result<Option<TrainingResult>> {
        let old = ModelMetadata::from_archive(previous)?;
        let Some(relative) = old.responses_node().map(|node| node.resource_path()) else {
            warn!(archive = %previous.name(), "previous model has no responses, retraining");
            return Ok(None);
        };

        let unpacked = unpack_archive(previous)?;
        let storage = ModelStorage::create()?;
        storage.import_archive(&unpacked)?;
        let dir = storage.write_to(&relative)?;
        fs::write(dir.join(RESPONSES_FILE), canonical_json_bytes(&project.domain.responses)?)?;

        let executor = TrainingExecutor::new(project, None);
        let node_fingerprints = self
            .runner(false)?
            .fingerprint(&old.train_schema, &BTreeMap::new(), &executor)?;
        let metadata = ModelMetadata {
            version: crate::VERSION.to_string(),
            trained_at: Utc::now(),
            fingerprint: fingerprint.clone(),
            node_fingerprints,
            ..old
        };

        let policy = ArchiveNamePolicy::generated().fixed_or(request.fixed_model_name.as_deref());
        let archive = self
            .index
            .packaged(storage.package(self.index.output_dir(), &policy, &metadata)?)?;
        info!(
            archive = %archive.path().display(),
            previous = %previous.name(),
            "Updated the responses of the previous model"
        );
        Ok(Some(TrainingResult::reused(archive)))
    }
}
