//! Executes training graph nodes for the graph runner.

use crate::components::classifier::{self, LinearIntentClassifier};
use crate::components::policy::{self, MemoizationPolicy, TransitionPolicy};
use crate::components::{
    Component, CountVectorsFeaturizer, LinearModel, NodeOutput, ResourceSummary, WhitespaceTokenizer,
    FINETUNE_FROM_KEY,
};
use crate::data::{Domain, ModelConfig, StoryGraph, TrainingData};
use crate::errors::Result;
use crate::finetune::FinetuneCandidate;
use crate::importer::TrainingDataImporter;
use anyhow::{bail, Context};
use parley_engine::serialization::canonical_json_bytes;
use parley_engine::{ExecutionContext, Fingerprint, NodeExecutor, NodeInputs, SchemaNode};
use std::fs;
use std::path::Path;
use tracing::debug;

pub const DOMAIN_FILE: &str = "domain.json";
pub const RESPONSES_FILE: &str = "responses.json";
pub const TRAINING_DATA_FILE: &str = "training_data.json";

/// Training inputs read once from an importer.
#[derive(Debug, Clone, Default)]
pub struct ProjectData {
    pub config: ModelConfig,
    pub domain: Domain,
    pub stories: StoryGraph,
    pub nlu: TrainingData,
}

impl ProjectData {
    pub fn load(importer: &dyn TrainingDataImporter) -> Result<Self> {
        Ok(Self {
            config: importer.get_config()?,
            domain: importer.get_domain()?,
            stories: importer.get_stories()?,
            nlu: importer.get_nlu_data()?,
        })
    }
}

fn write_json<T: serde::Serialize>(dir: &Path, file: &str, value: &T) -> anyhow::Result<()> {
    let path = dir.join(file);
    fs::write(&path, canonical_json_bytes(value)?).with_context(|| format!("failed to write {}", path.display()))
}

/// Runs [`Component`]s over the data of one project.
pub struct TrainingExecutor<'a> {
    data: &'a ProjectData,
    finetune: Option<&'a FinetuneCandidate>,
}

impl<'a> TrainingExecutor<'a> {
    pub fn new(data: &'a ProjectData, finetune: Option<&'a FinetuneCandidate>) -> Self {
        Self { data, finetune }
    }

    /// Model persisted by the same node of the model being fine-tuned.
    fn prior_model(&self, node: &SchemaNode<Component>, file: &str) -> anyhow::Result<Option<LinearModel>> {
        if !node.config.contains_key(FINETUNE_FROM_KEY) {
            return Ok(None);
        }
        let candidate = self
            .finetune
            .with_context(|| format!("node '{}' is configured for fine-tuning but no model was loaded", node.name))?;
        let relative = node.resource_path();
        let dir = candidate
            .resource_dir(&relative)
            .with_context(|| format!("model '{}' has no resource '{relative}'", candidate.archive().name()))?;
        debug!(node = %node.name, resource = %relative, "loading prior weights");
        Ok(Some(LinearModel::load(&dir.join(file))?))
    }

    fn summarize(node: &SchemaNode<Component>, metrics: &[(&str, i64)]) -> NodeOutput {
        NodeOutput::Resource(ResourceSummary {
            path: node.resource_path(),
            metrics: metrics.iter().map(|(key, value)| (key.to_string(), *value)).collect(),
        })
    }
}

impl NodeExecutor for TrainingExecutor<'_> {
    type Kind = Component;
    type Output = NodeOutput;

    fn content_fingerprint(&self, node: &SchemaNode<Component>) -> anyhow::Result<Option<Fingerprint>> {
        let fingerprint = match node.kind {
            Component::DomainProvider => Fingerprint::of(&self.data.domain.without_responses())?,
            Component::ResponsesProvider => Fingerprint::of(&self.data.domain.responses)?,
            Component::StoryProvider => Fingerprint::of(&self.data.stories)?,
            Component::NluDataProvider => Fingerprint::of(&self.data.nlu)?,
            _ => return Ok(None),
        };
        Ok(Some(fingerprint))
    }

    fn execute(
        &self,
        node: &SchemaNode<Component>,
        inputs: &NodeInputs<'_, NodeOutput>,
        ctx: &ExecutionContext<'_>,
    ) -> anyhow::Result<NodeOutput> {
        match node.kind {
            Component::DomainProvider => {
                let domain = self.data.domain.without_responses();
                write_json(ctx.require_resource_dir()?, DOMAIN_FILE, &domain)?;
                Ok(NodeOutput::Domain(domain))
            }
            Component::ResponsesProvider => {
                let responses = self.data.domain.responses.clone();
                write_json(ctx.require_resource_dir()?, RESPONSES_FILE, &responses)?;
                Ok(NodeOutput::Responses(responses))
            }
            Component::StoryProvider => Ok(NodeOutput::Stories(self.data.stories.clone())),
            Component::NluDataProvider => {
                if let Some(dir) = &ctx.resource_dir {
                    write_json(dir, TRAINING_DATA_FILE, &self.data.nlu)?;
                }
                Ok(NodeOutput::TrainingData(self.data.nlu.clone()))
            }
            Component::WhitespaceTokenizer => {
                let data = inputs.require("training_data")?.training_data()?;
                let tokenizer = WhitespaceTokenizer::from_config(&node.config)?;
                Ok(NodeOutput::Tokens(tokenizer.process(data)))
            }
            Component::CountVectorsFeaturizer => {
                let messages = inputs.require("messages")?.tokens()?;
                let matrix = CountVectorsFeaturizer::from_config(&node.config)?.train(messages);
                CountVectorsFeaturizer::persist(&matrix, ctx.require_resource_dir()?)?;
                Ok(NodeOutput::Features(matrix))
            }
            Component::LinearIntentClassifier => {
                let features = inputs.require("features")?.features()?;
                let prior = self.prior_model(node, classifier::MODEL_FILE)?;
                let model = LinearIntentClassifier::from_config(&node.config)?.train(features, prior.as_ref())?;
                model.save(&ctx.require_resource_dir()?.join(classifier::MODEL_FILE))?;
                let accuracy = model.accuracy(&LinearIntentClassifier::examples(features));
                Ok(Self::summarize(
                    node,
                    &[
                        ("labels", model.labels.len() as i64),
                        ("epochs_trained", model.epochs_trained as i64),
                        ("accuracy", accuracy),
                    ],
                ))
            }
            Component::MemoizationPolicy => {
                let stories = inputs.require("stories")?.stories()?;
                let table = MemoizationPolicy::from_config(&node.config)?.train(stories);
                table.save(ctx.require_resource_dir()?)?;
                Ok(Self::summarize(node, &[("states", table.lookup.len() as i64)]))
            }
            Component::TransitionPolicy => {
                let stories = inputs.require("stories")?.stories()?;
                let domain = inputs.require("domain")?.domain()?;
                let transition = TransitionPolicy::from_config(&node.config)?;
                let prior = self.prior_model(node, policy::MODEL_FILE)?;
                let model = transition.train(stories, domain, prior.as_ref());
                model.save(&ctx.require_resource_dir()?.join(policy::MODEL_FILE))?;
                Ok(Self::summarize(
                    node,
                    &[
                        ("labels", model.labels.len() as i64),
                        ("epochs_trained", model.epochs_trained as i64),
                        ("accuracy", model.accuracy(&transition.examples(stories))),
                    ],
                ))
            }
            Component::MessageInput | Component::PredictionEnsemble => {
                bail!("{} only runs at prediction time", node.kind.as_str())
            }
        }
    }
}
