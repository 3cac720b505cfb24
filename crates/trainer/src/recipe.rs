//! Recipes turn a model config into a training and a prediction schema.

use crate::components::{Component, DataKind, Role, EPOCH_FRACTION_KEY, FINETUNE_FROM_KEY};
use crate::data::{ComponentConfig, ModelConfig};
use crate::errors::{Result, TrainerError};
use crate::metadata::{Stage, TrainingStages};
use parley_engine::{GraphSchema, SchemaNode};
use serde_json::json;
use tracing::debug;

pub const DEFAULT_RECIPE: &str = "default.v1";

pub const NLU_DATA_NODE: &str = "nlu_training_data_provider";
pub const DOMAIN_NODE: &str = "domain_provider";
pub const RESPONSES_NODE: &str = "responses_provider";
pub const STORIES_NODE: &str = "story_graph_provider";
pub const MESSAGE_INPUT_NODE: &str = "nlu_message_input";
pub const PREDICTION_NODE: &str = "select_prediction";

/// Fine-tuning parameters injected into every trainable node.
#[derive(Debug, Clone, PartialEq)]
pub struct FinetuneParams {
    /// Combined fingerprint of the model being fine-tuned, as hex.
    pub from: String,
    pub epoch_fraction: f64,
}

/// What the recipe should build.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipeOptions {
    pub stages: TrainingStages,
    /// Keep the NLU training data in the archive.
    pub persist_nlu_training_data: bool,
    pub finetune: Option<FinetuneParams>,
}

impl Default for RecipeOptions {
    fn default() -> Self {
        Self {
            stages: TrainingStages::all(),
            persist_nlu_training_data: false,
            finetune: None,
        }
    }
}

/// Training and prediction schema built from one config.
#[derive(Debug, Clone)]
pub struct RecipeSchemas {
    pub train: GraphSchema<Component>,
    pub predict: GraphSchema<Component>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipe {
    DefaultV1,
}

impl Recipe {
    /// Recipe named by the config; configs without one use the default.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        match config.recipe.as_deref() {
            None | Some(DEFAULT_RECIPE) => Ok(Recipe::DefaultV1),
            Some(other) => Err(TrainerError::UnknownRecipe(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Recipe::DefaultV1 => DEFAULT_RECIPE,
        }
    }

    pub fn schemas_for_config(self, config: &ModelConfig, options: &RecipeOptions) -> Result<RecipeSchemas> {
        match self {
            Recipe::DefaultV1 => default_v1(config, options),
        }
    }
}

struct ResolvedStep {
    train_name: String,
    component: Component,
    config: std::collections::BTreeMap<String, serde_json::Value>,
}

fn input_param(kind: DataKind) -> &'static str {
    match kind {
        DataKind::TrainingData => "training_data",
        DataKind::Tokens => "messages",
        DataKind::Features => "features",
        DataKind::Domain => "domain",
        DataKind::Responses => "responses",
        DataKind::Stories => "stories",
        DataKind::Resource => "resource",
        DataKind::Prediction => "prediction",
    }
}

fn resolve_steps(entries: &[ComponentConfig], role: Role, options: &RecipeOptions) -> Result<Vec<ResolvedStep>> {
    entries
        .iter()
        .enumerate()
        .map(|(idx, entry)| {
            let train_name = format!("train_{}{idx}", entry.name);
            let component = Component::from_name(&entry.name).ok_or_else(|| TrainerError::UnknownComponent {
                node: train_name.clone(),
                component: entry.name.clone(),
            })?;
            if component.role() != role {
                return Err(TrainerError::InvalidPipeline {
                    node: train_name,
                    reason: format!("{} can not be used as {role:?} component", component.as_str()),
                });
            }
            let mut config = component.resolve_config(&train_name, &entry.params)?;
            if let (Some(finetune), true) = (&options.finetune, component.is_trainable()) {
                config.insert(FINETUNE_FROM_KEY.to_string(), json!(finetune.from));
                config.insert(EPOCH_FRACTION_KEY.to_string(), json!(finetune.epoch_fraction));
            }
            Ok(ResolvedStep {
                train_name,
                component,
                config,
            })
        })
        .collect()
}

/// Each NLU component must accept what its predecessor produces.
fn check_chaining(steps: &[ResolvedStep]) -> Result<()> {
    let mut available = DataKind::TrainingData;
    for step in steps {
        if let Some(expected) = step.component.consumes() {
            if expected != available {
                return Err(TrainerError::InvalidPipeline {
                    node: step.train_name.clone(),
                    reason: format!(
                        "{} expects {expected:?} but the previous component produces {available:?}",
                        step.component.as_str()
                    ),
                });
            }
        }
        available = step.component.produces();
    }
    Ok(())
}

fn run_name(train_name: &str) -> String {
    match train_name.strip_prefix("train_") {
        Some(rest) => format!("run_{rest}"),
        None => format!("run_{train_name}"),
    }
}

fn default_v1(config: &ModelConfig, options: &RecipeOptions) -> Result<RecipeSchemas> {
    let mut train = Vec::new();
    let mut predict = Vec::new();
    let mut predict_inputs: Vec<(String, String)> = Vec::new();

    if options.stages.nlu {
        let steps = resolve_steps(&config.pipeline, Role::Nlu, options)?;
        check_chaining(&steps)?;

        let provider = SchemaNode::new(NLU_DATA_NODE, Component::NluDataProvider);
        train.push(if options.persist_nlu_training_data {
            provider.persisting(Stage::Nlu.dir()).target()
        } else {
            provider.uncached()
        });
        predict.push(SchemaNode::new(MESSAGE_INPUT_NODE, Component::MessageInput).uncached());

        let mut previous_train = NLU_DATA_NODE.to_string();
        let mut previous_run = MESSAGE_INPUT_NODE.to_string();
        let mut available = DataKind::TrainingData;
        let last = steps.len().saturating_sub(1);
        for (idx, step) in steps.iter().enumerate() {
            let param = input_param(step.component.consumes().unwrap_or(available));
            let mut node = SchemaNode::new(&step.train_name, step.component)
                .with_config(step.config.clone())
                .with_input(param, &previous_train);
            if step.component.persists() {
                node = node.persisting(Stage::Nlu.dir()).target();
            } else if idx == last {
                node = node.target();
            }
            train.push(node);

            let mut run = SchemaNode::new(run_name(&step.train_name), step.component)
                .with_config(step.config.clone())
                .with_input(param, &previous_run);
            if step.component.persists() {
                run = run.loading(Stage::Nlu.dir(), &step.train_name);
            }
            predict.push(run);

            previous_train = step.train_name.clone();
            previous_run = run_name(&step.train_name);
            available = step.component.produces();
        }
        if !steps.is_empty() {
            predict_inputs.push(("nlu".to_string(), previous_run));
        }
    }

    if options.stages.core {
        let steps = resolve_steps(&config.policies, Role::Policy, options)?;

        train.push(
            SchemaNode::new(DOMAIN_NODE, Component::DomainProvider)
                .persisting(Stage::Core.dir())
                .target(),
        );
        train.push(
            SchemaNode::new(RESPONSES_NODE, Component::ResponsesProvider)
                .persisting(Stage::Nlg.dir())
                .target(),
        );
        train.push(SchemaNode::new(STORIES_NODE, Component::StoryProvider).uncached());
        predict.push(
            SchemaNode::new(DOMAIN_NODE, Component::DomainProvider).loading(Stage::Core.dir(), DOMAIN_NODE),
        );

        for (idx, step) in steps.iter().enumerate() {
            train.push(
                SchemaNode::new(&step.train_name, step.component)
                    .with_config(step.config.clone())
                    .with_input("stories", STORIES_NODE)
                    .with_input("domain", DOMAIN_NODE)
                    .persisting(Stage::Core.dir())
                    .target(),
            );
            let run = run_name(&step.train_name);
            predict.push(
                SchemaNode::new(&run, step.component)
                    .with_config(step.config.clone())
                    .with_input("domain", DOMAIN_NODE)
                    .loading(Stage::Core.dir(), &step.train_name),
            );
            predict_inputs.push((format!("policy{idx}"), run));
        }
    }

    let mut ensemble = SchemaNode::new(PREDICTION_NODE, Component::PredictionEnsemble).target();
    for (param, node) in predict_inputs {
        ensemble = ensemble.with_input(param, node);
    }
    predict.push(ensemble);

    let schemas = RecipeSchemas {
        train: GraphSchema::new(train)?,
        predict: GraphSchema::new(predict)?,
    };
    debug!(
        train_nodes = schemas.train.len(),
        predict_nodes = schemas.predict.len(),
        "built schemas from config"
    );
    Ok(schemas)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_config() -> ModelConfig {
        ModelConfig {
            pipeline: vec![
                ComponentConfig::new("WhitespaceTokenizer"),
                ComponentConfig::new("CountVectorsFeaturizer"),
                ComponentConfig::new("LinearIntentClassifier").with_param("epochs", json!(5)),
            ],
            policies: vec![
                ComponentConfig::new("MemoizationPolicy"),
                ComponentConfig::new("TransitionPolicy"),
            ],
            ..ModelConfig::default()
        }
    }

    #[test]
    fn builds_default_schemas() {
        let schemas = Recipe::DefaultV1
            .schemas_for_config(&full_config(), &RecipeOptions::default())
            .unwrap();
        let train = &schemas.train;
        assert!(!train.node(NLU_DATA_NODE).unwrap().cacheable);
        let featurizer = train.node("train_CountVectorsFeaturizer1").unwrap();
        assert_eq!(featurizer.inputs["messages"], "train_WhitespaceTokenizer0");
        assert_eq!(featurizer.resource_path(), "nlu/train_CountVectorsFeaturizer1");
        assert_eq!(train.node("train_LinearIntentClassifier2").unwrap().config["epochs"], json!(5));
        assert_eq!(train.node(RESPONSES_NODE).unwrap().resource_path(), "nlg/responses_provider");
        assert_eq!(
            train.node("train_TransitionPolicy1").unwrap().inputs["stories"],
            STORIES_NODE
        );

        let predict = &schemas.predict;
        let run = predict.node("run_LinearIntentClassifier2").unwrap();
        assert_eq!(run.resource_path(), "nlu/train_LinearIntentClassifier2");
        assert_eq!(predict.target_names(), vec![PREDICTION_NODE.to_string()]);
        assert_eq!(predict.node(PREDICTION_NODE).unwrap().inputs.len(), 3);
    }

    #[test]
    fn stage_selection() {
        let options = RecipeOptions {
            stages: TrainingStages::nlu_only(),
            ..RecipeOptions::default()
        };
        let schemas = Recipe::DefaultV1.schemas_for_config(&full_config(), &options).unwrap();
        assert!(!schemas.train.contains(DOMAIN_NODE));
        assert!(!schemas.train.contains("train_MemoizationPolicy0"));

        let options = RecipeOptions {
            stages: TrainingStages::core_only(),
            persist_nlu_training_data: true,
            ..RecipeOptions::default()
        };
        let schemas = Recipe::DefaultV1.schemas_for_config(&full_config(), &options).unwrap();
        assert!(!schemas.train.contains(NLU_DATA_NODE));
        assert!(schemas.train.contains(RESPONSES_NODE));
    }

    #[test]
    fn persisted_nlu_data_is_a_target() {
        let options = RecipeOptions {
            persist_nlu_training_data: true,
            ..RecipeOptions::default()
        };
        let schemas = Recipe::DefaultV1.schemas_for_config(&full_config(), &options).unwrap();
        let provider = schemas.train.node(NLU_DATA_NODE).unwrap();
        assert!(provider.is_target && provider.persists && provider.cacheable);
    }

    #[test]
    fn finetune_parameters_reach_trainable_nodes_only() {
        let options = RecipeOptions {
            finetune: Some(FinetuneParams {
                from: "ab".repeat(32),
                epoch_fraction: 0.5,
            }),
            ..RecipeOptions::default()
        };
        let schemas = Recipe::DefaultV1.schemas_for_config(&full_config(), &options).unwrap();
        let policy = schemas.train.node("train_TransitionPolicy1").unwrap();
        assert_eq!(policy.config[EPOCH_FRACTION_KEY], json!(0.5));
        let memo = schemas.train.node("train_MemoizationPolicy0").unwrap();
        assert!(!memo.config.contains_key(FINETUNE_FROM_KEY));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let config = ModelConfig {
            recipe: Some("graph.v2".into()),
            ..ModelConfig::default()
        };
        assert!(matches!(Recipe::from_config(&config), Err(TrainerError::UnknownRecipe(name)) if name == "graph.v2"));
        assert_eq!(Recipe::from_config(&ModelConfig::default()).unwrap(), Recipe::DefaultV1);

        let mut config = full_config();
        config.pipeline.push(ComponentConfig::new("SpacyNLP"));
        let err = Recipe::DefaultV1
            .schemas_for_config(&config, &RecipeOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            TrainerError::UnknownComponent { ref node, ref component } if node == "train_SpacyNLP3" && component == "SpacyNLP"
        ));
    }

    #[test]
    fn misordered_pipeline_names_the_node() {
        let mut config = full_config();
        config.pipeline.swap(0, 1);
        let err = Recipe::DefaultV1
            .schemas_for_config(&config, &RecipeOptions::default())
            .unwrap_err();
        assert_eq!(err.node(), Some("train_CountVectorsFeaturizer0"));

        let mut config = full_config();
        config.policies.push(ComponentConfig::new("WhitespaceTokenizer"));
        let err = Recipe::DefaultV1
            .schemas_for_config(&config, &RecipeOptions::default())
            .unwrap_err();
        assert_eq!(err.node(), Some("train_WhitespaceTokenizer2"));
    }
}
