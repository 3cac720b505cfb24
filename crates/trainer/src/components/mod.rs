//! Training components.
//!
//! Every node of a training graph is one [`Component`] variant. Names from
//! the model config are resolved to variants when the schema is built, and
//! their parameters are merged with defaults and type-checked at the same
//! time, so a bad config fails before anything executes.

pub mod classifier;
pub mod featurizer;
pub mod linear;
pub mod policy;
pub mod tokenizer;

use crate::data::{Domain, Responses, StoryGraph, TrainingData};
use crate::errors::{Result, TrainerError};
use anyhow::{bail, Context};
use parley_engine::ComponentKind;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub use classifier::LinearIntentClassifier;
pub use featurizer::{CountVectorsFeaturizer, FeatureMatrix, FeatureRow};
pub use linear::LinearModel;
pub use policy::{MemoizationPolicy, MemoTable, TransitionPolicy};
pub use tokenizer::{Token, TokenizedMessage, WhitespaceTokenizer, CLS_TOKEN};

/// Config keys injected when fine-tuning; never accepted from users.
pub const FINETUNE_FROM_KEY: &str = "finetune_from";
pub const EPOCH_FRACTION_KEY: &str = "epoch_fraction";

/// Closed set of graph node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    DomainProvider,
    ResponsesProvider,
    StoryProvider,
    NluDataProvider,
    WhitespaceTokenizer,
    CountVectorsFeaturizer,
    LinearIntentClassifier,
    MemoizationPolicy,
    TransitionPolicy,
    MessageInput,
    PredictionEnsemble,
}

/// What a component does in a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Provider,
    Nlu,
    Policy,
    PredictOnly,
}

/// Kind of value flowing along a graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Domain,
    Responses,
    Stories,
    TrainingData,
    Tokens,
    Features,
    Resource,
    Prediction,
}

#[derive(Debug, Clone, Copy)]
enum ParamKind {
    Bool,
    PositiveInt,
    PositiveNumber,
    NonEmptyString,
}

impl Component {
    pub const ALL: [Component; 11] = [
        Component::DomainProvider,
        Component::ResponsesProvider,
        Component::StoryProvider,
        Component::NluDataProvider,
        Component::WhitespaceTokenizer,
        Component::CountVectorsFeaturizer,
        Component::LinearIntentClassifier,
        Component::MemoizationPolicy,
        Component::TransitionPolicy,
        Component::MessageInput,
        Component::PredictionEnsemble,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|component| component.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Component::DomainProvider => "DomainProvider",
            Component::ResponsesProvider => "ResponsesProvider",
            Component::StoryProvider => "StoryProvider",
            Component::NluDataProvider => "NluDataProvider",
            Component::WhitespaceTokenizer => "WhitespaceTokenizer",
            Component::CountVectorsFeaturizer => "CountVectorsFeaturizer",
            Component::LinearIntentClassifier => "LinearIntentClassifier",
            Component::MemoizationPolicy => "MemoizationPolicy",
            Component::TransitionPolicy => "TransitionPolicy",
            Component::MessageInput => "MessageInput",
            Component::PredictionEnsemble => "PredictionEnsemble",
        }
    }

    pub fn role(self) -> Role {
        match self {
            Component::DomainProvider
            | Component::ResponsesProvider
            | Component::StoryProvider
            | Component::NluDataProvider => Role::Provider,
            Component::WhitespaceTokenizer
            | Component::CountVectorsFeaturizer
            | Component::LinearIntentClassifier => Role::Nlu,
            Component::MemoizationPolicy | Component::TransitionPolicy => Role::Policy,
            Component::MessageInput | Component::PredictionEnsemble => Role::PredictOnly,
        }
    }

    /// Components trained over epochs; these can be fine-tuned.
    pub fn is_trainable(self) -> bool {
        matches!(self, Component::LinearIntentClassifier | Component::TransitionPolicy)
    }

    /// Whether the component writes an artifact into model storage.
    pub fn persists(self) -> bool {
        matches!(
            self,
            Component::CountVectorsFeaturizer
                | Component::LinearIntentClassifier
                | Component::MemoizationPolicy
                | Component::TransitionPolicy
        )
    }

    /// Input an NLU component expects from its predecessor.
    pub fn consumes(self) -> Option<DataKind> {
        match self {
            Component::WhitespaceTokenizer => Some(DataKind::TrainingData),
            Component::CountVectorsFeaturizer => Some(DataKind::Tokens),
            Component::LinearIntentClassifier => Some(DataKind::Features),
            _ => None,
        }
    }

    pub fn produces(self) -> DataKind {
        match self {
            Component::DomainProvider => DataKind::Domain,
            Component::ResponsesProvider => DataKind::Responses,
            Component::StoryProvider => DataKind::Stories,
            Component::NluDataProvider | Component::MessageInput => DataKind::TrainingData,
            Component::WhitespaceTokenizer => DataKind::Tokens,
            Component::CountVectorsFeaturizer => DataKind::Features,
            Component::LinearIntentClassifier
            | Component::MemoizationPolicy
            | Component::TransitionPolicy => DataKind::Resource,
            Component::PredictionEnsemble => DataKind::Prediction,
        }
    }

    fn params(self) -> &'static [(&'static str, ParamKind)] {
        use ParamKind::*;
        match self {
            Component::WhitespaceTokenizer => &[
                ("use_cls_token", Bool),
                ("intent_tokenization_flag", Bool),
                ("intent_split_symbol", NonEmptyString),
            ],
            Component::CountVectorsFeaturizer => &[("lowercase", Bool), ("min_df", PositiveInt)],
            Component::LinearIntentClassifier => &[
                ("epochs", PositiveInt),
                ("learning_rate", PositiveNumber),
                ("random_seed", PositiveInt),
            ],
            Component::MemoizationPolicy => &[("max_history", PositiveInt)],
            Component::TransitionPolicy => &[
                ("epochs", PositiveInt),
                ("max_history", PositiveInt),
                ("learning_rate", PositiveNumber),
                ("random_seed", PositiveInt),
            ],
            _ => &[],
        }
    }

    /// Default parameters of the component.
    pub fn defaults(self) -> BTreeMap<String, Value> {
        let pairs: Vec<(&str, Value)> = match self {
            Component::WhitespaceTokenizer => vec![
                ("use_cls_token", json!(false)),
                ("intent_tokenization_flag", json!(false)),
                ("intent_split_symbol", json!("_")),
            ],
            Component::CountVectorsFeaturizer => vec![("lowercase", json!(true)), ("min_df", json!(1))],
            Component::LinearIntentClassifier => vec![
                ("epochs", json!(20)),
                ("learning_rate", json!(0.1)),
                ("random_seed", json!(42)),
            ],
            Component::MemoizationPolicy => vec![("max_history", json!(5))],
            Component::TransitionPolicy => vec![
                ("epochs", json!(10)),
                ("max_history", json!(3)),
                ("learning_rate", json!(0.1)),
                ("random_seed", json!(42)),
            ],
            _ => Vec::new(),
        };
        pairs.into_iter().map(|(key, value)| (key.to_string(), value)).collect()
    }

    /// Merge user parameters over the defaults, rejecting unknown keys and
    /// values of the wrong type.
    pub fn resolve_config(self, node: &str, params: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
        let mut config = self.defaults();
        for (key, value) in params {
            let Some((_, kind)) = self.params().iter().find(|(name, _)| name == key) else {
                return Err(TrainerError::InvalidParameter {
                    node: node.to_string(),
                    param: key.clone(),
                    reason: format!("{} does not accept this parameter", self.as_str()),
                });
            };
            let valid = match kind {
                ParamKind::Bool => value.is_boolean(),
                ParamKind::PositiveInt => value.as_u64().map_or(false, |n| n > 0),
                ParamKind::PositiveNumber => value.as_f64().map_or(false, |n| n > 0.0 && n.is_finite()),
                ParamKind::NonEmptyString => value.as_str().map_or(false, |s| !s.is_empty()),
            };
            if !valid {
                return Err(TrainerError::InvalidParameter {
                    node: node.to_string(),
                    param: key.clone(),
                    reason: format!("expected {kind:?}, got {value}"),
                });
            }
            config.insert(key.clone(), value.clone());
        }
        Ok(config)
    }
}

impl ComponentKind for Component {
    fn name(&self) -> &str {
        self.as_str()
    }
}

/// Summary of an artifact a training node persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    /// Resource directory relative to model storage.
    pub path: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, i64>,
}

/// Value produced by a graph node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum NodeOutput {
    Domain(Domain),
    Responses(Responses),
    Stories(StoryGraph),
    TrainingData(TrainingData),
    Tokens(Vec<TokenizedMessage>),
    Features(FeatureMatrix),
    Resource(ResourceSummary),
}

impl NodeOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeOutput::Domain(_) => "domain",
            NodeOutput::Responses(_) => "responses",
            NodeOutput::Stories(_) => "stories",
            NodeOutput::TrainingData(_) => "training_data",
            NodeOutput::Tokens(_) => "tokens",
            NodeOutput::Features(_) => "features",
            NodeOutput::Resource(_) => "resource",
        }
    }

    pub fn domain(&self) -> anyhow::Result<&Domain> {
        match self {
            NodeOutput::Domain(domain) => Ok(domain),
            other => bail!("expected a domain, got {}", other.kind()),
        }
    }

    pub fn stories(&self) -> anyhow::Result<&StoryGraph> {
        match self {
            NodeOutput::Stories(stories) => Ok(stories),
            other => bail!("expected stories, got {}", other.kind()),
        }
    }

    pub fn training_data(&self) -> anyhow::Result<&TrainingData> {
        match self {
            NodeOutput::TrainingData(data) => Ok(data),
            other => bail!("expected training data, got {}", other.kind()),
        }
    }

    pub fn tokens(&self) -> anyhow::Result<&[TokenizedMessage]> {
        match self {
            NodeOutput::Tokens(tokens) => Ok(tokens),
            other => bail!("expected tokenized messages, got {}", other.kind()),
        }
    }

    pub fn features(&self) -> anyhow::Result<&FeatureMatrix> {
        match self {
            NodeOutput::Features(features) => Ok(features),
            other => bail!("expected features, got {}", other.kind()),
        }
    }
}

pub(crate) fn param_bool(config: &BTreeMap<String, Value>, key: &str) -> anyhow::Result<bool> {
    config
        .get(key)
        .and_then(Value::as_bool)
        .with_context(|| format!("missing boolean parameter '{key}'"))
}

pub(crate) fn param_u64(config: &BTreeMap<String, Value>, key: &str) -> anyhow::Result<u64> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .with_context(|| format!("missing integer parameter '{key}'"))
}

pub(crate) fn param_f64(config: &BTreeMap<String, Value>, key: &str) -> anyhow::Result<f64> {
    config
        .get(key)
        .and_then(Value::as_f64)
        .with_context(|| format!("missing numeric parameter '{key}'"))
}

pub(crate) fn param_str<'a>(config: &'a BTreeMap<String, Value>, key: &str) -> anyhow::Result<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("missing string parameter '{key}'"))
}

/// Epochs to run: `ceil(epochs * epoch_fraction)` when fine-tuning, at least one.
pub fn effective_epochs(config: &BTreeMap<String, Value>) -> anyhow::Result<u64> {
    let epochs = param_u64(config, "epochs")?;
    match config.get(EPOCH_FRACTION_KEY).and_then(Value::as_f64) {
        Some(fraction) => Ok(crate::finetune::finetune_epochs(epochs, fraction)),
        None => Ok(epochs),
    }
}
