//! Intent classifier on top of count features.

use super::effective_epochs;
use super::featurizer::FeatureMatrix;
use super::linear::{LabelledExample, LinearModel};
use super::{param_f64, param_u64};
use anyhow::bail;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub const MODEL_FILE: &str = "model.json";

#[derive(Debug, Clone, PartialEq)]
pub struct LinearIntentClassifier {
    pub epochs: u64,
    pub learning_rate: f64,
    pub random_seed: i64,
}

impl LinearIntentClassifier {
    pub fn from_config(config: &BTreeMap<String, Value>) -> anyhow::Result<Self> {
        Ok(Self {
            epochs: effective_epochs(config)?,
            learning_rate: param_f64(config, "learning_rate")?,
            random_seed: param_u64(config, "random_seed")? as i64,
        })
    }

    /// Labelled rows of the matrix; end-to-end texts carry no intent.
    pub fn examples(features: &FeatureMatrix) -> Vec<LabelledExample> {
        features
            .rows
            .iter()
            .filter_map(|row| {
                row.intent.as_ref().map(|intent| LabelledExample {
                    features: features.named_counts(row),
                    label: intent.clone(),
                })
            })
            .collect()
    }

    /// Train a model, continuing from `prior` when fine-tuning.
    pub fn train(&self, features: &FeatureMatrix, prior: Option<&LinearModel>) -> anyhow::Result<LinearModel> {
        let examples = Self::examples(features);
        if examples.is_empty() {
            bail!("no labelled examples to train the intent classifier on");
        }
        let labels: BTreeSet<String> = examples.iter().map(|example| example.label.clone()).collect();

        let mut model = match prior {
            Some(prior) => LinearModel::warm_start(labels, prior),
            None => LinearModel::new(labels),
        };
        model.fit(&examples, self.epochs, self.learning_rate, self.random_seed);
        debug!(
            epochs = self.epochs,
            total_epochs = model.epochs_trained,
            accuracy = model.accuracy(&examples),
            "trained intent classifier"
        );
        Ok(model)
    }
}
