//! Multi-class perceptron shared by the intent classifier and the transition
//! policy.
//!
//! Weights are fixed-point integers (`SCALE` = 1.0) so training is exactly
//! reproducible across platforms and the persisted model is canonical JSON.

use crate::deterministic::epoch_order;
use anyhow::Context;
use parley_engine::serialization::canonical_json_bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Fixed-point scale: 1.0 = 1_000_000
pub const SCALE: i64 = 1_000_000;

/// Sparse feature counts with the expected label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelledExample {
    pub features: BTreeMap<String, i64>,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearModel {
    /// Sorted, unique.
    pub labels: Vec<String>,
    pub weights: BTreeMap<String, BTreeMap<String, i64>>,
    pub bias: BTreeMap<String, i64>,
    pub epochs_trained: u64,
}

impl LinearModel {
    pub fn new(labels: impl IntoIterator<Item = String>) -> Self {
        let labels: BTreeSet<String> = labels.into_iter().collect();
        Self {
            labels: labels.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Start from the weights of `prior` for every label both models share.
    pub fn warm_start(labels: impl IntoIterator<Item = String>, prior: &LinearModel) -> Self {
        let mut model = Self::new(labels);
        for label in &model.labels {
            if let Some(weights) = prior.weights.get(label) {
                model.weights.insert(label.clone(), weights.clone());
            }
            if let Some(bias) = prior.bias.get(label) {
                model.bias.insert(label.clone(), *bias);
            }
        }
        model.epochs_trained = prior.epochs_trained;
        model
    }

    pub fn score(&self, label: &str, features: &BTreeMap<String, i64>) -> i64 {
        let bias = self.bias.get(label).copied().unwrap_or(0);
        let Some(weights) = self.weights.get(label) else {
            return bias;
        };
        features.iter().fold(bias, |acc, (feature, count)| {
            let weight = weights.get(feature).copied().unwrap_or(0);
            acc.saturating_add(weight.saturating_mul(*count))
        })
    }

    /// Highest scoring label; ties go to the label that sorts first.
    pub fn predict(&self, features: &BTreeMap<String, i64>) -> Option<&str> {
        let mut best: Option<(&str, i64)> = None;
        for label in &self.labels {
            let score = self.score(label, features);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((label, score));
            }
        }
        best.map(|(label, _)| label)
    }

    fn update(&mut self, label: &str, features: &BTreeMap<String, i64>, step: i64) {
        let weights = self.weights.entry(label.to_string()).or_default();
        for (feature, count) in features {
            let weight = weights.entry(feature.clone()).or_insert(0);
            *weight = weight.saturating_add(step.saturating_mul(*count));
        }
        weights.retain(|_, weight| *weight != 0);
        let bias = self.bias.entry(label.to_string()).or_insert(0);
        *bias = bias.saturating_add(step);
    }

    /// Run `epochs` perceptron passes. Examples whose label the model does not
    /// know are skipped.
    pub fn fit(&mut self, examples: &[LabelledExample], epochs: u64, learning_rate: f64, seed: i64) {
        let step = ((learning_rate * SCALE as f64).round() as i64).max(1);
        let known: BTreeSet<String> = self.labels.iter().cloned().collect();

        for epoch in 0..epochs {
            for idx in epoch_order(examples.len(), seed, self.epochs_trained + epoch) {
                let example = &examples[idx];
                if !known.contains(&example.label) {
                    continue;
                }
                let predicted = self.predict(&example.features).map(str::to_string);
                match predicted {
                    Some(predicted) if predicted == example.label => {}
                    Some(predicted) => {
                        self.update(&example.label, &example.features, step);
                        self.update(&predicted, &example.features, -step);
                    }
                    None => self.update(&example.label, &example.features, step),
                }
            }
        }
        self.epochs_trained += epochs;
    }

    /// Fraction of correctly predicted examples, scaled by `SCALE`.
    pub fn accuracy(&self, examples: &[LabelledExample]) -> i64 {
        if examples.is_empty() {
            return 0;
        }
        let correct = examples
            .iter()
            .filter(|example| self.predict(&example.features) == Some(example.label.as_str()))
            .count() as i64;
        correct * SCALE / examples.len() as i64
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        fs::write(path, canonical_json_bytes(self)?)
            .with_context(|| format!("failed to write model to {}", path.display()))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed to read model from {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("malformed model in {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(features: &[(&str, i64)], label: &str) -> LabelledExample {
        LabelledExample {
            features: features.iter().map(|(f, c)| (f.to_string(), *c)).collect(),
            label: label.to_string(),
        }
    }

    fn separable() -> Vec<LabelledExample> {
        vec![
            example(&[("hello", 1)], "greet"),
            example(&[("hi", 1)], "greet"),
            example(&[("bye", 1)], "goodbye"),
            example(&[("later", 1), ("bye", 1)], "goodbye"),
        ]
    }

    #[test]
    fn learns_separable_data() {
        let mut model = LinearModel::new(vec!["greet".to_string(), "goodbye".to_string()]);
        model.fit(&separable(), 10, 0.1, 42);
        assert_eq!(model.accuracy(&separable()), SCALE);
        assert_eq!(model.predict(&example(&[("hello", 1)], "").features), Some("greet"));
        assert_eq!(model.epochs_trained, 10);
    }

    #[test]
    fn training_is_reproducible() {
        let labels = vec!["greet".to_string(), "goodbye".to_string()];
        let mut a = LinearModel::new(labels.clone());
        let mut b = LinearModel::new(labels);
        a.fit(&separable(), 5, 0.1, 7);
        b.fit(&separable(), 5, 0.1, 7);
        assert_eq!(a, b);
        assert_eq!(canonical_json_bytes(&a).unwrap(), canonical_json_bytes(&b).unwrap());
    }

    #[test]
    fn ties_go_to_first_label() {
        let model = LinearModel::new(vec!["b".to_string(), "a".to_string()]);
        assert_eq!(model.predict(&BTreeMap::new()), Some("a"));
        assert_eq!(LinearModel::default().predict(&BTreeMap::new()), None);
    }

    #[test]
    fn warm_start_keeps_shared_labels() {
        let mut prior = LinearModel::new(vec!["greet".to_string(), "goodbye".to_string()]);
        prior.fit(&separable(), 3, 0.1, 42);

        let model = LinearModel::warm_start(vec!["greet".to_string(), "affirm".to_string()], &prior);
        assert_eq!(model.labels, vec!["affirm", "greet"]);
        assert_eq!(model.weights.get("greet"), prior.weights.get("greet"));
        assert!(!model.weights.contains_key("goodbye"));
        assert_eq!(model.epochs_trained, 3);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let mut model = LinearModel::new(vec!["greet".to_string(), "goodbye".to_string()]);
        model.fit(&separable(), 2, 0.5, 1);
        model.save(&path).unwrap();
        assert_eq!(LinearModel::load(&path).unwrap(), model);
        assert!(LinearModel::load(&dir.path().join("missing.json")).is_err());
    }
}
