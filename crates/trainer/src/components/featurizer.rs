//! Bag-of-words count featurizer.

use super::tokenizer::{TokenizedMessage, CLS_TOKEN};
use super::{param_bool, param_u64};
use parley_engine::serialization::canonical_json_bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

pub const VOCABULARY_FILE: &str = "vocabulary.json";

/// Sparse term counts of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// `(vocabulary index, count)`, sorted by index.
    pub counts: Vec<(usize, u32)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub vocabulary: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl FeatureMatrix {
    /// Counts of a row keyed by term.
    pub fn named_counts(&self, row: &FeatureRow) -> BTreeMap<String, i64> {
        row.counts
            .iter()
            .filter_map(|(idx, count)| self.vocabulary.get(*idx).map(|term| (term.clone(), i64::from(*count))))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountVectorsFeaturizer {
    pub lowercase: bool,
    /// Minimum number of messages a term must occur in.
    pub min_df: u64,
}

impl CountVectorsFeaturizer {
    pub fn from_config(config: &BTreeMap<String, Value>) -> anyhow::Result<Self> {
        Ok(Self {
            lowercase: param_bool(config, "lowercase")?,
            min_df: param_u64(config, "min_df")?,
        })
    }

    fn terms<'a>(&'a self, message: &'a TokenizedMessage) -> impl Iterator<Item = String> + 'a {
        message
            .tokens
            .iter()
            .filter(|token| token.text != CLS_TOKEN)
            .map(|token| {
                if self.lowercase {
                    token.text.to_lowercase()
                } else {
                    token.text.clone()
                }
            })
    }

    pub fn train(&self, messages: &[TokenizedMessage]) -> FeatureMatrix {
        let mut document_frequency: BTreeMap<String, u64> = BTreeMap::new();
        for message in messages {
            let unique: BTreeSet<String> = self.terms(message).collect();
            for term in unique {
                *document_frequency.entry(term).or_default() += 1;
            }
        }

        let vocabulary: Vec<String> = document_frequency
            .into_iter()
            .filter(|(_, df)| *df >= self.min_df)
            .map(|(term, _)| term)
            .collect();
        let index: BTreeMap<&str, usize> = vocabulary
            .iter()
            .enumerate()
            .map(|(idx, term)| (term.as_str(), idx))
            .collect();

        let rows = messages
            .iter()
            .map(|message| {
                let mut counts: BTreeMap<usize, u32> = BTreeMap::new();
                for term in self.terms(message) {
                    if let Some(idx) = index.get(term.as_str()) {
                        *counts.entry(*idx).or_default() += 1;
                    }
                }
                FeatureRow {
                    intent: message.intent.clone(),
                    counts: counts.into_iter().collect(),
                }
            })
            .collect();

        FeatureMatrix { vocabulary, rows }
    }

    pub fn persist(matrix: &FeatureMatrix, dir: &Path) -> anyhow::Result<()> {
        fs::write(dir.join(VOCABULARY_FILE), canonical_json_bytes(&matrix.vocabulary)?)?;
        Ok(())
    }
}
