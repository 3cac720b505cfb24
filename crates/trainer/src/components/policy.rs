//! Dialogue policies trained on stories.

use super::effective_epochs;
use super::linear::{LabelledExample, LinearModel};
use super::{param_f64, param_u64};
use crate::data::{Domain, Story, StoryGraph, StoryStep};
use anyhow::Context;
use parley_engine::serialization::canonical_json_bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::debug;

pub const MEMO_FILE: &str = "memo.json";
pub const MODEL_FILE: &str = "model.json";

fn event_key(step: &StoryStep) -> String {
    match step {
        StoryStep::Intent(intent) => format!("intent:{intent}"),
        StoryStep::User(text) => format!("user:{text}"),
        StoryStep::Action(action) => format!("action:{action}"),
    }
}

/// `(history, action)` for every bot action of a story; history holds the
/// preceding events, oldest first, at most `max_history` of them.
fn action_turns(story: &Story, max_history: usize) -> Vec<(Vec<String>, String)> {
    let events: Vec<String> = story.steps.iter().map(event_key).collect();
    story
        .steps
        .iter()
        .enumerate()
        .filter_map(|(idx, step)| match step {
            StoryStep::Action(action) => {
                let start = idx.saturating_sub(max_history);
                Some((events[start..idx].to_vec(), action.clone()))
            }
            _ => None,
        })
        .collect()
}

/// Exact-match lookup from recent history to the next action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoTable {
    pub max_history: u64,
    pub lookup: BTreeMap<String, String>,
}

impl MemoTable {
    pub fn state_key(history: &[String]) -> String {
        history.join(" | ")
    }

    pub fn predict(&self, history: &[String]) -> Option<&str> {
        let start = history.len().saturating_sub(self.max_history as usize);
        self.lookup
            .get(&Self::state_key(&history[start..]))
            .map(String::as_str)
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        fs::write(dir.join(MEMO_FILE), canonical_json_bytes(self)?).context("failed to write memo table")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoizationPolicy {
    pub max_history: u64,
}

impl MemoizationPolicy {
    pub fn from_config(config: &BTreeMap<String, Value>) -> anyhow::Result<Self> {
        Ok(Self {
            max_history: param_u64(config, "max_history")?,
        })
    }

    /// Histories that lead to different actions in different stories are
    /// dropped.
    pub fn train(&self, stories: &StoryGraph) -> MemoTable {
        let mut lookup: BTreeMap<String, String> = BTreeMap::new();
        let mut ambiguous: BTreeSet<String> = BTreeSet::new();

        for story in &stories.stories {
            for (history, action) in action_turns(story, self.max_history as usize) {
                let key = MemoTable::state_key(&history);
                if ambiguous.contains(&key) {
                    continue;
                }
                match lookup.get(&key) {
                    Some(known) if *known != action => {
                        lookup.remove(&key);
                        ambiguous.insert(key);
                    }
                    Some(_) => {}
                    None => {
                        lookup.insert(key, action);
                    }
                }
            }
        }

        debug!(states = lookup.len(), dropped = ambiguous.len(), "memorized stories");
        MemoTable {
            max_history: self.max_history,
            lookup,
        }
    }
}

/// Linear next-action policy over positional history features.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPolicy {
    pub epochs: u64,
    pub max_history: u64,
    pub learning_rate: f64,
    pub random_seed: i64,
}

impl TransitionPolicy {
    pub fn from_config(config: &BTreeMap<String, Value>) -> anyhow::Result<Self> {
        Ok(Self {
            epochs: effective_epochs(config)?,
            max_history: param_u64(config, "max_history")?,
            learning_rate: param_f64(config, "learning_rate")?,
            random_seed: param_u64(config, "random_seed")? as i64,
        })
    }

    /// Features `"{k}:{event}"` where `k` counts back from the most recent
    /// event, starting at 1.
    pub fn featurize(history: &[String]) -> BTreeMap<String, i64> {
        history
            .iter()
            .rev()
            .enumerate()
            .map(|(k, event)| (format!("{}:{event}", k + 1), 1))
            .collect()
    }

    pub fn examples(&self, stories: &StoryGraph) -> Vec<LabelledExample> {
        stories
            .stories
            .iter()
            .flat_map(|story| action_turns(story, self.max_history as usize))
            .map(|(history, action)| LabelledExample {
                features: Self::featurize(&history),
                label: action,
            })
            .collect()
    }

    /// Labels are every action of the domain plus those the stories use.
    pub fn train(&self, stories: &StoryGraph, domain: &Domain, prior: Option<&LinearModel>) -> LinearModel {
        let examples = self.examples(stories);
        let labels: BTreeSet<String> = domain
            .actions
            .iter()
            .cloned()
            .chain(examples.iter().map(|example| example.label.clone()))
            .collect();

        let mut model = match prior {
            Some(prior) => LinearModel::warm_start(labels, prior),
            None => LinearModel::new(labels),
        };
        model.fit(&examples, self.epochs, self.learning_rate, self.random_seed);
        debug!(
            examples = examples.len(),
            epochs = self.epochs,
            accuracy = model.accuracy(&examples),
            "trained transition policy"
        );
        model
    }
}
