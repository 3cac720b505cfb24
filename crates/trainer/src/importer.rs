//! Training data importers.
//!
//! The trainer only ever talks to the [`TrainingDataImporter`] trait. Two
//! implementations are provided: [`InMemoryImporter`] for tests and embedding,
//! and [`FileImporter`] which reads a YAML project layout.

use crate::data::{Domain, Message, ModelConfig, Story, StoryGraph, StoryStep, TrainingData};
use crate::errors::{Result, TrainerError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source of validated, already-parsed training inputs.
pub trait TrainingDataImporter: Send + Sync {
    fn get_domain(&self) -> Result<Domain>;

    fn get_stories(&self) -> Result<StoryGraph>;

    /// NLU examples plus the end-to-end user texts found in stories.
    fn get_nlu_data(&self) -> Result<TrainingData>;

    fn get_config(&self) -> Result<ModelConfig>;
}

/// Importer over values held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryImporter {
    pub config: ModelConfig,
    pub domain: Domain,
    pub stories: StoryGraph,
    pub nlu: TrainingData,
}

impl InMemoryImporter {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_domain(mut self, domain: Domain) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_stories(mut self, stories: StoryGraph) -> Self {
        self.stories = stories;
        self
    }

    pub fn with_nlu(mut self, nlu: TrainingData) -> Self {
        self.nlu = nlu;
        self
    }
}

impl TrainingDataImporter for InMemoryImporter {
    fn get_domain(&self) -> Result<Domain> {
        Ok(self.domain.clone())
    }

    fn get_stories(&self) -> Result<StoryGraph> {
        Ok(self.stories.clone())
    }

    fn get_nlu_data(&self) -> Result<TrainingData> {
        Ok(self.nlu.clone().with_e2e_from(&self.stories))
    }

    fn get_config(&self) -> Result<ModelConfig> {
        Ok(self.config.clone())
    }
}

/// Which parts of the training files a [`FileImporter`] exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataScope {
    #[default]
    All,
    /// Stories only; NLU blocks are ignored.
    CoreOnly,
    /// NLU blocks only; stories are ignored.
    NluOnly,
}

#[derive(Debug, Default, Deserialize)]
struct TrainingFile {
    #[serde(default)]
    nlu: Vec<IntentBlock>,
    #[serde(default)]
    stories: Vec<StoryBlock>,
}

#[derive(Debug, Deserialize)]
struct IntentBlock {
    intent: String,
    #[serde(default)]
    examples: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StoryBlock {
    story: String,
    #[serde(default)]
    steps: Vec<StepBlock>,
}

#[derive(Debug, Deserialize)]
struct StepBlock {
    intent: Option<String>,
    user: Option<String>,
    action: Option<String>,
}

impl StepBlock {
    fn into_step(self, story: &str, idx: usize) -> Result<StoryStep> {
        match (self.intent, self.user, self.action) {
            (Some(intent), None, None) => Ok(StoryStep::Intent(intent)),
            (None, Some(text), None) => Ok(StoryStep::User(text)),
            (None, None, Some(action)) => Ok(StoryStep::Action(action)),
            _ => Err(TrainerError::Data(format!(
                "step {idx} of story '{story}' must set exactly one of 'intent', 'user' or 'action'"
            ))),
        }
    }
}

/// Importer reading YAML files from disk.
///
/// `data_paths` may name files or directories; directories are searched
/// recursively for `*.yml` / `*.yaml` files, visited in sorted order.
#[derive(Debug, Clone)]
pub struct FileImporter {
    config_path: PathBuf,
    domain_path: Option<PathBuf>,
    data_paths: Vec<PathBuf>,
    scope: DataScope,
}

impl FileImporter {
    pub fn new(config_path: impl Into<PathBuf>, domain_path: Option<PathBuf>, data_paths: Vec<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            domain_path,
            data_paths,
            scope: DataScope::All,
        }
    }

    pub fn with_scope(mut self, scope: DataScope) -> Self {
        self.scope = scope;
        self
    }

    fn training_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for path in &self.data_paths {
            if path.is_dir() {
                collect_yaml_files(path, &mut files)?;
            } else if path.is_file() {
                files.push(path.clone());
            } else {
                return Err(TrainerError::Data(format!(
                    "training data path '{}' does not exist",
                    path.display()
                )));
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn load_training_files(&self) -> Result<Vec<TrainingFile>> {
        let mut parsed = Vec::new();
        for path in self.training_files()? {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                continue;
            }
            let file: TrainingFile = serde_yaml::from_str(&content).map_err(|err| {
                TrainerError::Data(format!("failed to parse '{}': {err}", path.display()))
            })?;
            debug!(path = %path.display(), intents = file.nlu.len(), stories = file.stories.len(), "loaded training file");
            parsed.push(file);
        }
        Ok(parsed)
    }
}

fn collect_yaml_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_yaml_files(&path, files)?;
        } else if matches!(path.extension().and_then(|ext| ext.to_str()), Some("yml" | "yaml")) {
            files.push(path);
        }
    }
    Ok(())
}

impl TrainingDataImporter for FileImporter {
    fn get_domain(&self) -> Result<Domain> {
        let Some(path) = self.domain_path.as_ref().filter(|path| path.is_file()) else {
            debug!("no domain file found, using an empty domain");
            return Ok(Domain::default());
        };
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Domain::default());
        }
        Ok(serde_yaml::from_str(&content)?)
    }

    fn get_stories(&self) -> Result<StoryGraph> {
        if self.scope == DataScope::NluOnly {
            return Ok(StoryGraph::default());
        }
        let mut stories = Vec::new();
        for file in self.load_training_files()? {
            for block in file.stories {
                let steps = block
                    .steps
                    .into_iter()
                    .enumerate()
                    .map(|(idx, step)| step.into_step(&block.story, idx))
                    .collect::<Result<Vec<_>>>()?;
                stories.push(Story {
                    name: block.story,
                    steps,
                });
            }
        }
        Ok(StoryGraph::new(stories))
    }

    fn get_nlu_data(&self) -> Result<TrainingData> {
        let stories = self.get_stories()?;
        if self.scope == DataScope::CoreOnly {
            return Ok(TrainingData::default().with_e2e_from(&stories));
        }
        let mut examples = Vec::new();
        for file in self.load_training_files()? {
            for block in file.nlu {
                examples.extend(
                    block
                        .examples
                        .iter()
                        .map(|example| Message::from_annotated(example, Some(&block.intent))),
                );
            }
        }
        Ok(TrainingData::new(examples).with_e2e_from(&stories))
    }

    fn get_config(&self) -> Result<ModelConfig> {
        let content = fs::read_to_string(&self.config_path).map_err(|err| {
            TrainerError::Config(format!(
                "could not read model configuration '{}': {err}",
                self.config_path.display()
            ))
        })?;
        if content.trim().is_empty() {
            return Ok(ModelConfig::default());
        }
        Ok(serde_yaml::from_str(&content)?)
    }
}
