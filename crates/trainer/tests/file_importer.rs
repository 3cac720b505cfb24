//! Reading projects from YAML files on disk.

use parley_trainer::{
    DataScope, FileImporter, ModelTrainer, StoryStep, TrainerError, TrainingDataImporter, TrainingRequest,
};
use parley_engine::{DirectoryArchiveIndex, MemoryTrainingCache};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CONFIG: &str = r#"
recipe: default.v1
language: en
pipeline:
  - name: WhitespaceTokenizer
  - name: CountVectorsFeaturizer
    min_df: 1
  - name: LinearIntentClassifier
    epochs: 15
policies:
  - name: MemoizationPolicy
    max_history: 3
  - name: TransitionPolicy
"#;

const DOMAIN: &str = r#"
intents:
  - greet
  - inform
entities:
  - city
actions:
  - utter_greet
responses:
  utter_greet:
    - text: "Hey there!"
"#;

const NLU: &str = r#"
nlu:
  - intent: greet
    examples:
      - hello
      - hi there
  - intent: inform
    examples:
      - I live in [Berlin](city)
"#;

const STORIES: &str = r#"
stories:
  - story: happy path
    steps:
      - intent: greet
      - action: utter_greet
  - story: raw text
    steps:
      - user: good evening
      - action: utter_greet
"#;

struct Project {
    dir: tempfile::TempDir,
}

impl Project {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("config.yml"), CONFIG).unwrap();
        fs::write(root.join("domain.yml"), DOMAIN).unwrap();
        fs::create_dir_all(root.join("data/nested")).unwrap();
        fs::write(root.join("data/nlu.yml"), NLU).unwrap();
        fs::write(root.join("data/nested/stories.yaml"), STORIES).unwrap();
        fs::write(root.join("data/notes.txt"), "not training data").unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn importer(&self) -> FileImporter {
        FileImporter::new(
            self.root().join("config.yml"),
            Some(self.root().join("domain.yml")),
            vec![self.root().join("data")],
        )
    }
}

#[test]
fn reads_a_project_directory() {
    let project = Project::new();
    let importer = project.importer();

    let config = importer.get_config().unwrap();
    assert_eq!(config.recipe.as_deref(), Some("default.v1"));
    assert_eq!(config.pipeline.len(), 3);
    assert_eq!(config.pipeline[2].params["epochs"], serde_json::json!(15));

    let domain = importer.get_domain().unwrap();
    assert_eq!(domain.intents, vec!["greet", "inform"]);
    assert_eq!(domain.responses["utter_greet"][0].text, "Hey there!");

    let stories = importer.get_stories().unwrap();
    assert_eq!(stories.stories.len(), 2);
    assert_eq!(stories.stories[1].steps[0], StoryStep::User("good evening".into()));

    let nlu = importer.get_nlu_data().unwrap();
    assert_eq!(nlu.examples.len(), 4);
    let berlin = &nlu.examples[2];
    assert_eq!(berlin.text, "I live in Berlin");
    assert_eq!(berlin.entities[0].entity, "city");
    assert_eq!((berlin.entities[0].start, berlin.entities[0].end), (10, 16));
    assert!(nlu.has_e2e_examples());
}

#[test]
fn scopes_hide_the_other_half() {
    let project = Project::new();

    let core = project.importer().with_scope(DataScope::CoreOnly);
    assert_eq!(core.get_stories().unwrap().stories.len(), 2);
    let nlu = core.get_nlu_data().unwrap();
    assert!(nlu.contains_no_pure_nlu_data());
    assert_eq!(nlu.examples.len(), 1);

    let nlu_only = project.importer().with_scope(DataScope::NluOnly);
    assert!(nlu_only.get_stories().unwrap().is_empty());
    assert_eq!(nlu_only.get_nlu_data().unwrap().examples.len(), 3);
}

#[test]
fn missing_domain_is_empty() {
    let project = Project::new();
    let importer = FileImporter::new(
        project.root().join("config.yml"),
        Some(project.root().join("nope.yml")),
        vec![project.root().join("data/nlu.yml")],
    );
    assert!(importer.get_domain().unwrap().is_empty());
    assert!(importer.get_stories().unwrap().is_empty());
}

#[test]
fn malformed_inputs_are_reported() {
    let project = Project::new();
    fs::write(
        project.root().join("data/bad.yml"),
        "stories:\n  - story: broken\n    steps:\n      - intent: greet\n        action: utter_greet\n",
    )
    .unwrap();
    let err = project.importer().get_stories().unwrap_err();
    assert!(matches!(&err, TrainerError::Data(message) if message.contains("broken")), "{err}");

    let missing = FileImporter::new(project.root().join("absent.yml"), None, Vec::new());
    assert!(matches!(missing.get_config(), Err(TrainerError::Config(_))));

    let no_data = FileImporter::new(
        project.root().join("config.yml"),
        None,
        vec![PathBuf::from("/definitely/not/here")],
    );
    assert!(matches!(no_data.get_nlu_data(), Err(TrainerError::Data(_))));
}

#[test]
fn trains_from_files_into_a_directory() {
    let project = Project::new();
    let models = project.root().join("models");
    let trainer = ModelTrainer::new(
        Arc::new(DirectoryArchiveIndex::new(&models)),
        Arc::new(MemoryTrainingCache::new()),
    );

    let first = trainer.train(&project.importer(), &TrainingRequest::default()).unwrap();
    let archive = first.model.unwrap();
    assert_eq!(archive.path().parent(), Some(models.as_path()));

    let second = trainer.train(&project.importer(), &TrainingRequest::default()).unwrap();
    assert_eq!(second.model, Some(archive));
    assert_eq!(DirectoryArchiveIndex::new(&models).list().unwrap().len(), 1);
}
