//! Typed training inputs: domain, stories, NLU examples and model config.
//!
//! These are the already-parsed representations handed out by a
//! [`TrainingDataImporter`](crate::importer::TrainingDataImporter). Their
//! serialized form is what gets fingerprinted, so field order and collection
//! types are kept deterministic (`Vec` in source order, `BTreeMap` for maps).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Response templates keyed by response name (e.g. `utter_greet`).
pub type Responses = BTreeMap<String, Vec<ResponseVariation>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseVariation {
    pub text: String,
}

impl ResponseVariation {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// The assistant's universe: what users can say and what the bot can do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    #[serde(default)]
    pub intents: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    /// Slot name -> slot type.
    #[serde(default)]
    pub slots: BTreeMap<String, String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub responses: Responses,
}

impl Domain {
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
            && self.entities.is_empty()
            && self.slots.is_empty()
            && self.actions.is_empty()
            && self.responses.is_empty()
    }

    /// Copy of the domain with the response templates removed.
    pub fn without_responses(&self) -> Domain {
        Domain {
            responses: Responses::new(),
            ..self.clone()
        }
    }
}

/// One event of a story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStep {
    /// User turn labelled with an intent.
    Intent(String),
    /// User turn given as raw text (end-to-end example).
    User(String),
    /// Bot action.
    Action(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub name: String,
    pub steps: Vec<StoryStep>,
}

/// All stories of a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryGraph {
    pub stories: Vec<Story>,
}

impl StoryGraph {
    pub fn new(stories: Vec<Story>) -> Self {
        Self { stories }
    }

    pub fn is_empty(&self) -> bool {
        self.stories.iter().all(|story| story.steps.is_empty())
    }

    /// Raw user texts used as end-to-end examples.
    pub fn user_texts(&self) -> impl Iterator<Item = &str> {
        self.stories.iter().flat_map(|story| {
            story.steps.iter().filter_map(|step| match step {
                StoryStep::User(text) => Some(text.as_str()),
                _ => None,
            })
        })
    }
}

/// Entity annotation; offsets are character positions in the message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub start: usize,
    pub end: usize,
    pub value: String,
    pub entity: String,
}

/// A user message. Messages without an intent come from end-to-end stories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,
}

static ENTITY_ANNOTATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[(?P<value>[^\]]+)\]\((?P<entity>[^)]+)\)").expect("valid entity regex")
});

impl Message {
    pub fn new(text: impl Into<String>, intent: Option<&str>) -> Self {
        Self {
            text: text.into(),
            intent: intent.map(str::to_string),
            entities: Vec::new(),
        }
    }

    /// Parse inline `[value](entity)` annotations out of an example.
    pub fn from_annotated(annotated: &str, intent: Option<&str>) -> Self {
        let mut text = String::with_capacity(annotated.len());
        let mut entities = Vec::new();
        let mut last = 0;

        for caps in ENTITY_ANNOTATION.captures_iter(annotated) {
            let (Some(whole), Some(value), Some(entity)) =
                (caps.get(0), caps.name("value"), caps.name("entity"))
            else {
                continue;
            };
            text.push_str(&annotated[last..whole.start()]);
            let start = text.chars().count();
            text.push_str(value.as_str());
            entities.push(Entity {
                start,
                end: start + value.as_str().chars().count(),
                value: value.as_str().to_string(),
                entity: entity.as_str().trim().to_string(),
            });
            last = whole.end();
        }
        text.push_str(&annotated[last..]);

        Self {
            text,
            intent: intent.map(str::to_string),
            entities,
        }
    }

    /// A labelled example usable for intent classification.
    pub fn is_pure_nlu(&self) -> bool {
        self.intent.is_some() && !self.text.trim().is_empty()
    }
}

/// NLU training examples, including end-to-end texts from stories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingData {
    pub examples: Vec<Message>,
}

impl TrainingData {
    pub fn new(examples: Vec<Message>) -> Self {
        Self { examples }
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn has_e2e_examples(&self) -> bool {
        self.examples.iter().any(|message| message.intent.is_none())
    }

    pub fn contains_no_pure_nlu_data(&self) -> bool {
        !self.examples.iter().any(Message::is_pure_nlu)
    }

    pub fn pure_examples(&self) -> impl Iterator<Item = &Message> {
        self.examples.iter().filter(|message| message.is_pure_nlu())
    }

    /// Sorted intent and entity labels; changes here break fine-tuning.
    pub fn labels(&self) -> BTreeSet<String> {
        let mut labels = BTreeSet::new();
        for message in &self.examples {
            if let Some(intent) = &message.intent {
                labels.insert(format!("intent:{intent}"));
            }
            for entity in &message.entities {
                labels.insert(format!("entity:{}", entity.entity));
            }
        }
        labels
    }

    /// Append the end-to-end user texts of `stories` as intent-less messages.
    pub fn with_e2e_from(mut self, stories: &StoryGraph) -> Self {
        self.examples
            .extend(stories.user_texts().map(|text| Message::new(text, None)));
        self
    }
}

/// Configuration of one pipeline component or policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl ComponentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

fn default_language() -> String {
    "en".to_string()
}

/// Model configuration: recipe, language, NLU pipeline and dialogue policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub pipeline: Vec<ComponentConfig>,
    #[serde(default)]
    pub policies: Vec<ComponentConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            recipe: None,
            language: default_language(),
            pipeline: Vec::new(),
            policies: Vec::new(),
        }
    }
}

impl ModelConfig {
    /// Settings shared by every stage.
    pub fn general_section(&self) -> Value {
        serde_json::json!({
            "recipe": self.recipe,
            "language": self.language,
        })
    }

    pub fn core_section(&self) -> Value {
        serde_json::json!({ "policies": self.policies })
    }

    pub fn nlu_section(&self) -> Value {
        serde_json::json!({
            "language": self.language,
            "pipeline": self.pipeline,
        })
    }

    /// The whole config with every `epochs` parameter removed.
    pub fn without_epochs(&self) -> ModelConfig {
        let strip = |components: &[ComponentConfig]| {
            components
                .iter()
                .map(|component| {
                    let mut component = component.clone();
                    component.params.remove("epochs");
                    component
                })
                .collect()
        };
        ModelConfig {
            pipeline: strip(&self.pipeline),
            policies: strip(&self.policies),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_entity_annotations() {
        let message = Message::from_annotated("fly to [Berlin](city) on [monday](day)", Some("book"));
        assert_eq!(message.text, "fly to Berlin on monday");
        assert_eq!(message.entities.len(), 2);
        assert_eq!(message.entities[0].start, 7);
        assert_eq!(message.entities[0].end, 13);
        assert_eq!(message.entities[1].entity, "day");
        assert_eq!(&message.text[17..23], "monday");
    }

    #[test]
    fn e2e_detection() {
        let stories = StoryGraph::new(vec![Story {
            name: "e2e".into(),
            steps: vec![StoryStep::User("hello there".into()), StoryStep::Action("utter_greet".into())],
        }]);
        let nlu = TrainingData::default().with_e2e_from(&stories);
        assert!(nlu.has_e2e_examples());
        assert!(nlu.contains_no_pure_nlu_data());

        let nlu = TrainingData::new(vec![Message::new("hi", Some("greet"))]);
        assert!(!nlu.has_e2e_examples());
        assert!(!nlu.contains_no_pure_nlu_data());
    }

    #[test]
    fn labels_are_sorted_and_unique() {
        let nlu = TrainingData::new(vec![
            Message::from_annotated("in [Paris](city)", Some("weather")),
            Message::new("bye", Some("goodbye")),
            Message::new("ciao", Some("goodbye")),
        ]);
        let labels: Vec<_> = nlu.labels().into_iter().collect();
        assert_eq!(labels, vec!["entity:city", "intent:goodbye", "intent:weather"]);
    }

    #[test]
    fn epochs_are_stripped_everywhere() {
        let config = ModelConfig {
            pipeline: vec![ComponentConfig::new("LinearIntentClassifier").with_param("epochs", json!(10))],
            policies: vec![ComponentConfig::new("TransitionPolicy")
                .with_param("epochs", json!(5))
                .with_param("max_history", json!(3))],
            ..ModelConfig::default()
        };
        let stripped = config.without_epochs();
        assert!(stripped.pipeline[0].params.is_empty());
        assert_eq!(stripped.policies[0].params.len(), 1);
    }

    #[test]
    fn domain_emptiness_and_responses() {
        assert!(Domain::default().is_empty());
        let mut domain = Domain {
            intents: vec!["greet".into()],
            ..Domain::default()
        };
        domain
            .responses
            .insert("utter_greet".into(), vec![ResponseVariation::new("Hi!")]);
        assert!(!domain.is_empty());
        assert!(domain.without_responses().responses.is_empty());
        assert_eq!(domain.without_responses().intents, domain.intents);
    }
}
