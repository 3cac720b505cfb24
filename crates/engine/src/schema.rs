//! Graph schema: an immutable DAG of node descriptors.
//!
//! A schema is validated once at construction. Every input edge must point to
//! a node defined earlier in the schema, which makes insertion order a valid
//! topological order, but cycles are still detected explicitly so that the
//! error names a node on the cycle rather than a forward reference.

use crate::errors::{EngineError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// A closed set of component kinds a schema can reference.
pub trait ComponentKind:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stable name of the kind; part of every node fingerprint.
    fn name(&self) -> &str;
}

fn default_true() -> bool {
    true
}

/// Descriptor of one unit of computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaNode<K> {
    /// Stable identifier, unique within the schema.
    pub name: String,
    /// Component resolved at schema-build time.
    pub kind: K,
    /// Canonical configuration passed to the component.
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    /// Input parameter name -> upstream node name.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Whether the caller wants this node's output.
    #[serde(default)]
    pub is_target: bool,
    /// Whether the output may be served from the training cache.
    #[serde(default = "default_true")]
    pub cacheable: bool,
    /// Whether the node writes a resource into model storage.
    #[serde(default)]
    pub persists: bool,
    /// Stage subdirectory holding the node's resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Training node whose persisted resource this node loads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl<K: ComponentKind> SchemaNode<K> {
    pub fn new(name: impl Into<String>, kind: K) -> Self {
        Self {
            name: name.into(),
            kind,
            config: BTreeMap::new(),
            inputs: BTreeMap::new(),
            is_target: false,
            cacheable: true,
            persists: false,
            stage: None,
            resource: None,
        }
    }

    pub fn with_input(mut self, param: impl Into<String>, node: impl Into<String>) -> Self {
        self.inputs.insert(param.into(), node.into());
        self
    }

    pub fn with_config(mut self, config: BTreeMap<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn target(mut self) -> Self {
        self.is_target = true;
        self
    }

    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Mark the node as persisting a resource under `stage`.
    pub fn persisting(mut self, stage: impl Into<String>) -> Self {
        self.persists = true;
        self.stage = Some(stage.into());
        self
    }

    /// Mark the node as loading the resource persisted by `training_node`.
    pub fn loading(mut self, stage: impl Into<String>, training_node: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self.resource = Some(training_node.into());
        self
    }

    /// Relative directory of this node's resource inside model storage.
    pub fn resource_path(&self) -> String {
        let owner = self.resource.as_deref().unwrap_or(&self.name);
        match &self.stage {
            Some(stage) => format!("{stage}/{owner}"),
            None => owner.to_string(),
        }
    }
}

/// Immutable, validated DAG of [`SchemaNode`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSchema<K> {
    nodes: Vec<SchemaNode<K>>,
}

impl<K: ComponentKind> GraphSchema<K> {
    /// Validate and build a schema.
    pub fn new(nodes: Vec<SchemaNode<K>>) -> Result<Self> {
        let schema = Self { nodes };
        schema.validate()?;
        Ok(schema)
    }

    /// Re-check the schema invariants (used after deserialization).
    pub fn validate(&self) -> Result<()> {
        let mut positions: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.name.trim().is_empty() {
                return Err(EngineError::invalid_schema(
                    format!("#{idx}"),
                    "node name must not be empty",
                ));
            }
            if positions.insert(node.name.as_str(), idx).is_some() {
                return Err(EngineError::invalid_schema(&node.name, "duplicate node name"));
            }
        }

        for node in &self.nodes {
            for (param, upstream) in &node.inputs {
                if !positions.contains_key(upstream.as_str()) {
                    return Err(EngineError::invalid_schema(
                        &node.name,
                        format!("input '{param}' references unknown node '{upstream}'"),
                    ));
                }
            }
        }

        if let Some(node) = self.find_cycle(&positions) {
            return Err(EngineError::Cycle { node });
        }

        for (idx, node) in self.nodes.iter().enumerate() {
            for (param, upstream) in &node.inputs {
                if positions[upstream.as_str()] >= idx {
                    return Err(EngineError::invalid_schema(
                        &node.name,
                        format!("input '{param}' references node '{upstream}' which is defined later"),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Iterative three-colour DFS; returns a node that lies on a cycle.
    fn find_cycle(&self, positions: &HashMap<&str, usize>) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        let mut marks = vec![Mark::New; self.nodes.len()];
        for start in 0..self.nodes.len() {
            if marks[start] != Mark::New {
                continue;
            }
            let mut stack: Vec<(usize, Vec<usize>)> = vec![(start, self.upstream_indices(start, positions))];
            marks[start] = Mark::Active;

            while let Some((current, pending)) = stack.last_mut() {
                let current = *current;
                match pending.pop() {
                    Some(next) => match marks[next] {
                        Mark::Active => return Some(self.nodes[next].name.clone()),
                        Mark::New => {
                            marks[next] = Mark::Active;
                            let upstream = self.upstream_indices(next, positions);
                            stack.push((next, upstream));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[current] = Mark::Done;
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    fn upstream_indices(&self, idx: usize, positions: &HashMap<&str, usize>) -> Vec<usize> {
        self.nodes[idx]
            .inputs
            .values()
            .filter_map(|name| positions.get(name.as_str()).copied())
            .collect()
    }

    pub fn nodes(&self) -> &[SchemaNode<K>] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&SchemaNode<K>> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.node(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Names of all nodes flagged as targets, in schema order.
    pub fn target_names(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| node.is_target)
            .map(|node| node.name.clone())
            .collect()
    }

    /// Deterministic topological order (Kahn, ties broken by schema position).
    pub fn topological_order(&self) -> Vec<&SchemaNode<K>> {
        let positions: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.name.as_str(), idx))
            .collect();

        let mut remaining: Vec<usize> = self.nodes.iter().map(|node| node.inputs.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            for upstream in node.inputs.values() {
                dependents[positions[upstream.as_str()]].push(idx);
            }
        }

        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(idx, _)| idx)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(idx) = ready.pop_first() {
            order.push(&self.nodes[idx]);
            for &dependent in &dependents[idx] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }
}
