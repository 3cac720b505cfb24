//! Graph runner: executes a schema in dependency order with caching.
//!
//! A run has three phases:
//!
//! 1. **Fingerprint**: every node gets a key derived from its kind, config,
//!    upstream keys and (for source nodes) the executor's content digest.
//! 2. **Plan**: walk back from the targets. Precomputed outputs and cache
//!    hits stop the walk; every other node reached must execute.
//! 3. **Execute**: ready nodes are dispatched in waves onto a bounded worker
//!    pool. An output is only published to dependents after the node finished
//!    and its cache entry was written. The first failure stops dispatch.

use crate::cache::{CacheEntry, CacheEntryMeta, TrainingCache};
use crate::errors::{EngineError, Result};
use crate::fingerprint::{Fingerprint, NodeKeyMaterial};
use crate::schema::{ComponentKind, GraphSchema, SchemaNode};
use crate::serialization::canonical_json_bytes;
use crate::storage::ModelStorage;
use anyhow::Context;
use rayon::prelude::*;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Performs the actual computation of graph nodes.
pub trait NodeExecutor: Send + Sync {
    type Kind: ComponentKind;
    type Output: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Digest of data a node reads from outside the graph (e.g. training
    /// files). Nodes without external inputs return `None`.
    fn content_fingerprint(&self, _node: &SchemaNode<Self::Kind>) -> anyhow::Result<Option<Fingerprint>> {
        Ok(None)
    }

    /// Run one node.
    fn execute(
        &self,
        node: &SchemaNode<Self::Kind>,
        inputs: &NodeInputs<'_, Self::Output>,
        ctx: &ExecutionContext<'_>,
    ) -> anyhow::Result<Self::Output>;
}

/// Materialized outputs of a node's upstream edges, keyed by parameter name.
pub struct NodeInputs<'a, O> {
    values: BTreeMap<&'a str, &'a O>,
}

impl<'a, O> NodeInputs<'a, O> {
    pub fn get(&self, param: &str) -> Option<&'a O> {
        self.values.get(param).copied()
    }

    pub fn require(&self, param: &str) -> anyhow::Result<&'a O> {
        self.get(param)
            .with_context(|| format!("missing required input '{param}'"))
    }
}

/// Per-node execution context.
pub struct ExecutionContext<'a> {
    pub node_name: &'a str,
    pub fingerprint: Fingerprint,
    /// Directory the node must write its resource into (persisting nodes only).
    pub resource_dir: Option<PathBuf>,
    pub storage: &'a ModelStorage,
}

impl ExecutionContext<'_> {
    pub fn require_resource_dir(&self) -> anyhow::Result<&PathBuf> {
        self.resource_dir
            .as_ref()
            .with_context(|| format!("node '{}' is not declared as persisting", self.node_name))
    }
}

/// What to compute and what is already known.
#[derive(Debug, Clone)]
pub struct RunRequest<O> {
    /// Nodes whose outputs are wanted; `None` means the schema's targets.
    pub targets: Option<Vec<String>>,
    /// Outputs supplied by the caller instead of being computed.
    pub precomputed: BTreeMap<String, O>,
}

impl<O> Default for RunRequest<O> {
    fn default() -> Self {
        Self {
            targets: None,
            precomputed: BTreeMap::new(),
        }
    }
}

impl<O> RunRequest<O> {
    pub fn targets(targets: Vec<String>) -> Self {
        Self {
            targets: Some(targets),
            precomputed: BTreeMap::new(),
        }
    }

    pub fn with_precomputed(mut self, node: impl Into<String>, output: O) -> Self {
        self.precomputed.insert(node.into(), output);
        self
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport<O> {
    /// Outputs of the requested targets.
    pub outputs: BTreeMap<String, O>,
    /// Fingerprint of every node in the schema.
    pub fingerprints: BTreeMap<String, Fingerprint>,
    /// Nodes that actually executed, in completion order.
    pub executed: Vec<String>,
    /// Nodes served from the cache.
    pub cache_hits: Vec<String>,
    /// Nodes supplied by the caller.
    pub precomputed: Vec<String>,
}

/// Cooperative cancellation flag shared with a runner.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Plan<O> {
    Precomputed,
    Cached(O),
    Execute,
}

/// Executes graph schemas against a cache using a bounded worker pool.
pub struct GraphRunner {
    cache: Arc<dyn TrainingCache>,
    pool: rayon::ThreadPool,
    cancel: CancellationToken,
}

impl GraphRunner {
    pub fn new(cache: Arc<dyn TrainingCache>, num_workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|idx| format!("parley-node-{idx}"))
            .build()
            .map_err(|err| EngineError::WorkerPool(err.to_string()))?;
        Ok(Self {
            cache,
            pool,
            cancel: CancellationToken::default(),
        })
    }

    /// Share an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops dispatching further nodes when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &Arc<dyn TrainingCache> {
        &self.cache
    }

    /// Compute the fingerprint of every node without executing anything.
    pub fn fingerprint<E: NodeExecutor>(
        &self,
        schema: &GraphSchema<E::Kind>,
        precomputed: &BTreeMap<String, E::Output>,
        executor: &E,
    ) -> Result<BTreeMap<String, Fingerprint>> {
        let mut fingerprints = BTreeMap::new();
        for node in schema.topological_order() {
            let fingerprint = match precomputed.get(&node.name) {
                Some(output) => Fingerprint::of(output)?,
                None => {
                    let content = executor.content_fingerprint(node).map_err(|source| {
                        EngineError::NodeFailed {
                            node: node.name.clone(),
                            source,
                        }
                    })?;
                    NodeKeyMaterial {
                        kind: node.kind.name(),
                        config: &node.config,
                        inputs: node
                            .inputs
                            .iter()
                            .map(|(param, upstream)| (param.as_str(), fingerprints[upstream]))
                            .collect(),
                        content,
                    }
                    .fingerprint()?
                }
            };
            fingerprints.insert(node.name.clone(), fingerprint);
        }
        Ok(fingerprints)
    }

    /// Run `schema` until the requested targets are materialized.
    #[instrument(skip_all, fields(nodes = schema.len()))]
    pub fn run<E: NodeExecutor>(
        &self,
        schema: &GraphSchema<E::Kind>,
        request: RunRequest<E::Output>,
        executor: &E,
        storage: &ModelStorage,
    ) -> Result<RunReport<E::Output>> {
        let targets = request.targets.unwrap_or_else(|| schema.target_names());
        for name in targets.iter().chain(request.precomputed.keys()) {
            if !schema.contains(name) {
                return Err(EngineError::UnknownTarget(name.clone()));
            }
        }

        let fingerprints = self.fingerprint(schema, &request.precomputed, executor)?;
        let plan = self.plan(schema, &targets, &request.precomputed, &fingerprints, storage);

        let mut report = RunReport {
            outputs: BTreeMap::new(),
            fingerprints,
            executed: Vec::new(),
            cache_hits: Vec::new(),
            precomputed: Vec::new(),
        };
        let mut materialized: BTreeMap<String, E::Output> = request.precomputed;
        let mut pending: Vec<&SchemaNode<E::Kind>> = Vec::new();

        for node in schema.topological_order() {
            match plan.get(&node.name) {
                Some(Plan::Precomputed) => report.precomputed.push(node.name.clone()),
                Some(Plan::Cached(_)) => report.cache_hits.push(node.name.clone()),
                Some(Plan::Execute) => pending.push(node),
                None => {}
            }
        }
        for (name, step) in plan {
            if let Plan::Cached(output) = step {
                materialized.insert(name, output);
            }
        }

        info!(
            execute = pending.len(),
            cached = report.cache_hits.len(),
            precomputed = report.precomputed.len(),
            "planned graph run"
        );

        while !pending.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = pending.into_iter().partition(|node| {
                node.inputs
                    .values()
                    .all(|upstream| materialized.contains_key(upstream))
            });

            let Some(first) = ready.first() else {
                return Err(EngineError::invalid_schema(
                    &blocked[0].name,
                    "inputs can never be materialized",
                ));
            };
            if self.cancel.is_cancelled() {
                warn!(node = %first.name, "graph run cancelled");
                return Err(EngineError::Cancelled(first.name.clone()));
            }

            let results: Vec<(&SchemaNode<E::Kind>, anyhow::Result<E::Output>)> =
                self.pool.install(|| {
                    ready
                        .par_iter()
                        .map(|node| {
                            let fingerprint = report.fingerprints[&node.name];
                            let result =
                                self.execute_node(node, fingerprint, &materialized, executor, storage);
                            (*node, result)
                        })
                        .collect()
                });

            let mut failure = None;
            for (node, result) in results {
                match result {
                    Ok(output) => {
                        materialized.insert(node.name.clone(), output);
                        report.executed.push(node.name.clone());
                    }
                    Err(source) => {
                        error!(node = %node.name, error = %format!("{source:#}"), "node failed");
                        failure.get_or_insert((node.name.clone(), source));
                    }
                }
            }
            if let Some((node, source)) = failure {
                return Err(EngineError::NodeFailed { node, source });
            }
            pending = blocked;
        }

        for target in targets {
            if let Some(output) = materialized.get(&target) {
                report.outputs.insert(target, output.clone());
            }
        }

        info!(
            executed = report.executed.len(),
            cache_hits = report.cache_hits.len(),
            "graph run finished"
        );
        Ok(report)
    }

    fn plan<K: ComponentKind, O: Serialize + DeserializeOwned>(
        &self,
        schema: &GraphSchema<K>,
        targets: &[String],
        precomputed: &BTreeMap<String, O>,
        fingerprints: &BTreeMap<String, Fingerprint>,
        storage: &ModelStorage,
    ) -> HashMap<String, Plan<O>> {
        let mut plan = HashMap::new();
        let mut stack: Vec<String> = targets.iter().rev().cloned().collect();

        while let Some(name) = stack.pop() {
            if plan.contains_key(&name) {
                continue;
            }
            let Some(node) = schema.node(&name) else {
                continue;
            };

            let step = if precomputed.contains_key(&name) {
                Plan::Precomputed
            } else if let Some(output) = node
                .cacheable
                .then(|| self.load_cached::<K, O>(node, &fingerprints[&name], storage))
                .flatten()
            {
                Plan::Cached(output)
            } else {
                stack.extend(node.inputs.values().cloned());
                Plan::Execute
            };
            plan.insert(name, step);
        }
        plan
    }

    /// Fetch a cached output and restore its resource. Any failure is a miss.
    fn load_cached<K: ComponentKind, O: DeserializeOwned>(
        &self,
        node: &SchemaNode<K>,
        fingerprint: &Fingerprint,
        storage: &ModelStorage,
    ) -> Option<O> {
        let entry = match self.cache.get(fingerprint) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(node = %node.name, fingerprint = %fingerprint.short(), "cache miss");
                return None;
            }
            Err(err) => {
                warn!(node = %node.name, error = %err, "cache lookup failed, recomputing");
                return None;
            }
        };

        let output = match serde_json::from_slice(&entry.output) {
            Ok(output) => output,
            Err(err) => {
                warn!(node = %node.name, error = %err, "cached output unreadable, recomputing");
                return None;
            }
        };

        if node.persists {
            let Some(resource) = &entry.resource else {
                warn!(node = %node.name, "cached entry lacks its resource, recomputing");
                return None;
            };
            if let Err(err) = storage.restore(&node.resource_path(), resource) {
                warn!(node = %node.name, error = %err, "could not restore cached resource, recomputing");
                return None;
            }
        }

        debug!(node = %node.name, fingerprint = %fingerprint.short(), "cache hit");
        Some(output)
    }

    fn execute_node<E: NodeExecutor>(
        &self,
        node: &SchemaNode<E::Kind>,
        fingerprint: Fingerprint,
        materialized: &BTreeMap<String, E::Output>,
        executor: &E,
        storage: &ModelStorage,
    ) -> anyhow::Result<E::Output> {
        let inputs = NodeInputs {
            values: node
                .inputs
                .iter()
                .filter_map(|(param, upstream)| {
                    materialized.get(upstream).map(|output| (param.as_str(), output))
                })
                .collect(),
        };
        let resource_dir = if node.persists {
            Some(storage.write_to(&node.resource_path())?)
        } else {
            None
        };
        let ctx = ExecutionContext {
            node_name: &node.name,
            fingerprint,
            resource_dir,
            storage,
        };

        let started = Instant::now();
        let output = executor.execute(node, &inputs, &ctx)?;
        info!(
            node = %node.name,
            kind = node.kind.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "executed node"
        );

        if node.cacheable {
            if let Err(err) = self.store(node, fingerprint, &output, storage) {
                warn!(node = %node.name, error = %err, "could not store output in cache");
            }
        }
        Ok(output)
    }

    fn store<K: ComponentKind, O: Serialize>(
        &self,
        node: &SchemaNode<K>,
        fingerprint: Fingerprint,
        output: &O,
        storage: &ModelStorage,
    ) -> Result<()> {
        let resource = if node.persists {
            Some(storage.snapshot(&node.resource_path())?)
        } else {
            None
        };
        self.cache.put(CacheEntry {
            meta: CacheEntryMeta {
                fingerprint,
                node_name: node.name.clone(),
                node_kind: node.kind.name().to_string(),
                created_at: chrono::Utc::now(),
            },
            output: canonical_json_bytes(output)?,
            resource,
        })
    }
}
