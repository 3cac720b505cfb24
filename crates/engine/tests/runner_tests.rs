//! Integration tests for cached graph execution
//!
//! Uses a small arithmetic component set so outputs are easy to predict.

use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use parley_engine::{
    CacheEntry, ComponentKind, EngineError, ExecutionContext, Fingerprint, GraphRunner,
    GraphSchema, LocalTrainingCache, MemoryTrainingCache, ModelStorage, NodeExecutor, NodeInputs,
    RunRequest, SchemaNode, TrainingCache,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Op {
    /// Emits `config.value`.
    Const,
    /// Reads a value from the executor's external "files".
    Source,
    /// Adds all inputs; persists the sum when declared persisting.
    Sum,
    Fail,
}

impl ComponentKind for Op {
    fn name(&self) -> &str {
        match self {
            Op::Const => "Const",
            Op::Source => "Source",
            Op::Sum => "Sum",
            Op::Fail => "Fail",
        }
    }
}

#[derive(Default)]
struct Arithmetic {
    files: RwLock<HashMap<String, i64>>,
    executed: Mutex<Vec<String>>,
}

impl Arithmetic {
    fn executed(&self) -> Vec<String> {
        let mut names = self.executed.lock().clone();
        names.sort();
        names
    }

    fn reset(&self) {
        self.executed.lock().clear();
    }
}

impl NodeExecutor for Arithmetic {
    type Kind = Op;
    type Output = i64;

    fn content_fingerprint(&self, node: &SchemaNode<Op>) -> Result<Option<Fingerprint>> {
        if node.kind != Op::Source {
            return Ok(None);
        }
        let value = self.files.read().get(&node.name).copied();
        Ok(Some(Fingerprint::of(&value)?))
    }

    fn execute(
        &self,
        node: &SchemaNode<Op>,
        inputs: &NodeInputs<'_, i64>,
        ctx: &ExecutionContext<'_>,
    ) -> Result<i64> {
        self.executed.lock().push(node.name.clone());
        let value = match node.kind {
            Op::Const => node.config.get("value").and_then(|v| v.as_i64()).unwrap_or(0),
            Op::Source => match self.files.read().get(&node.name) {
                Some(value) => *value,
                None => bail!("no file for {}", node.name),
            },
            Op::Sum => node.inputs.keys().map(|p| inputs.require(p).map(|v| *v)).sum::<Result<i64>>()?,
            Op::Fail => bail!("boom"),
        };
        if node.persists {
            fs::write(ctx.require_resource_dir()?.join("value.txt"), value.to_string())?;
        }
        Ok(value)
    }
}

fn constant(name: &str, value: i64) -> SchemaNode<Op> {
    SchemaNode::new(name, Op::Const).with_param("value", json!(value))
}

fn diamond(left: i64, right: i64) -> GraphSchema<Op> {
    GraphSchema::new(vec![
        constant("left", left),
        constant("right", right),
        SchemaNode::new("left_sum", Op::Sum).with_input("a", "left"),
        SchemaNode::new("right_sum", Op::Sum).with_input("a", "right"),
        SchemaNode::new("total", Op::Sum)
            .with_input("a", "left_sum")
            .with_input("b", "right_sum")
            .target(),
    ])
    .unwrap()
}

fn runner(cache: Arc<dyn TrainingCache>) -> GraphRunner {
    GraphRunner::new(cache, 4).unwrap()
}

#[test]
fn second_run_is_served_from_cache() {
    let runner = runner(Arc::new(MemoryTrainingCache::new()));
    let executor = Arithmetic::default();
    let schema = diamond(2, 3);

    let storage = ModelStorage::create().unwrap();
    let first = runner.run(&schema, RunRequest::default(), &executor, &storage).unwrap();
    assert_eq!(first.outputs["total"], 5);
    assert_eq!(first.executed.len(), 5);
    assert!(first.cache_hits.is_empty());

    executor.reset();
    let storage = ModelStorage::create().unwrap();
    let second = runner.run(&schema, RunRequest::default(), &executor, &storage).unwrap();
    assert_eq!(second.outputs["total"], 5);
    assert!(executor.executed().is_empty());
    assert_eq!(second.cache_hits, vec!["total"]);
    assert_eq!(first.fingerprints, second.fingerprints);
}

#[test]
fn config_change_reruns_only_affected_branch() {
    let runner = runner(Arc::new(MemoryTrainingCache::new()));
    let executor = Arithmetic::default();

    let storage = ModelStorage::create().unwrap();
    runner.run(&diamond(2, 3), RunRequest::default(), &executor, &storage).unwrap();

    executor.reset();
    let storage = ModelStorage::create().unwrap();
    let report = runner.run(&diamond(10, 3), RunRequest::default(), &executor, &storage).unwrap();
    assert_eq!(report.outputs["total"], 13);
    assert_eq!(executor.executed(), vec!["left", "left_sum", "total"]);
    assert_eq!(report.cache_hits, vec!["right_sum"]);
}

#[test]
fn failure_names_node_and_stops_downstream() {
    let cache = Arc::new(MemoryTrainingCache::new());
    let runner = runner(cache.clone());
    let executor = Arithmetic::default();
    let schema = GraphSchema::new(vec![
        constant("ok", 1),
        SchemaNode::new("broken", Op::Fail),
        SchemaNode::new("total", Op::Sum)
            .with_input("a", "ok")
            .with_input("b", "broken")
            .target(),
    ])
    .unwrap();

    let storage = ModelStorage::create().unwrap();
    let err = runner.run(&schema, RunRequest::default(), &executor, &storage).unwrap_err();
    assert!(matches!(err, EngineError::NodeFailed { ref node, .. } if node == "broken"));
    assert!(err.to_string().contains("boom"));
    assert!(!executor.executed().contains(&"total".to_string()));
    // The sibling that finished in the same wave keeps its cache entry.
    assert_eq!(cache.len().unwrap(), 1);
}

#[test]
fn precomputed_outputs_skip_upstream() {
    let runner = runner(Arc::new(MemoryTrainingCache::new()));
    let executor = Arithmetic::default();
    let storage = ModelStorage::create().unwrap();

    let request = RunRequest::default().with_precomputed("left_sum", 100);
    let report = runner.run(&diamond(2, 3), request, &executor, &storage).unwrap();
    assert_eq!(report.outputs["total"], 103);
    assert_eq!(report.precomputed, vec!["left_sum"]);
    assert!(!executor.executed().contains(&"left".to_string()));
}

#[test]
fn explicit_targets_limit_execution() {
    let runner = runner(Arc::new(MemoryTrainingCache::new()));
    let executor = Arithmetic::default();
    let storage = ModelStorage::create().unwrap();

    let request = RunRequest::targets(vec!["right_sum".into()]);
    let report = runner.run(&diamond(2, 3), request, &executor, &storage).unwrap();
    assert_eq!(report.outputs.len(), 1);
    assert_eq!(report.outputs["right_sum"], 3);
    assert_eq!(executor.executed(), vec!["right", "right_sum"]);
}

#[test]
fn unknown_target_is_rejected() {
    let runner = runner(Arc::new(MemoryTrainingCache::new()));
    let storage = ModelStorage::create().unwrap();
    let err = runner
        .run(&diamond(1, 1), RunRequest::targets(vec!["nope".into()]), &Arithmetic::default(), &storage)
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownTarget(ref name) if name == "nope"));
}

#[test]
fn cancelled_runner_dispatches_nothing() {
    let runner = runner(Arc::new(MemoryTrainingCache::new()));
    runner.cancellation_token().cancel();
    let executor = Arithmetic::default();
    let storage = ModelStorage::create().unwrap();

    let err = runner.run(&diamond(1, 1), RunRequest::default(), &executor, &storage).unwrap_err();
    assert!(matches!(err, EngineError::Cancelled(_)));
    assert!(executor.executed().is_empty());
}

#[test]
fn source_content_drives_downstream_cache_keys() {
    let runner = runner(Arc::new(MemoryTrainingCache::new()));
    let executor = Arithmetic::default();
    executor.files.write().insert("reader".into(), 7);
    let schema = GraphSchema::new(vec![
        SchemaNode::new("reader", Op::Source).uncached(),
        SchemaNode::new("total", Op::Sum).with_input("a", "reader").target(),
    ])
    .unwrap();

    let storage = ModelStorage::create().unwrap();
    assert_eq!(runner.run(&schema, RunRequest::default(), &executor, &storage).unwrap().outputs["total"], 7);

    // Unchanged content: the cached consumer short-circuits the uncached reader.
    executor.reset();
    let report = runner.run(&schema, RunRequest::default(), &executor, &storage).unwrap();
    assert!(executor.executed().is_empty());
    assert_eq!(report.cache_hits, vec!["total"]);

    executor.reset();
    executor.files.write().insert("reader".into(), 8);
    let report = runner.run(&schema, RunRequest::default(), &executor, &storage).unwrap();
    assert_eq!(report.outputs["total"], 8);
    assert_eq!(executor.executed(), vec!["reader", "total"]);
}

#[test]
fn persisted_resources_are_restored_from_local_cache() {
    let cache_dir = TempDir::new().unwrap();
    let runner = runner(Arc::new(LocalTrainingCache::open(cache_dir.path()).unwrap()));
    let executor = Arithmetic::default();
    let schema = GraphSchema::new(vec![
        constant("seed", 4),
        SchemaNode::new("train_Sum0", Op::Sum)
            .with_input("a", "seed")
            .persisting("core")
            .target(),
    ])
    .unwrap();

    let first = ModelStorage::create().unwrap();
    runner.run(&schema, RunRequest::default(), &executor, &first).unwrap();
    assert!(first.resource_dir("core/train_Sum0").is_dir());

    executor.reset();
    let second = ModelStorage::create().unwrap();
    let report = runner.run(&schema, RunRequest::default(), &executor, &second).unwrap();
    assert!(executor.executed().is_empty());
    assert_eq!(report.outputs["train_Sum0"], 4);
    let restored = fs::read_to_string(second.resource_dir("core/train_Sum0").join("value.txt")).unwrap();
    assert_eq!(restored, "4");
}

struct BrokenCache;

impl TrainingCache for BrokenCache {
    fn get(&self, _fingerprint: &Fingerprint) -> parley_engine::Result<Option<CacheEntry>> {
        Err(EngineError::Cache("disk on fire".into()))
    }

    fn put(&self, _entry: CacheEntry) -> parley_engine::Result<()> {
        Err(EngineError::Cache("disk on fire".into()))
    }

    fn len(&self) -> parley_engine::Result<usize> {
        Ok(0)
    }
}

#[test]
fn cache_failures_degrade_to_recomputation() {
    let runner = runner(Arc::new(BrokenCache));
    let executor = Arithmetic::default();
    for _ in 0..2 {
        executor.reset();
        let storage = ModelStorage::create().unwrap();
        let report = runner.run(&diamond(2, 2), RunRequest::default(), &executor, &storage).unwrap();
        assert_eq!(report.outputs["total"], 4);
        assert_eq!(executor.executed().len(), 5);
    }
}
