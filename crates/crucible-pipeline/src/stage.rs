//! Stage tree — the closed set of composition primitives.
//!
//! A pipeline is a tree of four stage kinds: `Leaf` (delegates to an external
//! capability), `Sequential`, `Parallel`, and `Loop`. Trees are pure data,
//! built once before a run and immutable during execution; capabilities,
//! escalation policies, and post-hooks are referenced by registry name, not
//! embedded as trait objects.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crucible_types::{CrucibleError, Result};

// ---------------------------------------------------------------------------
// Failure policies
// ---------------------------------------------------------------------------

/// How a `Parallel` stage reacts to a failing child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelFailureMode {
    /// Abort sibling children on the first failure and propagate it.
    #[default]
    FailFast,
    /// Record the failure, keep the surviving children's writes.
    ContinuePartial,
}

/// How a `Loop` stage reacts to a failing body iteration.
///
/// The choice is always explicit on the stage; the engine never infers one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum LoopErrorPolicy {
    /// Abort the whole loop (and pipeline) on a failing iteration.
    #[default]
    Abort,
    /// Write a zero-score fail grade under `grade_key` and let the
    /// escalation policy see the failed iteration.
    TreatAsFailGrade { grade_key: String },
}

// ---------------------------------------------------------------------------
// Stage variants
// ---------------------------------------------------------------------------

/// A stage that delegates to an external capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafStage {
    pub id: String,
    /// Registry name of the capability to invoke.
    pub capability: String,
    /// State key the capability's output is merged under.
    pub output_key: String,
    /// Keys this leaf reads. Checked before invocation; when non-empty the
    /// capability receives exactly this slice of state.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Free-form configuration handed to the capability.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Registry names of post-hooks, run in order after the output merge.
    #[serde(default)]
    pub post_hooks: Vec<String>,
}

impl LeafStage {
    pub fn new(
        id: impl Into<String>,
        capability: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            output_key: output_key.into(),
            input_keys: Vec::new(),
            params: serde_json::Map::new(),
            post_hooks: Vec::new(),
        }
    }

    pub fn input(mut self, key: impl Into<String>) -> Self {
        self.input_keys.push(key.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn hook(mut self, name: impl Into<String>) -> Self {
        self.post_hooks.push(name.into());
        self
    }

    /// String parameter accessor with fallback.
    pub fn param_str(&self, key: &str, default: &str) -> String {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or(default)
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialStage {
    pub id: String,
    pub children: Vec<Stage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelStage {
    pub id: String,
    pub children: Vec<Stage>,
    #[serde(default)]
    pub on_child_failure: ParallelFailureMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStage {
    pub id: String,
    pub body: Box<Stage>,
    pub max_iterations: u32,
    /// Registry name of the escalation policy consulted after each iteration.
    pub escalation: String,
    #[serde(default)]
    pub on_body_error: LoopErrorPolicy,
}

/// A node in the pipeline tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Stage {
    Leaf(LeafStage),
    Sequential(SequentialStage),
    Parallel(ParallelStage),
    Loop(LoopStage),
}

impl Stage {
    pub fn leaf(
        id: impl Into<String>,
        capability: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Stage {
        Stage::Leaf(LeafStage::new(id, capability, output_key))
    }

    pub fn sequential(id: impl Into<String>, children: Vec<Stage>) -> Stage {
        Stage::Sequential(SequentialStage {
            id: id.into(),
            children,
        })
    }

    pub fn parallel(id: impl Into<String>, children: Vec<Stage>) -> Stage {
        Stage::Parallel(ParallelStage {
            id: id.into(),
            children,
            on_child_failure: ParallelFailureMode::FailFast,
        })
    }

    pub fn bounded_loop(
        id: impl Into<String>,
        body: Stage,
        max_iterations: u32,
        escalation: impl Into<String>,
    ) -> Stage {
        Stage::Loop(LoopStage {
            id: id.into(),
            body: Box::new(body),
            max_iterations,
            escalation: escalation.into(),
            on_body_error: LoopErrorPolicy::Abort,
        })
    }

    pub fn id(&self) -> &str {
        match self {
            Stage::Leaf(s) => &s.id,
            Stage::Sequential(s) => &s.id,
            Stage::Parallel(s) => &s.id,
            Stage::Loop(s) => &s.id,
        }
    }

    /// All state keys this subtree can write: leaf output keys plus the
    /// engine-owned loop bookkeeping keys.
    pub fn write_set(&self) -> HashSet<String> {
        let mut keys = HashSet::new();
        collect_write_set(self, &mut keys);
        keys
    }

    /// Iterate every leaf in the subtree.
    pub fn leaves(&self) -> Vec<&LeafStage> {
        let mut out = Vec::new();
        collect_leaves(self, &mut out);
        out
    }

    /// Iterate every loop in the subtree.
    pub fn loops(&self) -> Vec<&LoopStage> {
        let mut out = Vec::new();
        collect_loops(self, &mut out);
        out
    }
}

fn collect_write_set(stage: &Stage, keys: &mut HashSet<String>) {
    match stage {
        Stage::Leaf(leaf) => {
            keys.insert(leaf.output_key.clone());
        }
        Stage::Sequential(seq) => {
            for child in &seq.children {
                collect_write_set(child, keys);
            }
        }
        Stage::Parallel(par) => {
            for child in &par.children {
                collect_write_set(child, keys);
            }
        }
        Stage::Loop(lp) => {
            keys.insert(format!("{}.iteration", lp.id));
            keys.insert(format!("{}.scores", lp.id));
            collect_write_set(&lp.body, keys);
        }
    }
}

fn collect_leaves<'a>(stage: &'a Stage, out: &mut Vec<&'a LeafStage>) {
    match stage {
        Stage::Leaf(leaf) => out.push(leaf),
        Stage::Sequential(seq) => seq.children.iter().for_each(|c| collect_leaves(c, out)),
        Stage::Parallel(par) => par.children.iter().for_each(|c| collect_leaves(c, out)),
        Stage::Loop(lp) => collect_leaves(&lp.body, out),
    }
}

fn collect_loops<'a>(stage: &'a Stage, out: &mut Vec<&'a LoopStage>) {
    match stage {
        Stage::Leaf(_) => {}
        Stage::Sequential(seq) => seq.children.iter().for_each(|c| collect_loops(c, out)),
        Stage::Parallel(par) => par.children.iter().for_each(|c| collect_loops(c, out)),
        Stage::Loop(lp) => {
            out.push(lp);
            collect_loops(&lp.body, out);
        }
    }
}

// ---------------------------------------------------------------------------
// Construction-time validation
// ---------------------------------------------------------------------------

/// Check the structural invariants of a stage tree.
///
/// Violations are construction errors, never runtime surprises: duplicate
/// stage ids, empty composites, a zero iteration budget, a blank capability
/// or escalation reference, and — the one with a concurrency hazard behind
/// it — overlapping write sets between siblings of a `Parallel` stage.
pub fn validate(tree: &Stage) -> Result<()> {
    let mut seen_ids = HashSet::new();
    walk(tree, &mut seen_ids)
}

fn walk(stage: &Stage, seen_ids: &mut HashSet<String>) -> Result<()> {
    let id = stage.id();
    if id.is_empty() {
        return Err(CrucibleError::Construction("stage with empty id".into()));
    }
    if !seen_ids.insert(id.to_string()) {
        return Err(CrucibleError::Construction(format!(
            "duplicate stage id '{id}'"
        )));
    }

    match stage {
        Stage::Leaf(leaf) => {
            if leaf.capability.is_empty() {
                return Err(CrucibleError::Construction(format!(
                    "leaf '{}' has no capability reference",
                    leaf.id
                )));
            }
            if leaf.output_key.is_empty() {
                return Err(CrucibleError::Construction(format!(
                    "leaf '{}' has no output key",
                    leaf.id
                )));
            }
            Ok(())
        }
        Stage::Sequential(seq) => {
            if seq.children.is_empty() {
                return Err(CrucibleError::Construction(format!(
                    "sequential '{}' has no children",
                    seq.id
                )));
            }
            for child in &seq.children {
                walk(child, seen_ids)?;
            }
            Ok(())
        }
        Stage::Parallel(par) => {
            if par.children.is_empty() {
                return Err(CrucibleError::Construction(format!(
                    "parallel '{}' has no children",
                    par.id
                )));
            }
            check_disjoint_write_sets(par)?;
            for child in &par.children {
                walk(child, seen_ids)?;
            }
            Ok(())
        }
        Stage::Loop(lp) => {
            if lp.max_iterations == 0 {
                return Err(CrucibleError::Construction(format!(
                    "loop '{}' has a zero iteration budget",
                    lp.id
                )));
            }
            if lp.escalation.is_empty() {
                return Err(CrucibleError::Construction(format!(
                    "loop '{}' has no escalation reference",
                    lp.id
                )));
            }
            walk(&lp.body, seen_ids)
        }
    }
}

fn check_disjoint_write_sets(par: &ParallelStage) -> Result<()> {
    let mut owner: HashMap<String, &str> = HashMap::new();
    for child in &par.children {
        for key in child.write_set() {
            if let Some(prev) = owner.insert(key.clone(), child.id()) {
                return Err(CrucibleError::Construction(format!(
                    "parallel '{}': children '{}' and '{}' both write key '{}'",
                    par.id,
                    prev,
                    child.id(),
                    key
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
