//! Pipeline execution engine — the core traversal loop.
//!
//! Walks the stage tree depth-first against one `SessionState`, producing
//! the event log and the final report. Sequential children see each other's
//! writes in order; parallel children run on isolated snapshots and merge
//! disjoint write sets at the join; loops repeat their body under an
//! escalation policy and a hard iteration budget.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::json;

use crucible_types::{CrucibleError, Event, EventKind, Result, RunStatus, SessionState};

use crate::capability::CapabilityRegistry;
use crate::escalation::{EscalationRegistry, LoopCx, LoopState};
use crate::events::EventLog;
use crate::hooks::{default_hooks, HookContext, HookRegistry};
use crate::sources::{SourceManager, SourceRecord};
use crate::stage::{
    self, LeafStage, LoopErrorPolicy, LoopStage, ParallelFailureMode, ParallelStage,
    SequentialStage, Stage,
};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The result of a finished pipeline run. A runtime failure is a report with
/// `status == Failed`, not an `Err` — the event log is always finalized with
/// a terminal event, never dropped.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub reason: String,
    pub final_state: HashMap<String, serde_json::Value>,
    pub events: Vec<Event>,
    pub sources: Vec<SourceRecord>,
}

/// Cooperative cancellation handle for an in-flight run.
#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<tokio::sync::watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

/// How execution of a subtree ended, as seen by its parent.
enum Flow {
    Ran,
    LoopDone { approved: bool, reason: String },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The pipeline executor. Owns the registries, the source table, and the
/// event log for one run. Cloning yields another handle to the same engine;
/// the parallel executor uses this to move into spawned child tasks.
#[derive(Clone)]
pub struct Engine {
    capabilities: Arc<CapabilityRegistry>,
    escalations: Arc<EscalationRegistry>,
    hooks: Arc<HookRegistry>,
    sources: Arc<SourceManager>,
    events: EventLog,
    cancel_tx: Arc<tokio::sync::watch::Sender<bool>>,
    cancel_rx: tokio::sync::watch::Receiver<bool>,
}

impl Engine {
    /// Create an engine with the given registries and the built-in hooks.
    pub fn new(capabilities: CapabilityRegistry, escalations: EscalationRegistry) -> Self {
        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        Self {
            capabilities: Arc::new(capabilities),
            escalations: Arc::new(escalations),
            hooks: Arc::new(default_hooks()),
            sources: Arc::new(SourceManager::new()),
            events: EventLog::default(),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    /// Replace the hook registry (e.g. to configure feedback consolidation).
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn sources(&self) -> &SourceManager {
        &self.sources
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            sender: self.cancel_tx.clone(),
        }
    }

    /// Run the pipeline to its terminal event.
    ///
    /// Construction problems (invalid tree, unresolved references) fail
    /// before any event is emitted. Everything after that ends in a
    /// `RunFinished` event and a report.
    pub async fn run(&self, tree: &Stage, state: SessionState) -> Result<RunReport> {
        stage::validate(tree)?;
        self.check_references(tree)?;

        let flow = self.execute(tree, &state).await;
        let (status, reason) = match flow {
            Ok(Flow::LoopDone {
                approved: true,
                reason,
            }) => (RunStatus::EscalatedApproved, reason),
            Ok(Flow::LoopDone {
                approved: false,
                reason,
            }) => (RunStatus::Exhausted, reason),
            Ok(Flow::Ran) => (RunStatus::Completed, "all stages completed".to_string()),
            Err(CrucibleError::Cancelled) => {
                (RunStatus::Cancelled, "cancelled by caller".to_string())
            }
            Err(e) => (RunStatus::Failed, e.to_string()),
        };

        self.events.append(
            tree.id(),
            EventKind::RunFinished,
            json!({"status": status.as_str(), "reason": reason}),
        );
        tracing::info!(status = status.as_str(), %reason, "Run finished");

        Ok(RunReport {
            status,
            reason,
            final_state: state.snapshot().await,
            events: self.events.snapshot(),
            sources: self.sources.records(),
        })
    }

    /// Resolve every capability, hook, and escalation reference up front so
    /// a bad name is a construction error, never a mid-run surprise.
    fn check_references(&self, tree: &Stage) -> Result<()> {
        for leaf in tree.leaves() {
            if !self.capabilities.has(&leaf.capability) {
                return Err(CrucibleError::Construction(format!(
                    "leaf '{}' references unknown capability '{}'",
                    leaf.id, leaf.capability
                )));
            }
            for hook in &leaf.post_hooks {
                if !self.hooks.has(hook) {
                    return Err(CrucibleError::Construction(format!(
                        "leaf '{}' references unknown hook '{hook}'",
                        leaf.id
                    )));
                }
            }
        }
        for lp in tree.loops() {
            if !self.escalations.has(&lp.escalation) {
                return Err(CrucibleError::Construction(format!(
                    "loop '{}' references unknown escalation policy '{}'",
                    lp.id, lp.escalation
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    fn execute<'a>(
        &'a self,
        stage: &'a Stage,
        state: &'a SessionState,
    ) -> Pin<Box<dyn Future<Output = Result<Flow>> + Send + 'a>> {
        Box::pin(async move {
            match stage {
                Stage::Leaf(leaf) => self.exec_leaf(leaf, state).await,
                Stage::Sequential(seq) => self.exec_sequential(seq, state).await,
                Stage::Parallel(par) => self.exec_parallel(par, state).await,
                Stage::Loop(lp) => self.exec_loop(lp, state).await,
            }
        })
    }

    async fn exec_leaf(&self, leaf: &LeafStage, state: &SessionState) -> Result<Flow> {
        self.check_cancelled()?;
        self.events.append(
            &leaf.id,
            EventKind::StageStarted,
            json!({"capability": leaf.capability}),
        );

        if let Err(e) = self.require_inputs(leaf, state).await {
            self.events.append(
                &leaf.id,
                EventKind::StageError,
                json!({"error": e.to_string()}),
            );
            return Err(e);
        }
        let snapshot = if leaf.input_keys.is_empty() {
            state.snapshot().await
        } else {
            state.snapshot_of(&leaf.input_keys).await
        };

        let capability = self.capabilities.get(&leaf.capability).ok_or_else(|| {
            CrucibleError::Construction(format!("unknown capability '{}'", leaf.capability))
        })?;

        // The capability call is the one suspension point; racing it against
        // cancellation is what lets an external caller stop a stuck leaf.
        let result = tokio::select! {
            result = capability.invoke(snapshot, leaf) => result,
            _ = self.cancelled() => Err(CrucibleError::Cancelled),
        };

        let output = match result {
            Ok(output) => output,
            Err(CrucibleError::Cancelled) => return Err(CrucibleError::Cancelled),
            Err(e) => {
                self.events.append(
                    &leaf.id,
                    EventKind::StageError,
                    json!({"error": e.to_string()}),
                );
                return Err(e);
            }
        };

        let mut delta = HashMap::new();
        delta.insert(leaf.output_key.clone(), output.output.clone());
        state.apply_delta(&leaf.id, delta).await;
        self.events.append(
            &leaf.id,
            EventKind::StageOutput,
            json!({
                "output_key": leaf.output_key,
                "grounding_events": output.grounding.len(),
            }),
        );

        for hook_name in &leaf.post_hooks {
            let hook = self.hooks.get(hook_name).ok_or_else(|| {
                CrucibleError::Construction(format!("unknown hook '{hook_name}'"))
            })?;
            let current = state
                .get(&leaf.output_key)
                .await
                .unwrap_or(serde_json::Value::Null);
            let snapshot = state.snapshot().await;
            let cx = HookContext {
                leaf_id: &leaf.id,
                output_key: &leaf.output_key,
                output: &current,
                grounding: &output.grounding,
                snapshot: &snapshot,
                sources: &self.sources,
            };
            match hook.run(cx).await {
                Ok(delta) => {
                    if !delta.is_empty() {
                        state
                            .apply_delta(&format!("{}:{}", leaf.id, hook_name), delta)
                            .await;
                    }
                }
                Err(e) => {
                    self.events.append(
                        &leaf.id,
                        EventKind::StageError,
                        json!({"hook": hook_name, "error": e.to_string()}),
                    );
                    return Err(e);
                }
            }
        }

        Ok(Flow::Ran)
    }

    async fn require_inputs(&self, leaf: &LeafStage, state: &SessionState) -> Result<()> {
        for key in &leaf.input_keys {
            state.get_required(&leaf.id, key).await?;
        }
        Ok(())
    }

    async fn exec_sequential(&self, seq: &SequentialStage, state: &SessionState) -> Result<Flow> {
        let mut flow = Flow::Ran;
        for child in &seq.children {
            flow = self.execute(child, state).await?;
        }
        Ok(flow)
    }

    async fn exec_parallel(&self, par: &ParallelStage, state: &SessionState) -> Result<Flow> {
        self.check_cancelled()?;
        self.events.append(
            &par.id,
            EventKind::StageStarted,
            json!({"children": par.children.len()}),
        );

        let mut join = tokio::task::JoinSet::new();
        for (index, child) in par.children.iter().enumerate() {
            let engine = self.clone();
            let child = child.clone();
            let branch = state.clone_isolated().await;
            join.spawn(async move {
                let result = engine.execute(&child, &branch).await;
                (index, result, branch)
            });
        }

        let mut branches: Vec<Option<SessionState>> =
            (0..par.children.len()).map(|_| None).collect();
        let mut failed = 0usize;
        let mut fatal: Option<CrucibleError> = None;

        loop {
            let joined = tokio::select! {
                joined = join.join_next() => joined,
                _ = self.cancelled() => {
                    join.abort_all();
                    return Err(CrucibleError::Cancelled);
                }
            };
            let Some(joined) = joined else { break };
            match joined {
                Ok((index, Ok(_), branch)) => branches[index] = Some(branch),
                Ok((_, Err(CrucibleError::Cancelled), _)) => {
                    join.abort_all();
                    return Err(CrucibleError::Cancelled);
                }
                Ok((index, Err(e), _)) => {
                    failed += 1;
                    match par.on_child_failure {
                        ParallelFailureMode::FailFast => {
                            join.abort_all();
                            fatal = Some(e);
                            break;
                        }
                        ParallelFailureMode::ContinuePartial => {
                            tracing::warn!(
                                parallel = %par.id,
                                child = index,
                                error = %e,
                                "Child failed, keeping siblings"
                            );
                        }
                    }
                }
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        continue;
                    }
                    join.abort_all();
                    fatal = Some(CrucibleError::Other(format!(
                        "parallel child task failed: {join_err}"
                    )));
                    break;
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        // Join barrier: merge surviving branches in declared order so the
        // result is independent of completion order.
        let mut merged = 0usize;
        for branch in branches.iter().flatten() {
            state.merge_child(branch).await;
            merged += 1;
        }
        self.events.append(
            &par.id,
            EventKind::StageOutput,
            json!({"merged_children": merged, "failed_children": failed}),
        );
        Ok(Flow::Ran)
    }

    async fn exec_loop(&self, lp: &LoopStage, state: &SessionState) -> Result<Flow> {
        let policy = self.escalations.get(&lp.escalation).ok_or_else(|| {
            CrucibleError::Construction(format!(
                "unknown escalation policy '{}'",
                lp.escalation
            ))
        })?;
        self.events.append(
            &lp.id,
            EventKind::StageStarted,
            json!({"max_iterations": lp.max_iterations, "escalation": lp.escalation}),
        );

        let iteration_key = format!("{}.iteration", lp.id);
        let scores_key = format!("{}.scores", lp.id);

        let mut loop_state = LoopState::start();
        loop {
            let iteration = match &loop_state {
                LoopState::Running { iteration } => *iteration,
                _ => break,
            };
            self.check_cancelled()?;

            let mut delta = HashMap::new();
            delta.insert(iteration_key.clone(), json!(iteration));
            state.apply_delta(&lp.id, delta).await;

            if let Err(e) = self.execute(&lp.body, state).await {
                if matches!(e, CrucibleError::Cancelled) {
                    return Err(e);
                }
                match &lp.on_body_error {
                    LoopErrorPolicy::Abort => return Err(e),
                    LoopErrorPolicy::TreatAsFailGrade { grade_key } => {
                        tracing::warn!(
                            loop_id = %lp.id,
                            iteration,
                            error = %e,
                            "Iteration failed, scoring as fail"
                        );
                        let mut delta = HashMap::new();
                        delta.insert(
                            grade_key.clone(),
                            json!({"grade": "fail", "score": 0.0, "error": e.to_string()}),
                        );
                        state.apply_delta(&lp.id, delta).await;
                    }
                }
            }

            // Engine-owned score accumulator, appended before the decision so
            // plateau detection has a history to look at.
            let snapshot = state.snapshot().await;
            if let Some(score) = policy.tracked_score(&snapshot) {
                let mut scores = state
                    .get(&scores_key)
                    .await
                    .and_then(|v| v.as_array().cloned())
                    .unwrap_or_default();
                scores.push(json!(score));
                let mut delta = HashMap::new();
                delta.insert(scores_key.clone(), serde_json::Value::Array(scores));
                state.apply_delta(&lp.id, delta).await;
            }

            let snapshot = state.snapshot().await;
            let cx = LoopCx {
                loop_id: lp.id.clone(),
                iteration,
            };
            let decision = policy.decide(&snapshot, &cx);
            tracing::debug!(loop_id = %lp.id, iteration, ?decision, "Escalation check");
            loop_state = loop_state.next(decision, lp.max_iterations);
        }

        let iterations = state.get(&iteration_key).await.unwrap_or(json!(0));
        match loop_state {
            LoopState::Escalated { reason } => {
                self.events.append(
                    &lp.id,
                    EventKind::Escalated,
                    json!({"reason": reason, "iterations": iterations}),
                );
                Ok(Flow::LoopDone {
                    approved: true,
                    reason,
                })
            }
            LoopState::Exhausted { reason } => {
                self.events.append(
                    &lp.id,
                    EventKind::StageOutput,
                    json!({"outcome": "exhausted", "reason": reason, "iterations": iterations}),
                );
                Ok(Flow::LoopDone {
                    approved: false,
                    reason,
                })
            }
            LoopState::Running { .. } => Err(CrucibleError::Other(format!(
                "loop '{}' ended while still running",
                lp.id
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    fn check_cancelled(&self) -> Result<()> {
        if *self.cancel_rx.borrow() {
            Err(CrucibleError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // Sender lives inside the engine; it cannot drop mid-run.
                std::future::pending::<()>().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
