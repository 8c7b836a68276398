//! End-to-end pipeline scenarios: composition semantics, loop control,
//! source bookkeeping, feedback quorums, and cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crucible_pipeline::{
    ApprovalCapability, ApprovalDecision, Capability, CapabilityOutput, CapabilityRegistry,
    ChannelApprover, Engine, EscalationRegistry, GradeEscalation, GroundingEvent, LeafStage,
    LoopErrorPolicy, LoopStage, PlateauEscalation, QuorumEscalation, ConsolidationConfig,
    ScriptedCapability, ScriptedResponse, Stage,
};
use crucible_types::{CrucibleError, EventKind, RunStatus, SessionState};

// ---------------------------------------------------------------------------
// Test capabilities
// ---------------------------------------------------------------------------

/// Returns a fixed output after an optional delay, counting invocations and
/// recording the snapshots it saw.
struct ProbeCapability {
    name: String,
    output: serde_json::Value,
    delay_ms: u64,
    calls: Arc<AtomicUsize>,
    seen: Arc<std::sync::Mutex<Vec<HashMap<String, serde_json::Value>>>>,
}

impl ProbeCapability {
    fn new(name: &str, output: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            output,
            delay_ms: 0,
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    fn snapshots(&self) -> Arc<std::sync::Mutex<Vec<HashMap<String, serde_json::Value>>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl Capability for ProbeCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        snapshot: HashMap<String, serde_json::Value>,
        _leaf: &LeafStage,
    ) -> crucible_types::Result<CapabilityOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(snapshot);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        Ok(CapabilityOutput::value(self.output.clone()))
    }
}

/// Never returns; only cancellation can get past it.
struct HangingCapability;

#[async_trait]
impl Capability for HangingCapability {
    fn name(&self) -> &str {
        "hang"
    }

    async fn invoke(
        &self,
        _snapshot: HashMap<String, serde_json::Value>,
        _leaf: &LeafStage,
    ) -> crucible_types::Result<CapabilityOutput> {
        std::future::pending::<()>().await;
        Ok(CapabilityOutput::default())
    }
}

fn grade(value: &str, score: f64) -> serde_json::Value {
    json!({"grade": value, "score": score})
}

fn grade_escalations() -> EscalationRegistry {
    let mut registry = EscalationRegistry::new();
    registry.register(GradeEscalation::new("grade", "review"));
    registry
}

// ---------------------------------------------------------------------------
// Sequential semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_children_observe_prior_writes() {
    let research = ProbeCapability::new("search", json!("research notes"));
    let draft = ProbeCapability::new("llm", json!("draft text"));
    let draft_snapshots = draft.snapshots();

    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(research);
    capabilities.register(draft);
    let engine = Engine::new(capabilities, EscalationRegistry::new());

    let tree = Stage::sequential(
        "root",
        vec![
            Stage::leaf("research", "search", "findings"),
            Stage::leaf("draft", "llm", "draft"),
        ],
    );

    let report = engine.run(&tree, SessionState::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    // The draft stage saw the research stage's write (happens-before).
    let seen = draft_snapshots.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get("findings"), Some(&json!("research notes")));
}

// ---------------------------------------------------------------------------
// Parallel semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_merge_is_the_union_regardless_of_completion_order() {
    // Slowest child is declared first, so completion order is reversed
    // relative to declaration order.
    let slow = ProbeCapability::new("slow", json!("a")).with_delay(40);
    let medium = ProbeCapability::new("medium", json!("b")).with_delay(15);
    let fast = ProbeCapability::new("fast", json!("c"));

    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(slow);
    capabilities.register(medium);
    capabilities.register(fast);
    let engine = Engine::new(capabilities, EscalationRegistry::new());

    let tree = Stage::parallel(
        "fan",
        vec![
            Stage::leaf("child_a", "slow", "a"),
            Stage::leaf("child_b", "medium", "b"),
            Stage::leaf("child_c", "fast", "c"),
        ],
    );

    let state = SessionState::new();
    let report = engine.run(&tree, state.clone()).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.final_state.get("a"), Some(&json!("a")));
    assert_eq!(report.final_state.get("b"), Some(&json!("b")));
    assert_eq!(report.final_state.get("c"), Some(&json!("c")));

    // Writes stay attributed to the child that made them.
    assert_eq!(state.writer_of("b").await.as_deref(), Some("child_b"));
}

#[tokio::test]
async fn parallel_children_do_not_observe_sibling_writes() {
    let left = ProbeCapability::new("left", json!("left out")).with_delay(10);
    let right = ProbeCapability::new("right", json!("right out")).with_delay(30);
    let right_snapshots = right.snapshots();

    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(left);
    capabilities.register(right);
    let engine = Engine::new(capabilities, EscalationRegistry::new());

    let tree = Stage::parallel(
        "fan",
        vec![
            Stage::leaf("lhs", "left", "lhs_out"),
            Stage::leaf("rhs", "right", "rhs_out"),
        ],
    );

    engine.run(&tree, SessionState::new()).await.unwrap();

    // The right child started from the fan-out snapshot; even though the
    // left child finished first, its write is not visible.
    let seen = right_snapshots.lock().unwrap();
    assert!(!seen[0].contains_key("lhs_out"));
}

#[tokio::test]
async fn overlapping_parallel_writes_fail_at_construction_not_at_runtime() {
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(ScriptedCapability::constant("llm", json!("x")));
    let engine = Engine::new(capabilities, EscalationRegistry::new());

    let tree = Stage::parallel(
        "fan",
        vec![
            Stage::leaf("one", "llm", "same_key"),
            Stage::leaf("two", "llm", "same_key"),
        ],
    );

    let err = engine.run(&tree, SessionState::new()).await.unwrap_err();
    assert!(matches!(err, CrucibleError::Construction(_)));
    // Construction failures happen before the first event.
    assert!(engine.events().is_empty());
}

#[tokio::test]
async fn fail_fast_parallel_propagates_the_child_error() {
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(ScriptedCapability::new(
        "bad",
        vec![ScriptedResponse::Error {
            message: "backend exploded".into(),
            retryable: false,
        }],
    ));
    capabilities.register(ProbeCapability::new("slow_ok", json!("ok")).with_delay(200));
    let engine = Engine::new(capabilities, EscalationRegistry::new());

    let tree = Stage::parallel(
        "fan",
        vec![
            Stage::leaf("failing", "bad", "bad_out"),
            Stage::leaf("surviving", "slow_ok", "ok_out"),
        ],
    );

    let report = engine.run(&tree, SessionState::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.reason.contains("backend exploded"));
}

#[tokio::test]
async fn continue_partial_parallel_keeps_surviving_writes() {
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(ScriptedCapability::new(
        "bad",
        vec![ScriptedResponse::Error {
            message: "backend exploded".into(),
            retryable: false,
        }],
    ));
    capabilities.register(ScriptedCapability::constant("good", json!("kept")));
    let engine = Engine::new(capabilities, EscalationRegistry::new());

    let tree = Stage::Parallel(crucible_pipeline::ParallelStage {
        id: "fan".into(),
        children: vec![
            Stage::leaf("failing", "bad", "bad_out"),
            Stage::leaf("surviving", "good", "ok_out"),
        ],
        on_child_failure: crucible_pipeline::ParallelFailureMode::ContinuePartial,
    });

    let report = engine.run(&tree, SessionState::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.final_state.get("ok_out"), Some(&json!("kept")));
    assert!(!report.final_state.contains_key("bad_out"));

    // The failure is visible in the log, not silently dropped.
    assert!(report.events.iter().any(|e| e.kind == EventKind::StageError));
}

// ---------------------------------------------------------------------------
// Loop control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn loop_exhausts_at_exactly_max_iterations() {
    // The reviewer never passes, so the loop must stop at the cap — and
    // never run a 4th time.
    let reviewer = ProbeCapability::new("reviewer", grade("fail", 50.0));
    let calls = reviewer.counter();

    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(reviewer);
    let engine = Engine::new(capabilities, grade_escalations());

    let tree = Stage::bounded_loop(
        "refine",
        Stage::leaf("review", "reviewer", "review"),
        3,
        "grade",
    );

    let report = engine.run(&tree, SessionState::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Exhausted);
    assert!(report.reason.contains("iteration budget"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.final_state.get("refine.iteration"), Some(&json!(3)));
}

#[tokio::test]
async fn loop_escalates_on_the_approving_iteration() {
    let reviewer = ScriptedCapability::new(
        "reviewer",
        vec![
            ScriptedResponse::Output(CapabilityOutput::value(grade("fail", 55.0))),
            ScriptedResponse::Output(CapabilityOutput::value(grade("pass", 88.0))),
        ],
    );

    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(reviewer);
    let engine = Engine::new(capabilities, grade_escalations());

    let tree = Stage::bounded_loop(
        "refine",
        Stage::leaf("review", "reviewer", "review"),
        5,
        "grade",
    );

    let report = engine.run(&tree, SessionState::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::EscalatedApproved);
    assert_eq!(report.reason, "approved");
    assert_eq!(report.final_state.get("refine.iteration"), Some(&json!(2)));

    // The escalation itself is an event, distinguishable from exhaustion.
    assert!(report.events.iter().any(|e| e.kind == EventKind::Escalated));
}

#[tokio::test]
async fn plateau_stops_the_loop_without_approval() {
    let reviewer = ScriptedCapability::new(
        "reviewer",
        vec![
            ScriptedResponse::Output(CapabilityOutput::value(grade("fail", 60.0))),
            ScriptedResponse::Output(CapabilityOutput::value(grade("fail", 60.5))),
        ],
    );

    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(reviewer);
    let mut escalations = EscalationRegistry::new();
    escalations.register(PlateauEscalation::new("plateau", "review", 2.0));
    let engine = Engine::new(capabilities, escalations);

    let tree = Stage::bounded_loop(
        "refine",
        Stage::leaf("review", "reviewer", "review"),
        10,
        "plateau",
    );

    let report = engine.run(&tree, SessionState::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Exhausted);
    assert_eq!(report.reason, "score plateau");
    assert_eq!(report.final_state.get("refine.iteration"), Some(&json!(2)));
    assert_eq!(
        report.final_state.get("refine.scores"),
        Some(&json!([60.0, 60.5]))
    );
}

#[tokio::test]
async fn loop_body_error_aborts_by_default() {
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(ScriptedCapability::new(
        "reviewer",
        vec![ScriptedResponse::Error {
            message: "reviewer crashed".into(),
            retryable: false,
        }],
    ));
    let engine = Engine::new(capabilities, grade_escalations());

    let tree = Stage::bounded_loop(
        "refine",
        Stage::leaf("review", "reviewer", "review"),
        3,
        "grade",
    );

    let report = engine.run(&tree, SessionState::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.reason.contains("reviewer crashed"));
}

#[tokio::test]
async fn loop_body_error_can_be_scored_as_fail_instead() {
    let reviewer = ScriptedCapability::new(
        "reviewer",
        vec![ScriptedResponse::Error {
            message: "reviewer crashed".into(),
            retryable: false,
        }],
    );

    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(reviewer);
    let engine = Engine::new(capabilities, grade_escalations());

    let tree = Stage::Loop(LoopStage {
        id: "refine".into(),
        body: Box::new(Stage::leaf("review", "reviewer", "review")),
        max_iterations: 2,
        escalation: "grade".into(),
        on_body_error: LoopErrorPolicy::TreatAsFailGrade {
            grade_key: "review".into(),
        },
    });

    let report = engine.run(&tree, SessionState::new()).await.unwrap();
    // Every iteration failed and was scored as fail; the loop exhausted
    // normally instead of aborting the pipeline.
    assert_eq!(report.status, RunStatus::Exhausted);
    assert_eq!(report.final_state.get("refine.iteration"), Some(&json!(2)));
    let review = report.final_state.get("review").unwrap();
    assert_eq!(review["grade"], json!("fail"));
    assert!(review["error"].as_str().unwrap().contains("reviewer crashed"));
}

// ---------------------------------------------------------------------------
// Sources and citations through a pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_research_leaves_deduplicate_shared_sources() {
    let shared = GroundingEvent::new("https://shared.example/paper", "Shared Paper");
    let left = CapabilityOutput::text("left notes").with_grounding(vec![
        shared.clone(),
        GroundingEvent::new("https://left.example", "Left Only"),
    ]);
    let right = CapabilityOutput::text("right notes").with_grounding(vec![
        shared.clone(),
        GroundingEvent::new("https://right.example", "Right Only"),
    ]);

    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(ScriptedCapability::new(
        "search_left",
        vec![ScriptedResponse::Output(left)],
    ));
    capabilities.register(ScriptedCapability::new(
        "search_right",
        vec![ScriptedResponse::Output(right)],
    ));
    let engine = Engine::new(capabilities, EscalationRegistry::new());

    let tree = Stage::parallel(
        "research",
        vec![
            Stage::Leaf(LeafStage::new("left", "search_left", "left_notes").hook("record_sources")),
            Stage::Leaf(
                LeafStage::new("right", "search_right", "right_notes").hook("record_sources"),
            ),
        ],
    );

    let report = engine.run(&tree, SessionState::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    // Three distinct URLs, three ids — the shared one minted exactly once.
    assert_eq!(report.sources.len(), 3);
    let ids: Vec<&str> = report.sources.iter().map(|s| s.short_id.as_str()).collect();
    assert_eq!(ids, vec!["src-1", "src-2", "src-3"]);
    let shared_count = report
        .sources
        .iter()
        .filter(|s| s.canonical_url.contains("shared.example"))
        .count();
    assert_eq!(shared_count, 1);
}

#[tokio::test]
async fn citations_resolve_against_sources_recorded_upstream() {
    let research = CapabilityOutput::text("notes").with_grounding(vec![GroundingEvent::new(
        "https://u.example/ref",
        "The Reference",
    )]);

    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(ScriptedCapability::new(
        "search",
        vec![ScriptedResponse::Output(research)],
    ));
    capabilities.register(ScriptedCapability::constant(
        "llm",
        json!("As shown in <cite source=\"src-1\"/> , this holds. See <cite source=\"src-7\"/>."),
    ));
    let engine = Engine::new(capabilities, EscalationRegistry::new());

    let tree = Stage::sequential(
        "root",
        vec![
            Stage::Leaf(LeafStage::new("research", "search", "findings").hook("record_sources")),
            Stage::Leaf(LeafStage::new("draft", "llm", "draft").hook("resolve_citations")),
        ],
    );

    let report = engine.run(&tree, SessionState::new()).await.unwrap();
    let draft = report.final_state.get("draft").unwrap().as_str().unwrap();

    // Known marker replaced, spacing artifact cleaned, unknown marker kept.
    assert!(draft.contains("[The Reference](https://u.example/ref), this holds."));
    assert!(draft.contains("<cite source=\"src-7\"/>"));
    assert_eq!(
        report.final_state.get("draft.citation_warnings"),
        Some(&json!(["unknown source id 'src-7'"]))
    );
}

// ---------------------------------------------------------------------------
// Feedback consolidation in a refinement loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn review_panel_quorum_gates_the_refinement_loop() {
    // Iteration 1: only one reviewer passes. Iteration 2: two of three.
    let round_one = json!([
        {"reviewer_id": "r1", "grade": "fail", "numeric_score": 55.0,
         "issues": ["weak evidence in section 2"]},
        {"reviewer_id": "r2", "grade": "fail", "numeric_score": 60.0,
         "issues": ["Weak evidence in section 2!"]},
        {"reviewer_id": "r3", "grade": "pass", "numeric_score": 78.0},
    ]);
    let round_two = json!([
        {"reviewer_id": "r1", "grade": "pass", "numeric_score": 85.0},
        {"reviewer_id": "r2", "grade": "fail", "numeric_score": 65.0},
        {"reviewer_id": "r3", "grade": "pass", "numeric_score": 82.0},
    ]);

    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(ScriptedCapability::new(
        "panel",
        vec![
            ScriptedResponse::Output(CapabilityOutput::value(round_one)),
            ScriptedResponse::Output(CapabilityOutput::value(round_two)),
        ],
    ));
    let mut escalations = EscalationRegistry::new();
    escalations.register(QuorumEscalation::new(
        "quorum",
        "reviews",
        ConsolidationConfig::default(),
    ));
    let engine = Engine::new(capabilities, escalations);

    let tree = Stage::bounded_loop(
        "refine",
        Stage::Leaf(LeafStage::new("review_panel", "panel", "reviews").hook("consolidate_feedback")),
        5,
        "quorum",
    );

    let report = engine.run(&tree, SessionState::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::EscalatedApproved);
    assert!(report.reason.contains("approved by quorum"));
    assert_eq!(report.final_state.get("refine.iteration"), Some(&json!(2)));

    // The first round's consensus issue was visible in state between
    // iterations (the same normalized issue from two reviewers).
    let consolidated = report.final_state.get("reviews.consolidated").unwrap();
    assert_eq!(consolidated["overall_grade"], json!("pass"));
}

// ---------------------------------------------------------------------------
// Human checkpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn human_checkpoint_suspends_until_resumed() {
    let (resume, approver) = ChannelApprover::pair(1);

    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(ApprovalCapability::new("session-1", Arc::new(approver)));
    capabilities.register(ScriptedCapability::constant("llm", json!("published")));
    let engine = Engine::new(capabilities, EscalationRegistry::new());

    let tree = Stage::sequential(
        "root",
        vec![
            Stage::Leaf(
                LeafStage::new("gate", "wait.approval", "approval")
                    .param("checkpoint", json!("publish")),
            ),
            Stage::leaf("publish", "llm", "published"),
        ],
    );

    let run_engine = engine.clone();
    let run = tokio::spawn(async move { run_engine.run(&tree, SessionState::new()).await });

    // Give the pipeline time to reach the checkpoint, then resume it.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    resume.send(ApprovalDecision::approve()).await.unwrap();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.final_state["approval"]["grade"], json!("pass"));
    assert_eq!(report.final_state.get("published"), Some(&json!("published")));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_finalizes_the_log_with_a_terminal_event() {
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(ScriptedCapability::constant("llm", json!("done")));
    capabilities.register(HangingCapability);
    let engine = Engine::new(capabilities, EscalationRegistry::new());
    let cancel = engine.cancel_handle();

    let tree = Stage::sequential(
        "root",
        vec![
            Stage::leaf("first", "llm", "first_out"),
            Stage::leaf("stuck", "hang", "never"),
        ],
    );

    let run_engine = engine.clone();
    let run = tokio::spawn(async move { run_engine.run(&tree, SessionState::new()).await });

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    cancel.cancel();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    // Work done before cancellation is still in the final state.
    assert_eq!(report.final_state.get("first_out"), Some(&json!("done")));

    let last = report.events.last().unwrap();
    assert_eq!(last.kind, EventKind::RunFinished);
    assert_eq!(last.payload["status"], json!("cancelled"));
}

#[tokio::test]
async fn cancellation_reaches_in_flight_parallel_children() {
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(HangingCapability);
    capabilities.register(ProbeCapability::new("slow", json!("x")).with_delay(5_000));
    let engine = Engine::new(capabilities, EscalationRegistry::new());
    let cancel = engine.cancel_handle();

    let tree = Stage::parallel(
        "fan",
        vec![
            Stage::leaf("stuck", "hang", "a"),
            Stage::leaf("slow", "slow", "b"),
        ],
    );

    let run_engine = engine.clone();
    let started = std::time::Instant::now();
    let run = tokio::spawn(async move { run_engine.run(&tree, SessionState::new()).await });

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    cancel.cancel();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    // The join did not wait out the slow child's five seconds.
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
}
