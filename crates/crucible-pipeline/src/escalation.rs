//! Escalation policies and the loop-control state machine.
//!
//! After every loop iteration the engine consults an [`EscalationPolicy`]
//! with a read snapshot of state. Policies are pure decision functions; the
//! engine owns the iteration counter, the score accumulator, and the
//! decision events.

use std::collections::HashMap;

use serde::Serialize;

use crate::feedback::{self, ConsolidationConfig, FeedbackRecord, Grade};

// ---------------------------------------------------------------------------
// Decision and loop context
// ---------------------------------------------------------------------------

/// Outcome of one escalation check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Continue,
    /// Stop the loop. `approved` distinguishes a met quality condition from
    /// an unproductive-iteration stop (e.g. a score plateau).
    Stop { reason: String, approved: bool },
}

impl Decision {
    pub fn approved(reason: impl Into<String>) -> Decision {
        Decision::Stop {
            reason: reason.into(),
            approved: true,
        }
    }

    pub fn give_up(reason: impl Into<String>) -> Decision {
        Decision::Stop {
            reason: reason.into(),
            approved: false,
        }
    }
}

/// Loop context handed to a policy alongside the state snapshot.
#[derive(Debug, Clone)]
pub struct LoopCx {
    pub loop_id: String,
    /// 1-based index of the iteration that just finished.
    pub iteration: u32,
}

impl LoopCx {
    /// Key of the engine-maintained score accumulator for this loop.
    pub fn scores_key(&self) -> String {
        format!("{}.scores", self.loop_id)
    }
}

// ---------------------------------------------------------------------------
// EscalationPolicy trait
// ---------------------------------------------------------------------------

pub trait EscalationPolicy: Send + Sync {
    /// The registry name loops use to reference this policy.
    fn name(&self) -> &str;

    /// Decide whether the loop continues. Must be idempotent and free of
    /// side effects; the engine records the decision.
    fn decide(&self, snapshot: &HashMap<String, serde_json::Value>, cx: &LoopCx) -> Decision;

    /// The score this policy tracks, if any. The engine appends it to the
    /// loop's score accumulator after each iteration so plateau detection
    /// can see a history without the policy holding state.
    fn tracked_score(&self, _snapshot: &HashMap<String, serde_json::Value>) -> Option<f64> {
        None
    }
}

// ---------------------------------------------------------------------------
// Grade record helpers
// ---------------------------------------------------------------------------

/// Read a grade record at `key`: either `{"grade": "pass", "score": 82.0}`
/// or a bare `"pass"` / `"fail"` string.
fn read_grade(snapshot: &HashMap<String, serde_json::Value>, key: &str) -> Option<bool> {
    let value = snapshot.get(key)?;
    let grade = value
        .as_str()
        .or_else(|| value.get("grade").and_then(|g| g.as_str()))?;
    Some(grade.eq_ignore_ascii_case("pass"))
}

fn read_score(snapshot: &HashMap<String, serde_json::Value>, key: &str) -> Option<f64> {
    snapshot.get(key)?.get("score")?.as_f64()
}

// ---------------------------------------------------------------------------
// GradeEscalation
// ---------------------------------------------------------------------------

/// Canonical policy: stop (approved) when the tracked grade record reads
/// "pass"; otherwise continue. A missing or malformed record continues —
/// the iteration cap is the backstop.
pub struct GradeEscalation {
    name: String,
    grade_key: String,
}

impl GradeEscalation {
    pub fn new(name: impl Into<String>, grade_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            grade_key: grade_key.into(),
        }
    }
}

impl EscalationPolicy for GradeEscalation {
    fn name(&self) -> &str {
        &self.name
    }

    fn decide(&self, snapshot: &HashMap<String, serde_json::Value>, cx: &LoopCx) -> Decision {
        match read_grade(snapshot, &self.grade_key) {
            Some(true) => Decision::approved("approved"),
            Some(false) => Decision::Continue,
            None => {
                tracing::debug!(
                    loop_id = %cx.loop_id,
                    key = %self.grade_key,
                    "No grade record yet, continuing"
                );
                Decision::Continue
            }
        }
    }

    fn tracked_score(&self, snapshot: &HashMap<String, serde_json::Value>) -> Option<f64> {
        read_score(snapshot, &self.grade_key)
    }
}

// ---------------------------------------------------------------------------
// PlateauEscalation
// ---------------------------------------------------------------------------

/// Grade gate plus plateau detection: if the last two tracked scores differ
/// by less than `improvement_threshold`, stop (unapproved) even though the
/// literal grade is still "fail". Prevents unproductive iteration.
pub struct PlateauEscalation {
    name: String,
    grade_key: String,
    improvement_threshold: f64,
}

impl PlateauEscalation {
    pub fn new(
        name: impl Into<String>,
        grade_key: impl Into<String>,
        improvement_threshold: f64,
    ) -> Self {
        Self {
            name: name.into(),
            grade_key: grade_key.into(),
            improvement_threshold,
        }
    }
}

impl EscalationPolicy for PlateauEscalation {
    fn name(&self) -> &str {
        &self.name
    }

    fn decide(&self, snapshot: &HashMap<String, serde_json::Value>, cx: &LoopCx) -> Decision {
        if read_grade(snapshot, &self.grade_key) == Some(true) {
            return Decision::approved("approved");
        }

        let scores: Vec<f64> = snapshot
            .get(&cx.scores_key())
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|s| s.as_f64()).collect())
            .unwrap_or_default();

        if let [.., previous, latest] = scores.as_slice() {
            if (latest - previous).abs() < self.improvement_threshold {
                return Decision::give_up("score plateau");
            }
        }
        Decision::Continue
    }

    fn tracked_score(&self, snapshot: &HashMap<String, serde_json::Value>) -> Option<f64> {
        read_score(snapshot, &self.grade_key)
    }
}

// ---------------------------------------------------------------------------
// QuorumEscalation
// ---------------------------------------------------------------------------

/// Consolidates the reviewer records stored under `feedback_key` and stops
/// (approved) when the consolidated grade passes the configured quorum.
pub struct QuorumEscalation {
    name: String,
    feedback_key: String,
    config: ConsolidationConfig,
}

impl QuorumEscalation {
    pub fn new(
        name: impl Into<String>,
        feedback_key: impl Into<String>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            name: name.into(),
            feedback_key: feedback_key.into(),
            config,
        }
    }

    fn records(&self, snapshot: &HashMap<String, serde_json::Value>) -> Vec<FeedbackRecord> {
        snapshot
            .get(&self.feedback_key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

impl EscalationPolicy for QuorumEscalation {
    fn name(&self) -> &str {
        &self.name
    }

    fn decide(&self, snapshot: &HashMap<String, serde_json::Value>, cx: &LoopCx) -> Decision {
        let records = self.records(snapshot);
        if records.is_empty() {
            tracing::debug!(loop_id = %cx.loop_id, key = %self.feedback_key, "No reviewer records yet");
            return Decision::Continue;
        }
        match feedback::consolidate(&records, &self.config) {
            Ok(consolidated) if consolidated.overall_grade == Grade::Pass => {
                Decision::approved(format!(
                    "approved by quorum ({} reviewers, avg {:.1})",
                    records.len(),
                    consolidated.average_score
                ))
            }
            Ok(_) => Decision::Continue,
            Err(e) => {
                tracing::warn!(loop_id = %cx.loop_id, error = %e, "Feedback consolidation failed, continuing");
                Decision::Continue
            }
        }
    }

    fn tracked_score(&self, snapshot: &HashMap<String, serde_json::Value>) -> Option<f64> {
        let records = self.records(snapshot);
        feedback::consolidate(&records, &self.config)
            .ok()
            .map(|c| c.average_score)
    }
}

// ---------------------------------------------------------------------------
// EscalationRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct EscalationRegistry {
    policies: HashMap<String, Box<dyn EscalationPolicy>>,
}

impl EscalationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, policy: impl EscalationPolicy + 'static) {
        let name = policy.name().to_string();
        self.policies.insert(name, Box::new(policy));
    }

    pub fn get(&self, name: &str) -> Option<&dyn EscalationPolicy> {
        self.policies.get(name).map(|p| p.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// Loop state machine
// ---------------------------------------------------------------------------

/// The refinement loop as a whole: `Running(i)` advances on "continue" while
/// below the cap, `Escalated` on an approving stop, `Exhausted` on an
/// unapproved stop or on reaching the cap. Both terminal states carry the
/// distinguishing reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoopState {
    Running { iteration: u32 },
    Escalated { reason: String },
    Exhausted { reason: String },
}

impl LoopState {
    pub fn start() -> LoopState {
        LoopState::Running { iteration: 1 }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoopState::Running { .. })
    }

    /// Advance the machine with the decision for the iteration that just
    /// finished. Terminal states absorb further input.
    pub fn next(self, decision: Decision, max_iterations: u32) -> LoopState {
        match (self, decision) {
            (LoopState::Running { .. }, Decision::Stop { reason, approved: true }) => {
                LoopState::Escalated { reason }
            }
            (LoopState::Running { .. }, Decision::Stop { reason, approved: false }) => {
                LoopState::Exhausted { reason }
            }
            (LoopState::Running { iteration }, Decision::Continue) => {
                if iteration < max_iterations {
                    LoopState::Running {
                        iteration: iteration + 1,
                    }
                } else {
                    LoopState::Exhausted {
                        reason: format!("iteration budget of {max_iterations} exhausted"),
                    }
                }
            }
            (terminal, _) => terminal,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
