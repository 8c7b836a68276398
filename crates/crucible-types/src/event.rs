//! Execution events and terminal run classification.

use serde::{Deserialize, Serialize};

/// Kind of an execution event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StageStarted,
    StageOutput,
    StageError,
    Escalated,
    RunFinished,
}

/// Terminal classification of a pipeline run.
///
/// `Exhausted` distinguishes "the refinement loop gave up at its iteration
/// cap" from `EscalatedApproved` ("a quality condition was met"), so
/// downstream consumers never have to guess which one happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    EscalatedApproved,
    Exhausted,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::EscalatedApproved => "escalated_approved",
            RunStatus::Exhausted => "exhausted",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

/// One record in the append-only execution log.
///
/// Immutable once appended; totally ordered by `seq` within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub stage_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&EventKind::StageStarted).unwrap(),
            "\"stage_started\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::RunFinished).unwrap(),
            "\"run_finished\""
        );
    }

    #[test]
    fn run_status_round_trip() {
        let status: RunStatus = serde_json::from_str("\"escalated_approved\"").unwrap();
        assert_eq!(status, RunStatus::EscalatedApproved);
        assert_eq!(status.as_str(), "escalated_approved");
    }

    #[test]
    fn event_serialization_round_trip() {
        let event = Event {
            seq: 7,
            stage_id: "draft".into(),
            kind: EventKind::StageOutput,
            payload: serde_json::json!({"output_key": "draft"}),
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.seq, 7);
        assert_eq!(back.stage_id, "draft");
        assert_eq!(back.kind, EventKind::StageOutput);
    }
}
