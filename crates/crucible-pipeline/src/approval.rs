//! Human-checkpoint boundary: a capability that suspends until an external
//! actor supplies a resume decision.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crucible_types::{CrucibleError, Result};

use crate::capability::{Capability, CapabilityOutput};
use crate::stage::LeafStage;

/// The resume value an external actor supplies for a checkpoint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(default)]
    pub note: Option<String>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            note: None,
        }
    }

    pub fn reject(note: impl Into<String>) -> Self {
        Self {
            approved: false,
            note: Some(note.into()),
        }
    }
}

/// The external actor that resolves checkpoints, keyed by session id and
/// checkpoint type.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn await_approval(
        &self,
        session_id: &str,
        checkpoint: &str,
        snapshot: &HashMap<String, serde_json::Value>,
    ) -> Result<ApprovalDecision>;
}

// ---------------------------------------------------------------------------
// AutoApprover
// ---------------------------------------------------------------------------

/// Approves every checkpoint immediately. Useful for unattended runs.
pub struct AutoApprover;

#[async_trait]
impl Approver for AutoApprover {
    async fn await_approval(
        &self,
        _session_id: &str,
        _checkpoint: &str,
        _snapshot: &HashMap<String, serde_json::Value>,
    ) -> Result<ApprovalDecision> {
        Ok(ApprovalDecision::approve())
    }
}

// ---------------------------------------------------------------------------
// ChannelApprover
// ---------------------------------------------------------------------------

/// Suspends until a decision arrives on a channel — the engine-side half of
/// an external approval transport. A closed channel is a capability failure,
/// not a hang.
pub struct ChannelApprover {
    receiver: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<ApprovalDecision>>,
}

impl ChannelApprover {
    pub fn new(receiver: tokio::sync::mpsc::Receiver<ApprovalDecision>) -> Self {
        Self {
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    /// Build an approver plus the sender an external actor resumes it with.
    pub fn pair(capacity: usize) -> (tokio::sync::mpsc::Sender<ApprovalDecision>, Self) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl Approver for ChannelApprover {
    async fn await_approval(
        &self,
        session_id: &str,
        checkpoint: &str,
        _snapshot: &HashMap<String, serde_json::Value>,
    ) -> Result<ApprovalDecision> {
        tracing::info!(session = %session_id, checkpoint = %checkpoint, "Waiting for approval");
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.ok_or_else(|| CrucibleError::Other(format!(
            "approval channel closed while waiting on checkpoint '{checkpoint}'"
        )))
    }
}

// ---------------------------------------------------------------------------
// RecordingApprover
// ---------------------------------------------------------------------------

/// Plays back preset decisions and records the checkpoints it was asked
/// about. Test double.
pub struct RecordingApprover {
    decisions: std::sync::Mutex<Vec<ApprovalDecision>>,
    checkpoints: std::sync::Mutex<Vec<String>>,
}

impl RecordingApprover {
    pub fn new(decisions: Vec<ApprovalDecision>) -> Self {
        let mut reversed = decisions;
        reversed.reverse();
        Self {
            decisions: std::sync::Mutex::new(reversed),
            checkpoints: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn checkpoints(&self) -> Vec<String> {
        self.checkpoints.lock().unwrap().clone()
    }
}

#[async_trait]
impl Approver for RecordingApprover {
    async fn await_approval(
        &self,
        _session_id: &str,
        checkpoint: &str,
        _snapshot: &HashMap<String, serde_json::Value>,
    ) -> Result<ApprovalDecision> {
        self.checkpoints.lock().unwrap().push(checkpoint.to_string());
        let decision = self
            .decisions
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(ApprovalDecision::approve);
        Ok(decision)
    }
}

// ---------------------------------------------------------------------------
// ApprovalCapability
// ---------------------------------------------------------------------------

/// Leaf capability wrapping an [`Approver`]. The decision is written as a
/// grade-shaped record so a refinement loop can gate on it directly.
pub struct ApprovalCapability {
    session_id: String,
    approver: Arc<dyn Approver>,
}

impl ApprovalCapability {
    pub fn new(session_id: impl Into<String>, approver: Arc<dyn Approver>) -> Self {
        Self {
            session_id: session_id.into(),
            approver,
        }
    }
}

#[async_trait]
impl Capability for ApprovalCapability {
    fn name(&self) -> &str {
        "wait.approval"
    }

    async fn invoke(
        &self,
        snapshot: HashMap<String, serde_json::Value>,
        leaf: &LeafStage,
    ) -> Result<CapabilityOutput> {
        let checkpoint = leaf.param_str("checkpoint", &leaf.id);
        let decision = self
            .approver
            .await_approval(&self.session_id, &checkpoint, &snapshot)
            .await?;

        tracing::info!(
            checkpoint = %checkpoint,
            approved = decision.approved,
            "Checkpoint resolved"
        );

        Ok(CapabilityOutput::value(serde_json::json!({
            "grade": if decision.approved { "pass" } else { "fail" },
            "checkpoint": checkpoint,
            "note": decision.note,
        })))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
