//! Pipeline engine: stage composition, escalation control, source/citation
//! bookkeeping, and feedback consolidation.
//!
//! This crate implements the core Crucible orchestrator: depth-first stage
//! traversal, concurrent parallel fan-out with disjoint merge, bounded
//! refinement loops driven by escalation policies, the session source table,
//! and multi-reviewer feedback consolidation.

pub mod approval;
pub mod capability;
pub mod engine;
pub mod escalation;
pub mod events;
pub mod feedback;
pub mod hooks;
pub mod session;
pub mod sources;
pub mod stage;

pub use approval::{
    ApprovalCapability, ApprovalDecision, Approver, AutoApprover, ChannelApprover,
    RecordingApprover,
};
pub use capability::{
    Capability, CapabilityOutput, CapabilityRegistry, GroundingEvent, ScriptedCapability,
    ScriptedResponse,
};
pub use engine::{CancelHandle, Engine, RunReport};
pub use escalation::{
    Decision, EscalationPolicy, EscalationRegistry, GradeEscalation, LoopCx, LoopState,
    PlateauEscalation, QuorumEscalation,
};
pub use events::EventLog;
pub use feedback::{
    consolidate, validate_record, ConsensusIssue, ConsolidatedFeedback, ConsolidationConfig,
    FeedbackRecord, Grade, GradePolicy, InconsistencyPolicy, SuggestionConflict,
};
pub use hooks::{
    default_hooks, ConsolidateFeedbackHook, HookContext, HookRegistry, PostHook,
    RecordSourcesHook, ResolveCitationsHook,
};
pub use session::{
    default_store_root, InMemorySessionStore, JsonFileSessionStore, SessionStore,
};
pub use sources::{CitationResolution, SourceManager, SourceRecord};
pub use stage::{
    validate, LeafStage, LoopErrorPolicy, LoopStage, ParallelFailureMode, ParallelStage,
    SequentialStage, Stage,
};
