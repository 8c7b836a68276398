//! Unified error taxonomy for all Crucible subsystems.

/// Unified error type for the Crucible orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum CrucibleError {
    // === Capability Errors ===
    #[error("Capability '{capability}' failed on stage '{stage}': {message}")]
    Capability {
        capability: String,
        stage: String,
        message: String,
        retryable: bool,
    },

    // === Construction Errors ===
    #[error("Stage tree construction failed: {0}")]
    Construction(String),

    // === State Errors ===
    #[error("Stage '{stage}' read unset required key '{key}'")]
    State { stage: String, key: String },

    // === Source/Citation Errors ===
    #[error("Source table error: {0}")]
    Source(String),

    // === Feedback Errors ===
    #[error("Feedback consolidation error: {0}")]
    Feedback(String),

    // === Persistence Errors ===
    #[error("Session store error for '{session}': {message}")]
    Store { session: String, message: String },

    // === Cancellation ===
    #[error("Run cancelled")]
    Cancelled,

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CrucibleError {
    /// Returns `true` if the error is transient and the operation may succeed
    /// on retry. Retrying is the capability's own concern; the engine only
    /// sees the flag.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CrucibleError::Capability { retryable: true, .. })
    }

    /// Returns `true` if the error indicates a bug in how the pipeline was
    /// wired, rather than a runtime condition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CrucibleError::Construction(_) | CrucibleError::State { .. }
        )
    }
}

/// A convenience alias for `Result<T, CrucibleError>`.
pub type Result<T> = std::result::Result<T, CrucibleError>;
