//! Post-hooks: an explicit, ordered list of processors the engine runs
//! immediately after a leaf's output merge.
//!
//! A hook receives the same state-delta contract as a stage — it reads a
//! snapshot and returns the delta it wants merged — rather than mutating
//! anything behind the engine's back.

use std::collections::HashMap;

use async_trait::async_trait;

use crucible_types::{CrucibleError, Result};

use crate::capability::GroundingEvent;
use crate::feedback::{self, ConsolidationConfig, FeedbackRecord};
use crate::sources::SourceManager;

/// Everything a hook may look at for one invocation. Hooks hold no state of
/// their own between invocations.
pub struct HookContext<'a> {
    pub leaf_id: &'a str,
    pub output_key: &'a str,
    /// Current value under `output_key` (a previous hook may have rewritten it).
    pub output: &'a serde_json::Value,
    pub grounding: &'a [GroundingEvent],
    pub snapshot: &'a HashMap<String, serde_json::Value>,
    pub sources: &'a SourceManager,
}

#[async_trait]
pub trait PostHook: Send + Sync {
    /// The registry name leaves use to reference this hook.
    fn name(&self) -> &str;

    /// Run the hook; the returned delta is merged into state under the
    /// hook's attribution.
    async fn run(&self, cx: HookContext<'_>) -> Result<HashMap<String, serde_json::Value>>;
}

// ---------------------------------------------------------------------------
// HookRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Box<dyn PostHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: impl PostHook + 'static) {
        let name = hook.name().to_string();
        self.hooks.insert(name, Box::new(hook));
    }

    pub fn get(&self, name: &str) -> Option<&dyn PostHook> {
        self.hooks.get(name).map(|h| h.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }
}

/// Registry with the built-in hooks, using default feedback configuration.
pub fn default_hooks() -> HookRegistry {
    let mut registry = HookRegistry::new();
    registry.register(RecordSourcesHook);
    registry.register(ResolveCitationsHook);
    registry.register(ConsolidateFeedbackHook::new(ConsolidationConfig::default()));
    registry
}

// ---------------------------------------------------------------------------
// RecordSourcesHook
// ---------------------------------------------------------------------------

/// Feeds the leaf's grounding events into the session source table and
/// writes the assigned short ids next to the output.
pub struct RecordSourcesHook;

#[async_trait]
impl PostHook for RecordSourcesHook {
    fn name(&self) -> &str {
        "record_sources"
    }

    async fn run(&self, cx: HookContext<'_>) -> Result<HashMap<String, serde_json::Value>> {
        let ids = cx.sources.record_all(cx.grounding, cx.leaf_id);
        tracing::debug!(stage = %cx.leaf_id, recorded = ids.len(), "Grounding recorded");

        let mut delta = HashMap::new();
        delta.insert(
            format!("{}.sources", cx.output_key),
            serde_json::json!(ids),
        );
        Ok(delta)
    }
}

// ---------------------------------------------------------------------------
// ResolveCitationsHook
// ---------------------------------------------------------------------------

/// Rewrites `<cite source="src-N"/>` markers in the leaf's text output into
/// formatted references using the session source table.
pub struct ResolveCitationsHook;

#[async_trait]
impl PostHook for ResolveCitationsHook {
    fn name(&self) -> &str {
        "resolve_citations"
    }

    async fn run(&self, cx: HookContext<'_>) -> Result<HashMap<String, serde_json::Value>> {
        let Some(text) = cx.output.as_str() else {
            tracing::debug!(stage = %cx.leaf_id, "Output is not text, skipping citation pass");
            return Ok(HashMap::new());
        };

        let resolved = cx.sources.resolve_citations(text);
        for warning in &resolved.warnings {
            tracing::warn!(stage = %cx.leaf_id, %warning, "Citation warning");
        }

        let mut delta = HashMap::new();
        delta.insert(
            cx.output_key.to_string(),
            serde_json::Value::String(resolved.text),
        );
        if !resolved.warnings.is_empty() {
            delta.insert(
                format!("{}.citation_warnings", cx.output_key),
                serde_json::json!(resolved.warnings),
            );
        }
        Ok(delta)
    }
}

// ---------------------------------------------------------------------------
// ConsolidateFeedbackHook
// ---------------------------------------------------------------------------

/// Consolidates a list of reviewer records produced by the leaf into one
/// decision, stored next to the raw records.
pub struct ConsolidateFeedbackHook {
    config: ConsolidationConfig,
}

impl ConsolidateFeedbackHook {
    pub fn new(config: ConsolidationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PostHook for ConsolidateFeedbackHook {
    fn name(&self) -> &str {
        "consolidate_feedback"
    }

    async fn run(&self, cx: HookContext<'_>) -> Result<HashMap<String, serde_json::Value>> {
        let records: Vec<FeedbackRecord> = serde_json::from_value(cx.output.clone())
            .map_err(|e| {
                CrucibleError::Feedback(format!(
                    "stage '{}' output under '{}' is not a reviewer record list: {e}",
                    cx.leaf_id, cx.output_key
                ))
            })?;

        let consolidated = feedback::consolidate(&records, &self.config)?;

        let mut delta = HashMap::new();
        delta.insert(
            format!("{}.consolidated", cx.output_key),
            serde_json::to_value(&consolidated)?,
        );
        Ok(delta)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
