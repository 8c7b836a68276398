//! Capability contract consumed by leaf stages, and the registry that
//! resolves capability references.
//!
//! A capability is whatever a leaf delegates to — a language-model call, a
//! web search, a human-approval wait. The engine never inspects capability
//! internals; it only needs `invoke` plus the ability to signal failure.

use std::collections::HashMap;

use async_trait::async_trait;

use crucible_types::{CrucibleError, Result};

use crate::stage::LeafStage;

// ---------------------------------------------------------------------------
// Capability I/O
// ---------------------------------------------------------------------------

/// A reference discovered by a capability while producing its output
/// (a search hit, a cited page). Fed to the source manager by the
/// `record_sources` post-hook.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GroundingEvent {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl GroundingEvent {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            confidence: None,
        }
    }
}

/// What a capability returns on success.
#[derive(Debug, Clone, Default)]
pub struct CapabilityOutput {
    pub output: serde_json::Value,
    pub grounding: Vec<GroundingEvent>,
}

impl CapabilityOutput {
    pub fn value(output: serde_json::Value) -> Self {
        Self {
            output,
            grounding: Vec::new(),
        }
    }

    pub fn text(output: impl Into<String>) -> Self {
        Self::value(serde_json::Value::String(output.into()))
    }

    pub fn with_grounding(mut self, grounding: Vec<GroundingEvent>) -> Self {
        self.grounding = grounding;
        self
    }
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Capability: Send + Sync {
    /// The registry name leaves use to reference this capability.
    fn name(&self) -> &str;

    /// Invoke the capability against a read snapshot of session state.
    ///
    /// The snapshot is the leaf's declared input slice (or the full state
    /// when the leaf declares none); the capability must not assume access
    /// to anything else.
    async fn invoke(
        &self,
        snapshot: HashMap<String, serde_json::Value>,
        leaf: &LeafStage,
    ) -> Result<CapabilityOutput>;
}

// ---------------------------------------------------------------------------
// CapabilityRegistry
// ---------------------------------------------------------------------------

/// Name → capability lookup, built once before a run.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Box<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: impl Capability + 'static) {
        let name = capability.name().to_string();
        self.capabilities.insert(name, Box::new(capability));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Capability> {
        self.capabilities.get(name).map(|c| c.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// Scripted capability — test/demo double
// ---------------------------------------------------------------------------

/// One scripted response, played back in order.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Output(CapabilityOutput),
    Error { message: String, retryable: bool },
}

/// Capability that plays back preset responses and records the snapshots it
/// was invoked with. When the script runs out, the last response repeats.
pub struct ScriptedCapability {
    name: String,
    responses: std::sync::Mutex<Vec<ScriptedResponse>>,
    last: ScriptedResponse,
    seen: std::sync::Mutex<Vec<HashMap<String, serde_json::Value>>>,
}

impl ScriptedCapability {
    pub fn new(name: impl Into<String>, responses: Vec<ScriptedResponse>) -> Self {
        let last = responses
            .last()
            .cloned()
            .unwrap_or(ScriptedResponse::Output(CapabilityOutput::default()));
        let mut reversed = responses;
        reversed.reverse();
        Self {
            name: name.into(),
            responses: std::sync::Mutex::new(reversed),
            last,
            seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Shorthand for a capability that always returns the same value.
    pub fn constant(name: impl Into<String>, output: serde_json::Value) -> Self {
        Self::new(
            name,
            vec![ScriptedResponse::Output(CapabilityOutput::value(output))],
        )
    }

    /// Snapshots received so far, in invocation order.
    pub fn invocations(&self) -> Vec<HashMap<String, serde_json::Value>> {
        self.seen.lock().expect("seen lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.seen.lock().expect("seen lock").len()
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        snapshot: HashMap<String, serde_json::Value>,
        leaf: &LeafStage,
    ) -> Result<CapabilityOutput> {
        self.seen.lock().expect("seen lock").push(snapshot);
        let response = self
            .responses
            .lock()
            .expect("responses lock")
            .pop()
            .unwrap_or_else(|| self.last.clone());
        match response {
            ScriptedResponse::Output(out) => Ok(out),
            ScriptedResponse::Error { message, retryable } => Err(CrucibleError::Capability {
                capability: self.name.clone(),
                stage: leaf.id.clone(),
                message,
                retryable,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
