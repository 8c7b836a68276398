//! Source/citation bookkeeping: stable short ids for discovered sources,
//! URL deduplication, and tag-to-reference substitution.
//!
//! The URL→id map and the id counter are one atomic unit behind a single
//! mutex, so concurrent research leaves discovering the same URL can never
//! mint two different ids.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crucible_types::{CrucibleError, Result};

use crate::capability::GroundingEvent;

/// A deduplicated external source with its session-stable short id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub short_id: String,
    pub canonical_url: String,
    pub title: String,
    pub domain: String,
    pub producing_stage_id: String,
    pub discovered_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Result of citation substitution over one text.
#[derive(Debug, Clone)]
pub struct CitationResolution {
    pub text: String,
    /// One entry per marker that referenced an unknown short id. The marker
    /// itself stays in the text as a visible placeholder.
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// SourceManager
// ---------------------------------------------------------------------------

struct TableInner {
    by_url: HashMap<String, String>,
    records: Vec<SourceRecord>,
}

/// Session-scoped source table. Safe to share across concurrent leaves.
pub struct SourceManager {
    inner: Mutex<TableInner>,
}

impl SourceManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                by_url: HashMap::new(),
                records: Vec::new(),
            }),
        }
    }

    /// Record one discovered source. Re-discovering a known canonical URL
    /// returns the existing short id instead of minting a new one.
    pub fn record(&self, grounding: &GroundingEvent, stage_id: &str) -> Result<String> {
        let canonical = canonicalize_url(&grounding.url);
        if canonical.is_empty() {
            return Err(CrucibleError::Source(format!(
                "stage '{stage_id}' reported a source with an empty URL"
            )));
        }

        let mut inner = self.inner.lock().expect("source table lock");
        if let Some(existing) = inner.by_url.get(&canonical) {
            return Ok(existing.clone());
        }
        let short_id = format!("src-{}", inner.records.len() + 1);
        inner.by_url.insert(canonical.clone(), short_id.clone());
        inner.records.push(SourceRecord {
            short_id: short_id.clone(),
            domain: domain_of(&canonical),
            canonical_url: canonical,
            title: grounding.title.clone(),
            producing_stage_id: stage_id.to_string(),
            discovered_at: chrono::Utc::now(),
            confidence: grounding.confidence,
        });
        tracing::debug!(id = %short_id, stage = %stage_id, "Source recorded");
        Ok(short_id)
    }

    /// Record a batch, skipping malformed entries with a warning.
    pub fn record_all(&self, grounding: &[GroundingEvent], stage_id: &str) -> Vec<String> {
        grounding
            .iter()
            .filter_map(|event| match self.record(event, stage_id) {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!(stage = %stage_id, error = %e, "Dropped malformed source");
                    None
                }
            })
            .collect()
    }

    pub fn get(&self, short_id: &str) -> Option<SourceRecord> {
        self.inner
            .lock()
            .expect("source table lock")
            .records
            .iter()
            .find(|r| r.short_id == short_id)
            .cloned()
    }

    /// All records in short-id order.
    pub fn records(&self) -> Vec<SourceRecord> {
        self.inner.lock().expect("source table lock").records.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("source table lock").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace `<cite source="src-N"/>` markers with `[Title](URL)`
    /// references. Unknown ids stay in the text verbatim and are reported in
    /// the warnings. Spacing is normalized afterwards so substitution never
    /// leaves a doubled space or a space before punctuation.
    pub fn resolve_citations(&self, text: &str) -> CitationResolution {
        let table: HashMap<String, SourceRecord> = {
            let inner = self.inner.lock().expect("source table lock");
            inner
                .records
                .iter()
                .map(|r| (r.short_id.clone(), r.clone()))
                .collect()
        };

        let mut out = String::with_capacity(text.len());
        let mut warnings = Vec::new();
        let mut last = 0;
        for caps in citation_regex().captures_iter(text) {
            let (Some(whole), Some(id)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&text[last..whole.start()]);
            match table.get(id.as_str()) {
                Some(record) => {
                    out.push_str(&format!("[{}]({})", record.title, record.canonical_url));
                }
                None => {
                    out.push_str(whole.as_str());
                    warnings.push(format!("unknown source id '{}'", id.as_str()));
                }
            }
            last = whole.end();
        }
        out.push_str(&text[last..]);

        CitationResolution {
            text: normalize_spacing(&out),
            warnings,
        }
    }
}

impl Default for SourceManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn citation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<cite\s+source\s*=\s*"([^"]+)"\s*/>"#).expect("valid citation regex")
    })
}

/// Canonical form used for deduplication: trimmed, trailing slash stripped,
/// scheme and host lowercased. Paths keep their case.
fn canonicalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    match trimmed.split_once("://") {
        Some((scheme, rest)) => {
            let (host, path) = match rest.split_once('/') {
                Some((host, path)) => (host, Some(path)),
                None => (rest, None),
            };
            let mut out = format!(
                "{}://{}",
                scheme.to_ascii_lowercase(),
                host.to_ascii_lowercase()
            );
            if let Some(path) = path {
                out.push('/');
                out.push_str(path);
            }
            out
        }
        None => trimmed.to_string(),
    }
}

fn domain_of(canonical: &str) -> String {
    let rest = canonical
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(canonical);
    rest.split('/').next().unwrap_or(rest).to_string()
}

fn normalize_spacing(text: &str) -> String {
    static BEFORE_PUNCT: OnceLock<Regex> = OnceLock::new();
    static RUNS: OnceLock<Regex> = OnceLock::new();
    let before_punct =
        BEFORE_PUNCT.get_or_init(|| Regex::new(r"[ \t]+([.,;:!?])").expect("valid regex"));
    let runs = RUNS.get_or_init(|| Regex::new(r"[ \t]{2,}").expect("valid regex"));

    let text = before_punct.replace_all(text, "$1");
    runs.replace_all(&text, " ").into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
