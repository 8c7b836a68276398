//! Multi-reviewer feedback consolidation: quorum grading, consensus issue
//! grouping, priority ordering, and conflict flagging.

use serde::{Deserialize, Serialize};

use crucible_types::{CrucibleError, Result};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Pass,
    Fail,
}

/// One reviewer's structured evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub reviewer_id: String,
    pub grade: Grade,
    pub numeric_score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub commendations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How the overall grade is derived from N reviewer grades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradePolicy {
    /// All reviewers must pass.
    Unanimous,
    /// At least ceil(N/2) reviewers must pass. Default (2-of-3 for N=3).
    #[default]
    Majority,
}

/// What to do with a record whose grade label contradicts its score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyPolicy {
    /// Refuse the whole consolidation.
    Reject,
    /// Repair: downgrade the record to Fail, keep its score. Default.
    #[default]
    Downgrade,
}

#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    pub grade_policy: GradePolicy,
    /// Minimum score a "pass" grade must carry to be consistent.
    pub pass_threshold: f64,
    /// How many consensus issues become priority revisions.
    pub top_k: usize,
    pub on_inconsistent: InconsistencyPolicy,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            grade_policy: GradePolicy::Majority,
            pass_threshold: 70.0,
            top_k: 3,
            on_inconsistent: InconsistencyPolicy::Downgrade,
        }
    }
}

// ---------------------------------------------------------------------------
// Consolidated output
// ---------------------------------------------------------------------------

/// An issue raised, after normalization, by two or more distinct reviewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusIssue {
    /// First-submitted wording of the group.
    pub representative: String,
    pub reviewers: Vec<String>,
}

/// Two suggestions from different reviewers pulling in opposite directions.
/// Surfaced for a human, never auto-resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionConflict {
    pub first_reviewer: String,
    pub first: String,
    pub second_reviewer: String,
    pub second: String,
    pub verbs: (String, String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedFeedback {
    pub overall_grade: Grade,
    /// Mean over all records (passing or not), rounded to one decimal.
    pub average_score: f64,
    pub consensus_issues: Vec<ConsensusIssue>,
    pub priority_revisions: Vec<String>,
    pub unanimous_approvals: Vec<String>,
    pub conflicts: Vec<SuggestionConflict>,
}

// ---------------------------------------------------------------------------
// Record validation
// ---------------------------------------------------------------------------

/// Enforce the grade/score consistency invariant on one record.
pub fn validate_record(
    record: FeedbackRecord,
    config: &ConsolidationConfig,
) -> Result<FeedbackRecord> {
    if !(0.0..=100.0).contains(&record.numeric_score) {
        return Err(CrucibleError::Feedback(format!(
            "reviewer '{}' scored {} outside [0, 100]",
            record.reviewer_id, record.numeric_score
        )));
    }
    if record.grade == Grade::Pass && record.numeric_score < config.pass_threshold {
        return match config.on_inconsistent {
            InconsistencyPolicy::Reject => Err(CrucibleError::Feedback(format!(
                "reviewer '{}' graded pass with score {} below threshold {}",
                record.reviewer_id, record.numeric_score, config.pass_threshold
            ))),
            InconsistencyPolicy::Downgrade => {
                tracing::warn!(
                    reviewer = %record.reviewer_id,
                    score = record.numeric_score,
                    threshold = config.pass_threshold,
                    "Inconsistent pass grade downgraded to fail"
                );
                Ok(FeedbackRecord {
                    grade: Grade::Fail,
                    ..record
                })
            }
        };
    }
    Ok(record)
}

// ---------------------------------------------------------------------------
// Consolidation
// ---------------------------------------------------------------------------

/// Merge N independent reviewer records into one decision.
pub fn consolidate(
    records: &[FeedbackRecord],
    config: &ConsolidationConfig,
) -> Result<ConsolidatedFeedback> {
    if records.is_empty() {
        return Err(CrucibleError::Feedback("no reviewer records".into()));
    }

    let records: Vec<FeedbackRecord> = records
        .iter()
        .cloned()
        .map(|r| validate_record(r, config))
        .collect::<Result<_>>()?;

    let n = records.len();
    let pass_count = records.iter().filter(|r| r.grade == Grade::Pass).count();
    let overall_grade = match config.grade_policy {
        GradePolicy::Unanimous if pass_count == n => Grade::Pass,
        GradePolicy::Majority if pass_count * 2 >= n => Grade::Pass,
        _ => Grade::Fail,
    };

    let average_score =
        (records.iter().map(|r| r.numeric_score).sum::<f64>() / n as f64 * 10.0).round() / 10.0;

    let groups = group_issues(&records);
    let mut consensus: Vec<&IssueGroup> =
        groups.iter().filter(|g| g.reviewers.len() >= 2).collect();
    let consensus_issues: Vec<ConsensusIssue> = consensus
        .iter()
        .map(|g| ConsensusIssue {
            representative: g.representative.clone(),
            reviewers: g.reviewers.clone(),
        })
        .collect();

    // Top-K by reviewer count, ties broken by original submission order.
    consensus.sort_by(|a, b| {
        b.reviewers
            .len()
            .cmp(&a.reviewers.len())
            .then(a.first_index.cmp(&b.first_index))
    });
    let priority_revisions: Vec<String> = consensus
        .iter()
        .take(config.top_k)
        .map(|g| g.representative.clone())
        .collect();

    let unanimous_approvals = unanimous_commendations(&records);
    let conflicts = find_conflicts(&records);
    for conflict in &conflicts {
        tracing::warn!(
            first = %conflict.first_reviewer,
            second = %conflict.second_reviewer,
            verbs = ?conflict.verbs,
            "Conflicting reviewer suggestions"
        );
    }

    Ok(ConsolidatedFeedback {
        overall_grade,
        average_score,
        consensus_issues,
        priority_revisions,
        unanimous_approvals,
        conflicts,
    })
}

// ---------------------------------------------------------------------------
// Issue grouping
// ---------------------------------------------------------------------------

struct IssueGroup {
    representative: String,
    normalized: String,
    reviewers: Vec<String>,
    first_index: usize,
}

/// Case-insensitive, punctuation-insensitive form used for matching.
fn normalize(text: &str) -> String {
    let lowered: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Two normalized issues are near-duplicates when one contains the other.
fn issues_match(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a.contains(b) || b.contains(a))
}

fn group_issues(records: &[FeedbackRecord]) -> Vec<IssueGroup> {
    let mut groups: Vec<IssueGroup> = Vec::new();
    let mut index = 0usize;
    for record in records {
        for issue in &record.issues {
            let normalized = normalize(issue);
            if normalized.is_empty() {
                continue;
            }
            match groups
                .iter_mut()
                .find(|g| issues_match(&g.normalized, &normalized))
            {
                Some(group) => {
                    if !group.reviewers.contains(&record.reviewer_id) {
                        group.reviewers.push(record.reviewer_id.clone());
                    }
                }
                None => groups.push(IssueGroup {
                    representative: issue.clone(),
                    normalized,
                    reviewers: vec![record.reviewer_id.clone()],
                    first_index: index,
                }),
            }
            index += 1;
        }
    }
    groups
}

/// Commendations present, after normalization, in every reviewer's list.
fn unanimous_commendations(records: &[FeedbackRecord]) -> Vec<String> {
    let Some((first, rest)) = records.split_first() else {
        return Vec::new();
    };
    first
        .commendations
        .iter()
        .filter(|c| {
            let normalized = normalize(c);
            !normalized.is_empty()
                && rest
                    .iter()
                    .all(|r| r.commendations.iter().any(|other| normalize(other) == normalized))
        })
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Conflict detection (best-effort diagnostic)
// ---------------------------------------------------------------------------

const ANTONYM_VERBS: &[(&str, &str)] = &[
    ("increase", "decrease"),
    ("increase", "reduce"),
    ("add", "remove"),
    ("expand", "shorten"),
    ("lengthen", "shorten"),
    ("expand", "condense"),
    ("strengthen", "weaken"),
    ("raise", "lower"),
];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "to", "of", "in", "on", "for", "with", "be", "is", "are",
    "it", "this", "that", "should", "more", "less",
];

fn find_conflicts(records: &[FeedbackRecord]) -> Vec<SuggestionConflict> {
    let suggestions: Vec<(&str, &str, Vec<String>)> = records
        .iter()
        .flat_map(|r| {
            r.suggestions
                .iter()
                .map(move |s| (r.reviewer_id.as_str(), s.as_str(), tokenize(s)))
        })
        .collect();

    let mut conflicts = Vec::new();
    for (i, (rev_a, text_a, tokens_a)) in suggestions.iter().enumerate() {
        for (rev_b, text_b, tokens_b) in suggestions.iter().skip(i + 1) {
            if rev_a == rev_b {
                continue;
            }
            if let Some(verbs) = antonym_pair(tokens_a, tokens_b) {
                if shares_subject(tokens_a, tokens_b, &verbs) {
                    conflicts.push(SuggestionConflict {
                        first_reviewer: rev_a.to_string(),
                        first: text_a.to_string(),
                        second_reviewer: rev_b.to_string(),
                        second: text_b.to_string(),
                        verbs,
                    });
                }
            }
        }
    }
    conflicts
}

fn tokenize(text: &str) -> Vec<String> {
    normalize(text).split(' ').map(String::from).collect()
}

fn antonym_pair(a: &[String], b: &[String]) -> Option<(String, String)> {
    for (left, right) in ANTONYM_VERBS {
        let has = |tokens: &[String], word: &str| tokens.iter().any(|t| t == word);
        if has(a, left) && has(b, right) {
            return Some((left.to_string(), right.to_string()));
        }
        if has(a, right) && has(b, left) {
            return Some((right.to_string(), left.to_string()));
        }
    }
    None
}

/// Antonymic verbs alone are not a conflict; the suggestions must also talk
/// about the same thing.
fn shares_subject(a: &[String], b: &[String], verbs: &(String, String)) -> bool {
    a.iter().any(|token| {
        token.len() > 3
            && *token != verbs.0
            && *token != verbs.1
            && !STOPWORDS.contains(&token.as_str())
            && b.contains(token)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
