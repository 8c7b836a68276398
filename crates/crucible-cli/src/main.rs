//! CLI binary for running Crucible pipelines.
//!
//! Ships a built-in demo pipeline (parallel research → cited draft →
//! quorum-gated refinement loop → approval checkpoint) wired to scripted
//! capabilities, so the engine's behavior can be observed without any
//! external services.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use crucible_pipeline::{
    ApprovalCapability, AutoApprover, CapabilityOutput, CapabilityRegistry, ConsolidationConfig,
    Engine, EscalationRegistry, GradePolicy, GroundingEvent, JsonFileSessionStore,
    LeafStage, QuorumEscalation, ScriptedCapability, ScriptedResponse, SessionStore, Stage,
};
use crucible_types::{new_session_id, SessionState};

#[derive(Parser)]
#[command(name = "crucible", version, about = "Multi-stage agent pipeline orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in demo pipeline with scripted capabilities
    Demo {
        /// Iteration budget for the refinement loop
        #[arg(long, default_value = "4")]
        max_iterations: u32,

        /// Quorum policy for the review panel
        #[arg(long, value_enum, default_value = "majority")]
        policy: PolicyArg,

        /// Save the final session state under this directory
        #[arg(long)]
        save_to: Option<PathBuf>,

        /// Print every event instead of a summary
        #[arg(long)]
        events: bool,
    },

    /// Print the demo pipeline's stage tree as JSON
    Explain,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    Majority,
    Unanimous,
}

impl From<PolicyArg> for GradePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Majority => GradePolicy::Majority,
            PolicyArg::Unanimous => GradePolicy::Unanimous,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Demo {
            max_iterations,
            policy,
            save_to,
            events,
        } => cmd_demo(max_iterations, policy.into(), save_to, events).await,
        Commands::Explain => cmd_explain(),
    }
}

// ---------------------------------------------------------------------------
// demo
// ---------------------------------------------------------------------------

async fn cmd_demo(
    max_iterations: u32,
    policy: GradePolicy,
    save_to: Option<PathBuf>,
    print_events: bool,
) -> anyhow::Result<()> {
    let session_id = new_session_id();
    let engine = build_demo_engine(&session_id, policy);

    let state = SessionState::new();
    state
        .set("topic", json!("Bounded refinement loops in agent pipelines"))
        .await;

    let tree = demo_tree(max_iterations);
    let report = engine.run(&tree, state.clone()).await?;

    if print_events {
        for event in &report.events {
            println!(
                "#{:<3} {:<18} {:<14} {}",
                event.seq,
                format!("{:?}", event.kind),
                event.stage_id,
                event.payload
            );
        }
    } else {
        println!("session:  {session_id}");
        println!("status:   {}", report.status.as_str());
        println!("reason:   {}", report.reason);
        println!("events:   {}", report.events.len());
        println!("sources:");
        for source in &report.sources {
            println!("  {:<7} {} ({})", source.short_id, source.title, source.domain);
        }
        if let Some(draft) = report.final_state.get("draft").and_then(|v| v.as_str()) {
            println!("draft:\n{draft}");
        }
    }

    if let Some(root) = save_to {
        let store = JsonFileSessionStore::new(root);
        store.save(&state.to_snapshot(&session_id).await).await?;
        tracing::info!(session = %session_id, "Session saved");
    }

    Ok(())
}

fn cmd_explain() -> anyhow::Result<()> {
    let tree = demo_tree(4);
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Demo pipeline
// ---------------------------------------------------------------------------

/// Parallel research, a cited draft, a quorum-gated refinement loop, and a
/// final approval checkpoint.
fn demo_tree(max_iterations: u32) -> Stage {
    Stage::sequential(
        "research_report",
        vec![
            Stage::parallel(
                "research",
                vec![
                    Stage::Leaf(
                        LeafStage::new("search_web", "search.web", "web_findings")
                            .input("topic")
                            .hook("record_sources"),
                    ),
                    Stage::Leaf(
                        LeafStage::new("search_papers", "search.papers", "paper_findings")
                            .input("topic")
                            .hook("record_sources"),
                    ),
                ],
            ),
            Stage::Leaf(
                LeafStage::new("draft", "llm.writer", "draft")
                    .input("topic")
                    .input("web_findings")
                    .input("paper_findings")
                    .hook("resolve_citations"),
            ),
            Stage::bounded_loop(
                "refine",
                Stage::sequential(
                    "refine_body",
                    vec![
                        Stage::Leaf(
                            LeafStage::new("review_panel", "llm.panel", "reviews")
                                .input("draft")
                                .hook("consolidate_feedback"),
                        ),
                        Stage::Leaf(
                            LeafStage::new("revise", "llm.reviser", "draft").input("reviews"),
                        ),
                    ],
                ),
                max_iterations,
                "quorum",
            ),
            Stage::Leaf(
                LeafStage::new("publish_gate", "wait.approval", "approval")
                    .param("checkpoint", json!("publish")),
            ),
        ],
    )
}

fn build_demo_engine(session_id: &str, policy: GradePolicy) -> Engine {
    let mut capabilities = CapabilityRegistry::new();

    capabilities.register(ScriptedCapability::new(
        "search.web",
        vec![ScriptedResponse::Output(
            CapabilityOutput::text(
                "Survey posts agree that refinement loops need hard iteration caps.",
            )
            .with_grounding(vec![
                GroundingEvent::new("https://blog.example/loops", "On Refinement Loops"),
                GroundingEvent::new("https://docs.example/pipelines", "Pipeline Patterns"),
            ]),
        )],
    ));

    capabilities.register(ScriptedCapability::new(
        "search.papers",
        vec![ScriptedResponse::Output(
            CapabilityOutput::text("Published evaluations gate loops on reviewer quorums.")
                .with_grounding(vec![
                    // Same survey both searches find — deduplicated to one id.
                    GroundingEvent::new("https://docs.example/pipelines", "Pipeline Patterns"),
                    GroundingEvent::new("https://papers.example/quorum", "Quorum Grading"),
                ]),
        )],
    ));

    capabilities.register(ScriptedCapability::constant(
        "llm.writer",
        json!(
            "Bounded loops keep agent pipelines honest <cite source=\"src-1\"/> . \
             Reviewer quorums decide when a draft is done <cite source=\"src-3\"/> ."
        ),
    ));

    capabilities.register(ScriptedCapability::new(
        "llm.panel",
        vec![
            ScriptedResponse::Output(CapabilityOutput::value(json!([
                {"reviewer_id": "structure", "grade": "fail", "numeric_score": 58.0,
                 "issues": ["conclusion is missing"],
                 "suggestions": ["expand the conclusion section"]},
                {"reviewer_id": "evidence", "grade": "fail", "numeric_score": 62.0,
                 "issues": ["Conclusion is missing!"],
                 "suggestions": ["shorten the conclusion section"]},
                {"reviewer_id": "style", "grade": "pass", "numeric_score": 75.0,
                 "commendations": ["clear citations"]},
            ]))),
            ScriptedResponse::Output(CapabilityOutput::value(json!([
                {"reviewer_id": "structure", "grade": "pass", "numeric_score": 84.0,
                 "commendations": ["clear citations"]},
                {"reviewer_id": "evidence", "grade": "pass", "numeric_score": 80.0,
                 "commendations": ["clear citations"]},
                {"reviewer_id": "style", "grade": "fail", "numeric_score": 66.0,
                 "issues": ["uneven paragraph lengths"]},
            ]))),
        ],
    ));

    capabilities.register(ScriptedCapability::new(
        "llm.reviser",
        vec![ScriptedResponse::Output(CapabilityOutput::text(
            "Bounded loops keep agent pipelines honest, and reviewer quorums \
             decide when a draft is done. The conclusion now states both.",
        ))],
    ));

    capabilities.register(ApprovalCapability::new(session_id, Arc::new(AutoApprover)));

    let mut escalations = EscalationRegistry::new();
    escalations.register(QuorumEscalation::new(
        "quorum",
        "reviews",
        ConsolidationConfig {
            grade_policy: policy,
            ..ConsolidationConfig::default()
        },
    ));

    Engine::new(capabilities, escalations)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
