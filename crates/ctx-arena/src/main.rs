//! Drive and inspect the context budget arena from the command line.
//!
//! Logs go to stderr (filter with `RUST_LOG`). Event streams and JSON
//! documents go to stdout.
//!
//! # Examples
//!
//! ```sh
//! # Replay a scenario and print every arena event as JSONL
//! ctx-arena simulate --scenario scenario.json --config arena.json
//!
//! # Validate a config and print it normalized
//! ctx-arena check --config arena.json
//!
//! # Print the config JSON Schema
//! ctx-arena schema
//!
//! # Summarize the last 7 days of recorded sessions
//! ctx-arena report --events-dir .orchestrator/events --days 7
//!
//! # Turn the latest report into strategy overrides
//! ctx-arena tune --reports-dir reports --output overrides.json
//!
//! # Show the config a (model, task class) pair would run with
//! ctx-arena tune --input reports/context-strategy-20261019.json \
//!   --resolve-model anthropic/claude-sonnet-4 --resolve-task-class review
//! ```

use clap::{Parser, Subcommand};
use ctx_arena::agent::injection::DEFAULT_SCOPE;
use ctx_arena::agent::{
    ArenaConfig, CompositeSink, InjectionOrchestrator, InjectionRequest, JsonlSink, LoggingSink,
    StaticSources,
};
use ctx_arena::context::{ContextUsage, InjectionCandidate, ManualClock};
use ctx_arena::json_schema_for;
use ctx_arena::strategy::observer::{DEFAULT_LOOKBACK_DAYS, build_report, default_report_name};
use ctx_arena::strategy::tuner::{
    DEFAULT_TTL_HOURS, StrategyOverrides, WILDCARD, find_latest_summary, load_summary,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Drive and inspect the context budget arena.
#[derive(Parser)]
#[command(name = "ctx-arena", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a JSON scenario of turns and print events as JSONL
    Simulate {
        /// Scenario file (see `Scenario`)
        #[arg(long)]
        scenario: PathBuf,

        /// Arena config file; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Also append events to this JSONL file
        #[arg(long)]
        events_out: Option<PathBuf>,
    },

    /// Validate a config file and print it normalized
    Check {
        #[arg(long)]
        config: PathBuf,
    },

    /// Print the JSON Schema of the arena config
    Schema,

    /// Summarize recorded session events into a Markdown + JSON report
    Report {
        /// Directory of per-session `*.jsonl` event files
        #[arg(long)]
        events_dir: PathBuf,

        /// Lookback window in days
        #[arg(long, default_value_t = DEFAULT_LOOKBACK_DAYS)]
        days: u32,

        /// Markdown output path; the JSON summary is written alongside
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Build strategy overrides from a report summary
    Tune {
        // ── Input ──────────────────────────────────────────────
        /// Summary JSON written by `report`
        #[arg(long, conflicts_with = "reports_dir")]
        input: Option<PathBuf>,

        /// Use the newest summary in this directory
        #[arg(long)]
        reports_dir: Option<PathBuf>,

        // ── Output ─────────────────────────────────────────────
        /// Overrides file to write; printed to stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,

        /// Lifetime of each override in hours
        #[arg(long, default_value_t = DEFAULT_TTL_HOURS)]
        ttl_hours: u64,

        // ── Resolution ─────────────────────────────────────────
        /// Print the config this model would run with instead of the overrides
        #[arg(long)]
        resolve_model: Option<String>,

        /// Task class for `--resolve-model`
        #[arg(long, requires = "resolve_model")]
        resolve_task_class: Option<String>,

        /// Base config for `--resolve-model`
        #[arg(long, requires = "resolve_model")]
        config: Option<PathBuf>,
    },
}

// ── Scenario ───────────────────────────────────────────────────────

/// A scripted session for `simulate`. Keys are snake_case throughout,
/// like the nested `usage` and `sources` objects.
#[derive(Deserialize)]
struct Scenario {
    #[serde(default = "default_session_id")]
    session_id: String,
    /// Simulated clock start, epoch milliseconds. Defaults to now so the
    /// recorded events fall inside `report`'s lookback window.
    #[serde(default = "now_ms")]
    start_ms: i64,
    #[serde(default)]
    sources: StaticSources,
    turns: Vec<ScenarioTurn>,
}

#[derive(Deserialize)]
struct ScenarioTurn {
    #[serde(default)]
    prompt: String,
    usage: Option<ContextUsage>,
    scope: Option<String>,
    /// Seconds to advance the clock before this turn.
    #[serde(default)]
    advance_secs: u64,
    /// Extra candidates registered before the turn.
    #[serde(default)]
    candidates: Vec<InjectionCandidate>,
    /// Tools the model tries to call after the injection.
    #[serde(default)]
    tools: Vec<String>,
    /// The host compacts after the tool calls.
    #[serde(default)]
    compacted: bool,
}

fn default_session_id() -> String {
    "sim".to_string()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_scenario(data: &str) -> Result<Scenario, String> {
    serde_json::from_str(data).map_err(|e| format!("Failed to parse scenario: {e}"))
}

// ── Commands ───────────────────────────────────────────────────────

fn load_config(path: Option<&Path>) -> Result<ArenaConfig, String> {
    match path {
        Some(p) => ArenaConfig::load(p).map_err(|e| e.to_string()),
        None => Ok(ArenaConfig::default()),
    }
}

fn to_pretty_json(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("Failed to serialize output: {e}"))
}

fn simulate(
    scenario: &Path,
    config: Option<&Path>,
    events_out: Option<&Path>,
) -> Result<(), String> {
    let config = load_config(config)?;
    let data = std::fs::read_to_string(scenario)
        .map_err(|e| format!("Failed to read scenario {}: {e}", scenario.display()))?;
    let scenario =
        parse_scenario(&data).map_err(|e| format!("{e} ({})", scenario.display()))?;

    let file_sink = events_out.map(JsonlSink::append).transpose()?;
    let sink = CompositeSink::new()
        .with(JsonlSink::stdout())
        .with(LoggingSink)
        .with_opt(file_sink);

    let clock = Arc::new(ManualClock::new(scenario.start_ms));
    let mut arena = InjectionOrchestrator::new(config)
        .with_clock(clock.clone())
        .with_sink(sink);
    let session_id = scenario.session_id.as_str();

    for (index, turn) in scenario.turns.iter().enumerate() {
        clock.advance_secs(turn.advance_secs);
        for candidate in &turn.candidates {
            arena.register_candidate(session_id, candidate.clone());
        }

        let mut request = InjectionRequest::new(session_id, &turn.prompt);
        if let Some(usage) = turn.usage {
            request = request.with_usage(usage);
        }
        if let Some(scope) = turn.scope.as_deref() {
            request = request.with_scope(scope);
        }

        let outcome = arena.build_context_injection(&scenario.sources, request);
        let scope = turn.scope.as_deref().unwrap_or(DEFAULT_SCOPE);
        info!(
            step = index + 1,
            turn = outcome.turn,
            accepted = outcome.accepted,
            final_tokens = outcome.final_tokens,
            reserved_tokens = arena.reserved_tokens(session_id, scope),
            truncated = outcome.truncated,
            critical_only = outcome.critical_only,
            dropped = ?outcome.dropped_reason,
            compaction = ?outcome.compaction_requested,
            "turn simulated"
        );

        for tool in &turn.tools {
            let decision =
                arena.check_context_compaction_gate(session_id, tool, turn.usage.as_ref());
            if !decision.allowed {
                warn!(tool = tool.as_str(), "tool blocked by compaction gate");
            }
        }
        if turn.compacted {
            arena.on_compacted(session_id);
        }
    }
    Ok(())
}

fn check(config: &Path) -> Result<(), String> {
    let config = ArenaConfig::load(config).map_err(|e| e.to_string())?;
    println!("{}", to_pretty_json(&config)?);
    Ok(())
}

fn schema() -> Result<(), String> {
    println!("{}", to_pretty_json(&json_schema_for::<ArenaConfig>())?);
    Ok(())
}

fn report(events_dir: &Path, days: u32, output: Option<PathBuf>) -> Result<(), String> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let report = build_report(events_dir, days, now_ms)?;
    let output =
        output.unwrap_or_else(|| PathBuf::from("reports").join(default_report_name(now_ms)));
    let summary_path = report.write(&output)?;
    info!(
        buckets = report.summary.buckets.len(),
        report = %output.display(),
        summary = %summary_path.display(),
        "strategy report written"
    );
    Ok(())
}

struct TuneArgs {
    input: Option<PathBuf>,
    reports_dir: Option<PathBuf>,
    output: Option<PathBuf>,
    ttl_hours: u64,
    resolve_model: Option<String>,
    resolve_task_class: Option<String>,
    config: Option<PathBuf>,
}

fn tune(args: TuneArgs) -> Result<(), String> {
    let input = match (args.input, args.reports_dir) {
        (Some(path), _) => path,
        (None, Some(dir)) => find_latest_summary(&dir)
            .ok_or_else(|| format!("No context-strategy summary found in {}", dir.display()))?,
        (None, None) => return Err("provide --input or --reports-dir".to_string()),
    };
    let summary = load_summary(&input)?;
    let now_ms = chrono::Utc::now().timestamp_millis();
    let overrides = StrategyOverrides::build(&summary, args.ttl_hours, now_ms);
    info!(
        input = %input.display(),
        entries = overrides.entries.len(),
        "strategy overrides built"
    );

    if let Some(path) = args.output.as_deref() {
        overrides.save(path)?;
        info!(output = %path.display(), "strategy overrides written");
    }

    match args.resolve_model {
        Some(model) => {
            let task_class = args.resolve_task_class.as_deref().unwrap_or(WILDCARD);
            let mut config = load_config(args.config.as_deref())?;
            match overrides.resolve(&model, task_class, now_ms) {
                Some(entry) => {
                    info!(id = entry.id.as_str(), arm = %entry.arm, "override matched");
                    entry.arm.apply_to(&mut config);
                }
                None => info!(model = model.as_str(), task_class, "no override matched"),
            }
            println!("{}", to_pretty_json(&config)?);
        }
        None if args.output.is_none() => println!("{}", overrides.to_json()?),
        None => {}
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Simulate {
            scenario,
            config,
            events_out,
        } => simulate(&scenario, config.as_deref(), events_out.as_deref()),
        Command::Check { config } => check(&config),
        Command::Schema => schema(),
        Command::Report {
            events_dir,
            days,
            output,
        } => report(&events_dir, days, output),
        Command::Tune {
            input,
            reports_dir,
            output,
            ttl_hours,
            resolve_model,
            resolve_task_class,
            config,
        } => tune(TuneArgs {
            input,
            reports_dir,
            output,
            ttl_hours,
            resolve_model,
            resolve_task_class,
            config,
        }),
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_keys_are_snake_case() {
        let scenario = parse_scenario(
            r#"{
                "session_id": "demo",
                "start_ms": 1000,
                "sources": {"working_memory": "notes"},
                "turns": [
                    {"prompt": "go", "advance_secs": 5, "compacted": true,
                     "usage": {"tokens": 10, "context_window": 100}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(scenario.session_id, "demo");
        assert_eq!(scenario.start_ms, 1000);
        assert_eq!(scenario.sources.working_memory.as_deref(), Some("notes"));
        assert_eq!(scenario.turns[0].advance_secs, 5);
        assert!(scenario.turns[0].compacted);
        assert!(scenario.turns[0].usage.is_some());
    }

    #[test]
    fn scenario_clock_starts_now_by_default() {
        let before = chrono::Utc::now().timestamp_millis();
        let scenario = parse_scenario(r#"{"turns": []}"#).unwrap();
        assert_eq!(scenario.session_id, "sim");
        assert!(scenario.start_ms >= before);
        assert!(scenario.start_ms - before < 60_000);
    }
}
