//! Adaptive context budget arena for LLM agent turns.
//!
//! `ctx-arena` decides, per turn and per session, how much auxiliary context
//! (identity, truth facts, task state, recent tool failures, recalled memory)
//! an agent may inject in front of the user's prompt. The model's context
//! window is a hard, shared resource: every injected token competes with the
//! conversation itself. The core abstraction is the
//! [`InjectionOrchestrator`](agent::injection::InjectionOrchestrator), which
//! packs registered candidates into per-zone budgets, adapts those budgets
//! from truncation pressure, deduplicates repeated injections, requests
//! upstream compaction under pressure, and degrades to critical-only injection
//! when a session keeps failing its floors.
//!
//! # Getting started
//!
//! Add `ctx-arena` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! ctx-arena = { path = "../ctx-arena" }
//! ```
//!
//! Then drive one turn:
//!
//! ```
//! use ctx_arena::prelude::*;
//!
//! let mut arena = InjectionOrchestrator::new(ArenaConfig::default())
//!     .with_sink(LoggingSink);
//!
//! let sources = StaticSources {
//!     identity: Some("You are the release assistant.".into()),
//!     ..Default::default()
//! };
//!
//! let outcome = arena.build_context_injection(
//!     &sources,
//!     InjectionRequest::new("session-1", "ship it")
//!         .with_usage(ContextUsage::from_tokens(12_000, 200_000)),
//! );
//! assert!(outcome.accepted);
//! assert!(outcome.text.contains("release assistant"));
//!
//! // Before every tool call:
//! let gate = arena.check_context_compaction_gate("session-1", "read_file", None);
//! assert!(gate.allowed);
//! ```
//!
//! # Where to find things
//!
//! If you're looking for how to...
//!
//! - **Inject context each turn:** see
//!   [`InjectionOrchestrator::build_context_injection`](agent::injection::InjectionOrchestrator::build_context_injection).
//!   Content comes from your [`ContextSources`](agent::sources::ContextSources)
//!   implementation; ad-hoc candidates go through
//!   [`register_candidate`](agent::injection::InjectionOrchestrator::register_candidate).
//!
//! - **Gate tools under pressure:** call
//!   [`check_context_compaction_gate`](agent::injection::InjectionOrchestrator::check_context_compaction_gate)
//!   before each tool call and
//!   [`on_compacted`](agent::injection::InjectionOrchestrator::on_compacted)
//!   once the host has compacted the conversation.
//!
//! - **Configure budgets:** see [`ArenaConfig`](agent::config::ArenaConfig).
//!   Zone floors and ceilings live in
//!   [`ZoneBudgetConfig`](context::zone::ZoneBudgetConfig); adaptive shifting
//!   and stability are [`Toggle`](agent::config::Toggle)s.
//!
//! - **Observe decisions:** implement [`EventSink`](agent::events::EventSink)
//!   or use [`LoggingSink`](agent::events::LoggingSink),
//!   [`JsonlSink`](agent::events::JsonlSink),
//!   [`MemorySink`](agent::events::MemorySink), and
//!   [`CompositeSink`](agent::events::CompositeSink).
//!
//! - **Tune strategy offline:** [`strategy::observer`] turns recorded JSONL
//!   event logs into per-bucket metrics and [`strategy::tuner`] turns those
//!   into time-limited overrides.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | [`InjectionOrchestrator`](agent::injection::InjectionOrchestrator), config, events, context sources |
//! | [`context`] | Zones, the zone-aware packer, budget manager, adaptive zone controller, stability monitor, compaction gate |
//! | [`strategy`] | Offline observer report and strategy override tuner |
//!
//! # Design principles
//!
//! 1. **Context is the scarcest resource.** Every injected token is budgeted.
//!    Candidates are packed by zone, truncated head-first when they overflow,
//!    and rejected outright past the hard limit.
//!
//! 2. **Floors are guarantees.** Critical zones get their minimum or the turn
//!    reports `floor_unmet` and requests compaction. Nothing is silently
//!    under-served.
//!
//! 3. **Degrade, then recover.** Repeated degraded turns switch a session to
//!    critical-only injection, with periodic probes back to normal.
//!
//! 4. **Observability over magic.** Every decision leaves through an
//!    [`EventSink`](agent::events::EventSink) as a typed
//!    [`ArenaEvent`](agent::events::ArenaEvent).
//!
//! 5. **Deterministic under test.** Time comes from an injectable
//!    [`Clock`](context::clock::Clock) and token counts from an injectable
//!    [`TokenEstimator`](context::budget::TokenEstimator).

pub mod agent;
pub mod context;
pub mod prelude;
pub mod strategy;

use schemars::JsonSchema;

// Re-export schemars for downstream crates.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. Used to publish the shape of
/// [`ArenaConfig`](agent::config::ArenaConfig) for host tooling.
///
/// # Example
///
/// ```
/// use ctx_arena::agent::ArenaConfig;
/// use ctx_arena::json_schema_for;
///
/// let schema = json_schema_for::<ArenaConfig>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["properties"].get("budget").is_some());
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}
