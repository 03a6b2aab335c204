//! Convenience re-exports for common `ctx-arena` types.
//!
//! Meant to be glob-imported by hosts:
//!
//! ```ignore
//! use ctx_arena::prelude::*;
//! ```
//!
//! This pulls in what a host needs to drive turns: the
//! [`InjectionOrchestrator`] and its request/outcome types, [`ArenaConfig`],
//! the [`ContextSources`] trait, event sinks, and the core context types.
//! Packer internals, controller state, and the offline strategy tools are
//! left out. Import those from their modules directly when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::json_schema_for;

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    ArenaConfig, ArenaEvent, CompositeSink, ConfigError, ContextSources, EventRecord, EventSink,
    FnSink, InjectionOrchestrator, InjectionOutcome, InjectionRequest, JsonlSink, LoggingSink,
    MemorySink, NoopSink, StaticSources, Toggle,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    Clock, CompactionReason, ContextUsage, DropReason, GateDecision, InjectionCandidate,
    InjectionPriority, ManualClock, PressureLevel, SystemClock, TokenEstimator, Zone,
    ZoneBudgetConfig, ZoneLimit,
};
