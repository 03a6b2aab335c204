//! Agent-facing runtime: the per-turn injection pipeline and its surfaces.
//!
//! - [`injection::InjectionOrchestrator`] is the entry point. Call
//!   [`build_context_injection`](injection::InjectionOrchestrator::build_context_injection)
//!   once per turn and
//!   [`check_context_compaction_gate`](injection::InjectionOrchestrator::check_context_compaction_gate)
//!   before each tool call.
//! - [`config::ArenaConfig`] holds every tunable, loaded from JSON.
//! - [`events`] defines [`ArenaEvent`] and the [`EventSink`] trait, with
//!   [`LoggingSink`], [`JsonlSink`], [`MemorySink`], and [`CompositeSink`].
//! - [`sources`] defines [`ContextSources`], the host's content provider.

pub mod config;
pub mod events;
pub mod injection;
pub mod sources;

// Re-export commonly used items at the module level.
pub use config::{ArenaConfig, ConfigError, Toggle};
pub use events::{
    ArenaEvent, CompositeSink, EventRecord, EventSink, FnSink, JsonlSink, LoggingSink,
    MemorySink, NoopSink,
};
pub use injection::{InjectionOrchestrator, InjectionOutcome, InjectionRequest};
pub use sources::{ContextSources, StaticSources};
