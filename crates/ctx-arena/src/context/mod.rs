//! Context budget primitives: zones, token budgets, adaptive ceilings,
//! stability, and compaction pressure.
//!
//! Each component keeps its own per-session state keyed by session id and is
//! driven by the [`InjectionOrchestrator`](crate::agent::injection::InjectionOrchestrator):
//!
//! 1. **[`zone`]** — the fixed set of [`Zone`]s and their floors/ceilings.
//! 2. **[`arena`]** — [`ContextArena`] packs registered candidates into one
//!    text within the total budget and each zone's limits.
//! 3. **[`zone_budget`]** — [`ZoneBudgetController`] moves ceiling tokens from
//!    idle zones to truncated ones.
//! 4. **[`budget`]** — [`ContextBudgetManager`] accepts, truncates, or rejects
//!    the merged text and decides when to request compaction.
//! 5. **[`stability`]** — [`StabilityMonitor`] forces critical-only injection
//!    after repeated degraded turns.
//! 6. **[`pressure`]** — [`CompactionGate`] blocks tools while compaction is
//!    required.

pub mod arena;
pub mod budget;
pub mod clock;
pub mod pressure;
pub mod stability;
pub mod zone;
pub mod zone_budget;

// Re-export commonly used items at the module level.
pub use arena::{ArenaPlan, ContextArena, InjectionCandidate, InjectionPriority, PlanTelemetry};
pub use budget::{
    BudgetConfig, CharRatioEstimator, CompactionReason, ContextBudgetManager, ContextUsage,
    DEFAULT_CHARS_PER_TOKEN, DropReason, TokenEstimator,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use pressure::{CompactionGate, GateDecision, PressureLevel};
pub use stability::StabilityMonitor;
pub use zone::{Zone, ZoneBudgetConfig, ZoneLimit};
pub use zone_budget::{AdaptiveZoneConfig, ZoneBudgetController};
