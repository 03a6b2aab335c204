//! Arena events and sinks.
//!
//! The orchestrator reports every decision it makes through [`ArenaEvent`]
//! variants wrapped in an [`EventRecord`]. Callers implement [`EventSink`] to
//! persist, log, or react to them.
//!
//! Records serialize to one JSON object per event:
//!
//! ```json
//! {"sessionId":"s1","turn":4,"timestamp":1718000000000,
//!  "type":"context_injection_dropped","payload":{"reason":"floor_unmet","sourceTokens":0}}
//! ```
//!
//! # Choosing a sink
//!
//! | Sink | Use case |
//! |------|----------|
//! | [`NoopSink`] | Tests or fire-and-forget runs |
//! | [`LoggingSink`] | Structured logging via `tracing` |
//! | [`FnSink`] | Quick closures |
//! | [`MemorySink`] | Collect records for assertions |
//! | [`JsonlSink`] | Append JSON lines to a file or stdout |
//! | [`CompositeSink`] | Fan out to several sinks in order |

use crate::context::arena::{PlanReason, PlanTelemetry};
use crate::context::budget::{CompactionReason, DropReason};
use crate::context::pressure::{GateBlockReason, PressureLevel};
use crate::context::zone::{Zone, ZoneTokens};
use crate::context::zone_budget::ZoneShift;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// One variant per event name; the variant name in snake_case is the wire
/// `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ArenaEvent {
    /// Merged context was delivered this turn.
    ContextInjected {
        scope_id: String,
        source_tokens: usize,
        final_tokens: usize,
        truncated: bool,
        critical_only: bool,
        plan_reason: PlanReason,
        consumed_keys: Vec<String>,
        telemetry: PlanTelemetry,
    },
    /// Nothing was delivered this turn.
    ContextInjectionDropped {
        scope_id: String,
        reason: DropReason,
        source_tokens: usize,
    },
    /// The zone controller moved ceiling tokens.
    ContextArenaZoneAdapted {
        /// Controller turn, counted from the last epoch reset.
        turn: u32,
        moved_tokens: usize,
        shifts: Vec<ZoneShift>,
        max_by_zone: BTreeMap<Zone, usize>,
    },
    /// Zone floors did not fit the budget even after relaxation.
    ContextArenaFloorUnmetUnrecoverable {
        token_budget: usize,
        zone_demand_tokens: ZoneTokens,
    },
    /// Zone floors did not fit but relaxing non-critical floors recovered.
    ContextArenaFloorUnmetRecovered {
        token_budget: usize,
        zone_demand_tokens: ZoneTokens,
    },
    /// The turn was packed with critical candidates only.
    ContextArenaCriticalOnly { pending_candidates: usize },
    /// A compaction request was latched for the host.
    ContextCompactionRequested {
        reason: CompactionReason,
        usage_percent: Option<f64>,
    },
    /// The compaction gate refused a tool call.
    ContextCompactionGateBlockedTool {
        tool_name: String,
        reason: GateBlockReason,
        pressure: PressureLevel,
        usage_percent: Option<f64>,
    },
    /// The stability monitor tripped into critical-only mode.
    ContextStabilityTripped { consecutive_degraded_turns: u32 },
    /// The session left critical-only mode.
    ContextStabilityRecovered {},
}

impl ArenaEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ArenaEvent::ContextInjected { .. } => "context_injected",
            ArenaEvent::ContextInjectionDropped { .. } => "context_injection_dropped",
            ArenaEvent::ContextArenaZoneAdapted { .. } => "context_arena_zone_adapted",
            ArenaEvent::ContextArenaFloorUnmetUnrecoverable { .. } => {
                "context_arena_floor_unmet_unrecoverable"
            }
            ArenaEvent::ContextArenaFloorUnmetRecovered { .. } => {
                "context_arena_floor_unmet_recovered"
            }
            ArenaEvent::ContextArenaCriticalOnly { .. } => "context_arena_critical_only",
            ArenaEvent::ContextCompactionRequested { .. } => "context_compaction_requested",
            ArenaEvent::ContextCompactionGateBlockedTool { .. } => {
                "context_compaction_gate_blocked_tool"
            }
            ArenaEvent::ContextStabilityTripped { .. } => "context_stability_tripped",
            ArenaEvent::ContextStabilityRecovered {} => "context_stability_recovered",
        }
    }
}

/// An event stamped with its session, turn, and wall-clock time (ms).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub session_id: String,
    pub turn: u32,
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: ArenaEvent,
}

// ── Sink trait ─────────────────────────────────────────────────────

/// Receives every event the orchestrator emits. Must not panic.
pub trait EventSink: Send + Sync {
    fn record(&self, record: &EventRecord);
}

/// Discards every event.
pub struct NoopSink;
impl EventSink for NoopSink {
    fn record(&self, _record: &EventRecord) {}
}

/// A sink backed by a closure.
///
/// ```ignore
/// let sink = FnSink::new(|record| println!("{}", record.event.name()));
/// ```
pub struct FnSink<F>(F)
where
    F: Fn(&EventRecord) + Send + Sync;

impl<F> FnSink<F>
where
    F: Fn(&EventRecord) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventSink for FnSink<F>
where
    F: Fn(&EventRecord) + Send + Sync,
{
    fn record(&self, record: &EventRecord) {
        (self.0)(record)
    }
}

/// Dispatches each record to every inner sink in registration order.
///
/// ```ignore
/// let sink = CompositeSink::new()
///     .with(LoggingSink)
///     .with_opt(jsonl);
/// ```
pub struct CompositeSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Conditionally add a sink.
    pub fn with_if(self, condition: bool, sink: impl EventSink + 'static) -> Self {
        if condition { self.with(sink) } else { self }
    }

    /// Add a sink from an `Option`. `None` is a no-op.
    pub fn with_opt(self, sink: Option<impl EventSink + 'static>) -> Self {
        match sink {
            Some(s) => self.with(s),
            None => self,
        }
    }
}

impl Default for CompositeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for CompositeSink {
    fn record(&self, record: &EventRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}

/// Collects records in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Event names in emission order.
    pub fn names(&self) -> Vec<&'static str> {
        self.records
            .lock()
            .map(|r| r.iter().map(|rec| rec.event.name()).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().iter().filter(|n| **n == name).count()
    }

    pub fn clear(&self) {
        if let Ok(mut r) = self.records.lock() {
            r.clear();
        }
    }
}

impl EventSink for MemorySink {
    fn record(&self, record: &EventRecord) {
        if let Ok(mut r) = self.records.lock() {
            r.push(record.clone());
        }
    }
}

/// Writes one JSON object per line. Write failures are logged, never raised.
pub struct JsonlSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonlSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Append to `path`, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("Failed to open event log {}: {e}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl EventSink for JsonlSink {
    fn record(&self, record: &EventRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize event {}: {e}", record.event.name());
                return;
            }
        };
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            warn!("Failed to write event {}: {e}", record.event.name());
        }
    }
}

/// Mirrors events into `tracing`.
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn record(&self, record: &EventRecord) {
        let session = record.session_id.as_str();
        let turn = record.turn;
        match &record.event {
            ArenaEvent::ContextInjected {
                source_tokens,
                final_tokens,
                truncated,
                critical_only,
                ..
            } => {
                debug!(
                    session, turn, source_tokens, final_tokens, truncated, critical_only,
                    "context injected"
                );
            }
            ArenaEvent::ContextInjectionDropped { reason, .. } => {
                debug!(session, turn, ?reason, "context injection dropped");
            }
            ArenaEvent::ContextArenaZoneAdapted {
                moved_tokens,
                shifts,
                ..
            } => {
                debug!(
                    session,
                    turn,
                    moved_tokens,
                    shifts = shifts.len(),
                    "zone ceilings adapted"
                );
            }
            ArenaEvent::ContextArenaFloorUnmetUnrecoverable { token_budget, .. } => {
                warn!(session, turn, token_budget, "zone floors unmet, injection dropped");
            }
            ArenaEvent::ContextArenaFloorUnmetRecovered { token_budget, .. } => {
                info!(session, turn, token_budget, "zone floors relaxed");
            }
            ArenaEvent::ContextArenaCriticalOnly { pending_candidates } => {
                debug!(session, turn, pending_candidates, "critical-only injection");
            }
            ArenaEvent::ContextCompactionRequested {
                reason,
                usage_percent,
            } => {
                info!(
                    session,
                    turn,
                    reason = reason.as_str(),
                    usage = usage_percent,
                    "compaction requested"
                );
            }
            ArenaEvent::ContextCompactionGateBlockedTool {
                tool_name, reason, ..
            } => {
                info!(
                    session,
                    turn,
                    tool = tool_name.as_str(),
                    reason = reason.as_str(),
                    "tool blocked pending compaction"
                );
            }
            ArenaEvent::ContextStabilityTripped {
                consecutive_degraded_turns,
            } => {
                warn!(session, turn, consecutive_degraded_turns, "stability tripped");
            }
            ArenaEvent::ContextStabilityRecovered {} => {
                info!(session, turn, "stability recovered");
            }
        }
    }
}
