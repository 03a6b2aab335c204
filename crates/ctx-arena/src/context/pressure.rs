//! Context pressure classification and the compaction gate.
//!
//! The gate sits in front of tool execution. While a compaction is required,
//! every tool except the compaction tool itself is blocked, so the agent
//! cannot keep growing a context that is already past its limits.

use crate::context::budget::{CompactionReason, ContextBudgetManager, ContextUsage};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse context pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl PressureLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PressureLevel::None => "none",
            PressureLevel::Low => "low",
            PressureLevel::Medium => "medium",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a usage ratio against the hard limit and compaction threshold.
///
/// `critical ≥ hard_limit`, `high ≥ threshold`, `medium ≥ max(0.5·threshold,
/// 0.5)`, `low ≥ max(0.25·threshold, 0.25)`. The medium and low boundaries
/// never rise above the high boundary.
pub fn classify_pressure(
    usage_ratio: Option<f64>,
    hard_limit: f64,
    compaction_threshold: f64,
) -> PressureLevel {
    let Some(ratio) = usage_ratio else {
        return PressureLevel::None;
    };
    let medium = (compaction_threshold * 0.5).max(0.5).min(compaction_threshold);
    let low = (compaction_threshold * 0.25).max(0.25).min(medium);
    if ratio >= hard_limit {
        PressureLevel::Critical
    } else if ratio >= compaction_threshold {
        PressureLevel::High
    } else if ratio >= medium {
        PressureLevel::Medium
    } else if ratio >= low {
        PressureLevel::Low
    } else {
        PressureLevel::None
    }
}

/// Pressure snapshot for a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PressureStatus {
    pub level: PressureLevel,
    pub usage_ratio: Option<f64>,
    pub hard_limit_ratio: f64,
    pub compaction_threshold_ratio: f64,
}

/// Gate tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GateConfig {
    /// Tool that performs compaction; always allowed.
    pub compaction_tool_name: String,
    /// A compaction within this many turns suppresses the critical-pressure
    /// requirement.
    pub compaction_window_turns: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            compaction_tool_name: "session_compact".to_string(),
            compaction_window_turns: 2,
        }
    }
}

/// Why the gate blocked a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GateBlockReason {
    FloorUnmet,
    CriticalPressure,
}

impl GateBlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GateBlockReason::FloorUnmet => "floor_unmet",
            GateBlockReason::CriticalPressure => "critical_context_pressure",
        }
    }
}

/// Outcome of [`CompactionGate::check`].
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub allowed: bool,
    /// Compaction is currently required for the session.
    pub required: bool,
    pub block_reason: Option<GateBlockReason>,
    /// Message for the model when blocked.
    pub message: Option<String>,
    pub pressure: PressureStatus,
}

/// Blocks non-compaction tools while compaction is required.
#[derive(Debug, Clone, Default)]
pub struct CompactionGate {
    config: GateConfig,
}

impl CompactionGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Current pressure for a session.
    pub fn pressure(
        &self,
        budget: &ContextBudgetManager,
        session_id: &str,
        usage: Option<&ContextUsage>,
    ) -> PressureStatus {
        let usage_ratio = budget.usage_ratio(session_id, usage);
        let cfg = budget.config();
        PressureStatus {
            level: classify_pressure(
                usage_ratio,
                cfg.hard_limit_percent,
                cfg.compaction_threshold_percent,
            ),
            usage_ratio,
            hard_limit_ratio: cfg.hard_limit_percent,
            compaction_threshold_ratio: cfg.compaction_threshold_percent,
        }
    }

    /// Decide whether `tool_name` may run.
    pub fn check(
        &self,
        budget: &ContextBudgetManager,
        session_id: &str,
        tool_name: &str,
        usage: Option<&ContextUsage>,
    ) -> GateDecision {
        let pressure = self.pressure(budget, session_id, usage);
        let allow = |required| GateDecision {
            allowed: true,
            required,
            block_reason: None,
            message: None,
            pressure,
        };
        if !budget.config().enabled {
            return allow(false);
        }

        let floor_unmet =
            budget.pending_compaction_reason(session_id) == Some(CompactionReason::FloorUnmet);
        let recently_compacted = budget.state(session_id).is_some_and(|s| {
            s.last_compaction_turn.is_some_and(|last| {
                s.turn_index.saturating_sub(last) <= self.config.compaction_window_turns
            })
        });
        let critical = pressure.level == PressureLevel::Critical && !recently_compacted;

        let block_reason = if floor_unmet {
            GateBlockReason::FloorUnmet
        } else if critical {
            GateBlockReason::CriticalPressure
        } else {
            return allow(false);
        };
        if tool_name == self.config.compaction_tool_name {
            return allow(true);
        }

        let message = match block_reason {
            GateBlockReason::FloorUnmet => format!(
                "Context compaction required: injected context cannot meet its minimum \
                 guarantees (floor_unmet). Call `{}` before using `{tool_name}`.",
                self.config.compaction_tool_name
            ),
            GateBlockReason::CriticalPressure => format!(
                "Context compaction required: context usage is critical ({:.0}%). \
                 Call `{}` before using `{tool_name}`.",
                pressure.usage_ratio.unwrap_or(1.0) * 100.0,
                self.config.compaction_tool_name
            ),
        };
        GateDecision {
            allowed: false,
            required: true,
            block_reason: Some(block_reason),
            message: Some(message),
            pressure,
        }
    }
}
