//! Context budget manager: per-session accept/truncate/reject decisions for
//! injected context, and the decision of when to ask the host for compaction.
//!
//! The manager never throws on odd input. Usage telemetry arrives from hosts
//! that disagree on units (a `0.0132` ratio vs `1.32` percentage points), so
//! every percent is normalized and clamped before it is compared against the
//! configured limits.
//!
//! Compaction requests are latched: once [`request_compaction`] records a
//! reason, [`should_request_compaction`] keeps returning it until the host
//! acknowledges with [`mark_compacted`].
//!
//! [`request_compaction`]: ContextBudgetManager::request_compaction
//! [`should_request_compaction`]: ContextBudgetManager::should_request_compaction
//! [`mark_compacted`]: ContextBudgetManager::mark_compacted

use crate::context::clock::Clock;
use crate::context::zone::clamp01;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Smallest token budget a candidate is ever truncated to.
pub const MIN_TRUNCATION_TOKENS: usize = 32;

/// Marker appended to truncated text.
pub const TRUNCATION_MARKER: &str = "\n…[truncated]";

// ── Token estimation ───────────────────────────────────────────────

/// Pluggable token estimator.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Estimates tokens from a characters-per-token ratio, rounding up.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }
}

/// Result of [`truncate_to_tokens`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedText {
    pub text: String,
    pub tokens: usize,
    pub truncated: bool,
}

/// Deterministically truncate `text` to at most `max_tokens`, keeping the
/// head and appending [`TRUNCATION_MARKER`].
///
/// The result never has more tokens than the input. If the marker alone
/// cannot make the text shorter, the input is returned unchanged.
pub fn truncate_to_tokens(
    text: &str,
    max_tokens: usize,
    estimator: &dyn TokenEstimator,
) -> TruncatedText {
    let original = estimator.estimate(text);
    if original <= max_tokens {
        return TruncatedText {
            text: text.to_string(),
            tokens: original,
            truncated: false,
        };
    }

    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let with_marker = |end: usize| {
        let head = text.get(..end).unwrap_or("").trim_end();
        format!("{head}{TRUNCATION_MARKER}")
    };

    // Largest prefix whose marked form fits.
    let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
    while lo < hi {
        let mid = (lo + hi).div_ceil(2);
        if estimator.estimate(&with_marker(boundaries[mid])) <= max_tokens {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    let candidate = with_marker(boundaries[lo]);
    let tokens = estimator.estimate(&candidate);
    if tokens >= original {
        return TruncatedText {
            text: text.to_string(),
            tokens: original,
            truncated: false,
        };
    }
    TruncatedText {
        text: candidate,
        tokens,
        truncated: true,
    }
}

// ── Usage ──────────────────────────────────────────────────────────

/// Model-context usage reported by the host for the current turn.
///
/// Any subset of fields may be present. `percent` may be a ratio (`0.42`) or
/// percentage points (`42.0`); see [`usage_ratio`](Self::usage_ratio).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ContextUsage {
    /// Tokens currently occupying the model context.
    pub tokens: Option<usize>,
    /// Model context window in tokens.
    pub context_window: Option<usize>,
    /// Reported usage, either as a ratio or as percentage points.
    pub percent: Option<f64>,
}

impl ContextUsage {
    pub fn from_tokens(tokens: usize, context_window: usize) -> Self {
        Self {
            tokens: Some(tokens),
            context_window: Some(context_window),
            percent: None,
        }
    }

    pub fn from_percent(percent: f64) -> Self {
        Self {
            tokens: None,
            context_window: None,
            percent: Some(percent),
        }
    }

    /// Normalized usage ratio in `[0, 1]`, or `None` when nothing usable was
    /// reported.
    ///
    /// When both a percent and a token/window pair are present, the percent
    /// is read as whichever unit lands closer to `tokens / context_window`.
    /// Without that hint, values above `1` are taken as percentage points.
    pub fn usage_ratio(&self) -> Option<f64> {
        let derived = match (self.tokens, self.context_window) {
            (Some(tokens), Some(window)) if window > 0 => Some(tokens as f64 / window as f64),
            _ => None,
        };
        let reported = self
            .percent
            .filter(|p| p.is_finite() && *p >= 0.0)
            .map(|p| match derived {
                Some(d) => {
                    let as_points = p / 100.0;
                    if (as_points - d).abs() < (p - d).abs() {
                        as_points
                    } else {
                        p
                    }
                }
                None if p > 1.0 => p / 100.0,
                None => p,
            });
        reported.or(derived).map(clamp01)
    }
}

// ── Config & outcomes ──────────────────────────────────────────────

/// Budget tuning for the [`ContextBudgetManager`].
///
/// Percent fields accept ratios or percentage points in the config file and
/// are normalized to ratios at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BudgetConfig {
    /// When false, every candidate is accepted verbatim.
    pub enabled: bool,
    /// Token budget for the merged injection of a single turn.
    pub max_injection_tokens: usize,
    /// Usage at or above which injections are rejected.
    pub hard_limit_percent: f64,
    /// Usage at or above which compaction is requested.
    pub compaction_threshold_percent: f64,
    /// Usage at or above which compaction cooldowns are bypassed.
    pub pressure_bypass_percent: f64,
    pub min_turns_between_compaction: u32,
    pub min_seconds_between_compaction: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_injection_tokens: 1200,
            hard_limit_percent: 0.94,
            compaction_threshold_percent: 0.82,
            pressure_bypass_percent: 0.88,
            min_turns_between_compaction: 2,
            min_seconds_between_compaction: 45,
        }
    }
}

/// Why the host should compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    UsageThreshold,
    HardLimit,
    FloorUnmet,
}

impl CompactionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CompactionReason::UsageThreshold => "usage_threshold",
            CompactionReason::HardLimit => "hard_limit",
            CompactionReason::FloorUnmet => "floor_unmet",
        }
    }
}

/// Why an injection was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    HardLimit,
    FloorUnmet,
    DuplicateContent,
    Unknown,
}

/// Per-call overrides for [`ContextBudgetManager::plan_injection`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Token budget for this candidate instead of `max_injection_tokens`.
    pub max_tokens: Option<usize>,
}

/// Decision for a single candidate text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionPlan {
    pub accepted: bool,
    pub final_text: String,
    pub original_tokens: usize,
    pub final_tokens: usize,
    pub truncated: bool,
    pub dropped_reason: Option<DropReason>,
}

/// Result of [`ContextBudgetManager::should_request_compaction`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionDecision {
    pub should_compact: bool,
    pub reason: Option<CompactionReason>,
    /// Normalized usage ratio the decision was based on.
    pub usage_percent: Option<f64>,
}

impl CompactionDecision {
    fn no(usage_percent: Option<f64>) -> Self {
        Self {
            should_compact: false,
            reason: None,
            usage_percent,
        }
    }

    fn yes(reason: CompactionReason, usage_percent: Option<f64>) -> Self {
        Self {
            should_compact: true,
            reason: Some(reason),
            usage_percent,
        }
    }
}

/// Per-session budget bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionBudgetState {
    pub turn_index: u32,
    pub last_compaction_turn: Option<u32>,
    pub last_compaction_at_ms: Option<i64>,
    pub last_context_usage: Option<ContextUsage>,
    pub pending_compaction_reason: Option<CompactionReason>,
}

// ── Manager ────────────────────────────────────────────────────────

/// Per-session accept/truncate/reject and compaction decisions.
pub struct ContextBudgetManager {
    config: BudgetConfig,
    estimator: Arc<dyn TokenEstimator>,
    clock: Arc<dyn Clock>,
    sessions: HashMap<String, SessionBudgetState>,
}

impl std::fmt::Debug for ContextBudgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBudgetManager")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl ContextBudgetManager {
    pub fn new(
        config: BudgetConfig,
        estimator: Arc<dyn TokenEstimator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            estimator,
            clock,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Budget state for a session, if it has been seen.
    pub fn state(&self, session_id: &str) -> Option<&SessionBudgetState> {
        self.sessions.get(session_id)
    }

    fn state_mut(&mut self, session_id: &str) -> &mut SessionBudgetState {
        self.sessions.entry(session_id.to_string()).or_default()
    }

    /// Start a turn. An explicit `turn` number is adopted as-is; otherwise the
    /// session's turn index is incremented. Returns the current turn.
    pub fn begin_turn(&mut self, session_id: &str, turn: Option<u32>) -> u32 {
        let state = self.state_mut(session_id);
        state.turn_index = match turn {
            Some(t) => t,
            None => state.turn_index.saturating_add(1),
        };
        state.turn_index
    }

    pub fn turn_index(&self, session_id: &str) -> u32 {
        self.state(session_id).map_or(0, |s| s.turn_index)
    }

    /// Remember the latest usage report for a session.
    pub fn observe_usage(&mut self, session_id: &str, usage: &ContextUsage) {
        self.state_mut(session_id).last_context_usage = Some(*usage);
    }

    /// Normalized usage ratio from `usage`, falling back to the last report.
    pub fn usage_ratio(&self, session_id: &str, usage: Option<&ContextUsage>) -> Option<f64> {
        usage
            .copied()
            .or_else(|| self.state(session_id).and_then(|s| s.last_context_usage))
            .and_then(|u| u.usage_ratio())
    }

    /// Accept, truncate, or reject a candidate injection text.
    pub fn plan_injection(
        &mut self,
        session_id: &str,
        text: &str,
        usage: Option<&ContextUsage>,
        opts: PlanOptions,
    ) -> InjectionPlan {
        let original_tokens = self.estimator.estimate(text);
        if !self.config.enabled {
            return InjectionPlan {
                accepted: true,
                final_text: text.to_string(),
                original_tokens,
                final_tokens: original_tokens,
                truncated: false,
                dropped_reason: None,
            };
        }

        if let Some(usage) = usage {
            self.observe_usage(session_id, usage);
        }
        let usage_ratio = self.usage_ratio(session_id, None);
        if usage_ratio.is_some_and(|r| r >= self.config.hard_limit_percent) {
            debug!(
                session_id,
                usage = usage_ratio,
                "injection rejected at hard limit"
            );
            return InjectionPlan {
                accepted: false,
                final_text: String::new(),
                original_tokens,
                final_tokens: 0,
                truncated: false,
                dropped_reason: Some(DropReason::HardLimit),
            };
        }

        let budget = opts
            .max_tokens
            .unwrap_or(self.config.max_injection_tokens)
            .max(MIN_TRUNCATION_TOKENS);
        let result = truncate_to_tokens(text, budget, self.estimator.as_ref());
        if result.truncated {
            debug!(
                session_id,
                original_tokens,
                final_tokens = result.tokens,
                budget,
                "injection truncated"
            );
        }
        InjectionPlan {
            accepted: true,
            final_text: result.text,
            original_tokens,
            final_tokens: result.tokens,
            truncated: result.truncated,
            dropped_reason: None,
        }
    }

    /// Decide whether the host should compact the session now.
    pub fn should_request_compaction(
        &mut self,
        session_id: &str,
        usage: Option<&ContextUsage>,
    ) -> CompactionDecision {
        if !self.config.enabled {
            return CompactionDecision::no(None);
        }
        if let Some(usage) = usage {
            self.observe_usage(session_id, usage);
        }
        let usage_percent = self.usage_ratio(session_id, None);
        let state = self.state_mut(session_id).clone();

        if let Some(pending) = state.pending_compaction_reason {
            return CompactionDecision::yes(pending, usage_percent);
        }
        let Some(ratio) = usage_percent else {
            return CompactionDecision::no(None);
        };

        let hard = ratio >= self.config.hard_limit_percent;
        let bypass = hard || ratio >= self.config.pressure_bypass_percent;
        if !bypass {
            if let Some(last_turn) = state.last_compaction_turn
                && state.turn_index.saturating_sub(last_turn)
                    < self.config.min_turns_between_compaction
            {
                return CompactionDecision::no(usage_percent);
            }
            if let Some(last_at) = state.last_compaction_at_ms {
                let elapsed_ms = self.clock.now_ms().saturating_sub(last_at);
                let min_ms = (self.config.min_seconds_between_compaction as i64).saturating_mul(1000);
                if elapsed_ms < min_ms {
                    return CompactionDecision::no(usage_percent);
                }
            }
        }

        if hard {
            CompactionDecision::yes(CompactionReason::HardLimit, usage_percent)
        } else if ratio >= self.config.compaction_threshold_percent {
            CompactionDecision::yes(CompactionReason::UsageThreshold, usage_percent)
        } else {
            CompactionDecision::no(usage_percent)
        }
    }

    /// Latch a compaction request. Returns `false` if the same reason was
    /// already pending.
    pub fn request_compaction(&mut self, session_id: &str, reason: CompactionReason) -> bool {
        let state = self.state_mut(session_id);
        if state.pending_compaction_reason == Some(reason) {
            return false;
        }
        state.pending_compaction_reason = Some(reason);
        info!(session_id, reason = reason.as_str(), "compaction requested");
        true
    }

    pub fn pending_compaction_reason(&self, session_id: &str) -> Option<CompactionReason> {
        self.state(session_id)
            .and_then(|s| s.pending_compaction_reason)
    }

    /// Acknowledge a completed compaction: reset cooldown anchors, clear
    /// the pending latch, and forget the pre-compaction usage report.
    pub fn mark_compacted(&mut self, session_id: &str) {
        let now = self.clock.now_ms();
        let state = self.state_mut(session_id);
        state.last_compaction_turn = Some(state.turn_index);
        state.last_compaction_at_ms = Some(now);
        state.pending_compaction_reason = None;
        state.last_context_usage = None;
        debug!(session_id, turn = state.turn_index, "compaction acknowledged");
    }

    pub fn clear_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}
