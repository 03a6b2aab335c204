//! Stability monitor: trips a session into critical-only injection after
//! repeated degraded turns, and lets it out again on a genuine recovery.
//!
//! While tripped, [`StabilityMonitor::should_force_critical_only`] returns
//! `true` except on periodic probe turns, where the caller attempts a full
//! injection. A normal outcome that was itself produced under the forced mode
//! does not count as recovery.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Stability tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StabilityConfig {
    /// Consecutive degraded turns that trip the monitor.
    pub consecutive_threshold: u32,
    /// Every Nth turn since tripping is a recovery probe. Zero disables probes.
    pub recovery_probe_interval_turns: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            consecutive_threshold: 3,
            recovery_probe_interval_turns: 5,
        }
    }
}

/// Per-session stability state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StabilityState {
    pub consecutive_degraded_turns: u32,
    pub stabilized: bool,
    pub last_degraded_turn: Option<u32>,
    pub stabilized_since_turn: Option<u32>,
}

/// A non-degraded turn outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalOutcome {
    /// The outcome was produced under forced critical-only mode.
    pub was_forced: bool,
    pub turn: u32,
}

#[derive(Debug, Clone)]
pub struct StabilityMonitor {
    config: StabilityConfig,
    enabled: bool,
    sessions: HashMap<String, StabilityState>,
}

impl StabilityMonitor {
    pub fn new(config: StabilityConfig, enabled: bool) -> Self {
        Self {
            config,
            enabled,
            sessions: HashMap::new(),
        }
    }

    pub fn state(&self, session_id: &str) -> Option<&StabilityState> {
        self.sessions.get(session_id)
    }

    pub fn is_stabilized(&self, session_id: &str) -> bool {
        self.state(session_id).is_some_and(|s| s.stabilized)
    }

    /// Record a degraded turn. Counts at most once per turn number. Returns
    /// `true` only for the call that trips the monitor.
    pub fn record_degraded(&mut self, session_id: &str, turn: u32) -> bool {
        if !self.enabled {
            return false;
        }
        let threshold = self.config.consecutive_threshold.max(1);
        let state = self.sessions.entry(session_id.to_string()).or_default();
        if state.last_degraded_turn == Some(turn) {
            return false;
        }
        state.consecutive_degraded_turns = state.consecutive_degraded_turns.saturating_add(1);
        state.last_degraded_turn = Some(turn);

        if state.stabilized {
            // Still failing: restart the probe cadence.
            state.stabilized_since_turn = Some(turn);
            return false;
        }
        if state.consecutive_degraded_turns >= threshold {
            state.stabilized = true;
            state.stabilized_since_turn = Some(turn);
            warn!(
                session_id,
                turn,
                consecutive = state.consecutive_degraded_turns,
                "session stabilized: forcing critical-only injection"
            );
            return true;
        }
        false
    }

    /// Record a normal turn. Returns `true` when this un-trips the monitor.
    pub fn record_normal(&mut self, session_id: &str, outcome: NormalOutcome) -> bool {
        if !self.enabled || outcome.was_forced {
            return false;
        }
        let Some(state) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let was_stabilized = state.stabilized;
        *state = StabilityState::default();
        if was_stabilized {
            info!(session_id, turn = outcome.turn, "session recovered from stabilization");
        }
        was_stabilized
    }

    /// Whether this turn must inject critical content only.
    pub fn should_force_critical_only(&self, session_id: &str, turn: u32) -> bool {
        let Some(state) = self.sessions.get(session_id) else {
            return false;
        };
        if !self.enabled || !state.stabilized {
            return false;
        }
        let interval = self.config.recovery_probe_interval_turns;
        let since = state.stabilized_since_turn.unwrap_or(turn);
        let elapsed = turn.saturating_sub(since);
        let probe = interval > 0 && elapsed > 0 && elapsed.is_multiple_of(interval);
        !probe
    }

    pub fn clear_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}
