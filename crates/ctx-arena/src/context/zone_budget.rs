//! Adaptive zone ceilings.
//!
//! The [`ZoneBudgetController`] watches per-turn [`PlanTelemetry`] and moves
//! ceiling tokens from zones that keep leaving their allocation unused
//! (donors) to zones that keep getting truncated (receivers). Signals are
//! smoothed with an exponential moving average so one noisy turn does not
//! reshape the arena.
//!
//! Invariants, for every session and every turn:
//! - each zone's ceiling stays at or above its configured floor;
//! - a shift moves exactly as many tokens out of donors as into receivers, so
//!   the sum of ceilings equals the sum of configured ceilings.

use crate::context::arena::PlanTelemetry;
use crate::context::zone::{Zone, ZoneBudgetConfig, ZoneTokens, clamp01};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Tuning for ceiling adaptation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AdaptiveZoneConfig {
    /// EMA smoothing factor in `(0, 1]`. Higher reacts faster.
    pub ema_alpha: f64,
    /// Observations required before any ceiling moves.
    pub min_turns_before_adapt: u32,
    /// Quantum of a single shift, in tokens.
    pub step_tokens: usize,
    /// Upper bound on tokens moved per turn (rounded down to whole steps).
    pub max_shift_per_turn: usize,
    /// EMA truncation above which a zone with demand becomes a receiver.
    pub upshift_truncation_ratio: f64,
    /// EMA idle ratio above which an unprotected zone becomes a donor.
    pub downshift_idle_ratio: f64,
}

impl Default for AdaptiveZoneConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.3,
            min_turns_before_adapt: 3,
            step_tokens: 32,
            max_shift_per_turn: 96,
            upshift_truncation_ratio: 0.25,
            downshift_idle_ratio: 0.45,
        }
    }
}

/// One donor → receiver transfer within an adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ZoneShift {
    pub from: Zone,
    pub to: Zone,
    pub tokens: usize,
}

/// Ceiling changes applied by a single [`ZoneBudgetController::observe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ZoneAdjustment {
    /// Controller turn at which the shift happened.
    pub turn: u32,
    pub moved_tokens: usize,
    pub shifts: Vec<ZoneShift>,
    /// Ceilings after the shift.
    pub max_by_zone: ZoneTokens,
}

/// Per-session controller state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneControllerState {
    pub turn: u32,
    pub ema_truncation_by_zone: BTreeMap<Zone, f64>,
    pub ema_idle_by_zone: BTreeMap<Zone, f64>,
    pub max_by_zone: ZoneTokens,
}

impl ZoneControllerState {
    fn new(config: &ZoneBudgetConfig) -> Self {
        Self {
            turn: 0,
            ema_truncation_by_zone: BTreeMap::new(),
            ema_idle_by_zone: BTreeMap::new(),
            max_by_zone: Zone::ALL.iter().map(|z| (*z, config.max(*z))).collect(),
        }
    }
}

/// Owns the adaptive ceilings of every session.
#[derive(Debug, Clone)]
pub struct ZoneBudgetController {
    zones: ZoneBudgetConfig,
    adaptive: AdaptiveZoneConfig,
    enabled: bool,
    sessions: HashMap<String, ZoneControllerState>,
}

impl ZoneBudgetController {
    pub fn new(zones: ZoneBudgetConfig, adaptive: AdaptiveZoneConfig, enabled: bool) -> Self {
        Self {
            zones,
            adaptive,
            enabled,
            sessions: HashMap::new(),
        }
    }

    /// Static zone config, never modified by adaptation.
    pub fn base_config(&self) -> &ZoneBudgetConfig {
        &self.zones
    }

    pub fn state(&self, session_id: &str) -> Option<&ZoneControllerState> {
        self.sessions.get(session_id)
    }

    /// Current floors and ceilings for a session.
    pub fn resolve_zone_budget_config(&self, session_id: &str) -> ZoneBudgetConfig {
        let mut config = self.zones.clone();
        if !self.enabled {
            return config;
        }
        if let Some(state) = self.sessions.get(session_id) {
            for (zone, max) in &state.max_by_zone {
                config.set_max(*zone, *max);
            }
        }
        config
    }

    /// Fold one turn of telemetry into the session's EMAs and rebalance
    /// ceilings if warranted. Returns `None` when nothing moved.
    pub fn observe(&mut self, session_id: &str, telemetry: &PlanTelemetry) -> Option<ZoneAdjustment> {
        if !self.enabled {
            return None;
        }
        let zones = &self.zones;
        let cfg = &self.adaptive;
        let state = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ZoneControllerState::new(zones));
        state.turn = state.turn.saturating_add(1);

        let alpha = clamp01(cfg.ema_alpha);
        for zone in Zone::ALL {
            let demand = tokens(&telemetry.zone_demand_tokens, zone);
            let allocated = tokens(&telemetry.zone_allocated_tokens, zone);
            let accepted = tokens(&telemetry.zone_accepted_tokens, zone);
            let truncation = if demand > 0 {
                clamp01(demand.saturating_sub(accepted) as f64 / demand as f64)
            } else {
                0.0
            };
            let idle = if allocated > 0 {
                clamp01(allocated.saturating_sub(accepted) as f64 / allocated as f64)
            } else {
                0.0
            };
            update_ema(&mut state.ema_truncation_by_zone, zone, truncation, alpha);
            update_ema(&mut state.ema_idle_by_zone, zone, idle, alpha);
        }

        if state.turn < cfg.min_turns_before_adapt || cfg.step_tokens == 0 {
            return None;
        }
        let mut units = cfg.max_shift_per_turn / cfg.step_tokens;
        if units == 0 {
            return None;
        }

        let ema = |map: &BTreeMap<Zone, f64>, zone: Zone| map.get(&zone).copied().unwrap_or(0.0);

        let mut receivers: Vec<Zone> = Zone::ALL
            .into_iter()
            .filter(|z| {
                tokens(&telemetry.zone_demand_tokens, *z) > 0
                    && ema(&state.ema_truncation_by_zone, *z) > cfg.upshift_truncation_ratio
            })
            .collect();
        receivers.sort_by(|a, b| {
            ema(&state.ema_truncation_by_zone, *b)
                .total_cmp(&ema(&state.ema_truncation_by_zone, *a))
                .then(a.cmp(b))
        });

        let mut donors: Vec<Zone> = Zone::ALL
            .into_iter()
            .filter(|z| {
                !z.is_protected()
                    && !receivers.contains(z)
                    && ema(&state.ema_idle_by_zone, *z) > cfg.downshift_idle_ratio
                    && state.max_by_zone.get(z).copied().unwrap_or(0)
                        >= zones.min(*z) + cfg.step_tokens
            })
            .collect();
        donors.sort_by(|a, b| {
            ema(&state.ema_idle_by_zone, *b)
                .total_cmp(&ema(&state.ema_idle_by_zone, *a))
                .then(a.cmp(b))
        });

        if receivers.is_empty() || donors.is_empty() {
            return None;
        }

        let mut shifts: Vec<ZoneShift> = Vec::new();
        let mut moved = 0usize;
        let mut next_receiver = 0usize;
        while units > 0 && !donors.is_empty() {
            let donor = donors[0];
            let ceiling = state.max_by_zone.get(&donor).copied().unwrap_or(0);
            if ceiling < zones.min(donor) + cfg.step_tokens {
                donors.remove(0);
                continue;
            }
            let receiver = receivers[next_receiver % receivers.len()];
            next_receiver += 1;

            state.max_by_zone.insert(donor, ceiling - cfg.step_tokens);
            *state.max_by_zone.entry(receiver).or_insert(0) += cfg.step_tokens;
            moved += cfg.step_tokens;
            units -= 1;

            match shifts
                .iter_mut()
                .find(|s| s.from == donor && s.to == receiver)
            {
                Some(shift) => shift.tokens += cfg.step_tokens,
                None => shifts.push(ZoneShift {
                    from: donor,
                    to: receiver,
                    tokens: cfg.step_tokens,
                }),
            }
        }

        if moved == 0 {
            return None;
        }
        debug!(session_id, turn = state.turn, moved, "zone ceilings rebalanced");
        Some(ZoneAdjustment {
            turn: state.turn,
            moved_tokens: moved,
            shifts,
            max_by_zone: state.max_by_zone.clone(),
        })
    }

    /// Drop the session's adaptation history, restoring configured ceilings.
    pub fn reset_epoch(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn clear_session(&mut self, session_id: &str) {
        self.reset_epoch(session_id);
    }
}

fn tokens(map: &ZoneTokens, zone: Zone) -> usize {
    map.get(&zone).copied().unwrap_or(0)
}

fn update_ema(map: &mut BTreeMap<Zone, f64>, zone: Zone, sample: f64, alpha: f64) {
    let next = match map.get(&zone) {
        Some(prev) => alpha * sample + (1.0 - alpha) * prev,
        None => sample,
    };
    map.insert(zone, clamp01(next));
}
