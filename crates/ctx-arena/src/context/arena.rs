//! Zone-aware packer for injection candidates.
//!
//! Content builders register [`InjectionCandidate`]s into a per-session
//! pending buffer. Once per turn, [`ContextArena::plan`] merges the buffer
//! into a single text that respects the total token budget and every zone's
//! floor and ceiling, and reports [`PlanTelemetry`] describing demand versus
//! what each zone was given. [`ContextArena::commit`] drains the buffer after
//! the caller decides to deliver (or deliberately discard) the plan.
//!
//! Floors are honoured first. When the floors of all zones with demand do not
//! fit the budget, the floors of zones holding no critical candidate are
//! relaxed; if the remaining floors still do not fit, the plan is empty with
//! reason [`PlanReason::FloorUnmet`].

use crate::context::budget::{TokenEstimator, truncate_to_tokens};
use crate::context::zone::{Zone, ZoneBudgetConfig, ZoneTokens};
use crate::context::zone_budget::ZoneAdjustment;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Below this many tokens of zone allowance, an oversized entry is skipped
/// instead of truncated.
pub const MIN_ENTRY_TOKENS: usize = 16;

/// Separator between packed entries.
const ENTRY_SEPARATOR: &str = "\n\n";

/// Packing priority of a candidate. Critical content is packed first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum InjectionPriority {
    Critical,
    High,
    Normal,
}

/// A block of content offered for injection this turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InjectionCandidate {
    /// Producer name, e.g. `"task_ledger"`.
    pub source: String,
    /// Identifier unique within the source.
    pub id: String,
    pub zone: Zone,
    #[serde(default = "default_priority")]
    pub priority: InjectionPriority,
    /// Deliver at most once per session epoch.
    #[serde(default)]
    pub once_per_session: bool,
    pub content: String,
}

fn default_priority() -> InjectionPriority {
    InjectionPriority::Normal
}

impl InjectionCandidate {
    pub fn new(
        source: impl Into<String>,
        id: impl Into<String>,
        zone: Zone,
        content: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            id: id.into(),
            zone,
            priority: InjectionPriority::Normal,
            once_per_session: false,
            content: content.into(),
        }
    }

    pub fn with_priority(mut self, priority: InjectionPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn once_per_session(mut self) -> Self {
        self.once_per_session = true;
        self
    }

    /// Buffer key: `source:id`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.source, self.id)
    }
}

/// Why a plan has the shape it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    /// At least one entry was packed.
    Packed,
    /// Nothing was pending, or nothing fit.
    Empty,
    /// Zone floors could not be satisfied even after relaxation.
    FloorUnmet,
}

/// Feedback signal for the zone controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanTelemetry {
    pub zone_demand_tokens: ZoneTokens,
    pub zone_allocated_tokens: ZoneTokens,
    pub zone_accepted_tokens: ZoneTokens,
    pub floor_unmet: bool,
    pub applied_floor_relaxation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_adaptation: Option<ZoneAdjustment>,
}

/// An entry that made it into the merged text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedEntry {
    pub key: String,
    pub zone: Zone,
    pub priority: InjectionPriority,
    pub tokens: usize,
    pub truncated: bool,
}

/// Result of [`ContextArena::plan`].
#[derive(Debug, Clone, PartialEq)]
pub struct ArenaPlan {
    pub text: String,
    /// Some entry was cut short or left out for lack of budget.
    pub truncated: bool,
    pub consumed_keys: Vec<String>,
    pub entries: Vec<PlannedEntry>,
    pub estimated_tokens: usize,
    pub plan_reason: PlanReason,
    pub telemetry: PlanTelemetry,
}

impl ArenaPlan {
    fn empty(reason: PlanReason, telemetry: PlanTelemetry) -> Self {
        Self {
            text: String::new(),
            truncated: false,
            consumed_keys: Vec::new(),
            entries: Vec::new(),
            estimated_tokens: 0,
            plan_reason: reason,
            telemetry,
        }
    }
}

#[derive(Debug, Default)]
struct ArenaSession {
    /// Registration order is preserved; re-registering a key replaces in place.
    pending: Vec<InjectionCandidate>,
    /// Once-per-session keys already delivered this epoch.
    delivered_once: HashSet<String>,
}

/// Per-session pending buffers and the packing algorithm.
pub struct ContextArena {
    estimator: Arc<dyn TokenEstimator>,
    sessions: HashMap<String, ArenaSession>,
}

impl std::fmt::Debug for ContextArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextArena")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl ContextArena {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            estimator,
            sessions: HashMap::new(),
        }
    }

    /// Add a candidate to the session's pending buffer. Returns `false` when
    /// a once-per-session candidate was already delivered this epoch.
    pub fn register(&mut self, session_id: &str, candidate: InjectionCandidate) -> bool {
        let session = self.sessions.entry(session_id.to_string()).or_default();
        let key = candidate.key();
        if candidate.once_per_session && session.delivered_once.contains(&key) {
            return false;
        }
        match session.pending.iter_mut().find(|c| c.key() == key) {
            Some(existing) => *existing = candidate,
            None => session.pending.push(candidate),
        }
        true
    }

    pub fn pending_len(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, |s| s.pending.len())
    }

    /// Pack the pending buffer into a single text within `token_budget` and
    /// the per-zone limits of `zones`. Does not modify the buffer.
    pub fn plan(
        &self,
        session_id: &str,
        token_budget: usize,
        zones: &ZoneBudgetConfig,
        critical_only: bool,
    ) -> ArenaPlan {
        let Some(session) = self.sessions.get(session_id) else {
            return ArenaPlan::empty(PlanReason::Empty, PlanTelemetry::default());
        };

        let mut candidates: Vec<(&InjectionCandidate, usize)> = session
            .pending
            .iter()
            .filter(|c| !c.content.trim().is_empty())
            .filter(|c| !critical_only || c.priority == InjectionPriority::Critical)
            .map(|c| (c, self.estimator.estimate(c.content.trim())))
            .collect();
        if candidates.is_empty() {
            return ArenaPlan::empty(PlanReason::Empty, PlanTelemetry::default());
        }
        // Stable: registration order survives within equal (priority, zone).
        candidates.sort_by_key(|(c, _)| (c.priority, c.zone));

        let mut telemetry = PlanTelemetry::default();
        for (c, tokens) in &candidates {
            *telemetry.zone_demand_tokens.entry(c.zone).or_insert(0) += tokens;
        }
        let demand = telemetry.zone_demand_tokens.clone();

        let mut floors: ZoneTokens = demand.keys().map(|z| (*z, zones.min(*z))).collect();
        let floor_sum: usize = floors.values().sum();
        if floor_sum > token_budget {
            telemetry.floor_unmet = true;
            let critical_zones: BTreeSet<Zone> = candidates
                .iter()
                .filter(|(c, _)| c.priority == InjectionPriority::Critical)
                .map(|(c, _)| c.zone)
                .collect();
            let relaxed_sum: usize = floors
                .iter()
                .filter(|(z, _)| critical_zones.contains(z))
                .map(|(_, f)| *f)
                .sum();
            if relaxed_sum > token_budget {
                warn!(
                    session_id,
                    floor_sum, relaxed_sum, token_budget, "zone floors unmet after relaxation"
                );
                return ArenaPlan::empty(PlanReason::FloorUnmet, telemetry);
            }
            for (zone, floor) in floors.iter_mut() {
                if !critical_zones.contains(zone) {
                    *floor = 0;
                }
            }
            telemetry.applied_floor_relaxation = true;
            debug!(session_id, floor_sum, relaxed_sum, "relaxed non-critical zone floors");
        }

        // Zones in packing order: best priority first, then zone order.
        let mut zone_order: Vec<(InjectionPriority, Zone)> = Vec::new();
        for (c, _) in &candidates {
            if !zone_order.iter().any(|(_, z)| *z == c.zone) {
                zone_order.push((c.priority, c.zone));
            }
        }
        zone_order.sort();

        let mut allowance = ZoneTokens::new();
        let mut floor_total = 0usize;
        for (zone, want) in &demand {
            let floor = floors
                .get(zone)
                .copied()
                .unwrap_or(0)
                .min(*want)
                .min(zones.max(*zone));
            allowance.insert(*zone, floor);
            floor_total += floor;
        }
        let mut remaining = token_budget.saturating_sub(floor_total);
        for (_, zone) in &zone_order {
            let floor = allowance.get(zone).copied().unwrap_or(0);
            let want = demand.get(zone).copied().unwrap_or(0);
            let reserve = zones.max(*zone).saturating_sub(floor).min(remaining);
            let used = want.saturating_sub(floor).min(reserve);
            remaining -= used;
            telemetry.zone_allocated_tokens.insert(*zone, floor + reserve);
            allowance.insert(*zone, floor + used);
        }

        let mut parts: Vec<String> = Vec::new();
        let mut entries: Vec<PlannedEntry> = Vec::new();
        let mut any_cut = false;
        for (candidate, tokens) in &candidates {
            let zone = candidate.zone;
            let accepted = telemetry.zone_accepted_tokens.entry(zone).or_insert(0);
            let left = allowance.get(&zone).copied().unwrap_or(0).saturating_sub(*accepted);
            let content = candidate.content.trim();

            let (text, used, cut) = if *tokens <= left {
                (content.to_string(), *tokens, false)
            } else if left >= MIN_ENTRY_TOKENS {
                let result = truncate_to_tokens(content, left, self.estimator.as_ref());
                if !result.truncated || result.tokens > left {
                    any_cut = true;
                    continue;
                }
                (result.text, result.tokens, true)
            } else {
                any_cut = true;
                continue;
            };

            *accepted += used;
            any_cut |= cut;
            parts.push(text);
            entries.push(PlannedEntry {
                key: candidate.key(),
                zone,
                priority: candidate.priority,
                tokens: used,
                truncated: cut,
            });
        }

        let text = parts.join(ENTRY_SEPARATOR);
        let estimated_tokens = self.estimator.estimate(&text);
        let plan_reason = if entries.is_empty() {
            PlanReason::Empty
        } else {
            PlanReason::Packed
        };
        ArenaPlan {
            text,
            truncated: any_cut,
            consumed_keys: entries.iter().map(|e| e.key.clone()).collect(),
            entries,
            estimated_tokens,
            plan_reason,
            telemetry,
        }
    }

    /// Drain the session's pending buffer, remembering delivered
    /// once-per-session keys among `consumed_keys`.
    pub fn commit(&mut self, session_id: &str, consumed_keys: &[String]) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        for candidate in session.pending.drain(..) {
            let key = candidate.key();
            if candidate.once_per_session && consumed_keys.contains(&key) {
                session.delivered_once.insert(key);
            }
        }
    }

    /// Forget once-per-session deliveries, e.g. after compaction removed
    /// them from the model context.
    pub fn reset_epoch(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.delivered_once.clear();
        }
    }

    pub fn clear_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::budget::CharRatioEstimator;
    use crate::context::zone::ZoneLimit;

    /// One token per char keeps the arithmetic obvious.
    fn arena() -> ContextArena {
        ContextArena::new(Arc::new(CharRatioEstimator::new(1.0)))
    }

    fn zones() -> ZoneBudgetConfig {
        ZoneBudgetConfig::from_limits([
            (Zone::Identity, ZoneLimit::new(10, 40)),
            (Zone::TaskState, ZoneLimit::new(20, 60)),
            (Zone::WorkingMemory, ZoneLimit::new(0, 50)),
        ])
    }

    fn candidate(id: &str, zone: Zone, len: usize) -> InjectionCandidate {
        InjectionCandidate::new("test", id, zone, "x".repeat(len))
    }

    #[test]
    fn empty_buffer_plans_empty() {
        let plan = arena().plan("s", 100, &zones(), false);
        assert_eq!(plan.plan_reason, PlanReason::Empty);
        assert!(plan.text.is_empty());
    }

    #[test]
    fn packs_everything_that_fits() {
        let mut a = arena();
        a.register("s", candidate("id", Zone::Identity, 20).with_priority(InjectionPriority::Critical));
        a.register("s", candidate("task", Zone::TaskState, 30));
        let plan = a.plan("s", 200, &zones(), false);
        assert_eq!(plan.plan_reason, PlanReason::Packed);
        assert!(!plan.truncated);
        assert_eq!(plan.consumed_keys, vec!["test:id", "test:task"]);
        assert_eq!(plan.telemetry.zone_demand_tokens[&Zone::TaskState], 30);
        assert_eq!(plan.telemetry.zone_accepted_tokens[&Zone::TaskState], 30);
        assert_eq!(plan.telemetry.zone_allocated_tokens[&Zone::TaskState], 60);
    }

    #[test]
    fn critical_entries_come_first() {
        let mut a = arena();
        a.register("s", InjectionCandidate::new("t", "mem", Zone::WorkingMemory, "memory"));
        a.register(
            "s",
            InjectionCandidate::new("t", "id", Zone::Identity, "identity")
                .with_priority(InjectionPriority::Critical),
        );
        let plan = a.plan("s", 200, &zones(), false);
        assert!(plan.text.starts_with("identity"));
        assert!(plan.text.ends_with("memory"));
    }

    #[test]
    fn ceiling_truncates_zone() {
        let mut a = arena();
        a.register("s", candidate("mem", Zone::WorkingMemory, 120));
        let plan = a.plan("s", 500, &zones(), false);
        assert!(plan.truncated);
        assert!(plan.entries[0].truncated);
        let accepted = plan.telemetry.zone_accepted_tokens[&Zone::WorkingMemory];
        assert!(accepted <= 50);
        assert_eq!(plan.telemetry.zone_demand_tokens[&Zone::WorkingMemory], 120);
    }

    #[test]
    fn total_budget_limits_best_effort() {
        let mut a = arena();
        a.register("s", candidate("task", Zone::TaskState, 60).with_priority(InjectionPriority::High));
        a.register("s", candidate("mem", Zone::WorkingMemory, 50));
        let plan = a.plan("s", 70, &zones(), false);
        let task = plan.telemetry.zone_accepted_tokens[&Zone::TaskState];
        let mem = plan.telemetry.zone_accepted_tokens.get(&Zone::WorkingMemory).copied().unwrap_or(0);
        assert_eq!(task, 60);
        assert!(mem <= 10);
        assert!(plan.truncated);
    }

    #[test]
    fn floor_unmet_is_relaxed_when_critical_floors_fit() {
        let mut a = arena();
        a.register("s", candidate("id", Zone::Identity, 10).with_priority(InjectionPriority::Critical));
        a.register("s", candidate("task", Zone::TaskState, 10));
        // Floors 10 + 20 exceed a budget of 25; identity alone fits.
        let plan = a.plan("s", 25, &zones(), false);
        assert!(plan.telemetry.floor_unmet);
        assert!(plan.telemetry.applied_floor_relaxation);
        assert_eq!(plan.plan_reason, PlanReason::Packed);
        assert_eq!(plan.telemetry.zone_accepted_tokens[&Zone::Identity], 10);
    }

    #[test]
    fn floor_unmet_unrecoverable() {
        let zones = ZoneBudgetConfig::from_limits([
            (Zone::TruthLedger, ZoneLimit::new(500, 1000)),
            (Zone::TaskState, ZoneLimit::new(500, 1000)),
        ]);
        let mut a = arena();
        a.register("s", candidate("truth", Zone::TruthLedger, 20).with_priority(InjectionPriority::Critical));
        a.register("s", candidate("task", Zone::TaskState, 20));
        let plan = a.plan("s", 100, &zones, false);
        assert_eq!(plan.plan_reason, PlanReason::FloorUnmet);
        assert!(plan.telemetry.floor_unmet);
        assert!(!plan.telemetry.applied_floor_relaxation);
        assert!(plan.text.is_empty());
        assert!(plan.consumed_keys.is_empty());
    }

    #[test]
    fn critical_only_filters() {
        let mut a = arena();
        a.register("s", candidate("id", Zone::Identity, 10).with_priority(InjectionPriority::Critical));
        a.register("s", candidate("mem", Zone::WorkingMemory, 10));
        let plan = a.plan("s", 200, &zones(), true);
        assert_eq!(plan.consumed_keys, vec!["test:id"]);
        assert!(!plan.telemetry.zone_demand_tokens.contains_key(&Zone::WorkingMemory));
    }

    #[test]
    fn reregistering_replaces_in_place() {
        let mut a = arena();
        a.register("s", InjectionCandidate::new("t", "a", Zone::TaskState, "old"));
        a.register("s", InjectionCandidate::new("t", "a", Zone::TaskState, "new"));
        assert_eq!(a.pending_len("s"), 1);
        assert_eq!(a.plan("s", 100, &zones(), false).text, "new");
    }

    #[test]
    fn once_per_session_refused_after_commit_until_epoch_reset() {
        let mut a = arena();
        let identity = candidate("id", Zone::Identity, 5).once_per_session();
        assert!(a.register("s", identity.clone()));
        let plan = a.plan("s", 100, &zones(), false);
        a.commit("s", &plan.consumed_keys);
        assert_eq!(a.pending_len("s"), 0);
        assert!(!a.register("s", identity.clone()));
        a.reset_epoch("s");
        assert!(a.register("s", identity));
    }

    #[test]
    fn once_per_session_not_marked_when_not_consumed() {
        let mut a = arena();
        let identity = candidate("id", Zone::Identity, 5).once_per_session();
        a.register("s", identity.clone());
        a.commit("s", &[]);
        assert!(a.register("s", identity));
    }

    #[test]
    fn blank_content_ignored() {
        let mut a = arena();
        a.register("s", InjectionCandidate::new("t", "a", Zone::TaskState, "   \n"));
        assert_eq!(a.plan("s", 100, &zones(), false).plan_reason, PlanReason::Empty);
    }
}
