//! Per-turn context injection.
//!
//! [`InjectionOrchestrator`] owns one instance of every arena component and
//! runs them in a fixed order each turn:
//!
//! 1. begin the turn and record the reported context usage;
//! 2. collect candidates from the host's [`ContextSources`] into the packer;
//! 3. ask the stability monitor whether only critical content may go in;
//! 4. pack within the total budget and the session's adaptive zone ceilings;
//! 5. feed the plan telemetry back into the zone controller;
//! 6. accept, truncate, or reject the merged text against usage limits;
//! 7. drop exact repeats of the previous injection for the same scope;
//! 8. update stability and latch a compaction request when warranted.
//!
//! Every outcome is reported through the configured [`EventSink`].

use crate::agent::config::ArenaConfig;
use crate::agent::events::{ArenaEvent, EventRecord, EventSink, NoopSink};
use crate::agent::sources::{ContextSources, collect_candidates};
use crate::context::arena::{ContextArena, InjectionCandidate, PlanReason};
use crate::context::budget::{
    CharRatioEstimator, CompactionReason, ContextBudgetManager, ContextUsage, DropReason,
    PlanOptions, TokenEstimator,
};
use crate::context::clock::{Clock, SystemClock};
use crate::context::pressure::{CompactionGate, GateDecision, PressureStatus};
use crate::context::stability::{NormalOutcome, StabilityMonitor};
use crate::context::zone::{Zone, ZoneBudgetConfig, ZoneLimit};
use crate::context::zone_budget::ZoneBudgetController;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Scope used when the request names none.
pub const DEFAULT_SCOPE: &str = "default";

/// FNV-1a 64-bit hash of injected text.
pub fn content_fingerprint(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in text.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Input for one turn.
#[derive(Debug, Clone, Copy)]
pub struct InjectionRequest<'a> {
    pub session_id: &'a str,
    /// Raw user prompt; used as the recall query.
    pub prompt: &'a str,
    pub usage: Option<ContextUsage>,
    /// Dedup scope. Separate scopes keep separate fingerprints.
    pub injection_scope_id: Option<&'a str>,
    /// Explicit turn number; the session counter advances when absent.
    pub turn: Option<u32>,
}

impl<'a> InjectionRequest<'a> {
    pub fn new(session_id: &'a str, prompt: &'a str) -> Self {
        Self {
            session_id,
            prompt,
            usage: None,
            injection_scope_id: None,
            turn: None,
        }
    }

    pub fn with_usage(mut self, usage: ContextUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_scope(mut self, scope_id: &'a str) -> Self {
        self.injection_scope_id = Some(scope_id);
        self
    }

    pub fn with_turn(mut self, turn: u32) -> Self {
        self.turn = Some(turn);
        self
    }
}

/// What the host should inject this turn.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionOutcome {
    /// Text to prepend to the model input. Empty unless `accepted`.
    pub text: String,
    pub accepted: bool,
    pub original_tokens: usize,
    pub final_tokens: usize,
    pub truncated: bool,
    pub dropped_reason: Option<DropReason>,
    pub turn: u32,
    /// Pending compaction reason after this turn, if any.
    pub compaction_requested: Option<CompactionReason>,
    pub critical_only: bool,
}

impl InjectionOutcome {
    fn dropped(turn: u32, reason: Option<DropReason>, original_tokens: usize) -> Self {
        Self {
            text: String::new(),
            accepted: false,
            original_tokens,
            final_tokens: 0,
            truncated: false,
            dropped_reason: reason,
            turn,
            compaction_requested: None,
            critical_only: false,
        }
    }
}

type ScopeKey = (String, String);

/// What the last delivered injection of a scope left in the context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ScopeState {
    fingerprint: Option<u64>,
    reserved_tokens: usize,
}

/// Composes the packer, budget manager, zone controller, stability monitor,
/// and compaction gate for every session.
pub struct InjectionOrchestrator {
    config: ArenaConfig,
    estimator: Arc<dyn TokenEstimator>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    arena: ContextArena,
    budget: ContextBudgetManager,
    zones: ZoneBudgetController,
    stability: StabilityMonitor,
    gate: CompactionGate,
    scopes: HashMap<ScopeKey, ScopeState>,
}

impl std::fmt::Debug for InjectionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionOrchestrator")
            .field("config", &self.config)
            .field("arena", &self.arena)
            .field("budget", &self.budget)
            .finish()
    }
}

impl InjectionOrchestrator {
    /// Orchestrator with the system clock, a chars-per-token estimator, and
    /// no event sink.
    pub fn new(config: ArenaConfig) -> Self {
        let estimator: Arc<dyn TokenEstimator> =
            Arc::new(CharRatioEstimator::new(config.chars_per_token));
        Self::assemble(config, estimator, Arc::new(SystemClock), Arc::new(NoopSink))
    }

    fn assemble(
        config: ArenaConfig,
        estimator: Arc<dyn TokenEstimator>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            arena: ContextArena::new(estimator.clone()),
            budget: ContextBudgetManager::new(
                config.budget.clone(),
                estimator.clone(),
                clock.clone(),
            ),
            zones: ZoneBudgetController::new(
                config.zones.clone(),
                config.adaptive.config.clone(),
                config.adaptive.enabled,
            ),
            stability: StabilityMonitor::new(
                config.stability.config.clone(),
                config.stability.enabled,
            ),
            gate: CompactionGate::new(config.gate.clone()),
            scopes: HashMap::new(),
            config,
            estimator,
            clock,
            sink,
        }
    }

    // ── Builder methods ───────────────────────────────────────────
    //
    // These rebuild the components, so call them before the first turn.

    pub fn with_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self::assemble(self.config, self.estimator, clock, self.sink)
    }

    pub fn with_estimator(self, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self::assemble(self.config, estimator, self.clock, self.sink)
    }

    // ── Accessors ─────────────────────────────────────────────────

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn budget(&self) -> &ContextBudgetManager {
        &self.budget
    }

    pub fn zones(&self) -> &ZoneBudgetController {
        &self.zones
    }

    pub fn stability(&self) -> &StabilityMonitor {
        &self.stability
    }

    pub fn arena(&self) -> &ContextArena {
        &self.arena
    }

    /// Tokens the scope's last delivered injection occupies in the context.
    pub fn reserved_tokens(&self, session_id: &str, scope_id: &str) -> usize {
        self.scopes
            .get(&scope_key(session_id, scope_id))
            .map_or(0, |s| s.reserved_tokens)
    }

    /// Offer an extra candidate for the session's next injection.
    pub fn register_candidate(&mut self, session_id: &str, candidate: InjectionCandidate) -> bool {
        self.arena.register(session_id, candidate)
    }

    // ── Turn ──────────────────────────────────────────────────────

    /// Plan, budget, and deduplicate this turn's injected context.
    pub fn build_context_injection(
        &mut self,
        sources: &dyn ContextSources,
        request: InjectionRequest<'_>,
    ) -> InjectionOutcome {
        let session_id = request.session_id;
        let scope_id = request.injection_scope_id.unwrap_or(DEFAULT_SCOPE);
        let key = scope_key(session_id, scope_id);

        let turn = self.budget.begin_turn(session_id, request.turn);
        if let Some(usage) = &request.usage {
            self.budget.observe_usage(session_id, usage);
        }

        let prompt = sources.sanitize_input(request.prompt);
        for candidate in collect_candidates(sources, session_id, &prompt) {
            self.arena.register(session_id, candidate);
        }

        let critical_only = self.stability.should_force_critical_only(session_id, turn);
        if critical_only {
            self.emit(
                session_id,
                turn,
                ArenaEvent::ContextArenaCriticalOnly {
                    pending_candidates: self.arena.pending_len(session_id),
                },
            );
        }

        let budgeting = self.config.budget.enabled;
        let (token_budget, zone_config) = if budgeting {
            (
                self.config.budget.max_injection_tokens,
                self.zones.resolve_zone_budget_config(session_id),
            )
        } else {
            (usize::MAX, unbounded_zones())
        };

        let mut plan = self
            .arena
            .plan(session_id, token_budget, &zone_config, critical_only);
        if budgeting
            && let Some(adjustment) = self.zones.observe(session_id, &plan.telemetry)
        {
            self.emit(
                session_id,
                turn,
                ArenaEvent::ContextArenaZoneAdapted {
                    turn: adjustment.turn,
                    moved_tokens: adjustment.moved_tokens,
                    shifts: adjustment.shifts.clone(),
                    max_by_zone: adjustment.max_by_zone.clone(),
                },
            );
            plan.telemetry.zone_adaptation = Some(adjustment);
        }

        let demand_tokens: usize = plan.telemetry.zone_demand_tokens.values().sum();
        if plan.plan_reason == PlanReason::FloorUnmet {
            self.emit(
                session_id,
                turn,
                ArenaEvent::ContextArenaFloorUnmetUnrecoverable {
                    token_budget,
                    zone_demand_tokens: plan.telemetry.zone_demand_tokens.clone(),
                },
            );
            if self.config.request_compaction_on_floor_unmet {
                self.latch_compaction(session_id, turn, CompactionReason::FloorUnmet, None);
            }
            self.arena.commit(session_id, &[]);
            self.record_degraded(session_id, turn);
            self.scopes.entry(key).or_default().reserved_tokens = 0;
            self.emit(
                session_id,
                turn,
                ArenaEvent::ContextInjectionDropped {
                    scope_id: scope_id.to_string(),
                    reason: DropReason::FloorUnmet,
                    source_tokens: demand_tokens,
                },
            );
            let mut outcome =
                InjectionOutcome::dropped(turn, Some(DropReason::FloorUnmet), demand_tokens);
            outcome.critical_only = critical_only;
            outcome.compaction_requested = self.budget.pending_compaction_reason(session_id);
            return outcome;
        }
        if plan.telemetry.floor_unmet {
            self.emit(
                session_id,
                turn,
                ArenaEvent::ContextArenaFloorUnmetRecovered {
                    token_budget,
                    zone_demand_tokens: plan.telemetry.zone_demand_tokens.clone(),
                },
            );
        }

        let mut outcome = if plan.plan_reason == PlanReason::Empty {
            self.arena.commit(session_id, &[]);
            debug!(session_id, turn, "nothing to inject");
            self.record_normal(session_id, turn, critical_only);
            InjectionOutcome::dropped(turn, None, demand_tokens)
        } else {
            let injection =
                self.budget
                    .plan_injection(session_id, &plan.text, None, PlanOptions::default());
            if !injection.accepted {
                let reason = injection.dropped_reason.unwrap_or(DropReason::Unknown);
                self.arena.commit(session_id, &[]);
                self.scopes.entry(key).or_default().reserved_tokens = 0;
                self.emit(
                    session_id,
                    turn,
                    ArenaEvent::ContextInjectionDropped {
                        scope_id: scope_id.to_string(),
                        reason,
                        source_tokens: injection.original_tokens,
                    },
                );
                self.record_degraded(session_id, turn);
                InjectionOutcome::dropped(turn, Some(reason), injection.original_tokens)
            } else {
                let fingerprint = content_fingerprint(&injection.final_text);
                self.arena.commit(session_id, &plan.consumed_keys);
                let scope = self.scopes.entry(key).or_default();
                if scope.fingerprint == Some(fingerprint) {
                    debug!(session_id, turn, scope_id, "duplicate injection dropped");
                    self.emit(
                        session_id,
                        turn,
                        ArenaEvent::ContextInjectionDropped {
                            scope_id: scope_id.to_string(),
                            reason: DropReason::DuplicateContent,
                            source_tokens: injection.original_tokens,
                        },
                    );
                    self.record_normal(session_id, turn, critical_only);
                    InjectionOutcome::dropped(
                        turn,
                        Some(DropReason::DuplicateContent),
                        injection.original_tokens,
                    )
                } else {
                    *scope = ScopeState {
                        fingerprint: Some(fingerprint),
                        reserved_tokens: injection.final_tokens,
                    };
                    let truncated = plan.truncated || injection.truncated;
                    self.emit(
                        session_id,
                        turn,
                        ArenaEvent::ContextInjected {
                            scope_id: scope_id.to_string(),
                            source_tokens: injection.original_tokens,
                            final_tokens: injection.final_tokens,
                            truncated,
                            critical_only,
                            plan_reason: plan.plan_reason,
                            consumed_keys: plan.consumed_keys.clone(),
                            telemetry: plan.telemetry.clone(),
                        },
                    );
                    self.record_normal(session_id, turn, critical_only);
                    InjectionOutcome {
                        text: injection.final_text,
                        accepted: true,
                        original_tokens: injection.original_tokens,
                        final_tokens: injection.final_tokens,
                        truncated,
                        dropped_reason: None,
                        turn,
                        compaction_requested: None,
                        critical_only,
                    }
                }
            }
        };

        let decision = self.budget.should_request_compaction(session_id, None);
        if let Some(reason) = decision.reason.filter(|_| decision.should_compact) {
            self.latch_compaction(session_id, turn, reason, decision.usage_percent);
        }
        outcome.critical_only = critical_only;
        outcome.compaction_requested = self.budget.pending_compaction_reason(session_id);
        outcome
    }

    // ── Compaction ────────────────────────────────────────────────

    /// Current context pressure for a session.
    pub fn pressure(&self, session_id: &str, usage: Option<&ContextUsage>) -> PressureStatus {
        self.gate.pressure(&self.budget, session_id, usage)
    }

    /// Decide whether `tool_name` may run. Blocked calls are reported as
    /// `context_compaction_gate_blocked_tool`.
    pub fn check_context_compaction_gate(
        &self,
        session_id: &str,
        tool_name: &str,
        usage: Option<&ContextUsage>,
    ) -> GateDecision {
        let decision = self.gate.check(&self.budget, session_id, tool_name, usage);
        if let Some(reason) = decision.block_reason.filter(|_| !decision.allowed) {
            self.emit(
                session_id,
                self.budget.turn_index(session_id),
                ArenaEvent::ContextCompactionGateBlockedTool {
                    tool_name: tool_name.to_string(),
                    reason,
                    pressure: decision.pressure.level,
                    usage_percent: decision.pressure.usage_ratio,
                },
            );
        }
        decision
    }

    /// Acknowledge a completed compaction. Starts a new epoch: once-per-session
    /// content and dedup fingerprints are forgotten, zone ceilings return to
    /// their configured values, and stability starts over.
    pub fn on_compacted(&mut self, session_id: &str) {
        self.budget.mark_compacted(session_id);
        self.zones.reset_epoch(session_id);
        self.arena.reset_epoch(session_id);
        self.stability.clear_session(session_id);
        self.scopes.retain(|(s, _), _| s != session_id);
        info!(session_id, "context compacted, arena epoch reset");
    }

    /// Drop all state for a finished session.
    pub fn clear_session(&mut self, session_id: &str) {
        self.arena.clear_session(session_id);
        self.budget.clear_session(session_id);
        self.zones.clear_session(session_id);
        self.stability.clear_session(session_id);
        self.scopes.retain(|(s, _), _| s != session_id);
        debug!(session_id, "session cleared");
    }

    // ── Internals ─────────────────────────────────────────────────

    fn emit(&self, session_id: &str, turn: u32, event: ArenaEvent) {
        self.sink.record(&EventRecord {
            session_id: session_id.to_string(),
            turn,
            timestamp: self.clock.now_ms(),
            event,
        });
    }

    fn latch_compaction(
        &mut self,
        session_id: &str,
        turn: u32,
        reason: CompactionReason,
        usage_percent: Option<f64>,
    ) {
        if self.budget.request_compaction(session_id, reason) {
            self.emit(
                session_id,
                turn,
                ArenaEvent::ContextCompactionRequested {
                    reason,
                    usage_percent,
                },
            );
        }
    }

    fn record_degraded(&mut self, session_id: &str, turn: u32) {
        if self.stability.record_degraded(session_id, turn) {
            let consecutive_degraded_turns = self
                .stability
                .state(session_id)
                .map_or(0, |s| s.consecutive_degraded_turns);
            self.emit(
                session_id,
                turn,
                ArenaEvent::ContextStabilityTripped {
                    consecutive_degraded_turns,
                },
            );
        }
    }

    fn record_normal(&mut self, session_id: &str, turn: u32, was_forced: bool) {
        if self
            .stability
            .record_normal(session_id, NormalOutcome { was_forced, turn })
        {
            self.emit(session_id, turn, ArenaEvent::ContextStabilityRecovered {});
        }
    }
}

fn scope_key(session_id: &str, scope_id: &str) -> ScopeKey {
    (session_id.to_string(), scope_id.to_string())
}

/// Limits used when budgeting is disabled.
fn unbounded_zones() -> ZoneBudgetConfig {
    ZoneBudgetConfig::from_limits(Zone::ALL.map(|z| (z, ZoneLimit::new(0, usize::MAX))))
}
