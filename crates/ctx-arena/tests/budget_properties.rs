//! End-to-end properties of the arena through its public API.

use ctx_arena::agent::sources::{TaskItem, TaskState, TaskStatus, TruthFact, TruthState};
use ctx_arena::agent::{
    ArenaConfig, ArenaEvent, InjectionOrchestrator, InjectionRequest, MemorySink, StaticSources,
};
use ctx_arena::context::arena::PlanReason;
use ctx_arena::context::budget::PlanOptions;
use ctx_arena::context::stability::{NormalOutcome, StabilityConfig};
use ctx_arena::context::zone_budget::ZoneBudgetController;
use ctx_arena::context::{
    AdaptiveZoneConfig, BudgetConfig, CharRatioEstimator, CompactionReason, ContextArena,
    ContextBudgetManager, ContextUsage, DropReason, InjectionCandidate, InjectionPriority,
    ManualClock, PlanTelemetry, StabilityMonitor, Zone, ZoneBudgetConfig, ZoneLimit,
};
use std::sync::Arc;

fn words(n: usize) -> String {
    vec!["lorem"; n].join(" ")
}

fn sources() -> StaticSources {
    StaticSources {
        identity: Some("You are the deploy agent for the payments service.".into()),
        truth: TruthState {
            facts: vec![TruthFact {
                id: "f1".into(),
                summary: "staging is frozen until Friday".into(),
                detail: None,
                active: true,
            }],
        },
        task: TaskState {
            goal: Some("roll out the retry fix".into()),
            items: vec![TaskItem {
                id: "t1".into(),
                title: "open the rollout PR".into(),
                status: TaskStatus::InProgress,
            }],
            blockers: vec![],
        },
        ..StaticSources::default()
    }
}

fn orchestrator(config: ArenaConfig) -> (InjectionOrchestrator, MemorySink, Arc<ManualClock>) {
    let sink = MemorySink::new();
    let clock = Arc::new(ManualClock::new(5_000_000));
    let orch = InjectionOrchestrator::new(config)
        .with_clock(clock.clone())
        .with_sink(sink.clone());
    (orch, sink, clock)
}

fn budget_manager(clock: Arc<ManualClock>) -> ContextBudgetManager {
    ContextBudgetManager::new(
        BudgetConfig::default(),
        Arc::new(CharRatioEstimator::default()),
        clock,
    )
}

// ── Packing ────────────────────────────────────────────────────────

#[test]
fn floors_are_honored_and_totals_conserved() {
    let mut arena = ContextArena::new(Arc::new(CharRatioEstimator::default()));
    arena.register(
        "s",
        InjectionCandidate::new("truth", "ledger", Zone::TruthLedger, words(60))
            .with_priority(InjectionPriority::Critical),
    );
    arena.register(
        "s",
        InjectionCandidate::new("memory", "working", Zone::WorkingMemory, words(120)),
    );
    let zones = ZoneBudgetConfig::from_limits([
        (Zone::TruthLedger, ZoneLimit::new(40, 60)),
        (Zone::WorkingMemory, ZoneLimit::new(0, 400)),
    ]);

    let plan = arena.plan("s", 120, &zones, false);
    assert_eq!(plan.plan_reason, PlanReason::Packed);

    let accepted = &plan.telemetry.zone_accepted_tokens;
    let ledger = accepted.get(&Zone::TruthLedger).copied().unwrap_or(0);
    assert!(ledger >= 40, "floor violated: {ledger}");
    for (zone, tokens) in accepted {
        assert!(*tokens <= zones.max(*zone), "{zone} over its ceiling");
    }
    assert!(accepted.values().sum::<usize>() <= 120);
    assert!(plan.truncated);
}

#[test]
fn unmet_critical_floor_rejects_the_turn() {
    let zones = ZoneBudgetConfig::from_limits([
        (Zone::TruthLedger, ZoneLimit::new(500, 1000)),
        (Zone::TaskState, ZoneLimit::new(500, 1000)),
    ]);
    let config = ArenaConfig::default()
        .with_zones(zones)
        .with_max_injection_tokens(100);
    let (mut orch, sink, _) = orchestrator(config);

    let out = orch.build_context_injection(&sources(), InjectionRequest::new("s", "go"));
    assert!(!out.accepted);
    assert_eq!(out.text, "");
    assert_eq!(out.dropped_reason, Some(DropReason::FloorUnmet));
    assert_eq!(out.compaction_requested, Some(CompactionReason::FloorUnmet));
    assert_eq!(sink.count("context_arena_floor_unmet_unrecoverable"), 1);
    assert_eq!(sink.count("context_injection_dropped"), 1);

    let blocked = orch.check_context_compaction_gate("s", "read_file", None);
    assert!(!blocked.allowed);
    let compact = orch.check_context_compaction_gate("s", "session_compact", None);
    assert!(compact.allowed);

    orch.on_compacted("s");
    assert!(orch.check_context_compaction_gate("s", "read_file", None).allowed);
}

#[test]
fn turn_without_content_is_a_no_op() {
    let (mut orch, sink, _) = orchestrator(ArenaConfig::default());
    let out = orch.build_context_injection(
        &StaticSources::default(),
        InjectionRequest::new("s", "hello"),
    );
    assert!(!out.accepted);
    assert_eq!(out.text, "");
    assert_eq!(out.dropped_reason, None);
    assert_eq!(out.compaction_requested, None);
    assert!(sink.records().is_empty());
    assert!(!orch.stability().is_stabilized("s"));
}

// ── Budget manager ─────────────────────────────────────────────────

#[test]
fn truncation_is_monotone() {
    let mut budget = budget_manager(Arc::new(ManualClock::new(0)));
    let opts = PlanOptions {
        max_tokens: Some(64),
    };
    let mut last_final = 0;
    for n in [1, 10, 40, 45, 80, 200, 1000] {
        let plan = budget.plan_injection("s", &words(n), None, opts);
        assert!(plan.accepted);
        assert!(plan.final_tokens <= plan.original_tokens);
        assert!(plan.final_tokens <= 64);
        assert_eq!(plan.truncated, plan.final_tokens < plan.original_tokens);
        assert!(plan.final_tokens >= last_final.min(60), "shrank at {n} words");
        last_final = plan.final_tokens;
    }
}

#[test]
fn compaction_respects_turn_and_wall_clock_cooldowns() {
    let clock = Arc::new(ManualClock::new(0));
    let mut budget = budget_manager(clock.clone());
    let high = ContextUsage::from_percent(0.85);

    budget.begin_turn("s", None);
    let first = budget.should_request_compaction("s", Some(&high));
    assert_eq!(first.reason, Some(CompactionReason::UsageThreshold));
    budget.mark_compacted("s");

    // One turn later, a minute later: turn gate still closed.
    clock.advance_secs(60);
    budget.begin_turn("s", None);
    assert!(!budget.should_request_compaction("s", Some(&high)).should_compact);

    // Two turns later: both gates open.
    budget.begin_turn("s", None);
    assert!(budget.should_request_compaction("s", Some(&high)).should_compact);
    budget.mark_compacted("s");

    // Two more turns but only ten seconds: clock gate closed.
    clock.advance_secs(10);
    budget.begin_turn("s", None);
    budget.begin_turn("s", None);
    assert!(!budget.should_request_compaction("s", Some(&high)).should_compact);

    clock.advance_secs(35);
    assert!(budget.should_request_compaction("s", Some(&high)).should_compact);
}

#[test]
fn pressure_bypasses_cooldowns() {
    let clock = Arc::new(ManualClock::new(0));
    let mut budget = budget_manager(clock);
    budget.begin_turn("s", None);
    budget.mark_compacted("s");
    budget.begin_turn("s", None);

    let bypass = budget.should_request_compaction("s", Some(&ContextUsage::from_percent(0.90)));
    assert_eq!(bypass.reason, Some(CompactionReason::UsageThreshold));

    let hard = budget.should_request_compaction("s", Some(&ContextUsage::from_percent(0.95)));
    assert_eq!(hard.reason, Some(CompactionReason::HardLimit));

    let calm = budget.should_request_compaction("s", Some(&ContextUsage::from_percent(0.85)));
    assert!(!calm.should_compact);
}

#[test]
fn percent_is_read_in_the_unit_closest_to_token_usage() {
    let usage = ContextUsage {
        tokens: Some(3597),
        context_window: Some(272_000),
        percent: Some(1.32),
    };
    let ratio = usage.usage_ratio().unwrap();
    assert!((ratio - 0.0132).abs() < 1e-9, "got {ratio}");

    assert_eq!(ContextUsage::from_percent(42.0).usage_ratio(), Some(0.42));
    assert_eq!(ContextUsage::from_percent(0.42).usage_ratio(), Some(0.42));

    let config = ArenaConfig::from_json_str(
        r#"{"budget": {"hard_limit_percent": 94, "compaction_threshold_percent": 80,
            "pressure_bypass_percent": 0.9}}"#,
    )
    .unwrap();
    assert!((config.budget.hard_limit_percent - 0.94).abs() < 1e-9);
    assert!((config.budget.compaction_threshold_percent - 0.80).abs() < 1e-9);
}

// ── Dedup ──────────────────────────────────────────────────────────

#[test]
fn identical_injections_are_delivered_once_per_epoch() {
    let (mut orch, sink, _) = orchestrator(ArenaConfig::default());
    // Identity is once-per-session and would change the second text.
    let src = StaticSources {
        identity: None,
        ..sources()
    };

    let first = orch.build_context_injection(&src, InjectionRequest::new("s", "a"));
    assert!(first.accepted);
    let second = orch.build_context_injection(&src, InjectionRequest::new("s", "b"));
    let third = orch.build_context_injection(&src, InjectionRequest::new("s", "c"));
    for out in [&second, &third] {
        assert!(!out.accepted);
        assert_eq!(out.dropped_reason, Some(DropReason::DuplicateContent));
    }

    orch.on_compacted("s");
    let fresh = orch.build_context_injection(&src, InjectionRequest::new("s", "d"));
    assert!(fresh.accepted);
    assert_eq!(fresh.text, first.text);
    assert_eq!(sink.count("context_injected"), 2);
}

// ── Stability ──────────────────────────────────────────────────────

#[test]
fn stability_trips_after_two_degraded_turns_and_resets() {
    let config = StabilityConfig {
        consecutive_threshold: 2,
        recovery_probe_interval_turns: 5,
    };
    let mut monitor = StabilityMonitor::new(config, true);

    assert!(!monitor.record_degraded("s", 1));
    assert!(!monitor.record_degraded("s", 1));
    assert!(!monitor.is_stabilized("s"));
    assert!(monitor.record_degraded("s", 2));
    assert!(monitor.is_stabilized("s"));

    assert!(monitor.should_force_critical_only("s", 3));
    assert!(!monitor.should_force_critical_only("s", 7));

    let forced = NormalOutcome {
        was_forced: true,
        turn: 3,
    };
    assert!(!monitor.record_normal("s", forced));
    assert!(monitor.is_stabilized("s"));

    let probe = NormalOutcome {
        was_forced: false,
        turn: 7,
    };
    assert!(monitor.record_normal("s", probe));
    assert!(!monitor.is_stabilized("s"));
    assert_eq!(monitor.state("s").unwrap().consecutive_degraded_turns, 0);
}

#[test]
fn repeated_hard_limit_turns_force_critical_only() {
    let mut config = ArenaConfig::default();
    config.stability.config.consecutive_threshold = 2;
    let (mut orch, sink, _) = orchestrator(config);
    let full = ContextUsage::from_percent(0.97);

    for prompt in ["a", "b"] {
        let out = orch.build_context_injection(
            &sources(),
            InjectionRequest::new("s", prompt).with_usage(full),
        );
        assert_eq!(out.dropped_reason, Some(DropReason::HardLimit));
    }
    assert_eq!(sink.count("context_stability_tripped"), 1);

    let calm = ContextUsage::from_percent(0.1);
    let out = orch.build_context_injection(
        &sources(),
        InjectionRequest::new("s", "c").with_usage(calm),
    );
    assert!(out.critical_only);
    assert!(out.accepted);
    assert!(out.text.contains("## Truth Ledger"));
    assert!(!out.text.contains("## Task State"));
}

// ── Adaptation ─────────────────────────────────────────────────────

fn starved_memory_telemetry() -> PlanTelemetry {
    PlanTelemetry {
        zone_demand_tokens: [(Zone::WorkingMemory, 300), (Zone::ExternalRecall, 10)].into(),
        zone_allocated_tokens: [(Zone::WorkingMemory, 100), (Zone::ExternalRecall, 120)].into(),
        zone_accepted_tokens: [(Zone::WorkingMemory, 100), (Zone::ExternalRecall, 10)].into(),
        ..PlanTelemetry::default()
    }
}

#[test]
fn ceilings_move_from_idle_to_truncated_zones_without_breaking_floors() {
    let zones = ZoneBudgetConfig::from_limits([
        (Zone::WorkingMemory, ZoneLimit::new(0, 100)),
        (Zone::ExternalRecall, ZoneLimit::new(80, 120)),
    ]);
    let mut controller = ZoneBudgetController::new(zones, AdaptiveZoneConfig::default(), true);
    let telemetry = starved_memory_telemetry();

    assert!(controller.observe("s", &telemetry).is_none());
    assert!(controller.observe("s", &telemetry).is_none());
    let adjustment = controller.observe("s", &telemetry).unwrap();
    assert_eq!(adjustment.turn, 3);
    assert_eq!(adjustment.moved_tokens, 32);

    let resolved = controller.resolve_zone_budget_config("s");
    assert_eq!(resolved.max(Zone::WorkingMemory), 132);
    assert_eq!(resolved.max(Zone::ExternalRecall), 88);
    assert!(resolved.max(Zone::ExternalRecall) >= resolved.min(Zone::ExternalRecall));

    // Donor headroom is below one step now.
    assert!(controller.observe("s", &telemetry).is_none());

    controller.reset_epoch("s");
    let restored = controller.resolve_zone_budget_config("s");
    assert_eq!(restored.max(Zone::WorkingMemory), 100);
}

#[test]
fn rebalancing_conserves_total_ceiling() {
    let zones = ZoneBudgetConfig::from_limits([
        (Zone::WorkingMemory, ZoneLimit::new(0, 100)),
        (Zone::ExternalRecall, ZoneLimit::new(0, 300)),
    ]);
    let before = zones.total_max();
    let mut controller = ZoneBudgetController::new(zones, AdaptiveZoneConfig::default(), true);
    let telemetry = starved_memory_telemetry();

    let mut moved = 0;
    for _ in 0..6 {
        if let Some(adjustment) = controller.observe("s", &telemetry) {
            moved += adjustment.moved_tokens;
            let shifted: usize = adjustment.shifts.iter().map(|s| s.tokens).sum();
            assert_eq!(shifted, adjustment.moved_tokens);
        }
        assert_eq!(controller.resolve_zone_budget_config("s").total_max(), before);
    }
    assert!(moved > 0);
}

#[test]
fn balanced_telemetry_changes_nothing() {
    let zones = ZoneBudgetConfig::default();
    let mut controller =
        ZoneBudgetController::new(zones.clone(), AdaptiveZoneConfig::default(), true);
    let telemetry = PlanTelemetry {
        zone_demand_tokens: [(Zone::WorkingMemory, 100), (Zone::ExternalRecall, 100)].into(),
        zone_allocated_tokens: [(Zone::WorkingMemory, 110), (Zone::ExternalRecall, 110)].into(),
        zone_accepted_tokens: [(Zone::WorkingMemory, 100), (Zone::ExternalRecall, 100)].into(),
        ..PlanTelemetry::default()
    };
    for _ in 0..5 {
        assert!(controller.observe("s", &telemetry).is_none());
    }
    assert_eq!(controller.resolve_zone_budget_config("s"), zones);
}

#[test]
fn close_compactions_are_suppressed_until_both_gates_clear() {
    let clock = Arc::new(ManualClock::new(0));
    let mut budget = budget_manager(clock.clone());
    let high = ContextUsage::from_percent(0.84);

    budget.begin_turn("s", None);
    budget.mark_compacted("s");

    clock.advance_secs(10);
    budget.begin_turn("s", None);
    assert!(!budget.should_request_compaction("s", Some(&high)).should_compact);

    clock.advance_secs(30);
    budget.begin_turn("s", None);
    budget.begin_turn("s", None);
    // Three turns, forty seconds.
    assert!(!budget.should_request_compaction("s", Some(&high)).should_compact);

    clock.advance_secs(5);
    let decision = budget.should_request_compaction("s", Some(&high));
    assert_eq!(decision.reason, Some(CompactionReason::UsageThreshold));
}

#[test]
fn changed_content_is_injected_after_a_duplicate() {
    let (mut orch, _, _) = orchestrator(ArenaConfig::default());
    let mut src = StaticSources {
        identity: None,
        ..sources()
    };

    assert!(orch.build_context_injection(&src, InjectionRequest::new("s", "a")).accepted);
    let dup = orch.build_context_injection(&src, InjectionRequest::new("s", "a"));
    assert_eq!(dup.dropped_reason, Some(DropReason::DuplicateContent));

    src.working_memory = Some("reviewer asked for a canary first".into());
    let changed = orch.build_context_injection(&src, InjectionRequest::new("s", "a"));
    assert!(changed.accepted);
    assert!(changed.text.contains("canary"));
}

// ── Epochs ─────────────────────────────────────────────────────────

#[test]
fn compaction_clears_the_stale_usage_reading() {
    let (mut orch, sink, _) = orchestrator(ArenaConfig::default());
    let full = orch.build_context_injection(
        &sources(),
        InjectionRequest::new("s", "a").with_usage(ContextUsage::from_percent(0.97)),
    );
    assert_eq!(full.dropped_reason, Some(DropReason::HardLimit));
    assert!(!orch.check_context_compaction_gate("s", "read_file", None).allowed);

    orch.on_compacted("s");
    let next = orch.build_context_injection(&sources(), InjectionRequest::new("s", "b"));
    assert!(next.accepted);
    assert_eq!(next.dropped_reason, None);
    assert_eq!(next.compaction_requested, None);
    assert!(orch.check_context_compaction_gate("s", "read_file", None).allowed);

    // Past the post-compaction grace window nothing resurrects the old reading.
    for prompt in ["c", "d", "e", "f"] {
        let out = orch.build_context_injection(&sources(), InjectionRequest::new("s", prompt));
        assert_ne!(out.dropped_reason, Some(DropReason::HardLimit));
        assert_eq!(out.compaction_requested, None);
    }
    assert!(orch.check_context_compaction_gate("s", "read_file", None).allowed);
    assert_eq!(sink.count("context_compaction_requested"), 1);
}

// ── Orchestrator events ────────────────────────────────────────────

#[test]
fn zone_adaptation_is_reported_once_with_its_ceilings() {
    let zones = ZoneBudgetConfig::from_limits([
        (Zone::WorkingMemory, ZoneLimit::new(0, 100)),
        (Zone::ExternalRecall, ZoneLimit::new(0, 300)),
    ]);
    let (mut orch, sink, _) = orchestrator(ArenaConfig::default().with_zones(zones));
    let src = StaticSources {
        working_memory: Some(words(200)),
        external_recall: Some("release notes v2".into()),
        ..StaticSources::default()
    };

    for prompt in ["a", "b", "c"] {
        orch.build_context_injection(&src, InjectionRequest::new("s", prompt));
    }
    assert_eq!(sink.count("context_arena_zone_adapted"), 1);

    let record = sink
        .records()
        .into_iter()
        .find(|r| matches!(r.event, ArenaEvent::ContextArenaZoneAdapted { .. }))
        .unwrap();
    assert_eq!(record.turn, 3);
    let ArenaEvent::ContextArenaZoneAdapted {
        turn,
        moved_tokens,
        shifts,
        max_by_zone,
    } = record.event
    else {
        unreachable!();
    };
    assert_eq!(turn, 3);
    assert_eq!(moved_tokens, 96);
    assert_eq!(shifts.len(), 1);
    assert_eq!(shifts[0].from, Zone::ExternalRecall);
    assert_eq!(shifts[0].to, Zone::WorkingMemory);
    assert_eq!(max_by_zone[&Zone::WorkingMemory], 196);
    assert_eq!(max_by_zone[&Zone::ExternalRecall], 204);
    assert_eq!(
        orch.zones().resolve_zone_budget_config("s").max(Zone::WorkingMemory),
        196
    );
}

#[test]
fn relaxed_floors_are_reported_before_the_injection() {
    let zones = ZoneBudgetConfig::from_limits([
        (Zone::TruthLedger, ZoneLimit::new(40, 200)),
        (Zone::TaskState, ZoneLimit::new(500, 1000)),
    ]);
    let config = ArenaConfig::default()
        .with_zones(zones)
        .with_max_injection_tokens(100);
    let (mut orch, sink, _) = orchestrator(config);
    let src = StaticSources {
        identity: None,
        ..sources()
    };

    let out = orch.build_context_injection(&src, InjectionRequest::new("s", "go"));
    assert!(out.accepted);
    assert!(out.text.contains("## Truth Ledger"));
    assert!(out.text.contains("## Task State"));
    assert_eq!(out.compaction_requested, None);

    let names = sink.names();
    let recovered = names
        .iter()
        .position(|n| *n == "context_arena_floor_unmet_recovered")
        .unwrap();
    let injected = names.iter().position(|n| *n == "context_injected").unwrap();
    assert!(recovered < injected);
    assert_eq!(sink.count("context_arena_floor_unmet_recovered"), 1);
    assert_eq!(sink.count("context_arena_floor_unmet_unrecoverable"), 0);
}
