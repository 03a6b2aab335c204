//! Semantic zones: the fixed categories of auxiliary content that compete for
//! the injection budget, and their configured floors and ceilings.
//!
//! Every map keyed by [`Zone`] is a `BTreeMap`, so iteration follows the enum
//! declaration order. That order is the tie-break used by the zone controller
//! and the packer whenever two zones score equally.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Token counts keyed by zone.
pub type ZoneTokens = BTreeMap<Zone, usize>;

/// A category of injectable context.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    /// Agent identity / persona file.
    Identity,
    /// Compact ledger of active truth facts.
    TruthLedger,
    /// Detailed truth fact evidence.
    TruthFacts,
    /// Task ledger: goal, phase, open items, blockers.
    TaskState,
    /// Recent tool failures worth not repeating.
    RecentFailures,
    /// Session working memory.
    WorkingMemory,
    /// Recall from external memory search.
    ExternalRecall,
}

impl Zone {
    /// All zones, in tie-break order.
    pub const ALL: [Zone; 7] = [
        Zone::Identity,
        Zone::TruthLedger,
        Zone::TruthFacts,
        Zone::TaskState,
        Zone::RecentFailures,
        Zone::WorkingMemory,
        Zone::ExternalRecall,
    ];

    /// Stable snake_case name, identical to the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Zone::Identity => "identity",
            Zone::TruthLedger => "truth_ledger",
            Zone::TruthFacts => "truth_facts",
            Zone::TaskState => "task_state",
            Zone::RecentFailures => "recent_failures",
            Zone::WorkingMemory => "working_memory",
            Zone::ExternalRecall => "external_recall",
        }
    }

    /// Protected zones never donate ceiling tokens to other zones.
    pub fn is_protected(self) -> bool {
        matches!(
            self,
            Zone::Identity | Zone::TruthLedger | Zone::TruthFacts | Zone::TaskState
        )
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Floor and ceiling for a single zone, in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ZoneLimit {
    /// Guaranteed floor. Never violated by adaptation.
    pub min: usize,
    /// Ceiling cap.
    pub max: usize,
}

impl ZoneLimit {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }
}

/// Per-zone floors and ceilings.
///
/// Zones absent from the map have a `{0, 0}` limit, i.e. they can never
/// receive budget unless adaptation moves ceiling tokens into them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ZoneBudgetConfig {
    zones: BTreeMap<Zone, ZoneLimit>,
}

impl Default for ZoneBudgetConfig {
    fn default() -> Self {
        Self::from_limits([
            (Zone::Identity, ZoneLimit::new(48, 320)),
            (Zone::TruthLedger, ZoneLimit::new(48, 240)),
            (Zone::TruthFacts, ZoneLimit::new(0, 260)),
            (Zone::TaskState, ZoneLimit::new(64, 360)),
            (Zone::RecentFailures, ZoneLimit::new(0, 160)),
            (Zone::WorkingMemory, ZoneLimit::new(0, 300)),
            (Zone::ExternalRecall, ZoneLimit::new(0, 220)),
        ])
    }
}

impl ZoneBudgetConfig {
    /// Build a config from explicit `(zone, limit)` pairs.
    pub fn from_limits(limits: impl IntoIterator<Item = (Zone, ZoneLimit)>) -> Self {
        Self {
            zones: limits.into_iter().collect(),
        }
    }

    /// Limit for `zone`, `{0, 0}` when unconfigured.
    pub fn limit(&self, zone: Zone) -> ZoneLimit {
        self.zones
            .get(&zone)
            .copied()
            .unwrap_or(ZoneLimit::new(0, 0))
    }

    pub fn min(&self, zone: Zone) -> usize {
        self.limit(zone).min
    }

    pub fn max(&self, zone: Zone) -> usize {
        self.limit(zone).max
    }

    /// Replace the ceiling of `zone`, keeping its floor.
    pub fn set_max(&mut self, zone: Zone, max: usize) {
        let min = self.min(zone);
        self.zones.insert(zone, ZoneLimit::new(min, max));
    }

    /// Sum of all configured ceilings.
    pub fn total_max(&self) -> usize {
        self.zones.values().map(|l| l.max).sum()
    }

    /// Iterate configured zones in tie-break order.
    pub fn iter(&self) -> impl Iterator<Item = (Zone, ZoneLimit)> + '_ {
        self.zones.iter().map(|(z, l)| (*z, *l))
    }

    /// First zone whose floor exceeds its ceiling, if any.
    pub fn first_inverted(&self) -> Option<(Zone, ZoneLimit)> {
        self.iter().find(|(_, l)| l.min > l.max)
    }
}

/// Clamp a ratio into `[0, 1]`, mapping NaN to zero.
pub fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_order_is_declaration_order() {
        let mut zones = Zone::ALL.to_vec();
        zones.sort();
        assert_eq!(zones, Zone::ALL.to_vec());
    }

    #[test]
    fn protected_zones() {
        assert!(Zone::Identity.is_protected());
        assert!(Zone::TruthLedger.is_protected());
        assert!(Zone::TaskState.is_protected());
        assert!(!Zone::WorkingMemory.is_protected());
        assert!(!Zone::ExternalRecall.is_protected());
    }

    #[test]
    fn serde_names_match_as_str() {
        for zone in Zone::ALL {
            let json = serde_json::to_string(&zone).unwrap();
            assert_eq!(json, format!("\"{}\"", zone.as_str()));
        }
    }

    #[test]
    fn unconfigured_zone_is_zero() {
        let config = ZoneBudgetConfig::from_limits([(Zone::TaskState, ZoneLimit::new(10, 20))]);
        assert_eq!(config.limit(Zone::Identity), ZoneLimit::new(0, 0));
        assert_eq!(config.max(Zone::TaskState), 20);
        assert_eq!(config.total_max(), 20);
    }

    #[test]
    fn config_deserializes_from_map() {
        let config: ZoneBudgetConfig = serde_json::from_str(
            r#"{"truth_ledger": {"min": 500, "max": 1000}, "task_state": {"min": 5, "max": 1}}"#,
        )
        .unwrap();
        assert_eq!(config.min(Zone::TruthLedger), 500);
        assert_eq!(
            config.first_inverted(),
            Some((Zone::TaskState, ZoneLimit::new(5, 1)))
        );
    }

    #[test]
    fn clamp01_handles_nan_and_bounds() {
        assert_eq!(clamp01(f64::NAN), 0.0);
        assert_eq!(clamp01(-0.5), 0.0);
        assert_eq!(clamp01(1.7), 1.0);
        assert_eq!(clamp01(0.25), 0.25);
    }
}
