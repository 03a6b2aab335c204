//! Context strategy tuner.
//!
//! Picks a [`StrategyArm`] for every observer bucket with enough samples and
//! writes them as an expiring overrides document. Hosts call
//! [`StrategyOverrides::resolve`] at session start and
//! [`StrategyArm::apply_to`] on their config.

use crate::agent::config::ArenaConfig;
use crate::strategy::observer::{BucketMetrics, StrategySummary};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Buckets with fewer plans are left to the default strategy.
pub const MIN_PLANS_FOR_OVERRIDE: u64 = 20;
pub const DEFAULT_TTL_HOURS: u64 = 168;
pub const OVERRIDES_VERSION: u32 = 1;
/// Matches any model or task class.
pub const WILDCARD: &str = "*";

const HOUR_MS: i64 = 60 * 60 * 1000;

/// How much of the arena a bucket runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StrategyArm {
    /// Every component on.
    Managed,
    /// Budgeting on, zone adaptation off.
    Hybrid,
    /// Budgeting off; content passes through verbatim.
    Passthrough,
}

impl StrategyArm {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyArm::Managed => "managed",
            StrategyArm::Hybrid => "hybrid",
            StrategyArm::Passthrough => "passthrough",
        }
    }

    /// Switch config modules on or off for this arm. Tunables are untouched.
    pub fn apply_to(self, config: &mut ArenaConfig) {
        match self {
            StrategyArm::Managed => {
                config.budget.enabled = true;
                config.adaptive.enabled = true;
                config.stability.enabled = true;
            }
            StrategyArm::Hybrid => {
                config.budget.enabled = true;
                config.adaptive.enabled = false;
            }
            StrategyArm::Passthrough => {
                config.budget.enabled = false;
            }
        }
    }
}

impl fmt::Display for StrategyArm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arm for a bucket's metrics.
pub fn choose_arm(bucket: &BucketMetrics) -> StrategyArm {
    let quality = bucket.quality_proxy;
    let floor_unmet = bucket.floor_unmet_rate;
    if quality >= 0.92
        && floor_unmet <= 0.01
        && bucket.injection_dropped_rate <= 0.08
        && bucket.zone_adaptation_move_ratio <= 0.02
    {
        StrategyArm::Passthrough
    } else if quality >= 0.88 && floor_unmet <= 0.05 {
        StrategyArm::Hybrid
    } else {
        StrategyArm::Managed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OverrideEntry {
    pub id: String,
    pub model: String,
    pub task_class: String,
    pub arm: StrategyArm,
    /// Epoch milliseconds.
    pub expires_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub source: String,
}

impl OverrideEntry {
    fn matches(&self, model: &str, task_class: &str) -> Option<u8> {
        let model_exact = self.model == model;
        let task_exact = self.task_class == task_class;
        if !(model_exact || self.model == WILDCARD) || !(task_exact || self.task_class == WILDCARD)
        {
            return None;
        }
        Some(u8::from(model_exact) * 2 + u8::from(task_exact))
    }
}

/// Versioned overrides document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOverrides {
    pub version: u32,
    pub generated_at: i64,
    #[serde(default)]
    pub entries: Vec<OverrideEntry>,
}

impl StrategyOverrides {
    /// One entry per bucket with at least [`MIN_PLANS_FOR_OVERRIDE`] plans.
    /// Ids follow the bucket's position in the summary.
    pub fn build(summary: &StrategySummary, ttl_hours: u64, now_ms: i64) -> Self {
        let ttl_ms = i64::try_from(ttl_hours.max(1))
            .unwrap_or(i64::MAX)
            .saturating_mul(HOUR_MS);
        let expires_at = now_ms.saturating_add(ttl_ms);
        let entries = summary
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.samples.plans >= MIN_PLANS_FOR_OVERRIDE)
            .map(|(index, bucket)| OverrideEntry {
                id: format!("auto-{}", index + 1),
                model: or_wildcard(&bucket.model),
                task_class: or_wildcard(&bucket.task_class),
                arm: choose_arm(bucket),
                expires_at,
                updated_at: now_ms,
                source: "tuner".to_string(),
            })
            .collect::<Vec<_>>();
        debug!(
            buckets = summary.buckets.len(),
            entries = entries.len(),
            "built strategy overrides"
        );
        Self {
            version: OVERRIDES_VERSION,
            generated_at: now_ms,
            entries,
        }
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read overrides {}: {e}", path.display()))?;
        serde_json::from_str(&data)
            .map_err(|e| format!("Failed to parse overrides {}: {e}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        super::write_atomic(path, &(self.to_json()? + "\n"))
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self).map_err(|e| format!("Failed to serialize overrides: {e}"))
    }

    /// Best unexpired entry for a model and task class. An exact model match
    /// outranks an exact task match, which outranks wildcards; earlier
    /// entries win ties.
    pub fn resolve(&self, model: &str, task_class: &str, now_ms: i64) -> Option<&OverrideEntry> {
        let mut best: Option<(u8, &OverrideEntry)> = None;
        for entry in self.entries.iter().filter(|e| e.expires_at > now_ms) {
            let Some(score) = entry.matches(model, task_class) else {
                continue;
            };
            if best.is_none_or(|(s, _)| score > s) {
                best = Some((score, entry));
            }
        }
        best.map(|(_, e)| e)
    }
}

fn or_wildcard(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        WILDCARD.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Read a summary written by the observer. A file that does not parse
/// yields an empty summary, so tuning falls back to the default strategy.
pub fn load_summary(path: &Path) -> Result<StrategySummary, String> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read summary {}: {e}", path.display()))?;
    match serde_json::from_str(&data) {
        Ok(summary) => Ok(summary),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable strategy summary, using empty");
            Ok(StrategySummary::default())
        }
    }
}

/// Newest `context-strategy-*.json` in `reports_dir` by file name.
pub fn find_latest_summary(reports_dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(reports_dir).ok()?;
    entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("context-strategy-") && n.ends_with(".json"))
        })
        .max()
}
