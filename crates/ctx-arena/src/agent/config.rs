//! Configuration for the [`InjectionOrchestrator`](super::injection::InjectionOrchestrator).
//!
//! Every module is **enabled by default** with defaults tuned for a
//! 200k-token model. Config files are JSON; any field may be omitted.
//! Percent fields accept either ratios (`0.82`) or percentage points (`82`)
//! and are normalized to ratios once, at load time.
//!
//! # Examples
//!
//! Defaults:
//!
//! ```ignore
//! let config = ArenaConfig::default();
//! ```
//!
//! From a file, with builder overrides:
//!
//! ```ignore
//! let config = ArenaConfig::load("arena.json")?
//!     .with_max_injection_tokens(800)
//!     .with_compaction_tool_name("compact_session");
//! ```
//!
//! Disabling a module via struct fields:
//!
//! ```ignore
//! let config = ArenaConfig {
//!     adaptive: Toggle::disabled(),
//!     ..ArenaConfig::default()
//! };
//! ```

use crate::context::budget::{BudgetConfig, DEFAULT_CHARS_PER_TOKEN};
use crate::context::pressure::GateConfig;
use crate::context::stability::StabilityConfig;
use crate::context::zone::{ZoneBudgetConfig, clamp01};
use crate::context::zone_budget::AdaptiveZoneConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

// ── Generic toggle ────────────────────────────────────────────────

/// Generic enabled/disabled wrapper for module configurations.
///
/// When `enabled` is `false`, the module is skipped regardless of the inner
/// config values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Toggle<T: Default> {
    /// Whether this module is active.
    pub enabled: bool,
    /// Module-specific configuration.
    pub config: T,
}

impl<T: Default> Toggle<T> {
    /// Create a disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

/// Zone ceiling adaptation.
pub type ArenaAdaptiveConfig = Toggle<AdaptiveZoneConfig>;
/// Stabilization into critical-only injection.
pub type ArenaStabilityConfig = Toggle<StabilityConfig>;

// ── Errors ────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config file at {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

// ── Arena config ──────────────────────────────────────────────────

/// Fully resolved arena configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ArenaConfig {
    /// Injection budget and compaction thresholds.
    pub budget: BudgetConfig,
    /// Per-zone floors and ceilings. Zones left out get `{min: 0, max: 0}`.
    pub zones: ZoneBudgetConfig,
    /// Adaptive ceilings. Enabled by default.
    pub adaptive: ArenaAdaptiveConfig,
    /// Stability monitor. Enabled by default.
    pub stability: ArenaStabilityConfig,
    /// Compaction gate.
    pub gate: GateConfig,
    /// Latch a `floor_unmet` compaction request when zone floors cannot be
    /// met even after relaxation.
    pub request_compaction_on_floor_unmet: bool,
    /// Ratio used by the default token estimator.
    pub chars_per_token: f64,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            zones: ZoneBudgetConfig::default(),
            adaptive: ArenaAdaptiveConfig::default(),
            stability: ArenaStabilityConfig::default(),
            gate: GateConfig::default(),
            request_compaction_on_floor_unmet: true,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl ArenaConfig {
    /// Load, normalize, and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!(path = %path.display(), "loaded arena config");
        config.resolved()
    }

    /// Parse, normalize, and validate JSON config text.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config = Self::parse(json).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        config.resolved()
    }

    fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Normalize then validate.
    pub fn resolved(mut self) -> Result<Self, ConfigError> {
        self.normalize();
        self.validate()?;
        Ok(self)
    }

    /// Convert percentage points to ratios and clamp every ratio to `[0, 1]`.
    pub fn normalize(&mut self) {
        let b = &mut self.budget;
        b.hard_limit_percent = normalize_ratio(b.hard_limit_percent);
        b.compaction_threshold_percent = normalize_ratio(b.compaction_threshold_percent);
        b.pressure_bypass_percent = normalize_ratio(b.pressure_bypass_percent);

        let a = &mut self.adaptive.config;
        a.upshift_truncation_ratio = normalize_ratio(a.upshift_truncation_ratio);
        a.downshift_idle_ratio = normalize_ratio(a.downshift_idle_ratio);
    }

    /// Reject configurations the arena cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some((zone, limit)) = self.zones.first_inverted() {
            return Err(ConfigError::Validation(format!(
                "zone {zone}: min ({}) exceeds max ({})",
                limit.min, limit.max
            )));
        }

        let b = &self.budget;
        if b.hard_limit_percent <= 0.0 {
            return Err(ConfigError::Validation(
                "budget.hard_limit_percent must be greater than zero".into(),
            ));
        }
        if b.compaction_threshold_percent > b.hard_limit_percent {
            return Err(ConfigError::Validation(format!(
                "budget.compaction_threshold_percent ({}) exceeds hard_limit_percent ({})",
                b.compaction_threshold_percent, b.hard_limit_percent
            )));
        }
        if b.pressure_bypass_percent < b.compaction_threshold_percent {
            return Err(ConfigError::Validation(format!(
                "budget.pressure_bypass_percent ({}) is below compaction_threshold_percent ({})",
                b.pressure_bypass_percent, b.compaction_threshold_percent
            )));
        }

        let a = &self.adaptive.config;
        if a.step_tokens == 0 {
            return Err(ConfigError::Validation(
                "adaptive.config.step_tokens must be at least 1".into(),
            ));
        }
        if !(a.ema_alpha > 0.0 && a.ema_alpha <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "adaptive.config.ema_alpha must be in (0, 1], got {}",
                a.ema_alpha
            )));
        }

        if self.stability.config.consecutive_threshold == 0 {
            return Err(ConfigError::Validation(
                "stability.config.consecutive_threshold must be at least 1".into(),
            ));
        }
        if self.gate.compaction_tool_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "gate.compaction_tool_name must not be empty".into(),
            ));
        }
        if !(self.chars_per_token.is_finite() && self.chars_per_token > 0.0) {
            return Err(ConfigError::Validation(format!(
                "chars_per_token must be positive, got {}",
                self.chars_per_token
            )));
        }
        Ok(())
    }

    // ── Builder methods ───────────────────────────────────────────

    /// Set the per-turn merged injection budget.
    pub fn with_max_injection_tokens(mut self, tokens: usize) -> Self {
        self.budget.max_injection_tokens = tokens;
        self
    }

    /// Replace the zone floors and ceilings.
    pub fn with_zones(mut self, zones: ZoneBudgetConfig) -> Self {
        self.zones = zones;
        self
    }

    /// Enable or disable budgeting altogether.
    pub fn with_budgeting(mut self, enabled: bool) -> Self {
        self.budget.enabled = enabled;
        self
    }

    /// Set the name of the tool the gate always lets through.
    pub fn with_compaction_tool_name(mut self, name: impl Into<String>) -> Self {
        self.gate.compaction_tool_name = name.into();
        self
    }
}

/// Values above 1 are percentage points.
fn normalize_ratio(value: f64) -> f64 {
    if value > 1.0 {
        clamp01(value / 100.0)
    } else {
        clamp01(value)
    }
}
