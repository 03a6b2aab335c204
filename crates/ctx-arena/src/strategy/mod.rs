//! Offline strategy tuning from recorded arena events.
//!
//! [`observer`] reads per-session JSONL event logs and computes per
//! (model, task class) metrics. [`tuner`] turns those metrics into
//! time-limited [`StrategyArm`] overrides that hosts apply to their
//! [`ArenaConfig`](crate::agent::config::ArenaConfig) at session start.

pub mod observer;
pub mod tuner;

pub use observer::{BucketMetrics, StrategyReport, StrategySummary, build_report};
pub use tuner::{OverrideEntry, StrategyArm, StrategyOverrides, choose_arm};

/// Atomic write: write to a sibling temp file, then rename into place.
pub(crate) fn write_atomic(path: &std::path::Path, contents: &str) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&tmp_path, contents)
        .map_err(|e| format!("Failed to write {}: {e}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Failed to rename into {}: {e}", path.display()))
}
