//! Context strategy observer.
//!
//! Each `*.jsonl` file in the events directory is one session. Sessions are
//! bucketed by the model named in their latest `cost_update` event and the
//! task class named in their latest `skill_activated` event. Only events
//! inside the lookback window are counted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const UNKNOWN_MODEL: &str = "(unknown)";
pub const NONE_TASK_CLASS: &str = "(none)";
pub const DEFAULT_LOOKBACK_DAYS: u32 = 7;

#[derive(Debug, Clone, Default)]
struct BucketCounts {
    plans: u64,
    floor_unmet: u64,
    dropped: u64,
    injected_count: u64,
    injected_tokens_sum: f64,
    zone_moves: u64,
    zone_move_tokens: f64,
    verification_total: u64,
    verification_pass: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSamples {
    #[serde(default)]
    pub plans: u64,
    #[serde(default)]
    pub verification: u64,
    #[serde(default)]
    pub zone_adaptations: u64,
}

/// Metrics for one (model, task class) bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketMetrics {
    #[serde(default = "any_bucket_key")]
    pub model: String,
    #[serde(default = "any_bucket_key")]
    pub task_class: String,
    #[serde(default)]
    pub floor_unmet_rate: f64,
    #[serde(default)]
    pub injection_dropped_rate: f64,
    #[serde(default)]
    pub avg_injection_tokens: f64,
    #[serde(default)]
    pub zone_adaptation_move_ratio: f64,
    #[serde(default)]
    pub verification_pass_rate: f64,
    #[serde(default)]
    pub quality_proxy: f64,
    #[serde(default)]
    pub samples: BucketSamples,
}

/// Summaries written without a model or task class apply to any.
fn any_bucket_key() -> String {
    "*".to_string()
}

impl BucketMetrics {
    fn from_counts(model: &str, task_class: &str, c: &BucketCounts) -> Self {
        let plans = c.plans.max(1) as f64;
        let injected = c.injected_count.max(1) as f64;
        let verification = c.verification_total.max(1) as f64;

        let floor_unmet_rate = c.floor_unmet as f64 / plans;
        let injection_dropped_rate = c.dropped as f64 / plans;
        let verification_pass_rate = c.verification_pass as f64 / verification;
        Self {
            model: model.to_string(),
            task_class: task_class.to_string(),
            floor_unmet_rate,
            injection_dropped_rate,
            avg_injection_tokens: c.injected_tokens_sum / injected,
            zone_adaptation_move_ratio: c.zone_move_tokens / c.injected_tokens_sum.max(1.0),
            verification_pass_rate,
            quality_proxy: verification_pass_rate * (1.0 - injection_dropped_rate),
            samples: BucketSamples {
                plans: c.plans,
                verification: c.verification_total,
                zone_adaptations: c.zone_moves,
            },
        }
    }
}

/// Machine-readable observer output, consumed by the tuner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategySummary {
    #[serde(default)]
    pub generated_at: String,
    #[serde(default)]
    pub lookback_days: u32,
    #[serde(default)]
    pub buckets: Vec<BucketMetrics>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyReport {
    pub markdown: String,
    pub summary: StrategySummary,
}

impl StrategyReport {
    /// Write the Markdown report to `output` and the JSON summary next to it
    /// (same stem, `.json`). Returns the summary path.
    pub fn write(&self, output: &Path) -> Result<PathBuf, String> {
        super::write_atomic(output, &self.markdown)?;
        let summary_path = output.with_extension("json");
        let json = serde_json::to_string_pretty(&self.summary)
            .map_err(|e| format!("Failed to serialize summary: {e}"))?;
        super::write_atomic(&summary_path, &format!("{json}\n"))?;
        Ok(summary_path)
    }
}

/// Default report file name for a given day: `context-strategy-YYYYMMDD.md`.
pub fn default_report_name(now_ms: i64) -> String {
    format!("context-strategy-{}.md", utc(now_ms).format("%Y%m%d"))
}

fn utc(now_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(now_ms).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse a JSONL file, skipping blank, malformed, and non-object lines.
pub fn read_event_lines(path: &Path) -> Result<Vec<Value>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<Value>(line) {
            Ok(v) if v.is_object() => rows.push(v),
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(path = %path.display(), skipped, "skipped malformed event lines");
    }
    Ok(rows)
}

fn non_empty_str<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Latest model and task class named by a session's events.
pub fn session_bucket(events: &[Value]) -> (String, String) {
    let mut model: Option<&str> = None;
    let mut task_class: Option<&str> = None;
    for event in events.iter().rev() {
        let Some(payload) = event.get("payload").filter(|p| p.is_object()) else {
            continue;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("cost_update") if model.is_none() => model = non_empty_str(payload, "model"),
            Some("skill_activated") if task_class.is_none() => {
                task_class = non_empty_str(payload, "skillName")
            }
            _ => {}
        }
        if model.is_some() && task_class.is_some() {
            break;
        }
    }
    (
        model.unwrap_or(UNKNOWN_MODEL).to_string(),
        task_class.unwrap_or(NONE_TASK_CLASS).to_string(),
    )
}

fn count_event(bucket: &mut BucketCounts, event: &Value) {
    let empty = Value::Null;
    let payload = event.get("payload").unwrap_or(&empty);
    let number = |key: &str| payload.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    match event.get("type").and_then(Value::as_str) {
        Some("context_injected") => {
            bucket.plans += 1;
            bucket.injected_count += 1;
            bucket.injected_tokens_sum += number("sourceTokens");
        }
        Some("context_injection_dropped") => {
            if payload.get("reason").and_then(Value::as_str) != Some("duplicate_content") {
                bucket.plans += 1;
                bucket.dropped += 1;
            }
        }
        Some("context_arena_floor_unmet_unrecoverable") => bucket.floor_unmet += 1,
        Some("context_arena_zone_adapted") => {
            bucket.zone_moves += 1;
            bucket.zone_move_tokens += number("movedTokens");
        }
        Some("verification_outcome_recorded") => {
            bucket.verification_total += 1;
            if payload.get("outcome").and_then(Value::as_str) == Some("pass") {
                bucket.verification_pass += 1;
            }
        }
        _ => {}
    }
}

/// Build the report from every `*.jsonl` file in `events_dir`.
pub fn build_report(
    events_dir: &Path,
    lookback_days: u32,
    now_ms: i64,
) -> Result<StrategyReport, String> {
    let lookback_days = lookback_days.max(1);
    let now = utc(now_ms);
    let today = now.format("%Y-%m-%d").to_string();
    let mut summary = StrategySummary {
        generated_at: today.clone(),
        lookback_days,
        buckets: Vec::new(),
    };

    if !events_dir.is_dir() {
        return Ok(StrategyReport {
            markdown: "# Context Strategy Report\n\nNo event files found.\n".to_string(),
            summary,
        });
    }

    let cutoff_ms = (now - Duration::days(i64::from(lookback_days))).timestamp_millis();
    let mut files: Vec<PathBuf> = std::fs::read_dir(events_dir)
        .map_err(|e| format!("Failed to read {}: {e}", events_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    files.sort();

    let mut grouped: BTreeMap<(String, String), BucketCounts> = BTreeMap::new();
    for path in &files {
        let events = match read_event_lines(path) {
            Ok(events) if !events.is_empty() => events,
            Ok(_) => continue,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };
        let bucket = grouped.entry(session_bucket(&events)).or_default();
        for event in &events {
            let in_window = event
                .get("timestamp")
                .and_then(Value::as_f64)
                .is_some_and(|ts| ts >= cutoff_ms as f64);
            if in_window {
                count_event(bucket, event);
            }
        }
    }
    debug!(files = files.len(), buckets = grouped.len(), "observer pass complete");

    let mut lines = vec![format!("# Context Strategy Report ({today})"), String::new()];
    if grouped.is_empty() {
        lines.push("No context strategy signals in the lookback window.".to_string());
    }
    for ((model, task_class), counts) in &grouped {
        let m = BucketMetrics::from_counts(model, task_class, counts);
        lines.extend([
            format!("## Model: {model} | Task: {task_class}"),
            String::new(),
            "| Metric | Value |".to_string(),
            "|---|---:|".to_string(),
            format!("| floor_unmet_rate | {:.4} |", m.floor_unmet_rate),
            format!("| injection_dropped_rate | {:.4} |", m.injection_dropped_rate),
            format!("| avg_injection_tokens | {:.1} |", m.avg_injection_tokens),
            format!(
                "| zone_adaptation_move_ratio | {:.4} |",
                m.zone_adaptation_move_ratio
            ),
            format!("| verification_pass_rate | {:.4} |", m.verification_pass_rate),
            format!("| quality_proxy | {:.4} |", m.quality_proxy),
            String::new(),
        ]);
        summary.buckets.push(m);
    }

    Ok(StrategyReport {
        markdown: lines.join("\n") + "\n",
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_760_000_000_000;
    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn write_session(dir: &Path, name: &str, events: &[Value]) {
        let body: Vec<String> = events.iter().map(|e| e.to_string()).collect();
        std::fs::write(dir.join(name), body.join("\n")).unwrap();
    }

    fn event(ts: i64, kind: &str, payload: Value) -> Value {
        json!({"sessionId": "s", "turn": 1, "timestamp": ts, "type": kind, "payload": payload})
    }

    #[test]
    fn bucket_without_keys_matches_anything() {
        let bucket: BucketMetrics =
            serde_json::from_value(json!({"qualityProxy": 0.5, "samples": {"plans": 3}})).unwrap();
        assert_eq!(bucket.model, "*");
        assert_eq!(bucket.task_class, "*");
        assert_eq!(bucket.samples.plans, 3);
    }

    #[test]
    fn bucket_uses_latest_model_and_skill() {
        let events = vec![
            event(NOW, "cost_update", json!({"model": "old-model"})),
            event(NOW, "skill_activated", json!({"skillName": "review"})),
            event(NOW, "cost_update", json!({"model": " new-model "})),
            event(NOW, "skill_activated", json!({"skillName": "  "})),
        ];
        assert_eq!(
            session_bucket(&events),
            ("new-model".to_string(), "review".to_string())
        );
        assert_eq!(
            session_bucket(&[]),
            (UNKNOWN_MODEL.to_string(), NONE_TASK_CLASS.to_string())
        );
    }

    #[test]
    fn computes_bucket_metrics() {
        let dir = tempfile::tempdir().unwrap();
        write_session(
            dir.path(),
            "a.jsonl",
            &[
                event(NOW, "cost_update", json!({"model": "m1"})),
                event(NOW, "skill_activated", json!({"skillName": "coding"})),
                event(NOW, "context_injected", json!({"sourceTokens": 300})),
                event(NOW, "context_injected", json!({"sourceTokens": 100})),
                event(NOW, "context_injection_dropped", json!({"reason": "floor_unmet"})),
                event(NOW, "context_injection_dropped", json!({"reason": "duplicate_content"})),
                event(NOW, "context_arena_floor_unmet_unrecoverable", json!({})),
                event(NOW, "context_arena_zone_adapted", json!({"movedTokens": 40})),
                event(NOW, "verification_outcome_recorded", json!({"outcome": "pass"})),
                event(NOW, "verification_outcome_recorded", json!({"outcome": "fail"})),
            ],
        );

        let report = build_report(dir.path(), 7, NOW).unwrap();
        assert_eq!(report.summary.buckets.len(), 1);
        let b = &report.summary.buckets[0];
        assert_eq!(b.model, "m1");
        assert_eq!(b.task_class, "coding");
        assert_eq!(b.samples.plans, 3);
        assert_eq!(b.samples.verification, 2);
        assert_eq!(b.samples.zone_adaptations, 1);
        assert!((b.floor_unmet_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((b.injection_dropped_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((b.avg_injection_tokens - 200.0).abs() < 1e-9);
        assert!((b.zone_adaptation_move_ratio - 0.1).abs() < 1e-9);
        assert!((b.verification_pass_rate - 0.5).abs() < 1e-9);
        assert!((b.quality_proxy - 0.5 * (2.0 / 3.0)).abs() < 1e-9);
        assert!(report.markdown.contains("## Model: m1 | Task: coding"));
        assert!(report.markdown.contains("| floor_unmet_rate | 0.3333 |"));
    }

    #[test]
    fn old_events_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_session(
            dir.path(),
            "a.jsonl",
            &[
                event(NOW - 10 * DAY_MS, "context_injected", json!({"sourceTokens": 50})),
                event(NOW - DAY_MS, "context_injected", json!({"sourceTokens": 10})),
            ],
        );
        let report = build_report(dir.path(), 7, NOW).unwrap();
        let b = &report.summary.buckets[0];
        assert_eq!(b.samples.plans, 1);
        assert_eq!(b.model, UNKNOWN_MODEL);
        assert!((b.avg_injection_tokens - 10.0).abs() < 1e-9);
    }

    #[test]
    fn malformed_lines_and_other_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.jsonl"),
            format!(
                "not json\n[1,2]\n\n{}\n",
                event(NOW, "context_injected", json!({"sourceTokens": 5}))
            ),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("empty.jsonl"), "").unwrap();
        let report = build_report(dir.path(), 7, NOW).unwrap();
        assert_eq!(report.summary.buckets.len(), 1);
        assert_eq!(report.summary.buckets[0].samples.plans, 1);
    }

    #[test]
    fn missing_directory_reports_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let report = build_report(&dir.path().join("nope"), 7, NOW).unwrap();
        assert!(report.markdown.contains("No event files found."));
        assert!(report.summary.buckets.is_empty());
    }

    #[test]
    fn write_emits_markdown_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let events = dir.path().join("events");
        std::fs::create_dir(&events).unwrap();
        write_session(
            &events,
            "a.jsonl",
            &[event(NOW, "context_injected", json!({"sourceTokens": 5}))],
        );
        let report = build_report(&events, 7, NOW).unwrap();
        let out = dir.path().join("reports").join(default_report_name(NOW));
        let summary_path = report.write(&out).unwrap();

        assert!(out.exists());
        assert_eq!(summary_path.extension().unwrap(), "json");
        let parsed: StrategySummary =
            serde_json::from_str(&std::fs::read_to_string(&summary_path).unwrap()).unwrap();
        assert_eq!(parsed, report.summary);
    }
}
