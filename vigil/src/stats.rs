//! Run statistics: timing, per-spec monitor and event counters, and the
//! violation summary.
//!
//! With no statistics file configured, the sections print to stdout under
//! fixed headers. With `statistics-file` set to `<base>.<ext>`, three
//! artifacts are written: `<base>-time.<ext>`, `<base>-violations.<ext>`
//! and, only when full statistics are enabled, `<base>-full.<ext>`.
//! A `.json` extension selects JSON (sets rendered as sorted lists);
//! anything else gets the plain-text sections.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use vigil_core::Dispatcher;

use crate::config::Config;

fn now_epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Serialize)]
pub struct Timings {
    pub start_time: f64,
    pub instrumentation_end_time: f64,
    pub instrumentation_duration: f64,
    pub create_monitor_end_time: f64,
    pub create_monitor_duration: f64,
    /// Module-load time accumulated after startup instrumentation.
    pub post_instrumentation_load_seconds: f64,
}

pub struct Statistics {
    timings: Timings,
}

impl Statistics {
    pub fn begin() -> Statistics {
        Statistics {
            timings: Timings {
                start_time: now_epoch_seconds(),
                instrumentation_end_time: 0.0,
                instrumentation_duration: 0.0,
                create_monitor_end_time: 0.0,
                create_monitor_duration: 0.0,
                post_instrumentation_load_seconds: 0.0,
            },
        }
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn mark_instrumentation_end(&mut self) {
        let now = now_epoch_seconds();
        self.timings.instrumentation_end_time = now;
        self.timings.instrumentation_duration = now - self.timings.start_time;
    }

    pub fn mark_monitors_created(&mut self) {
        let now = now_epoch_seconds();
        self.timings.create_monitor_end_time = now;
        self.timings.create_monitor_duration = now - self.timings.instrumentation_end_time;
    }

    pub fn set_post_instrumentation_load_seconds(&mut self, seconds: f64) {
        self.timings.post_instrumentation_load_seconds = seconds;
    }

    /// Emits every section, to stdout or to the configured artifacts.
    pub fn emit(&self, config: &Config, dispatcher: &Dispatcher) {
        println!("Generating statistics...");
        self.emit_time(config);
        if config.statistics {
            self.emit_full(config, dispatcher);
        }
        self.emit_violations(config, dispatcher);
    }

    fn emit_time(&self, config: &Config) {
        let mut text = String::from(
            "=========================== Time Measurements ===========================\n",
        );
        let t = &self.timings;
        text.push_str(&format!("Start time: {:.5} seconds\n", t.start_time));
        text.push_str(&format!(
            "Instrumentation end time: {:.5} seconds\n",
            t.instrumentation_end_time
        ));
        text.push_str(&format!(
            "Time taken for instrumentation: {:.5} seconds\n",
            t.instrumentation_duration
        ));
        text.push_str(&format!(
            "Create monitor end time: {:.5} seconds\n",
            t.create_monitor_end_time
        ));
        text.push_str(&format!(
            "Time taken for creating monitors: {:.5} seconds\n",
            t.create_monitor_duration
        ));
        text.push_str(&format!(
            "Module load time after instrumentation: {:.6} seconds\n",
            t.post_instrumentation_load_seconds
        ));

        match artifact_path(config, "time") {
            Some(path) => {
                let payload = serde_json::to_value(t).unwrap_or_else(|_| json!({}));
                write_artifact(&path, &text, &payload);
                println!("Time measurements are saved in {}.", path.display());
            }
            None => println!("{}", text),
        }
    }

    fn emit_violations(&self, config: &Config, dispatcher: &Dispatcher) {
        let snapshot = dispatcher.violations().snapshot();
        let mut text = String::from(
            "============================== Violations ==============================\n",
        );
        let mut total = 0usize;
        for (spec, records) in &snapshot {
            let spec_total: usize = records.iter().map(|r| r.count).sum();
            total += spec_total;
            text.push_str(&format!("Spec - {}: {} violations\n", spec, spec_total));
        }
        text.push_str(&format!("Total Violations: {} violations\n", total));
        text.push_str("------------\n");
        for (spec, records) in &snapshot {
            text.push_str(&format!("Spec - {}:\n", spec));
            for record in records {
                let tests: Vec<&str> = record.tests.iter().map(String::as_str).collect();
                text.push_str(&format!(
                    "    {}, (Tests: [{}]): {} times\n",
                    record.format_line(),
                    tests.join(", "),
                    record.count
                ));
            }
            text.push_str("------------\n");
        }

        match artifact_path(config, "violations") {
            Some(path) => {
                let mut by_spec = BTreeMap::new();
                for (spec, records) in &snapshot {
                    let entries: Vec<serde_json::Value> = records
                        .iter()
                        .map(|r| {
                            json!({
                                "message": r.format_line(),
                                "event": r.event,
                                "binding": r.binding,
                                "file": r.file,
                                "line": r.line,
                                "opener_file": r.opener_file,
                                "opener_line": r.opener_line,
                                "count": r.count,
                                // BTreeSet iteration is sorted already.
                                "tests": r.tests.iter().collect::<Vec<_>>(),
                            })
                        })
                        .collect();
                    by_spec.insert(spec.clone(), entries);
                }
                let payload = serde_json::to_value(&by_spec).unwrap_or_else(|_| json!({}));
                write_artifact(&path, &text, &payload);
                println!("Violations are saved in {}.", path.display());
            }
            None => println!("{}", text),
        }
    }

    fn emit_full(&self, config: &Config, dispatcher: &Dispatcher) {
        let mut text = String::from(
            "============================== Monitors and Events calls ==============================\n",
        );
        let mut monitors: BTreeMap<String, usize> = BTreeMap::new();
        let mut events: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        dispatcher.for_each_spec(|spec| {
            monitors.insert(spec.spec.name.clone(), spec.monitors_created());
            events.insert(spec.spec.name.clone(), spec.event_counts());
        });

        let total: usize = monitors.values().sum();
        for (spec, count) in &monitors {
            text.push_str(&format!("Spec - {}: {} monitors\n", spec, count));
        }
        text.push_str(&format!("Total Monitors: {} monitors\n", total));
        text.push_str("------------\n");
        for (spec, counts) in &events {
            text.push_str(&format!("Spec - {}:\n", spec));
            for (event, count) in counts {
                text.push_str(&format!("    {}: {} times\n", event, count));
            }
            text.push_str("------------\n");
        }

        match artifact_path(config, "full") {
            Some(path) => {
                let mut payload = BTreeMap::new();
                for (spec, count) in &monitors {
                    payload.insert(
                        spec.clone(),
                        json!({
                            "monitors": count,
                            "events": events.get(spec).cloned().unwrap_or_default(),
                        }),
                    );
                }
                let payload = serde_json::to_value(&payload).unwrap_or_else(|_| json!({}));
                write_artifact(&path, &text, &payload);
                println!("Full statistics are saved in {}.", path.display());
            }
            None => println!("{}", text),
        }
    }
}

/// `<base>-<section>.<ext>` next to the configured statistics file.
fn artifact_path(config: &Config, section: &str) -> Option<PathBuf> {
    let base = config.statistics_file.as_ref()?;
    let stem = base.file_stem()?.to_string_lossy();
    let ext = base
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "txt".to_string());
    let name = format!("{}-{}.{}", stem, section, ext);
    Some(base.with_file_name(name))
}

fn write_artifact(path: &Path, text: &str, payload: &serde_json::Value) {
    let is_json = path.extension().map(|e| e == "json").unwrap_or(false);
    let contents = if is_json {
        serde_json::to_string_pretty(payload).unwrap_or_else(|_| "{}".to_string())
    } else {
        text.to_string()
    };
    if let Err(err) = std::fs::write(path, contents) {
        warn!(path = %path.display(), error = %err, "cannot write statistics artifact");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths_follow_base_name() {
        let mut config = Config {
            statistics_file: Some(PathBuf::from("/tmp/out/run.json")),
            ..Config::default()
        };
        assert_eq!(
            artifact_path(&config, "time").unwrap(),
            PathBuf::from("/tmp/out/run-time.json")
        );
        config.statistics_file = Some(PathBuf::from("stats.txt"));
        assert_eq!(
            artifact_path(&config, "violations").unwrap(),
            PathBuf::from("stats-violations.txt")
        );
        config.statistics_file = None;
        assert!(artifact_path(&config, "time").is_none());
    }

    #[test]
    fn timings_are_monotonic() {
        let mut stats = Statistics::begin();
        stats.mark_instrumentation_end();
        stats.mark_monitors_created();
        let t = stats.timings();
        assert!(t.instrumentation_end_time >= t.start_time);
        assert!(t.create_monitor_end_time >= t.instrumentation_end_time);
        assert!(t.instrumentation_duration >= 0.0);
    }
}
