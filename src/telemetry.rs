//! JSONL activity log for commands, resolver runs and agent streams, plus the
//! `telemetry report` summary built from it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::RuntimeConfig;

pub fn unix_ms_now() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

pub fn unix_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Two decimal places, used for latencies.
pub fn round_metric(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

const ENVELOPE_KEYS: [&str; 5] = ["ts_unix_ms", "event", "run_id", "command", "profile"];

/// One line of the activity log. Payload keys sit beside the envelope keys.
#[derive(Debug, Serialize)]
struct TelemetryRecord<'a> {
    ts_unix_ms: u64,
    event: &'a str,
    run_id: &'a str,
    command: &'a str,
    profile: &'a str,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

#[derive(Debug)]
struct LogFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LogFile {
    fn append(&self, record: &TelemetryRecord<'_>) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create telemetry directory '{}'", dir.display()))?;
        }

        let mut line = serde_json::to_vec(record)
            .with_context(|| format!("failed to encode telemetry event '{}'", record.event))?;
        line.push(b'\n');

        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&line))
            .with_context(|| format!("failed to append to telemetry log '{}'", self.path.display()))
    }
}

/// Cloneable handle that appends events for one process run. A disabled sink drops everything.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    log: Option<Arc<LogFile>>,
    run_id: String,
    command: String,
    profile: String,
}

impl TelemetrySink {
    pub fn new(cfg: &RuntimeConfig, command: String) -> Self {
        let log = cfg.telemetry_enabled.then(|| {
            Arc::new(LogFile {
                path: PathBuf::from(&cfg.telemetry_path),
                lock: Mutex::new(()),
            })
        });
        Self {
            log,
            run_id: format!("linkbox-{}", uuid::Uuid::new_v4().simple()),
            command,
            profile: cfg.profile.clone(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            log: None,
            run_id: String::new(),
            command: String::new(),
            profile: String::new(),
        }
    }

    /// Appends `event` with the object keys of `payload`; keys naming envelope fields are
    /// dropped. Write failures are logged, never returned.
    pub fn emit(&self, event: &str, payload: Value) {
        let Some(log) = &self.log else {
            return;
        };

        let record = TelemetryRecord {
            ts_unix_ms: unix_ms_now(),
            event,
            run_id: &self.run_id,
            command: &self.command,
            profile: &self.profile,
            payload: match payload {
                Value::Object(mut map) => {
                    map.retain(|key, _| !ENVELOPE_KEYS.contains(&key.as_str()));
                    map
                }
                _ => Map::new(),
            },
        };
        if let Err(err) = log.append(&record) {
            tracing::warn!(event, path = %log.path.display(), error = %format!("{err:#}"), "telemetry write failed");
        }
    }
}

/// The fields of a logged line the report looks at.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoggedEvent {
    event: String,
    run_id: String,
    command: String,
    ts_unix_ms: Option<u64>,
    outcome: Option<String>,
    stage: Option<String>,
    latency_ms: Option<f64>,
}

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub unique_runs: BTreeSet<String>,
    pub command_counts: HashMap<String, usize>,
    pub command_completed: usize,
    pub command_failed: usize,
    pub resolver_runs: usize,
    pub resolver_outcomes: BTreeMap<String, usize>,
    pub resolver_latency_total_ms: f64,
    pub oracle_fallbacks: usize,
    pub fallback_stages: BTreeMap<String, usize>,
    pub cache_misses: usize,
    pub agent_streams: usize,
    pub last_event_ts_unix_ms: Option<u64>,
}

impl TelemetrySummary {
    fn record(&mut self, logged: LoggedEvent) {
        self.parsed_events += 1;
        if !logged.run_id.is_empty() {
            self.unique_runs.insert(logged.run_id);
        }
        if !logged.command.is_empty() {
            *self.command_counts.entry(logged.command).or_default() += 1;
        }
        if let Some(ts) = logged.ts_unix_ms {
            self.last_event_ts_unix_ms = self.last_event_ts_unix_ms.max(Some(ts));
        }

        match logged.event.as_str() {
            "command.completed" => self.command_completed += 1,
            "command.failed" => self.command_failed += 1,
            "resolver.completed" => {
                self.resolver_runs += 1;
                let outcome = logged.outcome.unwrap_or_else(|| "unknown".to_string());
                *self.resolver_outcomes.entry(outcome).or_default() += 1;
                self.resolver_latency_total_ms += logged.latency_ms.unwrap_or_default();
            }
            "oracle.fallback" => {
                self.oracle_fallbacks += 1;
                let stage = logged.stage.unwrap_or_else(|| "unknown".to_string());
                *self.fallback_stages.entry(stage).or_default() += 1;
            }
            "resolver.cache_miss" => self.cache_misses += 1,
            "agent.stream.completed" => self.agent_streams += 1,
            _ => {}
        }
    }

    pub fn mean_resolver_latency_ms(&self) -> Option<f64> {
        (self.resolver_runs > 0)
            .then(|| round_metric(self.resolver_latency_total_ms / self.resolver_runs as f64))
    }
}

/// Summarizes the newest `limit` lines of the log (at least one).
pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary {
        total_lines: lines.len(),
        ..TelemetrySummary::default()
    };

    for line in lines.iter().rev().take(limit.max(1)) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LoggedEvent>(line) {
            Ok(logged) => summary.record(logged),
            Err(_) => summary.parse_errors += 1,
        }
    }

    summary
}

fn read_log_lines(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open telemetry file '{}'", path.display()))?;
    BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))
}

pub fn run_telemetry_report(
    cfg: &RuntimeConfig,
    path_override: Option<String>,
    limit: usize,
) -> Result<()> {
    let path = PathBuf::from(path_override.unwrap_or_else(|| cfg.telemetry_path.clone()));
    if !path.exists() {
        println!("No activity log at '{}' yet.", path.display());
        return Ok(());
    }

    let summary = summarize_telemetry_lines(read_log_lines(&path)?, limit);

    println!("linkbox activity ({})", path.display());
    println!(
        "{} of {} lines read, {} unreadable, {} runs",
        summary.parsed_events,
        summary.total_lines,
        summary.parse_errors,
        summary.unique_runs.len()
    );

    let mut commands = summary.command_counts.iter().collect::<Vec<_>>();
    commands.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    println!(
        "\nCommands: {} ok, {} failed",
        summary.command_completed, summary.command_failed
    );
    for (name, count) in commands.into_iter().take(5) {
        println!("  {name:<16} {count}");
    }

    println!("\nSearches resolved: {}", summary.resolver_runs);
    for (outcome, count) in &summary.resolver_outcomes {
        println!("  {outcome:<22} {count}");
    }
    if let Some(mean) = summary.mean_resolver_latency_ms() {
        println!("  mean latency {mean} ms");
    }
    println!(
        "Oracle fallbacks: {} (cache misses {})",
        summary.oracle_fallbacks, summary.cache_misses
    );
    for (stage, count) in &summary.fallback_stages {
        println!("  {stage:<22} {count}");
    }
    println!("Agent streams served: {}", summary.agent_streams);

    if let Some(ts) = summary.last_event_ts_unix_ms {
        println!("\nLast event at {ts} (unix ms)");
    }

    Ok(())
}
