//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tally_core::logging::LogFormat;
use tracing::debug;

use crate::errors::Result;
use crate::types::TallySettings;

/// Resolve the path to the settings file (`~/.tally/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tally").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TallySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TallySettings> {
    let defaults = serde_json::to_value(TallySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TallySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TALLY_*` environment overrides.
///
/// Out-of-range or unparseable values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut TallySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

fn apply_overrides(settings: &mut TallySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };
    let server = &mut settings.server;

    if let Some(v) = env.string("TALLY_HOST") {
        server.host = v;
    }
    if let Some(v) = env.ranged("TALLY_PORT", 1_u16, 65535) {
        server.port = v;
    }
    if let Some(v) = env.ranged("TALLY_HEARTBEAT_INTERVAL_SECS", 1_u64, 3600) {
        server.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.ranged("TALLY_SESSION_TTL_SECS", 1_u64, 86_400) {
        server.session_ttl_secs = v;
    }
    if let Some(v) = env.ranged("TALLY_DRAIN_POLL_INTERVAL_MS", 1_u64, 10_000) {
        server.drain_poll_interval_ms = v;
    }
    if let Some(v) = env.ranged("TALLY_DRAIN_MAX_ATTEMPTS", 1_u32, 100_000) {
        server.drain_max_attempts = v;
    }
    if let Some(v) = env.ranged("TALLY_SEND_QUEUE_CAPACITY", 1_usize, 65_536) {
        server.send_queue_capacity = v;
    }
    if let Some(v) = env.ranged("TALLY_SHUTDOWN_TIMEOUT_SECS", 1_u64, 600) {
        server.shutdown_timeout_secs = v;
    }

    if let Some(v) = env.string("TALLY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(raw) = env.string("TALLY_LOG_FORMAT") {
        match LogFormat::parse(&raw) {
            Some(format) => settings.logging.format = format,
            None => tracing::warn!(key = "TALLY_LOG_FORMAT", value = %raw, "invalid log format, ignoring"),
        }
    }
}

/// Parse a string as a number within an inclusive range.
pub fn parse_ranged<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn ranged<T>(&self, name: &str, min: T, max: T) -> Option<T>
    where
        T: std::str::FromStr + PartialOrd,
    {
        let val = (self.lookup)(name)?;
        let result = parse_ranged(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}
