//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`EngineSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `LIFELINE_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{BatchStrategy, EngineSettings};

/// Resolve the settings file path.
///
/// `$LIFELINE_HOME/settings.json` when set, otherwise
/// `~/.lifeline/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(home) = read_env_string("LIFELINE_HOME") {
        return PathBuf::from(home).join("settings.json");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".lifeline").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<EngineSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// [`EngineSettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<EngineSettings> {
    let defaults = serde_json::to_value(EngineSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: EngineSettings = serde_json::from_value(merged)?;
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

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut EngineSettings) {
    // ── Registry ────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("LIFELINE_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.registry.max_connections = v;
    }

    // ── Heartbeat ───────────────────────────────────────────────────
    if let Some(v) = read_env_u64("LIFELINE_HEARTBEAT_INTERVAL_MS", 100, 3_600_000) {
        settings.heartbeat.interval_ms = v;
    }
    if let Some(v) = read_env_u64("LIFELINE_PROBE_TIMEOUT_MS", 10, 600_000) {
        settings.heartbeat.probe_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("LIFELINE_MISS_THRESHOLD", 1, 100) {
        settings.heartbeat.miss_threshold = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = read_env_u64("LIFELINE_CONNECTION_TIMEOUT_MS", 100, 86_400_000) {
        settings.heartbeat.connection_timeout_ms = v;
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("LIFELINE_CLEANUP_INTERVAL_MS", 100, 3_600_000) {
        settings.cleanup.interval_ms = v;
    }

    // ── Reconnection ────────────────────────────────────────────────
    if let Some(v) = read_env_bool("LIFELINE_RECONNECT_ENABLED") {
        settings.reconnection.enabled = v;
    }
    if let Some(v) = read_env_u64("LIFELINE_RECONNECT_MAX_ATTEMPTS", 1, 1_000) {
        settings.reconnection.max_attempts = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = read_env_u64("LIFELINE_RECONNECT_RETENTION_SECS", 60, 31_536_000) {
        settings.reconnection.retention_secs = v;
    }

    // ── Batching ────────────────────────────────────────────────────
    if let Some(v) = read_env_string("LIFELINE_BATCH_STRATEGY") {
        match parse_strategy(&v) {
            Some(strategy) => settings.batching.strategy = strategy,
            None => {
                tracing::warn!(key = "LIFELINE_BATCH_STRATEGY", value = %v, "unknown batch strategy, ignoring");
            }
        }
    }
    if let Some(v) = read_env_usize("LIFELINE_BATCH_MAX_SIZE", 1, 100_000) {
        settings.batching.max_batch_size = v;
    }

    // ── Metrics / logging ───────────────────────────────────────────
    if let Some(v) = read_env_usize("LIFELINE_METRICS_MAX_POINTS", 1, 10_000_000) {
        settings.metrics.max_points = v;
    }
    if let Some(v) = read_env_string("LIFELINE_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a batch strategy name (`size_based`, `size-based`, `SIZE_BASED`, ...).
pub fn parse_strategy(val: &str) -> Option<BatchStrategy> {
    let normalized = val.trim().to_lowercase().replace('-', "_");
    serde_json::from_value(Value::String(normalized)).ok()
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
