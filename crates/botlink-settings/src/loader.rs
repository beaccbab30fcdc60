//! Layered settings: compiled defaults, the JSON file, then the environment.
//!
//! Loading flow:
//! 1. Start with compiled [`BotSettings::default()`]
//! 2. If the settings file exists, overlay its values onto the defaults
//! 3. Apply `BOTLINK_*` environment overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Overlay rules: objects merge key by key, anything else in the file
//! replaces the default outright, and `null` in the file keeps the default.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::BotSettings;

/// Resolve the default settings path (`~/.botlink/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".botlink").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BotSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or a failed validation is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<BotSettings> {
    let mut merged = serde_json::to_value(BotSettings::default())?;

    if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        merge_into(&mut merged, serde_json::from_str(&content)?);
    } else {
        debug!(?path, "settings file not found, using defaults");
    }

    let mut settings: BotSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Overlay `overlay` onto `base` in place.
pub fn merge_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_into(slot, value),
                    None if value.is_null() => {}
                    None => {
                        let _ = base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `BOTLINK_*` environment overrides.
///
/// Unparseable or out-of-range values are logged and ignored.
pub fn apply_env_overrides(settings: &mut BotSettings) {
    if let Some(v) = env_override("BOTLINK_LOG_LEVEL", non_empty) {
        settings.logging.level = v;
    }
    if let Some(v) = env_override("BOTLINK_LOG_JSON", parse_flag) {
        settings.logging.json = v;
    }
    if let Some(v) = env_override("BOTLINK_CHILDREN_DIR", non_empty) {
        settings.children.dir = v;
    }
    if let Some(v) = env_override("BOTLINK_CHILD_RUNTIME", non_empty) {
        settings.children.runtime = Some(v);
    }
    if let Some(v) = env_override("BOTLINK_MAX_RESTARTS", |v| parse_bounded(v, 0..=1_000_000u32)) {
        settings.children.max_restarts = Some(v);
    }
    if let Some(v) = env_override("BOTLINK_PORT_RANGE_START", |v| parse_bounded(v, PORT_BOUNDS)) {
        settings.ports.range_start = v;
    }
    if let Some(v) = env_override("BOTLINK_PORT_RANGE_END", |v| parse_bounded(v, PORT_BOUNDS)) {
        settings.ports.range_end = v;
    }
}

/// Unprivileged ports only.
const PORT_BOUNDS: RangeInclusive<u16> = 1024..=u16::MAX;

/// Yes/no flag: `1/true/yes/on` or `0/false/no/off`, any case.
pub fn parse_flag(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    let is = |words: [&str; 4]| words.iter().any(|w| raw.eq_ignore_ascii_case(w));
    if is(["1", "true", "yes", "on"]) {
        Some(true)
    } else if is(["0", "false", "no", "off"]) {
        Some(false)
    } else {
        None
    }
}

/// Parse a number and keep it only if it falls inside `bounds`.
pub fn parse_bounded<T>(raw: &str, bounds: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    raw.trim().parse().ok().filter(|n| bounds.contains(n))
}

fn non_empty(raw: &str) -> Option<String> {
    Some(raw.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

fn env_override<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        tracing::warn!(key = name, value = %raw, "ignoring invalid environment override");
    }
    parsed
}
