//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tether_core::PairingMethod;
use tracing::debug;

use crate::errors::Result;
use crate::types::{TetherSettings, TransportKind};

/// Tether's home directory (`~/.tether`).
pub fn tether_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether")
}

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    tether_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
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
/// Invalid values are logged and ignored (file/default value stays).
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("TETHER_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_u64("TETHER_HEARTBEAT_INTERVAL_MS", 1000, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }

    // ── Storage and auth ────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_DB_PATH") {
        settings.database.path = v;
    }
    if let Some(v) = read_env_string("TETHER_JWT_SECRET") {
        settings.auth.jwt_secret = Some(v);
    }

    // ── Worker ──────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("TETHER_PAIRING_TIMEOUT_MS", 1000, 3_600_000) {
        settings.worker.pairing_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_PAIRING_REFRESH_MS", 1000, 600_000) {
        settings.worker.pairing_refresh_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_TEARDOWN_GRACE_MS", 10, 120_000) {
        settings.worker.teardown_grace_ms = v;
    }
    if let Some(phone) = read_env_string("TETHER_PAIRING_PHONE") {
        settings.worker.pairing = PairingMethod::Code { phone };
    }
    if let Some(v) = read_env_u32("TETHER_BACKOFF_MAX_ATTEMPTS", 0, 1000) {
        settings.backoff.max_attempts = v;
    }

    // ── Transport ───────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_TRANSPORT") {
        match parse_transport_kind(&v) {
            Some(kind) => settings.transport.kind = kind,
            None => tracing::warn!(key = "TETHER_TRANSPORT", value = %v, "unknown transport, ignoring"),
        }
    }
    if let Some(v) = read_env_string("TETHER_GATEWAY_URL") {
        settings.transport.gateway.base_url = Some(v);
    }
    if let Some(v) = read_env_string("TETHER_GATEWAY_API_KEY") {
        settings.transport.gateway.api_key = Some(v);
    }
    if let Some(v) = read_env_string("TETHER_WEBHOOK_BASE_URL") {
        settings.transport.gateway.webhook_base_url = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("TETHER_LOG_JSON") {
        settings.logging.json = v;
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

/// Parse a transport name (`scripted`, `http_gateway`, or `http-gateway`).
pub fn parse_transport_kind(val: &str) -> Option<TransportKind> {
    match val.to_lowercase().replace('-', "_").as_str() {
        "scripted" => Some(TransportKind::Scripted),
        "http_gateway" => Some(TransportKind::HttpGateway),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
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

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
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

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8090, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_object_replaces_primitive() {
        let target = serde_json::json!({"pairing": "qr"});
        let source = serde_json::json!({"pairing": {"method": "code", "phone": "1"}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["pairing"]["method"], "code");
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let file = load_file_layer(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(file.server.port, 8090);
        assert_eq!(file.database.path, "tether.db");
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"backoff": {"baseDelayMs": 250}, "transport": {"kind": "http_gateway", "gateway": {"baseUrl": "http://gw"}}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.backoff.base_delay_ms, 250);
        assert_eq!(settings.backoff.max_delay_ms, 60_000);
        assert_eq!(settings.transport.kind, TransportKind::HttpGateway);
        assert_eq!(settings.transport.gateway.base_url.as_deref(), Some("http://gw"));
        assert_eq!(settings.transport.gateway.request_timeout_ms, 10_000);
    }

    #[test]
    fn load_code_pairing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"worker": {"pairing": {"method": "code", "phone": "5511999999999"}}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(
            settings.worker.pairing,
            PairingMethod::Code {
                phone: "5511999999999".into()
            }
        );
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_file_layer(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "no", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_transport_names() {
        assert_eq!(parse_transport_kind("scripted"), Some(TransportKind::Scripted));
        assert_eq!(parse_transport_kind("HTTP-GATEWAY"), Some(TransportKind::HttpGateway));
        assert_eq!(parse_transport_kind("baileys"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("0", 0, 65535), Some(0));
        assert_eq!(parse_u16_range("99999", 0, 65535), None);
        assert_eq!(parse_u32_range("5", 0, 1000), Some(5));
        assert_eq!(parse_u32_range("1001", 0, 1000), None);
        assert_eq!(parse_u64_range("500", 1000, 600_000), None);
        assert_eq!(parse_u64_range("abc", 1000, 600_000), None);
    }
}
