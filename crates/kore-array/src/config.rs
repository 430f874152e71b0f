//! Runtime configuration for the indexing fallbacks.

use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub const ENV_ALLOW_FALLBACK: &str = "KORE_ARRAY_ALLOW_FALLBACK";
pub const ENV_LOG_FALLBACK: &str = "KORE_ARRAY_LOG_FALLBACK";

/// Controls what `getitem` / `setitem` do when a backend declines a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrayConfig {
    /// Retry unsupported keys on the fallback tensor. When false, the
    /// decline surfaces as `KoreError::FallbackDisabled`.
    pub allow_fallback: bool,
    /// Emit a `debug` event whenever a fallback path runs.
    pub log_fallback: bool,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            allow_fallback: true,
            log_fallback: true,
        }
    }
}

impl ArrayConfig {
    /// Defaults overridden by `KORE_ARRAY_ALLOW_FALLBACK` and
    /// `KORE_ARRAY_LOG_FALLBACK`. Unparseable values are ignored with a
    /// warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let flags = [
            (ENV_ALLOW_FALLBACK, &mut config.allow_fallback),
            (ENV_LOG_FALLBACK, &mut config.log_fallback),
        ];
        for (key, slot) in flags {
            let Some(raw) = lookup(key) else { continue };
            match parse_flag(&raw) {
                Some(value) => *slot = value,
                None => tracing::warn!(key, value = %raw, "ignoring unrecognised boolean"),
            }
        }
        config
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

static GLOBAL: OnceLock<RwLock<ArrayConfig>> = OnceLock::new();

fn global_lock() -> &'static RwLock<ArrayConfig> {
    GLOBAL.get_or_init(|| RwLock::new(ArrayConfig::from_env()))
}

/// The process-wide configuration used by `getitem` and `setitem`.
///
/// Initialised from the environment on first use.
pub fn global() -> ArrayConfig {
    *global_lock().read()
}

/// Replace the process-wide configuration.
pub fn set_global(config: ArrayConfig) {
    *global_lock().write() = config;
}
