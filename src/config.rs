//! Governor configuration: the inbound knobs a host process can set, loaded
//! from a TOML file with environment overrides.

use std::{env, fs, path::PathBuf, time::Duration};

use anyhow::Result;
use directories::ProjectDirs;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernorConfig {
    /// Pressure monitor poll interval.
    pub monitor_interval_ms: u64,
    /// Controller watchdog tick interval.
    pub watchdog_interval_ms: u64,
    /// Capacity probe cache window.
    pub cache_ttl_ms: u64,
    /// Controller worker-count triple; `initial` is clamped into
    /// `[min, max]` at controller construction.
    pub initial_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_monitor_interval_ms")]
    monitor_interval_ms: u64,
    #[serde(default = "default_watchdog_interval_ms")]
    watchdog_interval_ms: u64,
    #[serde(default = "default_cache_ttl_ms")]
    cache_ttl_ms: u64,
    #[serde(default = "default_initial_workers")]
    initial_workers: usize,
    #[serde(default = "default_min_workers")]
    min_workers: usize,
    #[serde(default = "default_max_workers")]
    max_workers: usize,
}

fn default_monitor_interval_ms() -> u64 {
    30_000
}
fn default_watchdog_interval_ms() -> u64 {
    5_000
}
fn default_cache_ttl_ms() -> u64 {
    1_000
}
fn default_initial_workers() -> usize {
    4
}
fn default_min_workers() -> usize {
    1
}
fn default_max_workers() -> usize {
    16
}

impl From<RawConfig> for GovernorConfig {
    fn from(raw: RawConfig) -> Self {
        Self {
            monitor_interval_ms: raw.monitor_interval_ms,
            watchdog_interval_ms: raw.watchdog_interval_ms,
            cache_ttl_ms: raw.cache_ttl_ms,
            initial_workers: raw.initial_workers,
            min_workers: raw.min_workers,
            max_workers: raw.max_workers,
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
            initial_workers: default_initial_workers(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
        }
    }
}

impl GovernorConfig {
    /// Load from an explicit path, the default config location, or built-in
    /// defaults, then apply environment overrides.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut cfg = if let Some(path) = path {
            let raw = fs::read_to_string(path)?;
            GovernorConfig::from(toml::from_str::<RawConfig>(&raw)?)
        } else {
            let default_path = default_config_path();
            if default_path.exists() {
                let raw = fs::read_to_string(&default_path)?;
                GovernorConfig::from(toml::from_str::<RawConfig>(&raw)?)
            } else {
                Self::default()
            }
        };

        apply_env_override(&mut cfg.monitor_interval_ms, "LOADGUARD_MONITOR_INTERVAL_MS");
        apply_env_override(
            &mut cfg.watchdog_interval_ms,
            "LOADGUARD_WATCHDOG_INTERVAL_MS",
        );
        apply_env_override(&mut cfg.cache_ttl_ms, "LOADGUARD_CACHE_TTL_MS");
        apply_env_override(&mut cfg.initial_workers, "LOADGUARD_INITIAL_WORKERS");
        apply_env_override(&mut cfg.min_workers, "LOADGUARD_MIN_WORKERS");
        apply_env_override(&mut cfg.max_workers, "LOADGUARD_MAX_WORKERS");

        Ok(cfg)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

fn apply_env_override<T: std::str::FromStr>(slot: &mut T, key: &str) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse() {
            *slot = parsed;
        }
    }
}

fn default_config_path() -> PathBuf {
    ProjectDirs::from("", "", "loadguard")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("loadguard.toml"))
}
