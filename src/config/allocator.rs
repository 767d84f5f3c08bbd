//! Allocator and lab configuration structures.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::request::PRIORITY_MAX;
use crate::core::target::{is_valid_target_id, TargetProperties};

/// Prefix of the environment variables read by [`AllocatorConfig::from_env`].
pub const ENV_PREFIX: &str = "LAB_ALLOC_";

/// Allocator tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Root of all persisted state.
    pub state_path: PathBuf,
    /// Idle time after which an allocation is removed as `timedout`.
    pub max_idle_secs: u64,
    /// Lifetime of an active allocation; 0 disables.
    pub max_ttl_secs: u64,
    /// Idle time after which a free target is powered off; 0 disables.
    pub idle_power_off_secs: u64,
    /// Idle time after which a free target is fully powered off; 0 disables.
    pub idle_power_fully_off_secs: u64,
    /// How long an allocation handle stays cached.
    pub cache_ttl_secs: u64,
    /// Maximum cached allocation handles.
    pub cache_max_entries: usize,
    /// How long a client UUID may not be reused.
    pub uuid_max_age_secs: u64,
    /// Maximum remembered client UUIDs.
    pub uuid_max_entries: usize,
    /// Give up on a lock after this long.
    pub lock_timeout_ms: u64,
    /// Poll interval while waiting for a lock.
    pub lock_wait_ms: u64,
    /// Longest reason kept.
    pub reason_len_max: usize,
    /// Priority of requests that do not give one.
    pub default_priority: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("state"),
            max_idle_secs: 30,
            max_ttl_secs: 0,
            idle_power_off_secs: 30,
            idle_power_fully_off_secs: 0,
            cache_ttl_secs: 120,
            cache_max_entries: 256,
            uuid_max_age_secs: 2 * 24 * 60 * 60,
            uuid_max_entries: 30 * 2 * 24 * 60,
            lock_timeout_ms: 20_000,
            lock_wait_ms: 300,
            reason_len_max: 128,
            default_priority: 50,
        }
    }
}

impl AllocatorConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.state_path.as_os_str().is_empty() {
            return Err("state_path must not be empty".into());
        }
        if self.max_idle_secs == 0 {
            return Err("max_idle_secs must be greater than 0".into());
        }
        if self.lock_timeout_ms == 0 {
            return Err("lock_timeout_ms must be greater than 0".into());
        }
        if self.lock_wait_ms == 0 || self.lock_wait_ms > self.lock_timeout_ms {
            return Err("lock_wait_ms must be between 1 and lock_timeout_ms".into());
        }
        if self.cache_max_entries == 0 {
            return Err("cache_max_entries must be greater than 0".into());
        }
        if self.uuid_max_entries == 0 {
            return Err("uuid_max_entries must be greater than 0".into());
        }
        if i64::from(self.default_priority) > PRIORITY_MAX {
            return Err(format!("default_priority must be 0-{PRIORITY_MAX}"));
        }
        Ok(())
    }

    /// Defaults overridden by `LAB_ALLOC_*` variables (a `.env` file is
    /// loaded first if present), then validated.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`AllocatorConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut cfg = Self::default();
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        if let Some(path) = var("STATE_PATH") {
            cfg.state_path = PathBuf::from(path);
        }
        for (name, slot) in [
            ("MAX_IDLE_SECS", &mut cfg.max_idle_secs),
            ("MAX_TTL_SECS", &mut cfg.max_ttl_secs),
            ("IDLE_POWER_OFF_SECS", &mut cfg.idle_power_off_secs),
            ("IDLE_POWER_FULLY_OFF_SECS", &mut cfg.idle_power_fully_off_secs),
            ("CACHE_TTL_SECS", &mut cfg.cache_ttl_secs),
            ("UUID_MAX_AGE_SECS", &mut cfg.uuid_max_age_secs),
            ("LOCK_TIMEOUT_MS", &mut cfg.lock_timeout_ms),
            ("LOCK_WAIT_MS", &mut cfg.lock_wait_ms),
        ] {
            if let Some(raw) = var(name) {
                *slot = parse_var(name, &raw)?;
            }
        }
        for (name, slot) in [
            ("CACHE_MAX_ENTRIES", &mut cfg.cache_max_entries),
            ("UUID_MAX_ENTRIES", &mut cfg.uuid_max_entries),
            ("REASON_LEN_MAX", &mut cfg.reason_len_max),
        ] {
            if let Some(raw) = var(name) {
                *slot = parse_var(name, &raw)?;
            }
        }
        if let Some(raw) = var("DEFAULT_PRIORITY") {
            cfg.default_priority = parse_var("DEFAULT_PRIORITY", &raw)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Lock acquisition timeout.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Lock poll interval.
    #[must_use]
    pub const fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Allocation handle cache TTL.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Client UUID reuse window.
    #[must_use]
    pub const fn uuid_max_age(&self) -> Duration {
        Duration::from_secs(self.uuid_max_age_secs)
    }

    /// Directory holding allocation records.
    #[must_use]
    pub fn allocations_path(&self) -> PathBuf {
        self.state_path.join("allocations")
    }

    /// Directory holding target `id`'s state.
    #[must_use]
    pub fn target_path(&self, id: &str) -> PathBuf {
        self.state_path.join("targets").join(id)
    }

    /// Directory holding the client UUID record.
    #[must_use]
    pub fn uuid_db_path(&self) -> PathBuf {
        self.state_path.join("cache").join("allocid_uuid_db")
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| format!("{ENV_PREFIX}{name}: cannot parse {raw:?}: {e}"))
}

/// Per-target configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Never power this target off when idle.
    pub skip_cleanup: bool,
    /// Override for [`AllocatorConfig::idle_power_off_secs`].
    pub idle_power_off_secs: Option<u64>,
    /// Override for [`AllocatorConfig::idle_power_fully_off_secs`].
    pub idle_power_fully_off_secs: Option<u64>,
}

impl TargetConfig {
    /// Runtime properties for this target.
    #[must_use]
    pub const fn properties(&self) -> TargetProperties {
        TargetProperties {
            skip_cleanup: self.skip_cleanup,
            idle_power_off_secs: self.idle_power_off_secs,
            idle_power_fully_off_secs: self.idle_power_fully_off_secs,
        }
    }
}

/// Root lab configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabConfig {
    /// Allocator tunables.
    #[serde(default)]
    pub allocator: AllocatorConfig,
    /// Map of target name to configuration.
    pub targets: BTreeMap<String, TargetConfig>,
}

impl LabConfig {
    /// Validate the allocator settings and ensure at least one target exists.
    pub fn validate(&self) -> Result<(), String> {
        self.allocator
            .validate()
            .map_err(|e| format!("allocator invalid: {e}"))?;
        if self.targets.is_empty() {
            return Err("at least one target must be defined".into());
        }
        for name in self.targets.keys() {
            if !is_valid_target_id(name) {
                return Err(format!("target `{name}` has an invalid name"));
            }
        }
        Ok(())
    }

    /// Parse lab configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
