//! Process-wide defaults, read once at startup from the environment the way
//! a small service reads its boot configuration, layered underneath the
//! per-instance [`Settings`] that the store persists.

use std::time::Duration;

use crate::model::Settings;

#[derive(Debug, Clone)]
pub struct Defaults {
    pub grace_period_minutes: u64,
    pub scan_interval_hours: u64,
    pub max_jitter: Duration,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            grace_period_minutes: 60,
            scan_interval_hours: 24,
            max_jitter: Duration::from_secs(30),
        }
    }
}

impl Defaults {
    /// Read overrides from the environment, falling back to the built-in
    /// default for any variable that is unset or fails to parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            grace_period_minutes: env_u64(
                "ORPHAN_SCAN_GRACE_PERIOD_MINUTES",
                defaults.grace_period_minutes,
            ),
            scan_interval_hours: env_u64(
                "ORPHAN_SCAN_INTERVAL_HOURS",
                defaults.scan_interval_hours,
            ),
            max_jitter: Duration::from_secs(env_u64(
                "ORPHAN_SCAN_MAX_JITTER_SECONDS",
                defaults.max_jitter.as_secs(),
            )),
        }
    }

    /// Apply these defaults to a freshly-created instance's settings, i.e.
    /// one the store has never seen before and returned its hardcoded
    /// fallback for.
    pub fn seed_settings(&self) -> Settings {
        Settings {
            grace_period_minutes: self.grace_period_minutes,
            scan_interval_hours: self.scan_interval_hours,
            ..Settings::default()
        }
    }
}

fn env_u64(name: &str, fallback: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}
