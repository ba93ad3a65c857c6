use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_SENSOR_RETRY_ATTEMPTS: &str = "SENSOR_RETRY_ATTEMPTS";
pub const ENV_SENSOR_RETRY_INTERVAL_MS: &str = "SENSOR_RETRY_INTERVAL_MS";
pub const ENV_SLEEP_DEADLINE_MS: &str = "SLEEP_DEADLINE_MS";
pub const ENV_DEEP_SLEEP_MS: &str = "DEEP_SLEEP_MS";

/// Timings of one boot-to-sleep session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub sensor_retry_attempts: u32,
    pub sensor_retry_interval_ms: u64,
    pub sleep_deadline_ms: u64,
    pub deep_sleep_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sensor_retry_attempts: 5,
            sensor_retry_interval_ms: 1_000,
            sleep_deadline_ms: 15_000,
            deep_sleep_ms: 900_000,
        }
    }
}

impl LifecycleConfig {
    /// Time from arming until the last sensor attempt fires.
    pub fn retry_window_ms(&self) -> u64 {
        u64::from(self.sensor_retry_attempts).saturating_mul(self.sensor_retry_interval_ms)
    }

    /// Replaces timings for which `lookup` returns a value, then validates the
    /// result. Keys are the `ENV_*` constants of this module.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(attempts) = parse_override(&lookup, ENV_SENSOR_RETRY_ATTEMPTS)? {
            self.sensor_retry_attempts = attempts;
        }
        if let Some(interval) = parse_override(&lookup, ENV_SENSOR_RETRY_INTERVAL_MS)? {
            self.sensor_retry_interval_ms = interval;
        }
        if let Some(deadline) = parse_override(&lookup, ENV_SLEEP_DEADLINE_MS)? {
            self.sleep_deadline_ms = deadline;
        }
        if let Some(sleep) = parse_override(&lookup, ENV_DEEP_SLEEP_MS)? {
            self.deep_sleep_ms = sleep;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensor_retry_attempts == 0 {
            return Err(ConfigError::NoRetryAttempts);
        }
        if self.sensor_retry_interval_ms == 0 {
            return Err(ConfigError::ZeroRetryInterval);
        }
        if self.deep_sleep_ms == 0 {
            return Err(ConfigError::ZeroDeepSleep);
        }

        let retry_window_ms = self.retry_window_ms();
        if self.sleep_deadline_ms <= retry_window_ms {
            return Err(ConfigError::SleepBeforeRetryWindow {
                sleep_deadline_ms: self.sleep_deadline_ms,
                retry_window_ms,
            });
        }

        Ok(())
    }
}

fn parse_override<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };

    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidOverride { key, value })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub update_server: String,
    pub firmware_version: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.178.28".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            update_server: "192.168.178.28:9042".to_string(),
            firmware_version: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub lifecycle: LifecycleConfig,
    pub network: NetworkConfig,
}
