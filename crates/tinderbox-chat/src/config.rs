use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ChatError;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Prekey lifecycle configuration, loaded from TOML with `TINDERBOX_*`
/// environment variable overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// One-time keys kept published. Default: 100
    pub desired_one_time_keys: usize,
    /// Age at which the current long-term key is replaced. Default: 5 days
    pub long_term_key_ttl_secs: u64,
    /// Grace period for an outdated long-term key. Default: 1 day
    pub outdated_long_term_key_ttl_secs: u64,
    /// Grace period for a consumed one-time key. Default: 1 day
    pub orphaned_one_time_key_ttl_secs: u64,
    /// Debounce before uploading replacement one-time keys. Default: 5000
    pub replenish_debounce_ms: u64,
    /// Period of the background rotation loop. Default: 1 hour
    pub rotation_interval_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            desired_one_time_keys: 100,
            long_term_key_ttl_secs: 5 * DAY_SECS,
            outdated_long_term_key_ttl_secs: DAY_SECS,
            orphaned_one_time_key_ttl_secs: DAY_SECS,
            replenish_debounce_ms: 5_000,
            rotation_interval_secs: 60 * 60,
        }
    }
}

impl ChatConfig {
    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ChatError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Parse a TOML string, then apply environment overrides.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ChatError> {
        let mut config: Self =
            toml::from_str(toml_str).map_err(|e| ChatError::InvalidConfig(e.to_string()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ChatError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ChatError> {
        override_field(&lookup, "TINDERBOX_DESIRED_ONE_TIME_KEYS", &mut self.desired_one_time_keys)?;
        override_field(&lookup, "TINDERBOX_LONG_TERM_KEY_TTL_SECS", &mut self.long_term_key_ttl_secs)?;
        override_field(
            &lookup,
            "TINDERBOX_OUTDATED_LONG_TERM_KEY_TTL_SECS",
            &mut self.outdated_long_term_key_ttl_secs,
        )?;
        override_field(
            &lookup,
            "TINDERBOX_ORPHANED_ONE_TIME_KEY_TTL_SECS",
            &mut self.orphaned_one_time_key_ttl_secs,
        )?;
        override_field(&lookup, "TINDERBOX_REPLENISH_DEBOUNCE_MS", &mut self.replenish_debounce_ms)?;
        override_field(&lookup, "TINDERBOX_ROTATION_INTERVAL_SECS", &mut self.rotation_interval_secs)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.desired_one_time_keys == 0 {
            return Err(ChatError::InvalidConfig(
                "desired_one_time_keys must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("long_term_key_ttl_secs", self.long_term_key_ttl_secs),
            ("outdated_long_term_key_ttl_secs", self.outdated_long_term_key_ttl_secs),
            ("orphaned_one_time_key_ttl_secs", self.orphaned_one_time_key_ttl_secs),
            ("rotation_interval_secs", self.rotation_interval_secs),
        ] {
            if value == 0 {
                return Err(ChatError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    pub fn long_term_key_ttl(&self) -> Duration {
        Duration::from_secs(self.long_term_key_ttl_secs)
    }

    pub fn outdated_long_term_key_ttl(&self) -> Duration {
        Duration::from_secs(self.outdated_long_term_key_ttl_secs)
    }

    pub fn orphaned_one_time_key_ttl(&self) -> Duration {
        Duration::from_secs(self.orphaned_one_time_key_ttl_secs)
    }

    pub fn replenish_debounce(&self) -> Duration {
        Duration::from_millis(self.replenish_debounce_ms)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }
}

fn override_field<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    field: &mut T,
) -> Result<(), ChatError> {
    if let Some(val) = lookup(name) {
        *field = val
            .trim()
            .parse()
            .map_err(|_| ChatError::InvalidConfig(format!("invalid {name} value: {val}")))?;
    }
    Ok(())
}
