//! Engine configuration loaded from environment variables.
//!
//! Our own public key is required; every other setting has a default.

use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_DISCOURSE_WINDOW_SECS, DEFAULT_KEEP_ALIVE_MARGIN_SECS, DEFAULT_TALK_CHUNK,
    MAX_TALK_CHUNK,
};
use parley_shared::PublicKey;

use crate::error::{CoreError, Result};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Our own public identity, used to tell ourselves apart from others
    /// when classifying contexts.
    /// Env: `PARLEY_SELF_KEY` (64 hex chars, required)
    pub self_key: PublicKey,

    /// Window used by `open_discourse` when none is given.
    /// Env: `PARLEY_DISCOURSE_WINDOW_SECS`
    /// Default: `10`
    pub discourse_window: Duration,

    /// How long before expiry a kept-alive subscription is renewed.
    /// Env: `PARLEY_KEEP_ALIVE_MARGIN_SECS`
    /// Default: `2`
    pub keep_alive_margin: Duration,

    /// Largest talk payload produced when splitting outbound data.
    /// Env: `PARLEY_TALK_CHUNK`
    /// Default: `4096`, capped at `MAX_TALK_CHUNK`.
    pub talk_chunk_size: usize,
}

impl EngineConfig {
    /// Configuration for the identity `self_key` with default settings.
    pub fn new(self_key: PublicKey) -> Self {
        Self {
            self_key,
            discourse_window: Duration::from_secs(DEFAULT_DISCOURSE_WINDOW_SECS),
            keep_alive_margin: Duration::from_secs(DEFAULT_KEEP_ALIVE_MARGIN_SECS),
            talk_chunk_size: DEFAULT_TALK_CHUNK,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Fails when `PARLEY_SELF_KEY` is unset or not a valid key; invalid
    /// optional settings fall back to their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let hex = lookup("PARLEY_SELF_KEY")
            .ok_or_else(|| CoreError::Config("PARLEY_SELF_KEY is not set".into()))?;
        let self_key = PublicKey::from_hex(hex.trim())
            .map_err(|e| CoreError::Config(format!("PARLEY_SELF_KEY: {e}")))?;
        let mut config = Self::new(self_key);

        if let Some(val) = lookup("PARLEY_DISCOURSE_WINDOW_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.discourse_window = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid PARLEY_DISCOURSE_WINDOW_SECS, using default"),
            }
        }

        if let Some(val) = lookup("PARLEY_KEEP_ALIVE_MARGIN_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.keep_alive_margin = Duration::from_secs(secs),
                Err(_) => tracing::warn!(value = %val, "Invalid PARLEY_KEEP_ALIVE_MARGIN_SECS, using default"),
            }
        }

        if let Some(val) = lookup("PARLEY_TALK_CHUNK") {
            match val.parse::<usize>() {
                Ok(size) if size > 0 => config.talk_chunk_size = size.min(MAX_TALK_CHUNK),
                _ => tracing::warn!(value = %val, "Invalid PARLEY_TALK_CHUNK, using default"),
            }
        }

        Ok(config)
    }

    /// Delay after which a subscription with `window` is renewed.
    pub fn renewal_delay(&self, window: Duration) -> Duration {
        window.saturating_sub(self.keep_alive_margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_new_config_defaults() {
        let config = EngineConfig::new(PublicKey([3; 32]));
        assert_eq!(config.self_key, PublicKey([3; 32]));
        assert_eq!(config.discourse_window, Duration::from_secs(10));
        assert_eq!(config.talk_chunk_size, DEFAULT_TALK_CHUNK);
    }

    #[test]
    fn test_values_from_env() {
        let hex = "ab".repeat(32);
        let config = EngineConfig::from_lookup(lookup(&[
            ("PARLEY_SELF_KEY", hex.as_str()),
            ("PARLEY_DISCOURSE_WINDOW_SECS", "30"),
            ("PARLEY_KEEP_ALIVE_MARGIN_SECS", "5"),
            ("PARLEY_TALK_CHUNK", "999999999"),
        ]))
        .unwrap();
        assert_eq!(config.self_key, PublicKey([0xab; 32]));
        assert_eq!(config.discourse_window, Duration::from_secs(30));
        assert_eq!(config.keep_alive_margin, Duration::from_secs(5));
        assert_eq!(config.talk_chunk_size, MAX_TALK_CHUNK);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let hex = "01".repeat(32);
        let config = EngineConfig::from_lookup(lookup(&[
            ("PARLEY_SELF_KEY", hex.as_str()),
            ("PARLEY_DISCOURSE_WINDOW_SECS", "0"),
            ("PARLEY_TALK_CHUNK", "lots"),
        ]))
        .unwrap();
        assert_eq!(config.discourse_window, Duration::from_secs(10));
        assert_eq!(config.talk_chunk_size, DEFAULT_TALK_CHUNK);
    }

    #[test]
    fn test_self_key_is_required() {
        let missing = EngineConfig::from_lookup(lookup(&[("PARLEY_TALK_CHUNK", "512")]));
        assert!(matches!(missing, Err(CoreError::Config(_))));

        let invalid = EngineConfig::from_lookup(lookup(&[("PARLEY_SELF_KEY", "xyz")]));
        assert!(matches!(invalid, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_renewal_delay() {
        let config = EngineConfig::new(PublicKey([0; 32]));
        assert_eq!(config.renewal_delay(Duration::from_secs(10)), Duration::from_secs(8));
        assert_eq!(config.renewal_delay(Duration::from_secs(1)), Duration::ZERO);
    }
}
