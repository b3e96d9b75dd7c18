//! Replay configuration loaded from environment variables.

use parley_core::{CoreError, EngineConfig};

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Engine settings (`PARLEY_*` variables).
    pub engine: EngineConfig,

    /// Pretty-print notifications instead of one JSON object per line.
    /// Env: `PARLEY_REPLAY_PRETTY` (true/false)
    /// Default: `false`
    pub pretty: bool,

    /// Fire due timers whenever the script clock moves forward.
    /// Env: `PARLEY_REPLAY_FLUSH_TIMERS` (true/false)
    /// Default: `true`
    pub flush_timers: bool,
}

impl ReplayConfig {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            pretty: false,
            flush_timers: true,
        }
    }

    /// Fails when the engine settings are unusable, e.g. `PARLEY_SELF_KEY`
    /// is missing.
    pub fn from_env() -> Result<Self, CoreError> {
        let mut config = Self::new(EngineConfig::from_env()?);

        if let Some(pretty) = flag("PARLEY_REPLAY_PRETTY") {
            config.pretty = pretty;
        }
        if let Some(flush) = flag("PARLEY_REPLAY_FLUSH_TIMERS") {
            config.flush_timers = flush;
        }

        Ok(config)
    }
}

fn flag(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    match parse_bool(&val) {
        Some(b) => Some(b),
        None => {
            tracing::warn!(var = name, value = %val, "Invalid boolean, using default");
            None
        }
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
