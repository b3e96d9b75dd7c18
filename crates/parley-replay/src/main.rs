//! # parley-replay
//!
//! Feeds a recorded transcript of transport events through the
//! reconciliation core and prints every notification it raises as a JSON
//! line on stdout.
//!
//! ```text
//! parley-replay [TRANSCRIPT]      # reads stdin when omitted or "-"
//! ```

mod config;
mod replay;
mod script;

use std::io::Write;
use std::path::Path;

use anyhow::Context as _;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_shared::constants::APP_NAME;

use crate::config::ReplayConfig;
use crate::replay::Replay;

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_core=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting {} replay v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let config = ReplayConfig::from_env().context("loading configuration")?;
    info!(?config, "Loaded configuration");

    let source = std::env::args().nth(1);
    let events = match source.as_deref() {
        None | Some("-") => script::read_script(std::io::stdin().lock())?,
        Some(path) => script::load_script(Path::new(path))?,
    };
    info!(events = events.len(), "Loaded transcript");

    let mut replay = Replay::new(&config);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for event in events {
        for note in replay.apply(event) {
            if config.pretty {
                serde_json::to_writer_pretty(&mut out, &note)?;
            } else {
                serde_json::to_writer(&mut out, &note)?;
            }
            writeln!(out).context("writing notification")?;
        }
    }
    out.flush()?;

    info!(contexts = replay.engine().context_keys().len(), "Transcript applied");
    replay.summarize();
    Ok(())
}
