//! JSON-lines transcripts of transport events.
//!
//! One event per line. Blank lines and lines starting with `#` are skipped.
//!
//! ```text
//! {"op":"members","at":"2024-01-01T00:00:00Z","context":"ab..","members":[{"id":1,"key":"01.."}]}
//! {"op":"deliver","at":"2024-01-01T00:00:01Z","delivery":{...}}
//! {"op":"missing","at":"2024-01-01T00:00:02Z","context":"ab..","id":"cd.."}
//! {"op":"advance","at":"2024-01-01T00:01:00Z"}
//! ```

use std::io::BufRead;
use std::path::Path;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::{ContextKey, Delivery, Member, MessageId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptEvent {
    /// The transport delivered a message.
    Deliver { at: DateTime<Utc>, delivery: Delivery },
    /// Current room membership; triggers reclassification.
    Members {
        at: DateTime<Utc>,
        context: ContextKey,
        members: Vec<Member>,
    },
    /// The transport gave up on a message.
    Missing {
        at: DateTime<Utc>,
        context: ContextKey,
        id: MessageId,
    },
    /// Only move the clock.
    Advance { at: DateTime<Utc> },
}

impl ScriptEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Deliver { at, .. }
            | Self::Members { at, .. }
            | Self::Missing { at, .. }
            | Self::Advance { at } => *at,
        }
    }
}

/// Parse every event of a transcript.
pub fn read_script<R: BufRead>(reader: R) -> anyhow::Result<Vec<ScriptEvent>> {
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading line {}", index + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(trimmed)
            .with_context(|| format!("parsing line {}", index + 1))?;
        events.push(event);
    }
    Ok(events)
}

pub fn load_script(path: &Path) -> anyhow::Result<Vec<ScriptEvent>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    read_script(std::io::BufReader::new(file))
}
