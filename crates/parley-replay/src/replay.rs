//! Drives an [`Engine`] from a recorded transcript with a scripted clock.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use parley_core::{Engine, Notification, RecordError, RecordStore, Transport, TransportError};
use parley_shared::{ContextKey, Member, MessageBody, MessageId};

use crate::config::ReplayConfig;
use crate::script::ScriptEvent;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Transport backed by the transcript: membership comes from `members`
/// events, requests and sends are only recorded.
#[derive(Debug, Default)]
pub struct ScriptTransport {
    members: HashMap<ContextKey, Vec<Member>>,
    pub requested: Vec<(ContextKey, MessageId)>,
    pub sent: Vec<(ContextKey, MessageBody)>,
}

impl ScriptTransport {
    pub fn set_members(&mut self, context: ContextKey, members: Vec<Member>) {
        self.members.insert(context, members);
    }
}

impl Transport for ScriptTransport {
    fn request_message(&mut self, context: &ContextKey, id: &MessageId) -> Result<(), TransportError> {
        debug!(context = %context.short(), id = %id.short(), "Requested missing message");
        self.requested.push((*context, *id));
        Ok(())
    }

    fn enumerate_members(&mut self, context: &ContextKey) -> Result<Vec<Member>, TransportError> {
        Ok(self.members.get(context).cloned().unwrap_or_default())
    }

    fn send_message(&mut self, context: &ContextKey, body: MessageBody) -> Result<(), TransportError> {
        debug!(context = %context.short(), kind = %body.kind(), "Outgoing message");
        self.sent.push((*context, body));
        Ok(())
    }
}

/// Record store kept in memory so the final state can be reported.
#[derive(Debug, Default)]
pub struct MemoryRecords {
    pub records: BTreeMap<String, Vec<u8>>,
}

impl RecordStore for MemoryRecords {
    fn publish(&mut self, label: &str, payload: &[u8]) -> Result<(), RecordError> {
        debug!(label, bytes = payload.len(), "Published record");
        self.records.insert(label.to_string(), payload.to_vec());
        Ok(())
    }

    fn retract(&mut self, label: &str) -> Result<(), RecordError> {
        debug!(label, "Retracted record");
        self.records.remove(label);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub events: usize,
    pub rejected: usize,
    pub timers_fired: usize,
}

pub struct Replay {
    engine: Engine<ScriptTransport, MemoryRecords>,
    flush_timers: bool,
    clock: Option<DateTime<Utc>>,
    stats: ReplayStats,
}

impl Replay {
    pub fn new(config: &ReplayConfig) -> Self {
        Self {
            engine: Engine::new(
                config.engine.clone(),
                ScriptTransport::default(),
                MemoryRecords::default(),
            ),
            flush_timers: config.flush_timers,
            clock: None,
            stats: ReplayStats::default(),
        }
    }

    pub fn engine(&self) -> &Engine<ScriptTransport, MemoryRecords> {
        &self.engine
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// Apply one event and return the notifications it produced.
    pub fn apply(&mut self, event: ScriptEvent) -> Vec<Notification> {
        self.stats.events += 1;
        let now = self.advance(event.at());

        match event {
            ScriptEvent::Deliver { delivery, .. } => {
                let id = delivery.id;
                if let Err(e) = self.engine.deliver(delivery, now) {
                    warn!(id = %id.short(), "Delivery rejected: {}", e);
                    self.stats.rejected += 1;
                }
            }
            ScriptEvent::Members {
                context, members, ..
            } => {
                self.engine.transport_mut().set_members(context, members);
                if let Err(e) = self.engine.on_membership_changed(context) {
                    warn!(context = %context.short(), "Reclassification failed: {}", e);
                }
            }
            ScriptEvent::Missing { context, id, .. } => {
                match self.engine.resolve_missing(context, id, now) {
                    Ok(released) => debug!(id = %id.short(), released, "Marked message missing"),
                    Err(e) => warn!(id = %id.short(), "Could not resolve missing message: {}", e),
                }
            }
            ScriptEvent::Advance { .. } => {}
        }

        self.engine.drain_notifications()
    }

    /// Move the clock forward and fire whatever fell due. The clock never
    /// runs backwards; out-of-order timestamps are applied at the current
    /// time.
    fn advance(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let now = match self.clock {
            Some(clock) if at < clock => {
                warn!(%at, %clock, "Event timestamp went backwards");
                clock
            }
            _ => at,
        };
        self.clock = Some(now);

        if self.flush_timers {
            let fired = self.engine.fire_timers(now);
            if fired > 0 {
                debug!(fired, %now, "Fired timers");
            }
            self.stats.timers_fired += fired;
        }
        now
    }

    /// Log the final state of every context.
    pub fn summarize(&self) {
        for key in self.engine.context_keys() {
            let Some(context) = self.engine.context(&key) else {
                continue;
            };
            info!(
                context = %key.short(),
                kind = ?context.kind(),
                messages = context.store().len(),
                pending = self.engine.pending_dependencies(&key).len(),
                "Context state"
            );
        }
        info!(
            events = self.stats.events,
            rejected = self.stats.rejected,
            timers_fired = self.stats.timers_fired,
            records = self.engine.records().records.len(),
            requested = self.engine.transport().requested.len(),
            sent = self.engine.transport().sent.len(),
            "Replay finished"
        );
    }
}
