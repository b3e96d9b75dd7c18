//! # parley-core
//!
//! Client-side reconciliation of an asynchronously delivered, causally
//! linked message feed. The [`Engine`] deduplicates and orders messages by
//! their declared dependencies, classifies conversations, schedules
//! deletions, indexes tags and tracks time-windowed discourse
//! subscriptions. The room transport and the metadata record store are
//! supplied by the embedding application through the [`Transport`] and
//! [`RecordStore`] traits.

pub mod classifier;
pub mod config;
pub mod contacts;
pub mod context;
pub mod deletion;
pub mod discourse;
pub mod engine;
pub mod events;
pub mod records;
pub mod resolver;
pub mod runtime;
pub mod store;
pub mod tagging;
pub mod timer;
pub mod transport;

mod error;

pub use classifier::{Classifier, ContextType, Transition};
pub use config::EngineConfig;
pub use contacts::{Contact, ContactRegistry};
pub use context::{Context, FileEntry, Invitation};
pub use engine::{Engine, TimerEvent};
pub use error::{CoreError, RecordError, Result, TransportError};
pub use events::{MessageChange, Notification};
pub use records::{context_label, ContextRecord, NullRecordStore, RecordStore};
pub use runtime::{pump_discourse, spawn_engine, EngineCommand};
pub use store::{DeliveryState, Grave, MessageStore, StoredMessage};
pub use timer::{TimerHandle, TimerQueue};
pub use transport::Transport;
