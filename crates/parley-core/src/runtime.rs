//! Async driver with the tokio mpsc command/notification pattern.
//!
//! The engine runs in a dedicated tokio task. Callers talk to it through a
//! typed command channel and receive [`Notification`]s on a second channel.
//! The task sleeps until the next timer deadline when idle, so deletion,
//! expiry and renewal timers fire without any caller involvement.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_shared::constants::MAX_TALK_CHUNK;
use parley_shared::{ContextKey, Delivery, DiscourseId, MemberId, MessageId};

use crate::engine::Engine;
use crate::error::{CoreError, Result, TransportError};
use crate::events::Notification;
use crate::records::RecordStore;
use crate::transport::Transport;

/// Longest single sleep; deadlines further out are re-evaluated.
const MAX_IDLE: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Command type
// ---------------------------------------------------------------------------

/// Commands sent *into* the engine task.
#[derive(Debug)]
pub enum EngineCommand {
    /// The transport delivered a message.
    Deliver(Delivery),
    /// Room membership changed; enumerate and reclassify.
    MembershipChanged(ContextKey),
    /// The transport gave up on a message.
    Missing { context: ContextKey, id: MessageId },
    TagMessage {
        context: ContextKey,
        target: MessageId,
        tag: Option<String>,
    },
    UntagMessage {
        context: ContextKey,
        target: MessageId,
        tag: Option<String>,
    },
    BlockContact {
        member: MemberId,
        context: Option<ContextKey>,
    },
    UnblockContact {
        member: MemberId,
        context: Option<ContextKey>,
    },
    OpenDiscourse {
        context: ContextKey,
        discourse: DiscourseId,
        window: Option<Duration>,
    },
    CloseDiscourse {
        context: ContextKey,
        discourse: DiscourseId,
    },
    WriteDiscourse {
        context: ContextKey,
        discourse: DiscourseId,
        data: Bytes,
    },
    SetName {
        context: ContextKey,
        name: Option<String>,
    },
    SetTopic {
        context: ContextKey,
        topic: Option<String>,
    },
    LeaveContext(ContextKey),
    /// Snapshot of the dependency table of a context.
    PendingDependencies {
        context: ContextKey,
        reply: oneshot::Sender<Vec<(MessageId, usize)>>,
    },
    /// Stop the task and hand the engine back through the join handle.
    Shutdown,
}

/// Spawn `engine` in a background tokio task.
///
/// Returns `(command_tx, notification_rx, handle)`. The handle resolves to
/// the engine once the task stops.
pub fn spawn_engine<T, S>(
    mut engine: Engine<T, S>,
) -> (
    mpsc::Sender<EngineCommand>,
    mpsc::Receiver<Notification>,
    JoinHandle<Engine<T, S>>,
)
where
    T: Transport + 'static,
    S: RecordStore + 'static,
{
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<EngineCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<Notification>(256);

    let handle = tokio::spawn(async move {
        loop {
            let deadline = engine.next_deadline();
            let sleep = async move {
                match deadline {
                    Some(at) => {
                        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        tokio::time::sleep(wait.min(MAX_IDLE)).await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(EngineCommand::Shutdown) => {
                            info!("Engine shutdown requested");
                            break;
                        }
                        Some(cmd) => {
                            if let Err(e) = handle_command(&mut engine, cmd) {
                                warn!(error = %e, "Engine command failed");
                                let _ = notif_tx
                                    .send(Notification::Warning {
                                        context: None,
                                        message: e.to_string(),
                                    })
                                    .await;
                            }
                        }
                        None => {
                            info!("Command channel closed, stopping engine");
                            break;
                        }
                    }
                }

                _ = sleep => {
                    let fired = engine.fire_timers(Utc::now());
                    if fired > 0 {
                        debug!(fired, "Timers fired");
                    }
                }
            }

            for notification in engine.drain_notifications() {
                if notif_tx.send(notification).await.is_err() {
                    debug!("Notification receiver dropped");
                    break;
                }
            }
        }
        engine
    });

    (cmd_tx, notif_rx, handle)
}

fn handle_command<T: Transport, S: RecordStore>(engine: &mut Engine<T, S>, cmd: EngineCommand) -> Result<()> {
    let now = Utc::now();
    match cmd {
        EngineCommand::Deliver(delivery) => engine.deliver(delivery, now),
        EngineCommand::MembershipChanged(context) => engine.on_membership_changed(context).map(|_| ()),
        EngineCommand::Missing { context, id } => engine.resolve_missing(context, id, now).map(|_| ()),
        EngineCommand::TagMessage {
            context,
            target,
            tag,
        } => engine.tag_message(context, target, tag.as_deref()),
        EngineCommand::UntagMessage {
            context,
            target,
            tag,
        } => engine.untag_message(context, target, tag.as_deref()),
        EngineCommand::BlockContact { member, context } => engine.block_contact(member, context),
        EngineCommand::UnblockContact { member, context } => engine.unblock_contact(member, context),
        EngineCommand::OpenDiscourse {
            context,
            discourse,
            window,
        } => engine.open_discourse(context, discourse, window),
        EngineCommand::CloseDiscourse { context, discourse } => engine.close_discourse(context, discourse),
        EngineCommand::WriteDiscourse {
            context,
            discourse,
            data,
        } => engine.write_discourse(context, discourse, &data).map(|_| ()),
        EngineCommand::SetName { context, name } => engine.set_context_name(context, name),
        EngineCommand::SetTopic { context, topic } => engine.set_context_topic(context, topic),
        EngineCommand::LeaveContext(context) => {
            engine.leave_context(&context);
            Ok(())
        }
        EngineCommand::PendingDependencies { context, reply } => {
            let _ = reply.send(engine.pending_dependencies(&context));
            Ok(())
        }
        EngineCommand::Shutdown => Ok(()),
    }
}

/// Forward everything readable from `reader` to a discourse.
///
/// Each read is handed to the engine as one write as soon as it completes,
/// so the engine task never waits on the reader. Returns the number of
/// bytes forwarded once the reader reaches end of stream.
pub async fn pump_discourse<R>(
    mut reader: R,
    commands: &mpsc::Sender<EngineCommand>,
    context: ContextKey,
    discourse: DiscourseId,
    chunk: usize,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk.clamp(1, MAX_TALK_CHUNK)];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        commands
            .send(EngineCommand::WriteDiscourse {
                context,
                discourse,
                data: Bytes::copy_from_slice(&buf[..n]),
            })
            .await
            .map_err(|_| CoreError::Transport(TransportError::Closed))?;
        total += n as u64;
    }

    debug!(discourse = %discourse.short(), total, "Discourse input drained");
    Ok(total)
}
