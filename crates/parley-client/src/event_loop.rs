//! The client's single owner context.
//!
//! The event loop runs in a dedicated tokio task and exclusively owns the
//! pending registry and the observer registrations. Everything else,
//! including transport tasks and server push forwarders, talks to it through
//! [`ClientCommand`]s over one unbounded channel, so state changes happen in
//! the order commands were issued.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use parley_net::UploadProgress;
use parley_shared::{ChannelEvent, ChatError, Message, RequestId};

use crate::channel::{merge_into, ChannelRegistry};
use crate::dispatcher::{ChannelObserver, EventDispatcher};
use crate::pending::{PendingEntry, PendingRegistry};
use crate::pipeline::FailedSend;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands sent *into* the event loop.
pub(crate) enum ClientCommand {
    Subscribe {
        id: String,
        observer: Arc<dyn ChannelObserver>,
    },
    Unsubscribe {
        id: String,
    },
    /// Register a freshly launched send and release its delivery task.
    Track(PendingEntry),
    Progress {
        request_id: RequestId,
        progress: UploadProgress,
    },
    /// The transport resolved a send.
    Settle {
        request_id: RequestId,
        outcome: Result<Message, ChatError>,
    },
    Cancel {
        request_id: RequestId,
    },
    /// Deliver an event to observers after applying its registry effects.
    Dispatch(ChannelEvent),
    PendingCount(oneshot::Sender<usize>),
    /// Answered once every earlier command has been handled.
    Flush(oneshot::Sender<()>),
    Shutdown,
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub(crate) struct EventLoop {
    pending: PendingRegistry,
    dispatcher: EventDispatcher,
    channels: Arc<ChannelRegistry>,
}

impl EventLoop {
    pub fn new(channels: Arc<ChannelRegistry>) -> Self {
        Self {
            pending: PendingRegistry::new(),
            dispatcher: EventDispatcher::new(),
            channels,
        }
    }

    pub fn spawn(self, commands: mpsc::UnboundedReceiver<ClientCommand>) -> JoinHandle<()> {
        tokio::spawn(self.run(commands))
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ClientCommand>) {
        info!("Client event loop started");

        while let Some(cmd) = commands.recv().await {
            if !self.handle(cmd) {
                break;
            }
        }

        let abandoned = self.pending.drain();
        let count = abandoned.len();
        for mut entry in abandoned {
            entry.abort();
            self.fail(entry, ChatError::transport("client shut down", true));
        }
        info!(abandoned = count, "Client event loop stopped");
    }

    /// Handle one command. Returns `false` when the loop should stop.
    pub fn handle(&mut self, cmd: ClientCommand) -> bool {
        match cmd {
            ClientCommand::Subscribe { id, observer } => {
                debug!(observer = %id, "Observer subscribed");
                self.dispatcher.subscribe(id, observer);
            }
            ClientCommand::Unsubscribe { id } => {
                if self.dispatcher.unsubscribe(&id) {
                    debug!(observer = %id, "Observer unsubscribed");
                }
            }
            ClientCommand::Track(mut entry) => {
                let request_id = entry.request_id.clone();
                let start = entry.start.take();
                match self.pending.insert(entry) {
                    Ok(()) => {
                        if let Some(start) = start {
                            let _ = start.send(());
                        }
                        debug!(request_id = %request_id, "Pending send registered");
                    }
                    Err(mut duplicate) => {
                        error!(request_id = %request_id, "Duplicate request ID refused");
                        drop(start);
                        duplicate.abort();
                        let error = ChatError::validation(format!("duplicate request ID {request_id}"));
                        let message = duplicate.message.clone().into_failed(error.clone());
                        duplicate.complete(Err(FailedSend { message, error }));
                    }
                }
            }
            ClientCommand::Progress {
                request_id,
                progress,
            } => {
                if let Some(entry) = self.pending.get_mut(&request_id) {
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| entry.report_progress(progress)));
                    if outcome.is_err() {
                        error!(request_id = %request_id, "Progress callback panicked, continuing");
                    }
                }
            }
            ClientCommand::Settle {
                request_id,
                outcome,
            } => self.settle(request_id, outcome),
            ClientCommand::Cancel { request_id } => match self.pending.remove(&request_id) {
                Some(mut entry) => {
                    entry.abort();
                    info!(request_id = %request_id, "Pending send cancelled");
                    self.fail(entry, ChatError::Cancelled);
                }
                None => debug!(request_id = %request_id, "Cancel after settlement ignored"),
            },
            ClientCommand::Dispatch(event) => self.dispatch(event),
            ClientCommand::PendingCount(reply) => {
                let _ = reply.send(self.pending.len());
            }
            ClientCommand::Flush(reply) => {
                let _ = reply.send(());
            }
            ClientCommand::Shutdown => {
                info!("Client event loop shutting down");
                return false;
            }
        }
        true
    }

    fn settle(&mut self, request_id: RequestId, outcome: Result<Message, ChatError>) {
        let Some(entry) = self.pending.remove(&request_id) else {
            debug!(request_id = %request_id, "Settlement for unknown request ignored");
            return;
        };

        match outcome {
            Ok(accepted) => {
                let confirmed = entry.message.confirm_with(accepted);
                info!(
                    request_id = %request_id,
                    channel = %confirmed.channel_url,
                    message_id = ?confirmed.message_id,
                    "Send confirmed"
                );
                entry.complete(Ok(confirmed.clone()));
                self.dispatch(ChannelEvent::MessageSent { message: confirmed });
            }
            Err(error) => {
                warn!(request_id = %request_id, error = %error, "Send failed");
                self.fail(entry, error);
            }
        }
    }

    fn fail(&self, entry: PendingEntry, error: ChatError) {
        let failed = entry.message.clone().into_failed(error.clone());
        entry.complete(Err(FailedSend {
            message: failed.clone(),
            error,
        }));
        self.dispatch(ChannelEvent::MessageFailed { message: failed });
    }

    fn dispatch(&self, event: ChannelEvent) {
        self.apply_registry_effects(&event);
        self.dispatcher.dispatch(&event);
    }

    fn apply_registry_effects(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::ChannelChanged { channel } => {
                self.channels.upsert(channel.clone());
            }
            ChannelEvent::ChannelDeleted { channel_url, .. } => {
                self.channels.evict(channel_url);
            }
            ChannelEvent::MetaDataChanged {
                channel_url,
                upserted,
                removed,
            } => {
                if let Some(channel) = self.channels.get(channel_url) {
                    merge_into(channel.meta_data_cache(), upserted, removed);
                }
            }
            ChannelEvent::MetaCountersChanged {
                channel_url,
                upserted,
                removed,
            } => {
                if let Some(channel) = self.channels.get(channel_url) {
                    merge_into(channel.meta_counters_cache(), upserted, removed);
                }
            }
            ChannelEvent::FrozenChanged {
                channel_url,
                frozen,
            } => {
                if let Some(channel) = self.channels.get(channel_url) {
                    channel.set_frozen(*frozen);
                }
            }
            _ => {}
        }
    }
}
