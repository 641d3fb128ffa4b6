//! The public client facade and per-channel handles.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use parley_net::{LoopbackTransport, SessionProvider, Transport, Uploader};
use parley_shared::{ChannelEvent, ChannelUrl, ChatError, Message, Request, Response, Sender};

use crate::channel::{Channel, ChannelRegistry};
use crate::config::ClientConfig;
use crate::deletion;
use crate::dispatcher::ChannelObserver;
use crate::event_loop::{ClientCommand, EventLoop};
use crate::metadata::MetaStore;
use crate::pending::RequestIdGenerator;
use crate::pipeline::{self, FileMessageParams, SendHandle, TextMessageParams};
use crate::query::{HistoryCursor, MessageListQuery};

/// The collaborators the client consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub uploader: Arc<dyn Uploader>,
    pub session: Arc<dyn SessionProvider>,
}

impl Collaborators {
    pub fn new(
        transport: Arc<dyn Transport>,
        uploader: Arc<dyn Uploader>,
        session: Arc<dyn SessionProvider>,
    ) -> Self {
        Self {
            transport,
            uploader,
            session,
        }
    }

    /// Use one loopback connection for all three roles.
    pub fn from_loopback(connection: LoopbackTransport) -> Self {
        let connection = Arc::new(connection);
        Self {
            transport: connection.clone(),
            uploader: connection.clone(),
            session: connection,
        }
    }
}

pub(crate) struct ClientInner {
    pub config: ClientConfig,
    pub transport: Arc<dyn Transport>,
    pub uploader: Arc<dyn Uploader>,
    pub session: Arc<dyn SessionProvider>,
    pub channels: Arc<ChannelRegistry>,
    pub ids: RequestIdGenerator,
    pub commands: mpsc::UnboundedSender<ClientCommand>,
    watched: Mutex<HashSet<ChannelUrl>>,
}

impl ClientInner {
    /// Submit `request`, bounded by the configured timeout.
    pub async fn round_trip(&self, request: Request) -> Result<Response, ChatError> {
        let operation = request.operation();
        let timeout = self.config.request_timeout;
        let started = Instant::now();

        match tokio::time::timeout(timeout, self.transport.submit(request)).await {
            Ok(Ok(response)) => {
                debug!(
                    operation,
                    response = response.kind(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Round trip complete"
                );
                Ok(response)
            }
            Ok(Err(e)) => {
                debug!(operation, error = %e, "Round trip failed");
                Err(e)
            }
            Err(_) => {
                warn!(operation, timeout_ms = timeout.as_millis() as u64, "Round trip timed out");
                Err(ChatError::transport(
                    format!("{operation} timed out after {}ms", timeout.as_millis()),
                    true,
                ))
            }
        }
    }

    /// Hand a command to the event loop. Returns `false` if the loop is gone.
    pub fn command(&self, cmd: ClientCommand) -> bool {
        if self.commands.send(cmd).is_err() {
            warn!("Client event loop has stopped, command dropped");
            return false;
        }
        true
    }
}

pub(crate) fn unexpected_response(expected: &str, response: &Response) -> ChatError {
    ChatError::transport(
        format!("expected {expected} response, got {}", response.kind()),
        false,
    )
}

/// Entry point of the SDK core. Cheap to clone; clones share one event loop.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

impl ChatClient {
    /// Build a client with its own channel registry. Must be called within a
    /// tokio runtime.
    pub fn new(config: ClientConfig, collaborators: Collaborators) -> Self {
        Self::with_registry(config, collaborators, Arc::new(ChannelRegistry::new()))
    }

    /// Build a client that shares `channels` with other components.
    pub fn with_registry(
        config: ClientConfig,
        collaborators: Collaborators,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        EventLoop::new(channels.clone()).spawn(rx);

        info!(
            user = ?collaborators.session.current_user().map(|u| u.user_id),
            "Chat client started"
        );
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport: collaborators.transport,
                uploader: collaborators.uploader,
                session: collaborators.session,
                channels,
                ids: RequestIdGenerator::new(),
                commands,
                watched: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.inner.channels
    }

    pub fn current_user(&self) -> Option<Sender> {
        self.inner.session.current_user()
    }

    /// Handle to the live instance for `url`.
    pub fn channel(&self, url: impl Into<ChannelUrl>) -> ChannelHandle {
        let url = url.into();
        ChannelHandle {
            client: self.inner.clone(),
            channel: self.inner.channels.get_or_create(&url),
        }
    }

    /// Fetch the server's view of a channel into the live instance.
    pub async fn refresh_channel(&self, url: &ChannelUrl) -> Result<ChannelHandle, ChatError> {
        let request = Request::GetChannel {
            channel_url: url.clone(),
        };
        match self.inner.round_trip(request).await? {
            Response::Channel(info) if &info.url == url => Ok(ChannelHandle {
                client: self.inner.clone(),
                channel: self.inner.channels.upsert(info),
            }),
            Response::Channel(info) => Err(ChatError::transport(
                format!("asked for channel '{url}', got '{}'", info.url),
                false,
            )),
            other => Err(unexpected_response("channel", &other)),
        }
    }

    /// Start receiving server push for `url`. Events are dispatched in arrival
    /// order. Watching an already watched channel is a no-op.
    pub async fn watch_channel(&self, url: &ChannelUrl) -> Result<(), ChatError> {
        if !self.lock_watched().insert(url.clone()) {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel(self.inner.config.event_buffer);
        if let Err(e) = self.inner.transport.subscribe_channel_events(url, tx).await {
            self.lock_watched().remove(url);
            return Err(e);
        }

        let commands = self.inner.commands.clone();
        let channel = url.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if commands.send(ClientCommand::Dispatch(event)).is_err() {
                    break;
                }
            }
            debug!(channel = %channel, "Channel event forwarder stopped");
        });

        info!(channel = %url, "Watching channel");
        Ok(())
    }

    /// Register `observer` under `id`, replacing any observer already there.
    pub fn subscribe(&self, id: impl Into<String>, observer: Arc<dyn ChannelObserver>) {
        self.inner.command(ClientCommand::Subscribe {
            id: id.into(),
            observer,
        });
    }

    /// Remove the observer under `id`. Unknown IDs are ignored.
    pub fn unsubscribe(&self, id: &str) {
        self.inner.command(ClientCommand::Unsubscribe { id: id.to_string() });
    }

    /// Deliver a locally produced event through the dispatcher.
    pub fn dispatch(&self, event: ChannelEvent) {
        self.inner.command(ClientCommand::Dispatch(event));
    }

    /// Number of sends still awaiting a terminal outcome.
    pub async fn pending_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if !self.inner.command(ClientCommand::PendingCount(tx)) {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Wait until the event loop has handled every command issued so far.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.command(ClientCommand::Flush(tx)) {
            let _ = rx.await;
        }
    }

    /// Stop the event loop. Sends still pending fail with a retriable
    /// transport error.
    pub fn shutdown(&self) {
        self.inner.command(ClientCommand::Shutdown);
    }

    fn lock_watched(&self) -> std::sync::MutexGuard<'_, HashSet<ChannelUrl>> {
        self.inner
            .watched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Operations scoped to one channel.
#[derive(Clone)]
pub struct ChannelHandle {
    client: Arc<ClientInner>,
    channel: Arc<Channel>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("url", self.channel.url())
            .finish_non_exhaustive()
    }
}

impl ChannelHandle {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn url(&self) -> &ChannelUrl {
        self.channel.url()
    }

    /// Send a text message. Returns immediately with the provisional message;
    /// the outcome arrives through [`SendHandle::completion`].
    pub fn send_text(&self, params: impl Into<TextMessageParams>) -> Result<SendHandle, ChatError> {
        pipeline::send_text(&self.client, self.url(), params.into())
    }

    /// Send a file message, uploading binary payloads first.
    pub fn send_file(&self, params: FileMessageParams) -> Result<SendHandle, ChatError> {
        pipeline::send_file(&self.client, self.url(), params)
    }

    pub fn meta_data(&self) -> MetaStore<String> {
        MetaStore::new(self.client.clone(), self.channel.clone())
    }

    pub fn meta_counters(&self) -> MetaStore<i64> {
        MetaStore::new(self.client.clone(), self.channel.clone())
    }

    /// Delete an own message. On success `message` becomes `Deleted` and one
    /// `MessageDeleted` event is dispatched.
    pub async fn delete_message(&self, message: &mut Message) -> Result<(), ChatError> {
        deletion::delete_message(&self.client, self.url(), message).await
    }

    pub fn create_history_cursor(&self) -> HistoryCursor {
        HistoryCursor::new(self.client.clone(), self.url().clone())
    }

    pub fn create_message_list_query(&self) -> MessageListQuery {
        MessageListQuery::new(self.client.clone(), self.url().clone())
    }
}
