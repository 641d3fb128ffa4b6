//! In-process emulation of the remote chat service.
//!
//! [`LoopbackServer`] holds channels, their message history, metadata and
//! counters. Every [`LoopbackTransport`] obtained from [`LoopbackServer::connect`]
//! acts as one authenticated user and implements all three collaborator
//! traits. Requests are encoded and decoded with the wire codec on the way in.
//!
//! Events caused by a connection are pushed to every *other* subscribed
//! connection; the originator learns the outcome from its response.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use parley_shared::protocol::HistoryAnchor;
use parley_shared::{
    ChannelEvent, ChannelInfo, ChannelUrl, ChatError, CounterDelta, FileInfo, HistoryDirection,
    Message, MessageBody, MessageId, MessageState, MetaOp, Request, Response, Sender,
};

use crate::transport::{SessionProvider, Transport, UploadMeta, UploadProgress, Uploader};

/// Default upload chunk size, in bytes.
pub const DEFAULT_UPLOAD_CHUNK: usize = 16 * 1024;

#[derive(Clone)]
pub struct LoopbackServer {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<ServerState>,
    paused: watch::Sender<bool>,
    next_connection: AtomicU64,
}

struct ServerState {
    next_message_id: i64,
    clock_ms: i64,
    upload_chunk: usize,
    channels: HashMap<ChannelUrl, ChannelRecord>,
    failures: VecDeque<ChatError>,
    operations: Vec<&'static str>,
}

struct ChannelRecord {
    info: ChannelInfo,
    messages: Vec<Message>,
    meta_data: BTreeMap<String, String>,
    meta_counters: BTreeMap<String, i64>,
    subscribers: Vec<Subscriber>,
}

/// A subscribed connection. Events queue here without bound and a forwarding
/// task feeds them into the connection's sink in order, so a slow reader
/// applies back-pressure instead of losing events.
struct Subscriber {
    connection: u64,
    queue: mpsc::UnboundedSender<ChannelEvent>,
}

/// Result of a store operation: the values to return, plus what changed.
struct MetaOutcome<V> {
    values: Option<BTreeMap<String, V>>,
    upserted: BTreeMap<String, V>,
    removed: Vec<String>,
}

impl LoopbackServer {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ServerState {
                    next_message_id: 1,
                    clock_ms: 1_000,
                    upload_chunk: DEFAULT_UPLOAD_CHUNK,
                    channels: HashMap::new(),
                    failures: VecDeque::new(),
                    operations: Vec::new(),
                }),
                paused,
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// ID assigned to the next accepted message.
    pub fn starting_message_id(self, id: i64) -> Self {
        self.state().next_message_id = id;
        self
    }

    /// Server clock, in epoch milliseconds. Advances by one per message.
    pub fn starting_clock(self, epoch_ms: i64) -> Self {
        self.state().clock_ms = epoch_ms;
        self
    }

    pub fn upload_chunk(self, bytes: usize) -> Self {
        self.state().upload_chunk = bytes.max(1);
        self
    }

    /// Open a connection authenticated as `user`.
    pub fn connect(&self, user: Sender) -> LoopbackTransport {
        let connection = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
        debug!(connection, user = %user.user_id, "Loopback connection opened");
        LoopbackTransport {
            server: self.clone(),
            connection,
            user,
        }
    }

    pub fn create_channel(&self, info: ChannelInfo) {
        let mut state = self.state();
        let mut info = info;
        if info.created_at.is_none() {
            info.created_at = Some(state.tick());
        }
        state.channels.insert(
            info.url.clone(),
            ChannelRecord {
                info,
                messages: Vec::new(),
                meta_data: BTreeMap::new(),
                meta_counters: BTreeMap::new(),
                subscribers: Vec::new(),
            },
        );
    }

    /// Store a message as if another party had sent it. Not pushed to
    /// subscribers.
    pub fn insert_message(
        &self,
        channel_url: &ChannelUrl,
        sender: Option<Sender>,
        body: MessageBody,
    ) -> Result<Message, ChatError> {
        let mut state = self.state();
        state.channel_mut(channel_url)?;
        let message_id = state.next_id();
        let created_at = state.tick();
        let record = state.channel_mut(channel_url)?;
        let message = Message {
            request_id: None,
            message_id: Some(message_id),
            channel_url: channel_url.clone(),
            body,
            data: None,
            custom_type: None,
            sender,
            target_languages: Vec::new(),
            created_at: Some(created_at),
            state: MessageState::Confirmed,
        };
        record.messages.push(message.clone());
        Ok(message)
    }

    /// Fail the next request or upload with `error`.
    pub fn fail_next(&self, error: ChatError) {
        self.state().failures.push_back(error);
    }

    /// Hold every request and upload until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
    }

    /// Push an event to every subscriber of its channel. Returns how many
    /// subscribers received it.
    pub fn push_event(&self, event: ChannelEvent) -> usize {
        let mut state = self.state();
        match state.channels.get_mut(event.channel_url()) {
            Some(record) => record.broadcast(None, event),
            None => 0,
        }
    }

    /// Overwrite a counter, as a concurrent writer would.
    pub fn set_meta_counter(&self, channel_url: &ChannelUrl, key: &str, value: i64) {
        if let Ok(record) = self.state().channel_mut(channel_url) {
            record.meta_counters.insert(key.to_string(), value);
        }
    }

    pub fn meta_data(&self, channel_url: &ChannelUrl) -> BTreeMap<String, String> {
        self.state()
            .channels
            .get(channel_url)
            .map(|r| r.meta_data.clone())
            .unwrap_or_default()
    }

    pub fn meta_counters(&self, channel_url: &ChannelUrl) -> BTreeMap<String, i64> {
        self.state()
            .channels
            .get(channel_url)
            .map(|r| r.meta_counters.clone())
            .unwrap_or_default()
    }

    pub fn messages(&self, channel_url: &ChannelUrl) -> Vec<Message> {
        self.state()
            .channels
            .get(channel_url)
            .map(|r| r.messages.clone())
            .unwrap_or_default()
    }

    /// Names of every operation received so far, in arrival order.
    pub fn operations(&self) -> Vec<&'static str> {
        self.state().operations.clone()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    async fn wait_until_resumed(&self) {
        let mut rx = self.shared.paused.subscribe();
        while self.is_paused() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn handle(&self, connection: u64, user: &Sender, request: Request) -> Result<Response, ChatError> {
        let mut state = self.state();
        state.operations.push(request.operation());
        if let Some(err) = state.failures.pop_front() {
            debug!(op = request.operation(), error = %err, "Injected failure");
            return Err(err);
        }

        match request {
            Request::SendMessage {
                request_id,
                channel_url,
                body,
                data,
                custom_type,
                target_languages,
            } => {
                if state.channel_mut(&channel_url)?.info.frozen {
                    return Err(ChatError::authorization("channel is frozen"));
                }
                let message_id = state.next_id();
                let created_at = state.tick();
                let record = state.channel_mut(&channel_url)?;
                let body = translate(body, &target_languages);
                let message = Message {
                    request_id: Some(request_id),
                    message_id: Some(message_id),
                    channel_url,
                    body,
                    data,
                    custom_type,
                    sender: Some(user.clone()),
                    target_languages,
                    created_at: Some(created_at),
                    state: MessageState::Confirmed,
                };
                record.messages.push(message.clone());
                record.broadcast(
                    Some(connection),
                    ChannelEvent::MessageReceived {
                        message: message.clone(),
                    },
                );
                Ok(Response::Message(message))
            }

            Request::GetChannel { channel_url } => {
                let record = state.channel_mut(&channel_url)?;
                Ok(Response::Channel(record.info.clone()))
            }

            Request::MetaData { channel_url, op } => {
                let record = state.channel_mut(&channel_url)?;
                let outcome = apply_meta(&mut record.meta_data, op)?;
                if !outcome.upserted.is_empty() || !outcome.removed.is_empty() {
                    record.broadcast(
                        Some(connection),
                        ChannelEvent::MetaDataChanged {
                            channel_url,
                            upserted: outcome.upserted,
                            removed: outcome.removed,
                        },
                    );
                }
                Ok(outcome.values.map_or(Response::Ack, Response::MetaData))
            }

            Request::MetaCounters { channel_url, op } => {
                let record = state.channel_mut(&channel_url)?;
                let outcome = apply_meta(&mut record.meta_counters, op)?;
                if !outcome.upserted.is_empty() || !outcome.removed.is_empty() {
                    record.broadcast(
                        Some(connection),
                        ChannelEvent::MetaCountersChanged {
                            channel_url,
                            upserted: outcome.upserted,
                            removed: outcome.removed,
                        },
                    );
                }
                Ok(outcome.values.map_or(Response::Ack, Response::MetaCounters))
            }

            Request::AdjustCounters {
                channel_url,
                delta,
                values,
            } => {
                let record = state.channel_mut(&channel_url)?;
                let mut computed = BTreeMap::new();
                for (key, amount) in &values {
                    let current = record
                        .meta_counters
                        .get(key)
                        .copied()
                        .ok_or_else(|| ChatError::not_found(format!("counter '{key}'")))?;
                    let next = match delta {
                        CounterDelta::Increase => current.checked_add(*amount),
                        CounterDelta::Decrease => current.checked_sub(*amount),
                    }
                    .ok_or_else(|| ChatError::validation(format!("counter '{key}' overflow")))?;
                    computed.insert(key.clone(), next);
                }
                record.meta_counters.extend(computed.clone());
                record.broadcast(
                    Some(connection),
                    ChannelEvent::MetaCountersChanged {
                        channel_url,
                        upserted: computed.clone(),
                        removed: Vec::new(),
                    },
                );
                Ok(Response::MetaCounters(computed))
            }

            Request::DeleteMessage {
                channel_url,
                message_id,
            } => {
                let record = state.channel_mut(&channel_url)?;
                let index = record
                    .messages
                    .iter()
                    .position(|m| m.message_id == Some(message_id))
                    .ok_or_else(|| ChatError::not_found(format!("message {message_id}")))?;
                let message = &record.messages[index];
                if message.is_admin() || !message.is_sent_by(&user.user_id) {
                    return Err(ChatError::authorization("only the sender may delete a message"));
                }
                record.messages.remove(index);
                record.broadcast(
                    Some(connection),
                    ChannelEvent::MessageDeleted {
                        channel_url,
                        message_id,
                    },
                );
                Ok(Response::Ack)
            }

            Request::LoadMessages {
                channel_url,
                anchor,
                direction,
                limit,
            } => {
                let record = state.channel_mut(&channel_url)?;
                Ok(Response::Messages(load_messages(
                    &record.messages,
                    anchor,
                    direction,
                    limit,
                )))
            }
        }
    }

    fn subscribe(
        &self,
        connection: u64,
        channel_url: &ChannelUrl,
        sink: mpsc::Sender<ChannelEvent>,
    ) -> Result<(), ChatError> {
        let mut state = self.state();
        let record = state.channel_mut(channel_url)?;
        let (queue, mut pending) = mpsc::unbounded_channel();
        record.subscribers.push(Subscriber { connection, queue });
        drop(state);

        let channel = channel_url.clone();
        tokio::spawn(async move {
            while let Some(event) = pending.recv().await {
                if sink.send(event).await.is_err() {
                    break;
                }
            }
            debug!(connection, channel = %channel, "Loopback subscriber closed");
        });
        Ok(())
    }

    fn take_failure(&self, operation: &'static str) -> Result<(), ChatError> {
        let mut state = self.state();
        state.operations.push(operation);
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    fn next_id(&mut self) -> MessageId {
        let id = MessageId(self.next_message_id);
        self.next_message_id += 1;
        id
    }

    fn tick(&mut self) -> DateTime<Utc> {
        let now = DateTime::from_timestamp_millis(self.clock_ms).unwrap_or_default();
        self.clock_ms += 1;
        now
    }

    fn channel_mut(&mut self, url: &ChannelUrl) -> Result<&mut ChannelRecord, ChatError> {
        self.channels
            .get_mut(url)
            .ok_or_else(|| ChatError::not_found(format!("channel '{url}'")))
    }
}

impl ChannelRecord {
    fn broadcast(&mut self, origin: Option<u64>, event: ChannelEvent) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|sub| {
            if Some(sub.connection) == origin {
                return true;
            }
            if sub.queue.send(event.clone()).is_err() {
                debug!(connection = sub.connection, "Dropping closed subscriber");
                return false;
            }
            delivered += 1;
            true
        });
        delivered
    }
}

fn translate(body: MessageBody, target_languages: &[String]) -> MessageBody {
    match body {
        MessageBody::User { text, .. } => {
            let translations = target_languages
                .iter()
                .map(|lang| (lang.clone(), format!("[{lang}] {text}")))
                .collect();
            MessageBody::User { text, translations }
        }
        other => other,
    }
}

fn apply_meta<V: Clone>(
    map: &mut BTreeMap<String, V>,
    op: MetaOp<V>,
) -> Result<MetaOutcome<V>, ChatError> {
    let unchanged = |values| MetaOutcome {
        values: Some(values),
        upserted: BTreeMap::new(),
        removed: Vec::new(),
    };

    match op {
        MetaOp::Create(values) => {
            let existing: Vec<&String> = values.keys().filter(|k| map.contains_key(*k)).collect();
            if !existing.is_empty() {
                return Err(ChatError::conflict(format!("keys already exist: {existing:?}")));
            }
            map.extend(values.clone());
            Ok(MetaOutcome {
                values: Some(values.clone()),
                upserted: values,
                removed: Vec::new(),
            })
        }
        MetaOp::Get(keys) if keys.is_empty() => Ok(unchanged(map.clone())),
        MetaOp::Get(keys) => Ok(unchanged(
            keys.iter()
                .filter_map(|k| map.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        )),
        MetaOp::GetAll => Ok(unchanged(map.clone())),
        MetaOp::Update(values) => {
            let missing: Vec<&String> = values.keys().filter(|k| !map.contains_key(*k)).collect();
            if !missing.is_empty() {
                return Err(ChatError::not_found(format!("keys not found: {missing:?}")));
            }
            map.extend(values.clone());
            Ok(MetaOutcome {
                values: Some(values.clone()),
                upserted: values,
                removed: Vec::new(),
            })
        }
        MetaOp::DeleteKey(key) => {
            let removed = map.remove(&key).map(|_| vec![key]).unwrap_or_default();
            Ok(MetaOutcome {
                values: None,
                upserted: BTreeMap::new(),
                removed,
            })
        }
        MetaOp::DeleteAll => {
            let removed = map.keys().cloned().collect();
            map.clear();
            Ok(MetaOutcome {
                values: None,
                upserted: BTreeMap::new(),
                removed,
            })
        }
    }
}

fn position(message: &Message) -> (Option<DateTime<Utc>>, Option<MessageId>) {
    (message.created_at, message.message_id)
}

fn load_messages(
    messages: &[Message],
    anchor: Option<HistoryAnchor>,
    direction: HistoryDirection,
    limit: usize,
) -> Vec<Message> {
    let mut sorted: Vec<&Message> = messages.iter().collect();
    sorted.sort_by_key(|m| position(m));

    let selected: Vec<&Message> = match direction {
        HistoryDirection::Previous => {
            let older: Vec<&Message> = sorted
                .into_iter()
                .filter(|m| match anchor {
                    None => true,
                    Some(a) => is_before(m, &a),
                })
                .collect();
            let skip = older.len().saturating_sub(limit);
            older.into_iter().skip(skip).collect()
        }
        HistoryDirection::Next => sorted
            .into_iter()
            .filter(|m| match anchor {
                None => true,
                Some(a) => is_after(m, &a),
            })
            .take(limit)
            .collect(),
    };
    selected.into_iter().cloned().collect()
}

fn is_before(message: &Message, anchor: &HistoryAnchor) -> bool {
    match (message.created_at, anchor.message_id) {
        (Some(ts), None) => ts < anchor.created_at,
        (Some(ts), Some(id)) => (ts, message.message_id) < (anchor.created_at, Some(id)),
        (None, _) => false,
    }
}

fn is_after(message: &Message, anchor: &HistoryAnchor) -> bool {
    match (message.created_at, anchor.message_id) {
        (Some(ts), None) => ts > anchor.created_at,
        (Some(ts), Some(id)) => (ts, message.message_id) > (anchor.created_at, Some(id)),
        (None, _) => false,
    }
}

/// One authenticated connection to a [`LoopbackServer`].
#[derive(Clone)]
pub struct LoopbackTransport {
    server: LoopbackServer,
    connection: u64,
    user: Sender,
}

impl LoopbackTransport {
    pub fn server(&self) -> &LoopbackServer {
        &self.server
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn submit(&self, request: Request) -> Result<Response, ChatError> {
        self.server.wait_until_resumed().await;
        let bytes = request.to_bytes()?;
        let request = Request::from_bytes(&bytes)?;
        let response = self.server.handle(self.connection, &self.user, request)?;
        Ok(Response::from_bytes(&response.to_bytes()?)?)
    }

    async fn subscribe_channel_events(
        &self,
        channel_url: &ChannelUrl,
        sink: mpsc::Sender<ChannelEvent>,
    ) -> Result<(), ChatError> {
        self.server.subscribe(self.connection, channel_url, sink)
    }
}

#[async_trait]
impl Uploader for LoopbackTransport {
    async fn upload(
        &self,
        payload: Bytes,
        meta: UploadMeta,
        progress: mpsc::UnboundedSender<UploadProgress>,
    ) -> Result<FileInfo, ChatError> {
        self.server.wait_until_resumed().await;
        self.server.take_failure("upload")?;

        let chunk = self.server.state().upload_chunk;
        let total = payload.len() as u64;
        let mut sent = 0u64;
        for piece in payload.chunks(chunk) {
            sent += piece.len() as u64;
            let _ = progress.send(UploadProgress {
                bytes_sent: piece.len() as u64,
                total_bytes_sent: sent,
                total_bytes_expected: total,
            });
            tokio::task::yield_now().await;
        }

        Ok(FileInfo {
            url: format!("loopback://files/{}/{}", Uuid::new_v4(), meta.file_name),
            name: meta.file_name,
            mime_type: meta.mime_type,
            size: meta.size,
        })
    }
}

impl SessionProvider for LoopbackTransport {
    fn current_user(&self) -> Option<Sender> {
        Some(self.user.clone())
    }
}
