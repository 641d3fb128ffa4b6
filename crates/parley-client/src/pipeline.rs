//! Outbound message pipeline.
//!
//! A send is validated synchronously, registered with the event loop and
//! handed back to the caller as a [`SendHandle`] carrying the provisional
//! message. Transmission runs on its own task; its outcome is marshalled back
//! to the event loop, which settles the pending entry exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use parley_net::{UploadMeta, UploadProgress};
use parley_shared::{
    ChannelUrl, ChatError, FileInfo, Message, MessageBody, RequestId, Request, Response,
};

use crate::client::{unexpected_response, ClientInner};
use crate::config::ClientConfig;
use crate::event_loop::ClientCommand;
use crate::pending::PendingEntry;

/// Receives upload progress for a binary file send. Runs on the event loop;
/// it must not block.
pub type ProgressSink = Box<dyn FnMut(UploadProgress) + Send>;

/// A send that ended without confirmation. `message` is the provisional
/// message in `Failed` state, request ID intact.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("message send failed: {error}")]
pub struct FailedSend {
    pub message: Message,
    #[source]
    pub error: ChatError,
}

pub type SendResult = Result<Message, FailedSend>;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextMessageParams {
    pub text: String,
    pub data: Option<String>,
    pub custom_type: Option<String>,
    /// Language codes the server should translate the text into.
    pub target_languages: Vec<String>,
}

impl TextMessageParams {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn custom_type(mut self, custom_type: impl Into<String>) -> Self {
        self.custom_type = Some(custom_type.into());
        self
    }

    pub fn target_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_languages = languages.into_iter().map(Into::into).collect();
        self
    }
}

impl From<&str> for TextMessageParams {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for TextMessageParams {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Raw bytes, uploaded before the message is submitted.
    Binary(Bytes),
    /// A file already hosted at this URL.
    Url(String),
}

pub struct FileMessageParams {
    pub source: FileSource,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    pub data: Option<String>,
    pub custom_type: Option<String>,
    progress: Option<ProgressSink>,
}

impl FileMessageParams {
    pub fn binary(
        payload: impl Into<Bytes>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        let payload = payload.into();
        Self {
            size: payload.len() as u64,
            source: FileSource::Binary(payload),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data: None,
            custom_type: None,
            progress: None,
        }
    }

    /// A hosted file. The name defaults to the last path segment of `url`.
    pub fn url(url: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        let url = url.into();
        let file_name = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            source: FileSource::Url(url),
            file_name,
            mime_type: mime_type.into(),
            size,
            data: None,
            custom_type: None,
            progress: None,
        }
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn custom_type(mut self, custom_type: impl Into<String>) -> Self {
        self.custom_type = Some(custom_type.into());
        self
    }

    /// Observe upload progress. Only binary sends report progress.
    pub fn with_progress(mut self, sink: impl FnMut(UploadProgress) + Send + 'static) -> Self {
        self.progress = Some(Box::new(sink));
        self
    }
}

impl std::fmt::Debug for FileMessageParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMessageParams")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .field("has_progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_text(params: &TextMessageParams, config: &ClientConfig) -> Result<(), ChatError> {
    if params.text.trim().is_empty() {
        return Err(ChatError::validation("text must not be empty"));
    }
    let length = params.text.chars().count();
    if length > config.max_text_length {
        return Err(ChatError::validation(format!(
            "text is {length} characters, limit is {}",
            config.max_text_length
        )));
    }
    if params.target_languages.iter().any(|l| l.trim().is_empty()) {
        return Err(ChatError::validation("target language codes must not be empty"));
    }
    Ok(())
}

fn validate_file(params: &FileMessageParams, config: &ClientConfig) -> Result<(), ChatError> {
    match &params.source {
        FileSource::Binary(payload) => {
            if payload.is_empty() {
                return Err(ChatError::validation("binary payload must not be empty"));
            }
            if params.file_name.trim().is_empty() {
                return Err(ChatError::validation("file name is required for binary sends"));
            }
            if params.mime_type.trim().is_empty() {
                return Err(ChatError::validation("mime type is required for binary sends"));
            }
            if params.size != payload.len() as u64 {
                return Err(ChatError::validation(format!(
                    "declared size {} does not match payload length {}",
                    params.size,
                    payload.len()
                )));
            }
        }
        FileSource::Url(url) => {
            if url.trim().is_empty() {
                return Err(ChatError::validation("url is required for hosted file sends"));
            }
        }
    }
    if params.size > config.max_file_size {
        return Err(ChatError::validation(format!(
            "file is {} bytes, limit is {}",
            params.size, config.max_file_size
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Send handle
// ---------------------------------------------------------------------------

/// The caller's side of an in-flight send.
pub struct SendHandle {
    message: Message,
    request_id: RequestId,
    commands: mpsc::UnboundedSender<ClientCommand>,
    completion: oneshot::Receiver<SendResult>,
}

impl SendHandle {
    /// The provisional message: request ID set, no message ID.
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Cancel the send. Has no effect once the transport has answered; the
    /// completion then still reports the real outcome.
    pub fn cancel(&self) {
        let _ = self.commands.send(ClientCommand::Cancel {
            request_id: self.request_id.clone(),
        });
    }

    /// Wait for the terminal outcome.
    pub async fn completion(self) -> SendResult {
        match self.completion.await {
            Ok(outcome) => outcome,
            Err(_) => {
                let error = ChatError::transport("client event loop stopped", true);
                Err(FailedSend {
                    message: self.message.into_failed(error.clone()),
                    error,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Launch and delivery
// ---------------------------------------------------------------------------

pub(crate) fn send_text(
    client: &Arc<ClientInner>,
    channel_url: &ChannelUrl,
    params: TextMessageParams,
) -> Result<SendHandle, ChatError> {
    validate_text(&params, &client.config)?;

    let request_id = client.ids.next_id();
    let body = MessageBody::User {
        text: params.text,
        translations: BTreeMap::new(),
    };
    let mut message = Message::pending(
        request_id.clone(),
        channel_url.clone(),
        body,
        client.session.current_user(),
    );
    message.data = params.data;
    message.custom_type = params.custom_type;
    message.target_languages = params.target_languages;

    Ok(launch(client, request_id, message, None, None))
}

pub(crate) fn send_file(
    client: &Arc<ClientInner>,
    channel_url: &ChannelUrl,
    params: FileMessageParams,
) -> Result<SendHandle, ChatError> {
    validate_file(&params, &client.config)?;

    let request_id = client.ids.next_id();
    let (url, upload) = match params.source {
        FileSource::Url(url) => (url, None),
        FileSource::Binary(payload) => {
            let meta = UploadMeta {
                file_name: params.file_name.clone(),
                mime_type: params.mime_type.clone(),
                size: params.size,
            };
            (String::new(), Some((payload, meta)))
        }
    };
    let body = MessageBody::File(FileInfo {
        url,
        name: params.file_name,
        mime_type: params.mime_type,
        size: params.size,
    });
    let mut message = Message::pending(
        request_id.clone(),
        channel_url.clone(),
        body,
        client.session.current_user(),
    );
    message.data = params.data;
    message.custom_type = params.custom_type;

    let progress = if upload.is_some() { params.progress } else { None };
    Ok(launch(client, request_id, message, upload, progress))
}

fn launch(
    client: &Arc<ClientInner>,
    request_id: RequestId,
    message: Message,
    upload: Option<(Bytes, UploadMeta)>,
    progress: Option<ProgressSink>,
) -> SendHandle {
    let (completion_tx, completion_rx) = oneshot::channel();
    let (start_tx, start_rx) = oneshot::channel();

    // The task waits until the loop has registered the entry, so no
    // settlement can overtake it and a refused entry never reaches the
    // transport.
    let task = tokio::spawn(deliver(
        client.clone(),
        request_id.clone(),
        message.clone(),
        upload,
        start_rx,
    ));
    client.command(ClientCommand::Track(PendingEntry {
        request_id: request_id.clone(),
        message: message.clone(),
        progress,
        completion: completion_tx,
        start: Some(start_tx),
        abort: Some(task.abort_handle()),
    }));

    debug!(request_id = %request_id, channel = %message.channel_url, "Send launched");
    SendHandle {
        message,
        request_id,
        commands: client.commands.clone(),
        completion: completion_rx,
    }
}

async fn deliver(
    client: Arc<ClientInner>,
    request_id: RequestId,
    message: Message,
    upload: Option<(Bytes, UploadMeta)>,
    start: oneshot::Receiver<()>,
) {
    if start.await.is_err() {
        debug!(request_id = %request_id, "Send not registered, delivery skipped");
        return;
    }
    let outcome = submit(&client, &request_id, message, upload).await;
    client.command(ClientCommand::Settle { request_id, outcome });
}

async fn submit(
    client: &ClientInner,
    request_id: &RequestId,
    message: Message,
    upload: Option<(Bytes, UploadMeta)>,
) -> Result<Message, ChatError> {
    let body = match upload {
        Some((payload, meta)) => MessageBody::File(upload_file(client, request_id, payload, meta).await?),
        None => message.body,
    };

    let request = Request::SendMessage {
        request_id: request_id.clone(),
        channel_url: message.channel_url,
        body,
        data: message.data,
        custom_type: message.custom_type,
        target_languages: message.target_languages,
    };
    match client.round_trip(request).await? {
        Response::Message(accepted) => Ok(accepted),
        other => Err(unexpected_response("message", &other)),
    }
}

async fn upload_file(
    client: &ClientInner,
    request_id: &RequestId,
    payload: Bytes,
    meta: UploadMeta,
) -> Result<FileInfo, ChatError> {
    info!(request_id = %request_id, file = %meta.file_name, size = meta.size, "Uploading file");

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let upload = client.uploader.upload(payload, meta, progress_tx);
    tokio::pin!(upload);

    let forward = |progress: UploadProgress| {
        client.command(ClientCommand::Progress {
            request_id: request_id.clone(),
            progress,
        });
    };

    let result = loop {
        tokio::select! {
            biased;
            Some(progress) = progress_rx.recv() => forward(progress),
            result = &mut upload => break result,
        }
    };
    while let Ok(progress) = progress_rx.try_recv() {
        forward(progress);
    }

    result
}
