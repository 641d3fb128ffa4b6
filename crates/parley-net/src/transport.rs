//! Collaborator seams consumed by the client core.
//!
//! The wire protocol, file hosting and authentication live behind these
//! traits. The client never talks to the network directly.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use parley_shared::{ChannelEvent, ChannelUrl, ChatError, FileInfo, Request, Response, Sender};

/// Request/response round trips and server push.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Submit a request and wait for the server's verdict.
    async fn submit(&self, request: Request) -> Result<Response, ChatError>;

    /// Start pushing events for `channel_url` into `sink`, in arrival order.
    /// Pushing stops when the receiving half is dropped.
    async fn subscribe_channel_events(
        &self,
        channel_url: &ChannelUrl,
        sink: mpsc::Sender<ChannelEvent>,
    ) -> Result<(), ChatError>;
}

/// Describes a binary payload being uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMeta {
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
}

/// Upload progress, reported zero or more times per upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    /// Bytes sent by the latest chunk.
    pub bytes_sent: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_expected: u64,
}

/// Hosts binary file payloads before the file message is submitted.
#[async_trait]
pub trait Uploader: Send + Sync + 'static {
    async fn upload(
        &self,
        payload: Bytes,
        meta: UploadMeta,
        progress: mpsc::UnboundedSender<UploadProgress>,
    ) -> Result<FileInfo, ChatError>;
}

/// Supplies the identity of the authenticated user.
pub trait SessionProvider: Send + Sync + 'static {
    fn current_user(&self) -> Option<Sender>;
}

/// A session fixed at construction. Useful for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSession(Option<Sender>);

impl StaticSession {
    pub fn new(user: Sender) -> Self {
        Self(Some(user))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl SessionProvider for StaticSession {
    fn current_user(&self) -> Option<Sender> {
        self.0.clone()
    }
}
