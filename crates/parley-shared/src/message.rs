//! The message model and its lifecycle.
//!
//! A message starts `Pending` (request ID only), becomes `Confirmed` once the
//! server assigns an ID and timestamp, or `Failed` with the error attached.
//! Confirmed messages may later become `Deleted`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::types::{ChannelUrl, MessageId, RequestId, Sender, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageState {
    Pending,
    Confirmed,
    Failed(ChatError),
    Deleted,
}

/// Descriptor of a hosted file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub url: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageBody {
    User {
        text: String,
        /// Language code to translated text, filled in by the server.
        translations: BTreeMap<String, String>,
    },
    File(FileInfo),
    Admin {
        text: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub request_id: Option<RequestId>,
    pub message_id: Option<MessageId>,
    pub channel_url: ChannelUrl,
    pub body: MessageBody,
    pub data: Option<String>,
    pub custom_type: Option<String>,
    pub sender: Option<Sender>,
    pub target_languages: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub state: MessageState,
}

impl Message {
    /// A provisional outbound message carrying only its request ID.
    pub fn pending(
        request_id: RequestId,
        channel_url: ChannelUrl,
        body: MessageBody,
        sender: Option<Sender>,
    ) -> Self {
        Self {
            request_id: Some(request_id),
            message_id: None,
            channel_url,
            body,
            data: None,
            custom_type: None,
            sender,
            target_languages: Vec::new(),
            created_at: None,
            state: MessageState::Pending,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::User { text, .. } | MessageBody::Admin { text } => Some(text),
            MessageBody::File(_) => None,
        }
    }

    pub fn file(&self) -> Option<&FileInfo> {
        match &self.body {
            MessageBody::File(info) => Some(info),
            _ => None,
        }
    }

    pub fn translations(&self) -> Option<&BTreeMap<String, String>> {
        match &self.body {
            MessageBody::User { translations, .. } => Some(translations),
            _ => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.body, MessageBody::Admin { .. })
    }

    pub fn is_pending(&self) -> bool {
        self.state == MessageState::Pending
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == MessageState::Confirmed
    }

    pub fn is_deleted(&self) -> bool {
        self.state == MessageState::Deleted
    }

    pub fn error(&self) -> Option<&ChatError> {
        match &self.state {
            MessageState::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_sent_by(&self, user: &UserId) -> bool {
        self.sender.as_ref().is_some_and(|s| &s.user_id == user)
    }

    /// Reconcile this provisional message with the copy the server accepted.
    /// Server fields win; the request ID is kept for caller correlation.
    pub fn confirm_with(&self, accepted: Message) -> Message {
        Message {
            request_id: self.request_id.clone(),
            state: MessageState::Confirmed,
            sender: accepted.sender.or_else(|| self.sender.clone()),
            ..accepted
        }
    }

    pub fn into_failed(mut self, error: ChatError) -> Message {
        self.state = MessageState::Failed(error);
        self
    }

    pub fn mark_deleted(&mut self) {
        self.state = MessageState::Deleted;
    }
}
