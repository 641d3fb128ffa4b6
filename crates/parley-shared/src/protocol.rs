use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::message::{Message, MessageBody};
use crate::types::{ChannelInfo, ChannelKind, ChannelUrl, MessageId, RequestId, Sender, UserId};

/// Requests submitted to the transport collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Request {
    /// Submit an outbound message. File bodies reference already hosted files.
    SendMessage {
        request_id: RequestId,
        channel_url: ChannelUrl,
        body: MessageBody,
        data: Option<String>,
        custom_type: Option<String>,
        target_languages: Vec<String>,
    },

    /// Fetch the current attributes of a channel.
    GetChannel { channel_url: ChannelUrl },

    /// Operate on the string-valued metadata map.
    MetaData {
        channel_url: ChannelUrl,
        op: MetaOp<String>,
    },

    /// Operate on the integer-valued counter map.
    MetaCounters {
        channel_url: ChannelUrl,
        op: MetaOp<i64>,
    },

    /// Apply per-key deltas to counters; the store computes the result.
    AdjustCounters {
        channel_url: ChannelUrl,
        delta: CounterDelta,
        values: BTreeMap<String, i64>,
    },

    DeleteMessage {
        channel_url: ChannelUrl,
        message_id: MessageId,
    },

    /// Load up to `limit` messages on one side of `anchor`.
    LoadMessages {
        channel_url: ChannelUrl,
        anchor: Option<HistoryAnchor>,
        direction: HistoryDirection,
        limit: usize,
    },
}

/// Store operations shared by metadata and counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetaOp<V> {
    /// Fails with `Conflict` if any key already exists.
    Create(BTreeMap<String, V>),
    /// An empty key list reads the whole map.
    Get(Vec<String>),
    GetAll,
    /// Fails with `NotFound` if any key is absent. All-or-nothing.
    Update(BTreeMap<String, V>),
    /// Succeeds whether or not the key exists.
    DeleteKey(String),
    DeleteAll,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CounterDelta {
    Increase,
    Decrease,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HistoryDirection {
    /// Older than the anchor.
    Previous,
    /// Newer than the anchor.
    Next,
}

/// Position in a channel's history. Without a message ID the timestamp alone
/// is the boundary; with one, ties on the timestamp are broken by ID.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryAnchor {
    pub created_at: DateTime<Utc>,
    pub message_id: Option<MessageId>,
}

/// Successful responses returned by the transport collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Response {
    /// The server-accepted copy of a sent message.
    Message(Message),
    /// Messages ordered oldest first.
    Messages(Vec<Message>),
    Channel(ChannelInfo),
    MetaData(BTreeMap<String, String>),
    MetaCounters(BTreeMap<String, i64>),
    Ack,
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Messages(_) => "messages",
            Self::Channel(_) => "channel",
            Self::MetaData(_) => "meta_data",
            Self::MetaCounters(_) => "meta_counters",
            Self::Ack => "ack",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MembershipChange {
    Joined,
    Left,
    Entered,
    Exited,
    Muted,
    Unmuted,
    Banned,
    Unbanned,
}

/// Interest categories observers can declare.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventCategory {
    Message,
    Delivery,
    Membership,
    Metadata,
    Typing,
    ReadReceipt,
    Frozen,
    Deleted,
}

impl EventCategory {
    pub const ALL: [EventCategory; 8] = [
        EventCategory::Message,
        EventCategory::Delivery,
        EventCategory::Membership,
        EventCategory::Metadata,
        EventCategory::Typing,
        EventCategory::ReadReceipt,
        EventCategory::Frozen,
        EventCategory::Deleted,
    ];
}

/// Everything that can happen on a channel, inbound from the server or
/// produced locally when an own send settles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChannelEvent {
    MessageReceived {
        message: Message,
    },
    MessageDeleted {
        channel_url: ChannelUrl,
        message_id: MessageId,
    },
    /// An own send was confirmed.
    MessageSent {
        message: Message,
    },
    /// An own send failed or was cancelled. The message is in `Failed` state.
    MessageFailed {
        message: Message,
    },
    MembershipChanged {
        channel_url: ChannelUrl,
        user: Sender,
        change: MembershipChange,
    },
    ChannelChanged {
        channel: ChannelInfo,
    },
    MetaDataChanged {
        channel_url: ChannelUrl,
        upserted: BTreeMap<String, String>,
        removed: Vec<String>,
    },
    MetaCountersChanged {
        channel_url: ChannelUrl,
        upserted: BTreeMap<String, i64>,
        removed: Vec<String>,
    },
    TypingStatusChanged {
        channel_url: ChannelUrl,
        typing: Vec<UserId>,
    },
    ReadReceiptUpdated {
        channel_url: ChannelUrl,
        reader: UserId,
        read_at: DateTime<Utc>,
    },
    FrozenChanged {
        channel_url: ChannelUrl,
        frozen: bool,
    },
    ChannelDeleted {
        channel_url: ChannelUrl,
        kind: ChannelKind,
    },
}

impl ChannelEvent {
    pub fn channel_url(&self) -> &ChannelUrl {
        match self {
            Self::MessageReceived { message }
            | Self::MessageSent { message }
            | Self::MessageFailed { message } => &message.channel_url,
            Self::ChannelChanged { channel } => &channel.url,
            Self::MessageDeleted { channel_url, .. }
            | Self::MembershipChanged { channel_url, .. }
            | Self::MetaDataChanged { channel_url, .. }
            | Self::MetaCountersChanged { channel_url, .. }
            | Self::TypingStatusChanged { channel_url, .. }
            | Self::ReadReceiptUpdated { channel_url, .. }
            | Self::FrozenChanged { channel_url, .. }
            | Self::ChannelDeleted { channel_url, .. } => channel_url,
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            Self::MessageReceived { .. } => EventCategory::Message,
            Self::MessageSent { .. } | Self::MessageFailed { .. } => EventCategory::Delivery,
            Self::MembershipChanged { .. } => EventCategory::Membership,
            Self::ChannelChanged { .. }
            | Self::MetaDataChanged { .. }
            | Self::MetaCountersChanged { .. } => EventCategory::Metadata,
            Self::TypingStatusChanged { .. } => EventCategory::Typing,
            Self::ReadReceiptUpdated { .. } => EventCategory::ReadReceipt,
            Self::FrozenChanged { .. } => EventCategory::Frozen,
            Self::MessageDeleted { .. } | Self::ChannelDeleted { .. } => EventCategory::Deleted,
        }
    }
}

impl Request {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::Encode)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(data).map_err(CodecError::Decode)
    }

    /// Short operation name for log fields.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::GetChannel { .. } => "get_channel",
            Self::MetaData { .. } => "meta_data",
            Self::MetaCounters { .. } => "meta_counters",
            Self::AdjustCounters { .. } => "adjust_counters",
            Self::DeleteMessage { .. } => "delete_message",
            Self::LoadMessages { .. } => "load_messages",
        }
    }
}

impl Response {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::Encode)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(data).map_err(CodecError::Decode)
    }
}

impl ChannelEvent {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::Encode)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(data).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = Request::SendMessage {
            request_id: RequestId("r1".into()),
            channel_url: ChannelUrl::new("c1"),
            body: MessageBody::User {
                text: "hello".into(),
                translations: BTreeMap::new(),
            },
            data: Some("{\"k\":1}".into()),
            custom_type: None,
            target_languages: vec!["fr".into()],
        };

        let bytes = req.to_bytes().unwrap();
        assert_eq!(Request::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn test_event_categories() {
        let url = ChannelUrl::new("c1");
        let frozen = ChannelEvent::FrozenChanged {
            channel_url: url.clone(),
            frozen: true,
        };
        assert_eq!(frozen.category(), EventCategory::Frozen);
        assert_eq!(frozen.channel_url(), &url);

        let deleted = ChannelEvent::MessageDeleted {
            channel_url: url,
            message_id: MessageId(7),
        };
        assert_eq!(deleted.category(), EventCategory::Deleted);
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(Request::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }
}
