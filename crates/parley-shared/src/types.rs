use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Identity of an authenticated user, as issued by the session collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A channel is identified by a unique URL string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelUrl(pub String);

impl ChannelUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelUrl {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Server-assigned message identifier. Only confirmed messages have one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated identifier of an outbound message awaiting confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The author of a message as it appears on the message itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sender {
    pub user_id: UserId,
    pub nickname: Option<String>,
    pub profile_url: Option<String>,
}

impl Sender {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            nickname: None,
            profile_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Public channel users enter and exit.
    Open,
    /// Membership-based channel users join and leave.
    #[default]
    Group,
}

/// Attributes of a channel as reported by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelInfo {
    pub url: ChannelUrl,
    pub kind: ChannelKind,
    pub name: String,
    pub cover_url: Option<String>,
    /// Set once by the server; never overwritten afterwards.
    pub created_at: Option<DateTime<Utc>>,
    pub data: Option<String>,
    pub custom_type: Option<String>,
    pub frozen: bool,
}

/// JSON shape accepted by [`ChannelInfo::from_json`]. Timestamps are epoch
/// milliseconds.
#[derive(Deserialize)]
struct ChannelDocument {
    channel_url: String,
    #[serde(default)]
    channel_type: ChannelKind,
    #[serde(default)]
    name: String,
    cover_url: Option<String>,
    created_at: Option<i64>,
    data: Option<String>,
    custom_type: Option<String>,
    #[serde(default)]
    freeze: bool,
}

impl ChannelInfo {
    pub fn new(url: ChannelUrl, kind: ChannelKind) -> Self {
        Self {
            url,
            kind,
            name: String::new(),
            cover_url: None,
            created_at: None,
            data: None,
            custom_type: None,
            frozen: false,
        }
    }

    /// Build channel attributes from a serialized channel document.
    pub fn from_json(document: &str) -> Result<Self, CodecError> {
        let doc: ChannelDocument = serde_json::from_str(document)?;
        Ok(Self {
            url: ChannelUrl(doc.channel_url),
            kind: doc.channel_type,
            name: doc.name,
            cover_url: doc.cover_url,
            created_at: doc.created_at.and_then(DateTime::from_timestamp_millis),
            data: doc.data,
            custom_type: doc.custom_type,
            frozen: doc.freeze,
        })
    }

    pub fn is_open(&self) -> bool {
        self.kind == ChannelKind::Open
    }

    pub fn is_group(&self) -> bool {
        self.kind == ChannelKind::Group
    }

    /// Fold newer attributes into this instance. `url` and an already known
    /// `created_at` are immutable.
    pub fn merge_from(&mut self, newer: ChannelInfo) {
        self.kind = newer.kind;
        self.name = newer.name;
        self.cover_url = newer.cover_url;
        self.data = newer.data;
        self.custom_type = newer.custom_type;
        self.frozen = newer.frozen;
        if self.created_at.is_none() {
            self.created_at = newer.created_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_from_json() {
        let info = ChannelInfo::from_json(
            r#"{"channel_url":"open_lobby","channel_type":"open","name":"Lobby",
                "created_at":1000,"custom_type":"event"}"#,
        )
        .unwrap();

        assert_eq!(info.url, ChannelUrl::new("open_lobby"));
        assert!(info.is_open());
        assert!(!info.is_group());
        assert_eq!(info.name, "Lobby");
        assert_eq!(info.created_at.unwrap().timestamp_millis(), 1000);
        assert_eq!(info.custom_type.as_deref(), Some("event"));
        assert!(info.cover_url.is_none());
    }

    #[test]
    fn test_channel_from_json_requires_url() {
        assert!(ChannelInfo::from_json(r#"{"name":"x"}"#).is_err());
    }

    #[test]
    fn test_merge_keeps_created_at() {
        let url = ChannelUrl::new("c1");
        let mut info = ChannelInfo::new(url.clone(), ChannelKind::Group);
        info.created_at = DateTime::from_timestamp_millis(1_000);

        let mut newer = ChannelInfo::new(url, ChannelKind::Group);
        newer.name = "renamed".into();
        newer.created_at = DateTime::from_timestamp_millis(9_999);
        info.merge_from(newer);

        assert_eq!(info.name, "renamed");
        assert_eq!(info.created_at.unwrap().timestamp_millis(), 1_000);
    }
}
