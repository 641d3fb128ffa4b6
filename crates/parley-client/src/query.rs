//! Message history queries.
//!
//! [`HistoryCursor`] walks a channel backwards from the newest message, one
//! page per call. [`MessageListQuery`] loads a bounded window on either side
//! of an arbitrary timestamp.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use parley_shared::constants::MAX_HISTORY_PAGE_SIZE;
use parley_shared::{
    ChannelUrl, ChatError, HistoryAnchor, HistoryDirection, Message, Request, Response,
};

use crate::client::{unexpected_response, ClientInner};

async fn load(
    client: &ClientInner,
    channel_url: &ChannelUrl,
    anchor: Option<HistoryAnchor>,
    direction: HistoryDirection,
    limit: usize,
) -> Result<Vec<Message>, ChatError> {
    let request = Request::LoadMessages {
        channel_url: channel_url.clone(),
        anchor,
        direction,
        limit,
    };
    match client.round_trip(request).await? {
        Response::Messages(messages) => Ok(messages),
        other => Err(unexpected_response("messages", &other)),
    }
}

fn anchor_of(message: &Message) -> Option<HistoryAnchor> {
    message.created_at.map(|created_at| HistoryAnchor {
        created_at,
        message_id: message.message_id,
    })
}

/// Pages through a channel's history, newest first.
///
/// A cursor belongs to its creator; advancing takes `&mut self`. It is
/// exhausted once a page comes back shorter than the page size.
pub struct HistoryCursor {
    client: Arc<ClientInner>,
    channel_url: ChannelUrl,
    page_size: usize,
    oldest: Option<HistoryAnchor>,
    exhausted: bool,
}

impl HistoryCursor {
    pub(crate) fn new(client: Arc<ClientInner>, channel_url: ChannelUrl) -> Self {
        let page_size = client.config.history_page_size;
        Self {
            client,
            channel_url,
            page_size,
            oldest: None,
            exhausted: false,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn has_more(&self) -> bool {
        !self.exhausted
    }

    /// Fetch the next page, ordered by descending creation time. Returns an
    /// empty page once exhausted. A failed fetch leaves the cursor where it
    /// was.
    pub async fn next_page(&mut self) -> Result<Vec<Message>, ChatError> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let mut page = load(
            &self.client,
            &self.channel_url,
            self.oldest,
            HistoryDirection::Previous,
            self.page_size,
        )
        .await?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.first().and_then(anchor_of) {
            Some(anchor) => self.oldest = Some(anchor),
            None => self.exhausted = true,
        }

        debug!(
            channel = %self.channel_url,
            fetched = page.len(),
            exhausted = self.exhausted,
            "History page loaded"
        );
        page.reverse();
        Ok(page)
    }

    /// Start again from the newest message.
    pub fn reset(&mut self) {
        self.oldest = None;
        self.exhausted = false;
    }
}

/// Loads messages around an anchor timestamp. One load may be in flight at a
/// time.
pub struct MessageListQuery {
    client: Arc<ClientInner>,
    channel_url: ChannelUrl,
    loading: AtomicBool,
}

/// Clears the loading flag when a load finishes or is dropped.
struct LoadGuard<'a>(&'a AtomicBool);

impl<'a> LoadGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ChatError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| ChatError::validation("a load is already in progress on this query"))
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MessageListQuery {
    pub(crate) fn new(client: Arc<ClientInner>, channel_url: ChannelUrl) -> Self {
        Self {
            client,
            channel_url,
            loading: AtomicBool::new(false),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    /// Up to `limit` messages created before `anchor`. Oldest first unless
    /// `reverse`.
    pub async fn load_previous(
        &self,
        anchor: DateTime<Utc>,
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<Message>, ChatError> {
        self.load(HistoryDirection::Previous, anchor, limit, reverse).await
    }

    /// Up to `limit` messages created after `anchor`. Oldest first unless
    /// `reverse`.
    pub async fn load_next(
        &self,
        anchor: DateTime<Utc>,
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<Message>, ChatError> {
        self.load(HistoryDirection::Next, anchor, limit, reverse).await
    }

    async fn load(
        &self,
        direction: HistoryDirection,
        anchor: DateTime<Utc>,
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<Message>, ChatError> {
        if limit == 0 || limit > MAX_HISTORY_PAGE_SIZE {
            return Err(ChatError::validation(format!(
                "limit must be between 1 and {MAX_HISTORY_PAGE_SIZE}, got {limit}"
            )));
        }
        let _guard = LoadGuard::acquire(&self.loading)?;

        let anchor = HistoryAnchor {
            created_at: anchor,
            message_id: None,
        };
        let mut messages = load(&self.client, &self.channel_url, Some(anchor), direction, limit).await?;
        if reverse {
            messages.reverse();
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use parley_net::LoopbackServer;
    use parley_shared::{ChannelInfo, ChannelKind, ErrorKind, MessageBody, Sender, UserId};

    use crate::client::{ChannelHandle, ChatClient, Collaborators};
    use crate::config::ClientConfig;

    use super::*;

    /// A channel holding messages "m0".."m{count-1}", created at 1000 + i ms.
    fn seeded(count: usize, page_size: usize) -> (LoopbackServer, ChannelHandle) {
        let server = LoopbackServer::new().starting_clock(1_000);
        let url = ChannelUrl::new("history");
        server.create_channel(ChannelInfo {
            created_at: DateTime::from_timestamp_millis(1),
            ..ChannelInfo::new(url.clone(), ChannelKind::Open)
        });
        for i in 0..count {
            server
                .insert_message(&url, None, MessageBody::Admin { text: format!("m{i}") })
                .unwrap();
        }
        let client = ChatClient::new(
            ClientConfig {
                history_page_size: page_size,
                ..ClientConfig::default()
            },
            Collaborators::from_loopback(server.connect(Sender::new(UserId::new("alice")))),
        );
        (server, client.channel(url))
    }

    fn texts(messages: &[Message]) -> Vec<&str> {
        messages.iter().filter_map(Message::text).collect()
    }

    #[tokio::test]
    async fn test_cursor_pages_newest_first_until_short_page() {
        let (_server, channel) = seeded(5, 2);
        let mut cursor = channel.create_history_cursor();

        assert_eq!(texts(&cursor.next_page().await.unwrap()), vec!["m4", "m3"]);
        assert_eq!(texts(&cursor.next_page().await.unwrap()), vec!["m2", "m1"]);
        assert!(cursor.has_more());
        assert_eq!(texts(&cursor.next_page().await.unwrap()), vec!["m0"]);
        assert!(!cursor.has_more());
        assert!(cursor.next_page().await.unwrap().is_empty());

        cursor.reset();
        assert_eq!(texts(&cursor.next_page().await.unwrap()), vec!["m4", "m3"]);
    }

    #[tokio::test]
    async fn test_cursor_exact_multiple_ends_with_empty_page() {
        let (_server, channel) = seeded(4, 2);
        let mut cursor = channel.create_history_cursor();

        cursor.next_page().await.unwrap();
        cursor.next_page().await.unwrap();
        assert!(cursor.has_more());
        assert!(cursor.next_page().await.unwrap().is_empty());
        assert!(!cursor.has_more());
    }

    #[tokio::test]
    async fn test_cursor_failure_keeps_position() {
        let (server, channel) = seeded(3, 2);
        let mut cursor = channel.create_history_cursor();
        cursor.next_page().await.unwrap();

        server.fail_next(ChatError::transport("flaky", true));
        assert!(cursor.next_page().await.is_err());
        assert!(cursor.has_more());
        assert_eq!(texts(&cursor.next_page().await.unwrap()), vec!["m0"]);
    }

    #[tokio::test]
    async fn test_cursors_are_independent() {
        let (_server, channel) = seeded(3, 2);
        let mut first = channel.create_history_cursor();
        let mut second = channel.create_history_cursor();

        first.next_page().await.unwrap();
        assert_eq!(texts(&second.next_page().await.unwrap()), vec!["m2", "m1"]);
    }

    #[tokio::test]
    async fn test_list_query_around_anchor() {
        let (_server, channel) = seeded(6, 30);
        let query = channel.create_message_list_query();
        let anchor = DateTime::from_timestamp_millis(1_003).unwrap();

        let previous = query.load_previous(anchor, 2, false).await.unwrap();
        assert_eq!(texts(&previous), vec!["m1", "m2"]);

        let next = query.load_next(anchor, 10, true).await.unwrap();
        assert_eq!(texts(&next), vec!["m5", "m4"]);

        let err = query.load_next(anchor, 0, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_list_query_rejects_concurrent_load() {
        let (server, channel) = seeded(3, 30);
        let query = Arc::new(channel.create_message_list_query());
        let anchor = DateTime::from_timestamp_millis(2_000).unwrap();
        server.pause();

        let background = query.clone();
        let first = tokio::spawn(async move { background.load_previous(anchor, 10, false).await });
        while !query.is_loading() {
            tokio::task::yield_now().await;
        }

        let err = query.load_previous(anchor, 10, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        server.resume();
        assert_eq!(first.await.unwrap().unwrap().len(), 3);
        assert!(!query.is_loading());
    }
}
