//! Channel-scoped metadata and counters.
//!
//! Both maps live in the remote store. Every operation round-trips through
//! the transport and the channel's cached copy changes only after a
//! successful response. Counters additionally support atomic increase and
//! decrease; the cache takes the value the store computed.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use tracing::debug;

use parley_shared::{ChannelUrl, ChatError, CounterDelta, MetaOp, Request, Response};

use crate::channel::{merge_into, read, write, Channel};
use crate::client::{unexpected_response, ClientInner};

mod sealed {
    pub trait Sealed {}
    impl Sealed for String {}
    impl Sealed for i64 {}
}

/// Value type of a channel-scoped store: `String` for metadata, `i64` for
/// counters.
pub trait MetaValue: sealed::Sealed + Clone + Debug + Send + Sync + 'static {
    /// Name used in log fields.
    const LABEL: &'static str;

    #[doc(hidden)]
    fn request(channel_url: ChannelUrl, op: MetaOp<Self>) -> Request;

    /// `None` for an acknowledgment without values.
    #[doc(hidden)]
    fn extract(response: Response) -> Result<Option<BTreeMap<String, Self>>, ChatError>;

    #[doc(hidden)]
    fn cache(channel: &Channel) -> &RwLock<BTreeMap<String, Self>>;
}

impl MetaValue for String {
    const LABEL: &'static str = "meta_data";

    fn request(channel_url: ChannelUrl, op: MetaOp<Self>) -> Request {
        Request::MetaData { channel_url, op }
    }

    fn extract(response: Response) -> Result<Option<BTreeMap<String, Self>>, ChatError> {
        match response {
            Response::MetaData(values) => Ok(Some(values)),
            Response::Ack => Ok(None),
            other => Err(unexpected_response("meta data", &other)),
        }
    }

    fn cache(channel: &Channel) -> &RwLock<BTreeMap<String, Self>> {
        channel.meta_data_cache()
    }
}

impl MetaValue for i64 {
    const LABEL: &'static str = "meta_counters";

    fn request(channel_url: ChannelUrl, op: MetaOp<Self>) -> Request {
        Request::MetaCounters { channel_url, op }
    }

    fn extract(response: Response) -> Result<Option<BTreeMap<String, Self>>, ChatError> {
        match response {
            Response::MetaCounters(values) => Ok(Some(values)),
            Response::Ack => Ok(None),
            other => Err(unexpected_response("meta counters", &other)),
        }
    }

    fn cache(channel: &Channel) -> &RwLock<BTreeMap<String, Self>> {
        channel.meta_counters_cache()
    }
}

/// Proxy for one channel's metadata (`MetaStore<String>`) or counters
/// (`MetaStore<i64>`).
pub struct MetaStore<V> {
    client: Arc<ClientInner>,
    channel: Arc<Channel>,
    _value: PhantomData<V>,
}

impl<V: MetaValue> MetaStore<V> {
    pub(crate) fn new(client: Arc<ClientInner>, channel: Arc<Channel>) -> Self {
        Self {
            client,
            channel,
            _value: PhantomData,
        }
    }

    /// Add new keys. Fails with `Conflict`, changing nothing, if any key
    /// already exists.
    pub async fn create(&self, values: BTreeMap<String, V>) -> Result<BTreeMap<String, V>, ChatError> {
        validate_entries(&values)?;
        let stored = self.expect_values(MetaOp::Create(values)).await?;
        merge_into(V::cache(&self.channel), &stored, &[]);
        Ok(stored)
    }

    /// Read `keys`, or the whole map when `keys` is empty.
    pub async fn get<I, S>(&self, keys: I) -> Result<BTreeMap<String, V>, ChatError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return self.get_all().await;
        }
        validate_keys(keys.iter())?;

        let values = self.expect_values(MetaOp::Get(keys.clone())).await?;
        let absent: Vec<String> = keys.into_iter().filter(|k| !values.contains_key(k)).collect();
        merge_into(V::cache(&self.channel), &values, &absent);
        Ok(values)
    }

    /// Read the whole map, replacing the cache.
    pub async fn get_all(&self) -> Result<BTreeMap<String, V>, ChatError> {
        let values = self.expect_values(MetaOp::GetAll).await?;
        *write(V::cache(&self.channel)) = values.clone();
        debug!(store = V::LABEL, channel = %self.channel.url(), keys = values.len(), "Cache refreshed");
        Ok(values)
    }

    /// Overwrite existing keys. Fails with `NotFound`, changing nothing, if
    /// any key is absent.
    pub async fn update(&self, values: BTreeMap<String, V>) -> Result<BTreeMap<String, V>, ChatError> {
        validate_entries(&values)?;
        let stored = self.expect_values(MetaOp::Update(values)).await?;
        merge_into(V::cache(&self.channel), &stored, &[]);
        Ok(stored)
    }

    /// Remove `key`. Removing an absent key succeeds.
    pub async fn delete_key(&self, key: &str) -> Result<(), ChatError> {
        validate_keys([key].into_iter())?;
        self.expect_ack(MetaOp::DeleteKey(key.to_string())).await?;
        write(V::cache(&self.channel)).remove(key);
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<(), ChatError> {
        self.expect_ack(MetaOp::DeleteAll).await?;
        write(V::cache(&self.channel)).clear();
        Ok(())
    }

    /// The locally cached copy as of the last successful response or push.
    pub fn cached(&self) -> BTreeMap<String, V> {
        read(V::cache(&self.channel)).clone()
    }

    async fn submit(&self, op: MetaOp<V>) -> Result<Option<BTreeMap<String, V>>, ChatError> {
        let request = V::request(self.channel.url().clone(), op);
        V::extract(self.client.round_trip(request).await?)
    }

    async fn expect_values(&self, op: MetaOp<V>) -> Result<BTreeMap<String, V>, ChatError> {
        self.submit(op)
            .await?
            .ok_or_else(|| ChatError::transport(format!("{} returned no values", V::LABEL), false))
    }

    async fn expect_ack(&self, op: MetaOp<V>) -> Result<(), ChatError> {
        match self.submit(op).await? {
            None => Ok(()),
            Some(_) => Err(ChatError::transport(
                format!("{} returned values for a delete", V::LABEL),
                false,
            )),
        }
    }
}

impl MetaStore<i64> {
    /// Add each delta to its counter. The returned and cached values are the
    /// ones computed by the store.
    pub async fn increase(&self, deltas: BTreeMap<String, i64>) -> Result<BTreeMap<String, i64>, ChatError> {
        self.adjust(CounterDelta::Increase, deltas).await
    }

    /// Subtract each delta from its counter.
    pub async fn decrease(&self, deltas: BTreeMap<String, i64>) -> Result<BTreeMap<String, i64>, ChatError> {
        self.adjust(CounterDelta::Decrease, deltas).await
    }

    async fn adjust(
        &self,
        delta: CounterDelta,
        values: BTreeMap<String, i64>,
    ) -> Result<BTreeMap<String, i64>, ChatError> {
        validate_entries(&values)?;
        if let Some((key, amount)) = values.iter().find(|(_, amount)| **amount < 0) {
            return Err(ChatError::validation(format!(
                "delta for '{key}' is negative ({amount}); use the opposite operation"
            )));
        }

        let request = Request::AdjustCounters {
            channel_url: self.channel.url().clone(),
            delta,
            values,
        };
        let computed = match self.client.round_trip(request).await? {
            Response::MetaCounters(computed) => computed,
            other => return Err(unexpected_response("meta counters", &other)),
        };
        merge_into(self.channel.meta_counters_cache(), &computed, &[]);
        debug!(channel = %self.channel.url(), ?delta, ?computed, "Counters adjusted");
        Ok(computed)
    }
}

fn validate_entries<V>(values: &BTreeMap<String, V>) -> Result<(), ChatError> {
    if values.is_empty() {
        return Err(ChatError::validation("at least one key is required"));
    }
    validate_keys(values.keys().map(String::as_str))
}

fn validate_keys<S: AsRef<str>>(keys: impl Iterator<Item = S>) -> Result<(), ChatError> {
    for key in keys {
        if key.as_ref().trim().is_empty() {
            return Err(ChatError::validation("keys must not be empty"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use parley_net::LoopbackServer;
    use parley_shared::{ChannelInfo, ChannelKind, ErrorKind, Sender, UserId};

    use crate::client::{ChannelHandle, ChatClient, Collaborators};
    use crate::config::ClientConfig;

    use super::*;

    fn setup() -> (LoopbackServer, ChannelHandle) {
        let server = LoopbackServer::new();
        let url = ChannelUrl::new("group_1");
        server.create_channel(ChannelInfo::new(url.clone(), ChannelKind::Group));
        let client = ChatClient::new(
            ClientConfig::default(),
            Collaborators::from_loopback(server.connect(Sender::new(UserId::new("alice")))),
        );
        (server, client.channel(url))
    }

    fn strings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn counts(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn test_create_conflict_is_all_or_nothing() {
        let (server, channel) = setup();
        let meta = channel.meta_data();

        meta.create(strings(&[("topic", "rust")])).await.unwrap();
        let err = meta
            .create(strings(&[("topic", "go"), ("mood", "calm")]))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(server.meta_data(channel.url()), strings(&[("topic", "rust")]));
        assert_eq!(meta.cached(), strings(&[("topic", "rust")]));
    }

    #[tokio::test]
    async fn test_update_requires_existing_keys() {
        let (server, channel) = setup();
        let meta = channel.meta_data();
        meta.create(strings(&[("a", "1")])).await.unwrap();

        let err = meta
            .update(strings(&[("a", "2"), ("b", "3")]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(server.meta_data(channel.url()), strings(&[("a", "1")]));

        meta.update(strings(&[("a", "2")])).await.unwrap();
        assert_eq!(meta.cached(), strings(&[("a", "2")]));
    }

    #[tokio::test]
    async fn test_get_empty_keys_equals_get_all() {
        let (_server, channel) = setup();
        let meta = channel.meta_data();
        meta.create(strings(&[("a", "1"), ("b", "2")])).await.unwrap();

        let by_empty = meta.get(Vec::<String>::new()).await.unwrap();
        let all = meta.get_all().await.unwrap();
        assert_eq!(by_empty, all);

        let some = meta.get(["a", "missing"]).await.unwrap();
        assert_eq!(some, strings(&[("a", "1")]));
    }

    #[tokio::test]
    async fn test_get_all_known_keys_matches_get_all() {
        let (_server, channel) = setup();
        let meta = channel.meta_data();
        meta.create(strings(&[("a", "1"), ("b", "2"), ("c", "3")])).await.unwrap();
        let counters = channel.meta_counters();
        counters.create(counts(&[("likes", 4), ("views", 9)])).await.unwrap();

        let all = meta.get_all().await.unwrap();
        let by_keys = meta.get(all.keys().cloned()).await.unwrap();
        assert_eq!(by_keys, all);
        assert_eq!(meta.cached(), all);

        let all_counts = counters.get_all().await.unwrap();
        let counts_by_keys = counters.get(all_counts.keys().cloned()).await.unwrap();
        assert_eq!(counts_by_keys, all_counts);
        assert_eq!(counters.cached(), all_counts);
    }

    #[tokio::test]
    async fn test_delete_key_is_idempotent() {
        let (_server, channel) = setup();
        let meta = channel.meta_data();
        meta.create(strings(&[("a", "1"), ("b", "2")])).await.unwrap();

        meta.delete_key("a").await.unwrap();
        meta.delete_key("a").await.unwrap();
        meta.delete_key("never-existed").await.unwrap();
        assert_eq!(meta.cached(), strings(&[("b", "2")]));

        meta.delete_all().await.unwrap();
        assert!(meta.cached().is_empty());
        assert!(meta.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_operation_leaves_cache_untouched() {
        let (server, channel) = setup();
        let meta = channel.meta_data();
        meta.create(strings(&[("a", "1")])).await.unwrap();

        server.fail_next(ChatError::transport("unavailable", true));
        assert!(meta.update(strings(&[("a", "2")])).await.is_err());
        assert_eq!(meta.cached(), strings(&[("a", "1")]));
    }

    #[tokio::test]
    async fn test_increase_reflects_store_value() {
        let (server, channel) = setup();
        let counters = channel.meta_counters();
        counters.create(counts(&[("likes", 0)])).await.unwrap();

        // Another writer moves the counter behind our back.
        server.set_meta_counter(channel.url(), "likes", 5);

        let result = counters.increase(counts(&[("likes", 1)])).await.unwrap();
        assert_eq!(result, counts(&[("likes", 6)]));
        assert_eq!(counters.cached(), counts(&[("likes", 6)]));

        let result = counters.decrease(counts(&[("likes", 2)])).await.unwrap();
        assert_eq!(result, counts(&[("likes", 4)]));
    }

    #[tokio::test]
    async fn test_counter_validation() {
        let (server, channel) = setup();
        let counters = channel.meta_counters();

        let err = counters.increase(BTreeMap::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = counters.increase(counts(&[("likes", -1)])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = counters.create(counts(&[(" ", 1)])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(server.operations().is_empty());

        let err = counters.increase(counts(&[("unknown", 1)])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
