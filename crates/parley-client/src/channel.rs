//! Live channel instances and the registry that keeps exactly one per URL.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use parley_shared::{ChannelInfo, ChannelKind, ChannelUrl};

/// A channel as known to this client: server attributes plus cached
/// metadata and counters. Caches change only when a server response or a
/// server push says so.
#[derive(Debug)]
pub struct Channel {
    url: ChannelUrl,
    info: RwLock<ChannelInfo>,
    meta_data: RwLock<BTreeMap<String, String>>,
    meta_counters: RwLock<BTreeMap<String, i64>>,
}

impl Channel {
    fn new(info: ChannelInfo) -> Self {
        Self {
            url: info.url.clone(),
            info: RwLock::new(info),
            meta_data: RwLock::new(BTreeMap::new()),
            meta_counters: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn url(&self) -> &ChannelUrl {
        &self.url
    }

    /// Snapshot of the current attributes.
    pub fn info(&self) -> ChannelInfo {
        read(&self.info).clone()
    }

    pub fn name(&self) -> String {
        read(&self.info).name.clone()
    }

    pub fn kind(&self) -> ChannelKind {
        read(&self.info).kind
    }

    pub fn is_open(&self) -> bool {
        read(&self.info).is_open()
    }

    pub fn is_group(&self) -> bool {
        read(&self.info).is_group()
    }

    pub fn is_frozen(&self) -> bool {
        read(&self.info).frozen
    }

    pub fn cached_meta_data(&self) -> BTreeMap<String, String> {
        read(&self.meta_data).clone()
    }

    pub fn cached_meta_counters(&self) -> BTreeMap<String, i64> {
        read(&self.meta_counters).clone()
    }

    pub(crate) fn apply_info(&self, newer: ChannelInfo) {
        write(&self.info).merge_from(newer);
    }

    pub(crate) fn set_frozen(&self, frozen: bool) {
        write(&self.info).frozen = frozen;
    }

    pub(crate) fn meta_data_cache(&self) -> &RwLock<BTreeMap<String, String>> {
        &self.meta_data
    }

    pub(crate) fn meta_counters_cache(&self) -> &RwLock<BTreeMap<String, i64>> {
        &self.meta_counters
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Apply a store change to a cached map.
pub(crate) fn merge_into<V: Clone>(
    cache: &RwLock<BTreeMap<String, V>>,
    upserted: &BTreeMap<String, V>,
    removed: &[String],
) {
    let mut cache = write(cache);
    cache.extend(upserted.iter().map(|(k, v)| (k.clone(), v.clone())));
    for key in removed {
        cache.remove(key);
    }
}

/// Process-wide map of URL to live channel. Injected into the client rather
/// than reached through a global.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<ChannelUrl, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live instance for `url`, creating a placeholder if none exists.
    pub fn get_or_create(&self, url: &ChannelUrl) -> Arc<Channel> {
        self.lock()
            .entry(url.clone())
            .or_insert_with(|| {
                debug!(channel = %url, "Channel instance created");
                Arc::new(Channel::new(ChannelInfo::new(url.clone(), ChannelKind::default())))
            })
            .clone()
    }

    pub fn get(&self, url: &ChannelUrl) -> Option<Arc<Channel>> {
        self.lock().get(url).cloned()
    }

    /// Fold server attributes into the live instance, creating it if needed.
    pub fn upsert(&self, info: ChannelInfo) -> Arc<Channel> {
        let mut channels = self.lock();
        match channels.get(&info.url) {
            Some(existing) => {
                existing.apply_info(info);
                existing.clone()
            }
            None => {
                let channel = Arc::new(Channel::new(info));
                channels.insert(channel.url().clone(), channel.clone());
                channel
            }
        }
    }

    pub fn evict(&self, url: &ChannelUrl) -> Option<Arc<Channel>> {
        let removed = self.lock().remove(url);
        if removed.is_some() {
            debug!(channel = %url, "Channel instance evicted");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelUrl, Arc<Channel>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    #[test]
    fn test_single_instance_per_url() {
        let registry = ChannelRegistry::new();
        let url = ChannelUrl::new("group_1");

        let a = registry.get_or_create(&url);
        let b = registry.get_or_create(&url);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_upsert_updates_live_instance() {
        let registry = ChannelRegistry::new();
        let url = ChannelUrl::new("open_1");
        let held = registry.get_or_create(&url);

        let mut info = ChannelInfo::new(url.clone(), ChannelKind::Open);
        info.name = "Lobby".into();
        info.created_at = DateTime::from_timestamp_millis(5_000);
        let returned = registry.upsert(info);

        assert!(Arc::ptr_eq(&held, &returned));
        assert_eq!(held.name(), "Lobby");
        assert!(held.is_open());
        assert_eq!(held.info().created_at.unwrap().timestamp_millis(), 5_000);
    }

    #[test]
    fn test_evict_then_recreate_is_fresh() {
        let registry = ChannelRegistry::new();
        let url = ChannelUrl::new("c1");
        let first = registry.get_or_create(&url);

        assert!(registry.evict(&url).is_some());
        assert!(registry.evict(&url).is_none());
        let second = registry.get_or_create(&url);
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
