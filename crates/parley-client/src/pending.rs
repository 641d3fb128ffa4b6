//! Request identifiers and the registry of sends awaiting acknowledgment.
//!
//! The registry is owned by the client event loop and is never touched from
//! a transport task directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use uuid::Uuid;

use parley_net::UploadProgress;
use parley_shared::{Message, RequestId};

use crate::pipeline::{ProgressSink, SendResult};

/// Generates request IDs that never repeat within the process.
///
/// Each generator draws a random prefix so IDs from different clients are
/// distinguishable; the suffix is a monotonically increasing sequence.
#[derive(Debug)]
pub struct RequestIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        let mut prefix = Uuid::new_v4().simple().to_string();
        prefix.truncate(12);
        Self {
            prefix,
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        RequestId(format!("{}-{seq}", self.prefix))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A send between submission and its terminal outcome.
pub(crate) struct PendingEntry {
    pub request_id: RequestId,
    /// The provisional message handed back to the caller.
    pub message: Message,
    pub progress: Option<ProgressSink>,
    pub completion: oneshot::Sender<SendResult>,
    /// Releases the delivery task once the entry is registered. Dropping it
    /// unsent makes the task exit without touching the transport.
    pub start: Option<oneshot::Sender<()>>,
    pub abort: Option<AbortHandle>,
}

impl PendingEntry {
    pub fn report_progress(&mut self, progress: UploadProgress) {
        if let Some(sink) = self.progress.as_mut() {
            sink(progress);
        }
    }

    /// Deliver the terminal outcome. The caller may have dropped its handle;
    /// that is not an error.
    pub fn complete(self, outcome: SendResult) {
        let _ = self.completion.send(outcome);
    }

    /// Stop the delivery task, whether or not it has been released yet.
    pub fn abort(&mut self) {
        self.start = None;
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

/// Live pending entries keyed by request ID. At most one per ID; every entry
/// is removed exactly once.
#[derive(Default)]
pub(crate) struct PendingRegistry {
    entries: HashMap<RequestId, PendingEntry>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry. A duplicate ID is refused and the entry returned.
    pub fn insert(&mut self, entry: PendingEntry) -> Result<(), PendingEntry> {
        if self.entries.contains_key(&entry.request_id) {
            return Err(entry);
        }
        self.entries.insert(entry.request_id.clone(), entry);
        Ok(())
    }

    pub fn get_mut(&mut self, request_id: &RequestId) -> Option<&mut PendingEntry> {
        self.entries.get_mut(request_id)
    }

    pub fn remove(&mut self, request_id: &RequestId) -> Option<PendingEntry> {
        self.entries.remove(request_id)
    }

    /// Remove every live entry.
    pub fn drain(&mut self) -> Vec<PendingEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};

    use parley_shared::{ChannelUrl, MessageBody};

    use super::*;

    fn entry(id: &RequestId) -> (PendingEntry, oneshot::Receiver<SendResult>) {
        let (tx, rx) = oneshot::channel();
        let message = Message::pending(
            id.clone(),
            ChannelUrl::new("c1"),
            MessageBody::User {
                text: "hi".into(),
                translations: BTreeMap::new(),
            },
            None,
        );
        (
            PendingEntry {
                request_id: id.clone(),
                message,
                progress: None,
                completion: tx,
                start: None,
                abort: None,
            },
            rx,
        )
    }

    #[test]
    fn test_request_ids_are_unique() {
        let ids = RequestIdGenerator::new();
        let seen: HashSet<RequestId> = (0..1_000).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 1_000);
    }

    #[test]
    fn test_generators_do_not_collide() {
        let a = RequestIdGenerator::new();
        let b = RequestIdGenerator::new();
        assert_ne!(a.next_id(), b.next_id());
    }

    #[test]
    fn test_duplicate_entry_refused() {
        let mut registry = PendingRegistry::new();
        let id = RequestId("r1".into());
        let (first, _rx1) = entry(&id);
        let (second, _rx2) = entry(&id);

        assert!(registry.insert(first).is_ok());
        assert!(registry.insert(second).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_entry_removed_exactly_once() {
        let mut registry = PendingRegistry::new();
        let id = RequestId("r1".into());
        let (e, _rx) = entry(&id);
        registry.insert(e).ok();

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_progress_reaches_sink() {
        let id = RequestId("r1".into());
        let (mut e, _rx) = entry(&id);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        e.progress = Some(Box::new(move |p| {
            let _ = tx.send(p.total_bytes_sent);
        }));

        e.report_progress(UploadProgress {
            bytes_sent: 3,
            total_bytes_sent: 3,
            total_bytes_expected: 9,
        });
        assert_eq!(rx.recv().await, Some(3));
    }
}
