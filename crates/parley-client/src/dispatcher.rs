//! Fan-out of channel events to registered observers.
//!
//! Observers run synchronously, in registration order, on the client event
//! loop. A failing or panicking observer is logged and skipped; it never
//! stops delivery to the others.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, trace, warn};

use parley_shared::{ChannelEvent, EventCategory};

/// Receives channel events. Handlers should return quickly and hand longer
/// work to their own tasks.
pub trait ChannelObserver: Send + Sync {
    /// Categories this observer wants. Defaults to every category.
    fn interests(&self) -> &[EventCategory] {
        &EventCategory::ALL
    }

    fn on_event(&self, event: &ChannelEvent) -> anyhow::Result<()>;
}

impl<F> ChannelObserver for F
where
    F: Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &ChannelEvent) -> anyhow::Result<()> {
        self(event)
    }
}

struct Registration {
    id: String,
    observer: Arc<dyn ChannelObserver>,
}

#[derive(Default)]
pub struct EventDispatcher {
    registrations: Vec<Registration>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` under `id`. Re-using an ID replaces the previous
    /// observer in place, keeping its position in the delivery order.
    pub fn subscribe(&mut self, id: impl Into<String>, observer: Arc<dyn ChannelObserver>) {
        let id = id.into();
        match self.registrations.iter_mut().find(|r| r.id == id) {
            Some(existing) => existing.observer = observer,
            None => self.registrations.push(Registration { id, observer }),
        }
    }

    /// Remove the observer registered under `id`. Unknown IDs are a no-op.
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        before != self.registrations.len()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Deliver `event` to every interested observer. Returns how many handled
    /// it successfully.
    pub fn dispatch(&self, event: &ChannelEvent) -> usize {
        let category = event.category();
        let mut delivered = 0;

        for reg in &self.registrations {
            if !reg.observer.interests().contains(&category) {
                continue;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| reg.observer.on_event(event)));
            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(observer = %reg.id, ?category, error = %e, "Observer failed, continuing");
                }
                Err(_) => {
                    error!(observer = %reg.id, ?category, "Observer panicked, continuing");
                }
            }
        }

        trace!(?category, channel = %event.channel_url(), delivered, "Event dispatched");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use parley_shared::{ChannelUrl, MessageId};

    use super::*;

    struct Recorder {
        seen: Mutex<Vec<i64>>,
        fail_on: Option<i64>,
        interests: Vec<EventCategory>,
    }

    impl Recorder {
        fn new(fail_on: Option<i64>) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_on,
                interests: EventCategory::ALL.to_vec(),
            })
        }

        fn seen(&self) -> Vec<i64> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ChannelObserver for Recorder {
        fn interests(&self) -> &[EventCategory] {
            &self.interests
        }

        fn on_event(&self, event: &ChannelEvent) -> anyhow::Result<()> {
            let ChannelEvent::MessageDeleted { message_id, .. } = event else {
                return Ok(());
            };
            self.seen.lock().unwrap().push(message_id.0);
            if Some(message_id.0) == self.fail_on {
                anyhow::bail!("observer rejected {message_id}");
            }
            Ok(())
        }
    }

    fn deleted(id: i64) -> ChannelEvent {
        ChannelEvent::MessageDeleted {
            channel_url: ChannelUrl::new("c1"),
            message_id: MessageId(id),
        }
    }

    #[test]
    fn test_failing_observer_does_not_block_others() {
        let mut dispatcher = EventDispatcher::new();
        let flaky = Recorder::new(Some(2));
        let steady = Recorder::new(None);
        dispatcher.subscribe("flaky", flaky.clone());
        dispatcher.subscribe("steady", steady.clone());

        for id in 1..=3 {
            dispatcher.dispatch(&deleted(id));
        }

        assert_eq!(flaky.seen(), vec![1, 2, 3]);
        assert_eq!(steady.seen(), vec![1, 2, 3]);
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let mut dispatcher = EventDispatcher::new();
        let steady = Recorder::new(None);
        dispatcher.subscribe(
            "panics",
            Arc::new(|_: &ChannelEvent| -> anyhow::Result<()> { panic!("boom") }),
        );
        dispatcher.subscribe("steady", steady.clone());

        assert_eq!(dispatcher.dispatch(&deleted(1)), 1);
        assert_eq!(steady.seen(), vec![1]);
    }

    #[test]
    fn test_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        for name in ["a", "b", "c"] {
            let order = order.clone();
            dispatcher.subscribe(
                name,
                Arc::new(move |_: &ChannelEvent| -> anyhow::Result<()> {
                    order.lock().unwrap().push(name);
                    Ok(())
                }),
            );
        }

        dispatcher.dispatch(&deleted(1));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_interest_filter() {
        let mut dispatcher = EventDispatcher::new();
        let typing_only = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_on: None,
            interests: vec![EventCategory::Typing],
        });
        dispatcher.subscribe("typing", typing_only.clone());

        assert_eq!(dispatcher.dispatch(&deleted(1)), 0);
        assert!(typing_only.seen().is_empty());
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.subscribe("a", Recorder::new(None));

        assert!(dispatcher.unsubscribe("a"));
        assert!(!dispatcher.unsubscribe("a"));
        assert!(!dispatcher.unsubscribe("never-registered"));
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_resubscribe_replaces_in_place() {
        let mut dispatcher = EventDispatcher::new();
        let old = Recorder::new(None);
        let new = Recorder::new(None);
        dispatcher.subscribe("a", old.clone());
        dispatcher.subscribe("b", Recorder::new(None));
        dispatcher.subscribe("a", new.clone());

        dispatcher.dispatch(&deleted(9));
        assert_eq!(dispatcher.len(), 2);
        assert!(old.seen().is_empty());
        assert_eq!(new.seen(), vec![9]);
    }
}
