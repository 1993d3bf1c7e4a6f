//! Event dispatcher: fans out index mutations to `WatchLargeFiles`/
//! `WatchTree` subscribers, one bounded channel per subscription
//! (spec.md §4.6).

use dashmap::DashMap;
use sizewatch_core::ChangeEvent;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 100;
pub const DEFAULT_LAG_CANCEL_THRESHOLD: u32 = 256;

/// A single item delivered to a subscriber. `lagging` is set on the first
/// successful send after one or more drops, so the client learns it may
/// have missed events and should re-sync with a fresh snapshot RPC.
#[derive(Debug, Clone)]
pub struct DispatchedEvent {
    pub event: ChangeEvent,
    pub lagging: bool,
}

struct SubscriberEntry {
    root: PathBuf,
    tx: mpsc::Sender<DispatchedEvent>,
    consecutive_drops: AtomicU32,
}

/// A live subscription. Dropping it unregisters the subscriber from the
/// dispatcher so `publish` stops doing wasted work on a channel nobody is
/// draining.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<DispatchedEvent>,
    dispatcher: Arc<EventDispatcherInner>,
}

impl Subscription {
    /// True if the dispatcher terminated this subscription for persistent
    /// lag (spec.md's `CANCELLED_LAGGING`) rather than the caller dropping
    /// it voluntarily. Meaningful once `rx.recv()` has returned `None`.
    pub fn lag_cancelled(&self) -> bool {
        self.dispatcher.lag_cancelled.contains_key(&self.id)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.id);
    }
}

struct EventDispatcherInner {
    next_id: AtomicU64,
    subscriptions: DashMap<u64, SubscriberEntry>,
    by_root: DashMap<PathBuf, Vec<u64>>,
    lag_cancelled: DashMap<u64, ()>,
    default_buffer: usize,
    lag_cancel_threshold: u32,
}

/// Shared handle; clone freely (cheap `Arc` underneath).
#[derive(Clone)]
pub struct EventDispatcher(Arc<EventDispatcherInner>);

impl Default for EventDispatcher {
    fn default() -> Self {
        EventDispatcher::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        EventDispatcher::with_limits(DEFAULT_SUBSCRIPTION_BUFFER, DEFAULT_LAG_CANCEL_THRESHOLD)
    }

    /// Build a dispatcher with a caller-supplied default buffer size and
    /// consecutive-drop cancellation threshold, overriding the defaults
    /// above.
    pub fn with_limits(default_buffer: usize, lag_cancel_threshold: u32) -> Self {
        EventDispatcher(Arc::new(EventDispatcherInner {
            next_id: AtomicU64::new(1),
            subscriptions: DashMap::new(),
            by_root: DashMap::new(),
            lag_cancelled: DashMap::new(),
            default_buffer: default_buffer.max(1),
            lag_cancel_threshold: lag_cancel_threshold.max(1),
        }))
    }

    pub fn subscribe(&self, root: PathBuf) -> Subscription {
        let buffer = self.0.default_buffer;
        self.subscribe_with_buffer(root, buffer)
    }

    pub fn subscribe_with_buffer(&self, root: PathBuf, buffer: usize) -> Subscription {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer.max(1));

        self.0.subscriptions.insert(
            id,
            SubscriberEntry {
                root: root.clone(),
                tx,
                consecutive_drops: AtomicU32::new(0),
            },
        );
        self.0.by_root.entry(root).or_default().push(id);

        Subscription {
            id,
            rx,
            dispatcher: Arc::clone(&self.0),
        }
    }

    /// Deliver `event` to every live subscription on `root`. FIFO per
    /// subscription is preserved because each subscriber has its own
    /// channel; there is no ordering guarantee across subscribers.
    pub fn publish(&self, root: &Path, event: ChangeEvent) {
        let Some(ids) = self.0.by_root.get(root).map(|v| v.clone()) else {
            return;
        };

        for id in ids {
            let Some(entry) = self.0.subscriptions.get(&id) else {
                continue;
            };

            let had_drops = entry.consecutive_drops.load(Ordering::Relaxed) > 0;
            let item = DispatchedEvent {
                event: event.clone(),
                lagging: had_drops,
            };

            match entry.tx.try_send(item) {
                Ok(()) => entry.consecutive_drops.store(0, Ordering::Relaxed),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let drops = entry.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                    if drops >= self.0.lag_cancel_threshold {
                        drop(entry);
                        self.cancel_lagging(id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    drop(entry);
                    self.unsubscribe(id);
                }
            }
        }
    }

    fn cancel_lagging(&self, id: u64) {
        warn!(subscription = id, "cancelling subscription after persistent lag");
        self.0.lag_cancelled.insert(id, ());
        self.unsubscribe(id);
    }

    fn unsubscribe(&self, id: u64) {
        if let Some((_, entry)) = self.0.subscriptions.remove(&id) {
            if let Some(mut ids) = self.0.by_root.get_mut(&entry.root) {
                ids.retain(|existing| *existing != id);
            }
        }
    }

    pub fn subscriber_count(&self, root: &Path) -> usize {
        self.0.by_root.get(root).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn event(n: u64) -> ChangeEvent {
        ChangeEvent::created(PathBuf::from(format!("/root/f{n}")), n, SystemTime::now())
    }

    #[test]
    fn subscriber_receives_events_in_fifo_order() {
        let dispatcher = EventDispatcher::new();
        let root = PathBuf::from("/root");
        let mut sub = dispatcher.subscribe(root.clone());

        for i in 0..5 {
            dispatcher.publish(&root, event(i));
        }

        let mut seen = Vec::new();
        while let Ok(item) = sub.rx.try_recv() {
            seen.push(item.event.size.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn full_channel_drops_and_flags_lagging_on_next_send() {
        let dispatcher = EventDispatcher::new();
        let root = PathBuf::from("/root");
        let mut sub = dispatcher.subscribe_with_buffer(root.clone(), 1);

        dispatcher.publish(&root, event(1));
        dispatcher.publish(&root, event(2)); // dropped, buffer full of event(1)

        let first = sub.rx.try_recv().unwrap();
        assert_eq!(first.event.size.unwrap(), 1);
        assert!(!first.lagging);

        dispatcher.publish(&root, event(3));
        let second = sub.rx.try_recv().unwrap();
        assert_eq!(second.event.size.unwrap(), 3);
        assert!(second.lagging, "first send after a drop should flag lagging");
    }

    #[test]
    fn persistent_lag_cancels_subscription() {
        let dispatcher = EventDispatcher::new();
        let root = PathBuf::from("/root");
        let sub = dispatcher.subscribe_with_buffer(root.clone(), 1);
        dispatcher.publish(&root, event(0)); // fills the one slot

        for i in 1..=DEFAULT_LAG_CANCEL_THRESHOLD {
            dispatcher.publish(&root, event(i as u64));
        }

        assert!(sub.lag_cancelled());
        assert_eq!(dispatcher.subscriber_count(&root), 0);
    }

    #[test]
    fn dropping_subscription_unregisters_it() {
        let dispatcher = EventDispatcher::new();
        let root = PathBuf::from("/root");
        let sub = dispatcher.subscribe(root.clone());
        assert_eq!(dispatcher.subscriber_count(&root), 1);
        drop(sub);
        assert_eq!(dispatcher.subscriber_count(&root), 0);
    }

    #[test]
    fn independent_subscriptions_do_not_interfere() {
        let dispatcher = EventDispatcher::new();
        let root = PathBuf::from("/root");
        let mut a = dispatcher.subscribe(root.clone());
        let mut b = dispatcher.subscribe(root.clone());

        dispatcher.publish(&root, event(42));
        assert_eq!(a.rx.try_recv().unwrap().event.size.unwrap(), 42);
        assert_eq!(b.rx.try_recv().unwrap().event.size.unwrap(), 42);
    }
}
