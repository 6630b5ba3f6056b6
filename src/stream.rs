//! Typed state and event publication.
//!
//! Each subsystem owns one publisher per stream it exposes. Consumers get an
//! independent [`Subscription`] that delivers every published value exactly
//! once, in publication order, so a slow consumer never drops a transition.
//!
//! ```text
//! ┌────────────────────┐  publish(v)  ┌──────────────┐
//! │  StatePublisher<T> │─────────────►│ Subscription │ (current value first)
//! │  current: T        │─────────────►│ Subscription │
//! └────────────────────┘              └──────────────┘
//! ```
//!
//! [`StatePublisher`] remembers its latest value and replays it to new
//! subscribers. [`EventPublisher`] is fire-and-forget: subscribers only see
//! events published after they subscribed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A subscriber's end of a state or event stream.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Wait for the next value.
    ///
    /// Returns `None` once the publisher has been dropped and every buffered
    /// value has been delivered.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next buffered value without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Discard every buffered value, returning the last one.
    pub fn drain(&mut self) -> Option<T> {
        let mut last = None;
        while let Ok(value) = self.rx.try_recv() {
            last = Some(value);
        }
        last
    }
}

struct StateInner<T> {
    current: T,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

/// Publisher for a value that always has a current state.
pub struct StatePublisher<T> {
    inner: Arc<Mutex<StateInner<T>>>,
}

impl<T> Clone for StatePublisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> StatePublisher<T> {
    /// Create a publisher holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateInner {
                current: initial,
                subscribers: Vec::new(),
            })),
        }
    }

    /// The latest published value.
    pub fn current(&self) -> T {
        self.lock().current.clone()
    }

    /// Replace the current value and deliver it to every live subscriber.
    pub fn publish(&self, value: T) {
        let mut inner = self.lock();
        inner.current = value.clone();
        inner
            .subscribers
            .retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Subscribe; the first item delivered is the current value.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        // The receiver is alive, this cannot fail.
        let _ = tx.send(inner.current.clone());
        inner.subscribers.push(tx);
        Subscription { rx }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + PartialEq + Send + 'static> StatePublisher<T> {
    /// Publish only if `value` differs from the current value.
    ///
    /// Returns whether anything was published.
    pub fn publish_if_changed(&self, value: T) -> bool {
        let mut inner = self.lock();
        if inner.current == value {
            return false;
        }
        inner.current = value.clone();
        inner
            .subscribers
            .retain(|tx| tx.send(value.clone()).is_ok());
        true
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for StatePublisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("StatePublisher")
            .field("current", &inner.current)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

/// Publisher for discrete events without a current value.
pub struct EventPublisher<T> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T> Clone for EventPublisher<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<T: Clone + Send + 'static> Default for EventPublisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> EventPublisher<T> {
    /// Create a publisher with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Deliver `event` to every live subscriber.
    pub fn publish(&self, event: T) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Subscription { rx }
    }
}

impl<T> std::fmt::Debug for EventPublisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_replays_current_value() {
        let publisher = StatePublisher::new(1u32);
        publisher.publish(2);

        let mut sub = publisher.subscribe();
        assert_eq!(sub.next().await, Some(2));
        assert_eq!(sub.try_next(), None);
    }

    #[tokio::test]
    async fn test_every_transition_delivered_in_order() {
        let publisher = StatePublisher::new(0u32);
        let mut sub = publisher.subscribe();

        for value in 1..=5 {
            publisher.publish(value);
        }

        let mut seen = Vec::new();
        while let Some(value) = sub.try_next() {
            seen.push(value);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_subscriptions_are_independent() {
        let publisher = StatePublisher::new("idle");
        let mut first = publisher.subscribe();
        publisher.publish("busy");
        let mut second = publisher.subscribe();

        assert_eq!(first.drain(), Some("busy"));
        assert_eq!(second.drain(), Some("busy"));
        assert_eq!(publisher.current(), "busy");
    }

    #[test]
    fn test_publish_if_changed_skips_duplicates() {
        let publisher = StatePublisher::new(1u8);
        let mut sub = publisher.subscribe();

        assert!(!publisher.publish_if_changed(1));
        assert!(publisher.publish_if_changed(2));

        assert_eq!(sub.try_next(), Some(1));
        assert_eq!(sub.try_next(), Some(2));
        assert_eq!(sub.try_next(), None);
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let publisher = StatePublisher::new(0u8);
        let kept = publisher.subscribe();
        let dropped = publisher.subscribe();
        assert!(format!("{publisher:?}").contains("subscribers: 2"));

        drop(dropped);
        publisher.publish(7);
        assert!(format!("{publisher:?}").contains("subscribers: 1"));
        drop(kept);
    }

    #[tokio::test]
    async fn test_events_only_reach_later_subscribers() {
        let events = EventPublisher::new();
        events.publish("before");
        let mut sub = events.subscribe();
        events.publish("after");

        assert_eq!(sub.next().await, Some("after"));
        assert_eq!(sub.try_next(), None);
    }

    #[tokio::test]
    async fn test_stream_ends_when_publisher_dropped() {
        let publisher = StatePublisher::new(3u8);
        let mut sub = publisher.subscribe();
        drop(publisher);

        assert_eq!(sub.next().await, Some(3));
        assert_eq!(sub.next().await, None);
    }
}
