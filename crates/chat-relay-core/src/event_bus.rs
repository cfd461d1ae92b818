//! Topic-keyed publish/subscribe.
//!
//! Delivery is synchronous and exact-match: `publish` invokes every
//! listener registered on that topic string at the moment of the call and
//! nothing else. There is no buffering; an event published while nobody
//! listens is dropped.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use dashmap::DashMap;
use serde_json::Value;

use crate::UserId;

/// Domain prefix of every per-user topic.
pub const TOPIC_DOMAIN: &str = "whatsapp";

/// Per-user topic: `<domain>.<event>.<userId>`.
#[must_use]
pub fn user_topic(event: &str, user_id: &UserId) -> String {
    format!("{TOPIC_DOMAIN}.{event}.{user_id}")
}

/// Formatted inbound messages for a user.
#[must_use]
pub fn message_topic(user_id: &UserId) -> String {
    user_topic("message", user_id)
}

/// Session became ready.
///
/// Live streams forward only [`message_topic`]; this and
/// [`disconnected_topic`] are for in-process subscribers.
#[must_use]
pub fn ready_topic(user_id: &UserId) -> String {
    user_topic("ready", user_id)
}

/// Client reported a terminal disconnect.
#[must_use]
pub fn disconnected_topic(user_id: &UserId) -> String {
    user_topic("disconnected", user_id)
}

/// User segment of a per-user topic. User ids may themselves contain dots.
fn topic_user(topic: &str) -> Option<&str> {
    topic.splitn(3, '.').nth(2)
}

/// Listener callback. Runs on the publisher's task and must not block.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

struct Registered {
    id: u64,
    live: Arc<AtomicBool>,
    listener: Listener,
}

struct Inner {
    topics: DashMap<String, Vec<Registered>>,
    next_id: AtomicU64,
}

impl Inner {
    fn remove(&self, topic: &str, id: u64) {
        self.topics.remove_if_mut(topic, |_, listeners| {
            listeners.retain(|r| r.id != id);
            listeners.is_empty()
        });
    }
}

/// Process-wide event bus.
///
/// Cheap to clone; clones share the same listener registry. Each topic's
/// listener list is locked independently, so traffic for one user never
/// waits on another user's topics.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Deliver `payload` to every listener currently registered on `topic`.
    ///
    /// Returns the number of listeners invoked. Listeners are called after
    /// the topic lock is released, so a listener may subscribe or
    /// unsubscribe without deadlocking; one registered during the call
    /// does not receive this payload.
    pub fn publish(&self, topic: &str, payload: &Value) -> usize {
        let listeners: Vec<(Arc<AtomicBool>, Listener)> = match self.inner.topics.get(topic) {
            Some(registered) => registered
                .iter()
                .map(|r| (Arc::clone(&r.live), Arc::clone(&r.listener)))
                .collect(),
            None => {
                tracing::trace!(topic, "publish without listeners");
                return 0;
            }
        };

        let mut delivered = 0;
        for (live, listener) in listeners {
            // Unsubscribed after the snapshot was taken.
            if !live.load(Ordering::Acquire) {
                continue;
            }
            listener(payload);
            delivered += 1;
        }

        tracing::trace!(topic, delivered, "published event");
        delivered
    }

    /// Register `listener` on `topic`.
    ///
    /// The returned [`Subscription`] removes the listener when
    /// unsubscribed or dropped.
    pub fn subscribe<F>(&self, topic: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let live = Arc::new(AtomicBool::new(true));

        self.inner
            .topics
            .entry(topic.clone())
            .or_default()
            .push(Registered {
                id,
                live: Arc::clone(&live),
                listener: Arc::new(listener),
            });

        tracing::debug!(topic = %topic, listener_id = id, "subscribed");

        Subscription {
            topic,
            id,
            live,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Drop every listener on every topic belonging to `user_id`.
    ///
    /// Topics of other users are untouched, including ones whose id shares
    /// a prefix with `user_id`. Returns the number of listeners removed.
    pub fn remove_user(&self, user_id: &UserId) -> usize {
        let topics: Vec<String> = self
            .inner
            .topics
            .iter()
            .filter(|entry| topic_user(entry.key()) == Some(user_id.as_str()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for topic in topics {
            if let Some((_, listeners)) = self.inner.topics.remove(&topic) {
                removed += deactivate(&listeners);
            }
        }

        tracing::debug!(user_id = %user_id, removed, "removed user listeners");
        removed
    }

    /// Drop every listener on every topic. Used at process shutdown.
    pub fn shutdown_all(&self) -> usize {
        let mut removed = 0;
        self.inner.topics.retain(|_, listeners| {
            removed += deactivate(listeners);
            false
        });

        tracing::debug!(removed, "removed all listeners");
        removed
    }

    /// Number of listeners on `topic`.
    #[must_use]
    pub fn listener_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map_or(0, |l| l.len())
    }

    /// Number of topics with at least one listener.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner.topics.len()
    }
}

fn deactivate(listeners: &[Registered]) -> usize {
    for r in listeners {
        r.live.store(false, Ordering::Release);
    }
    listeners.len()
}

/// Handle to one registered listener.
///
/// Unsubscribing is idempotent, and dropping the handle unsubscribes.
pub struct Subscription {
    topic: String,
    id: u64,
    live: Arc<AtomicBool>,
    bus: Weak<Inner>,
}

impl Subscription {
    /// Topic this subscription listens on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the listener is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Remove the listener. No publish that starts after this returns will
    /// reach it. Calling again is a no-op.
    pub fn unsubscribe(&self) {
        if !self.live.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(&self.topic, self.id);
        }
        tracing::debug!(topic = %self.topic, listener_id = self.id, "unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, atomic::AtomicUsize};

    use serde_json::json;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Value) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        (count, move |_: &Value| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_topic_format() {
        let user = UserId::new("u1");
        assert_eq!(message_topic(&user), "whatsapp.message.u1");
        assert_eq!(ready_topic(&user), "whatsapp.ready.u1");
        assert_eq!(topic_user("whatsapp.message.a.b"), Some("a.b"));
        assert_eq!(topic_user("global"), None);
    }

    #[test]
    fn test_publish_exact_topic_only() {
        let bus = EventBus::new();
        let (hits, listener) = counter();
        let _sub = bus.subscribe("whatsapp.message.u1", listener);

        assert_eq!(bus.publish("whatsapp.message.u1", &json!({})), 1);
        assert_eq!(bus.publish("whatsapp.message.u10", &json!({})), 0);
        assert_eq!(bus.publish("whatsapp.message", &json!({})), 0);
        assert_eq!(bus.publish("whatsapp.*.u1", &json!({})), 0);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_publish_passes_payload() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = bus.subscribe("t.e.u", move |v: &Value| {
            seen_clone.lock().unwrap().push(v.clone());
        });

        bus.publish("t.e.u", &json!({"text": "hi"}));

        assert_eq!(*seen.lock().unwrap(), vec![json!({"text": "hi"})]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let (hits, listener) = counter();
        let (other_hits, other) = counter();
        let sub = bus.subscribe("whatsapp.message.u1", listener);
        let _other = bus.subscribe("whatsapp.message.u1", other);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(bus.listener_count("whatsapp.message.u1"), 1);

        bus.publish("whatsapp.message.u1", &json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(other_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes_and_cleans_topic() {
        let bus = EventBus::new();
        let (hits, listener) = counter();
        {
            let _sub = bus.subscribe("whatsapp.message.u1", listener);
            assert_eq!(bus.topic_count(), 1);
        }

        assert_eq!(bus.topic_count(), 0);
        assert_eq!(bus.publish("whatsapp.message.u1", &json!({})), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_added_during_publish_misses_it() {
        let bus = EventBus::new();
        let (late_hits, late) = counter();
        let late = Arc::new(late);
        let held = Arc::new(Mutex::new(Vec::new()));

        let bus_clone = bus.clone();
        let held_clone = Arc::clone(&held);
        let late_clone = Arc::clone(&late);
        let _sub = bus.subscribe("t.e.u", move |_: &Value| {
            let late = Arc::clone(&late_clone);
            let sub = bus_clone.subscribe("t.e.u", move |v: &Value| (*late)(v));
            held_clone.lock().unwrap().push(sub);
        });

        assert_eq!(bus.publish("t.e.u", &json!(1)), 1);
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count("t.e.u"), 2);
    }

    #[test]
    fn test_unsubscribe_from_inside_listener() {
        let bus = EventBus::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_clone = Arc::clone(&slot);
        let sub = bus.subscribe("t.e.u", move |_: &Value| {
            if let Some(sub) = slot_clone.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        assert_eq!(bus.publish("t.e.u", &json!(1)), 1);
        assert_eq!(bus.publish("t.e.u", &json!(2)), 0);
    }

    #[test]
    fn test_remove_user_leaves_other_users() {
        let bus = EventBus::new();
        let (u1_hits, u1) = counter();
        let (u10_hits, u10) = counter();
        let sub_u1 = bus.subscribe(message_topic(&UserId::new("u1")), u1);
        let _sub_ready = bus.subscribe(ready_topic(&UserId::new("u1")), |_: &Value| {});
        let _sub_u10 = bus.subscribe(message_topic(&UserId::new("u10")), u10);

        assert_eq!(bus.remove_user(&UserId::new("u1")), 2);
        assert!(!sub_u1.is_active());

        bus.publish("whatsapp.message.u1", &json!({}));
        bus.publish("whatsapp.message.u10", &json!({}));
        assert_eq!(u1_hits.load(Ordering::SeqCst), 0);
        assert_eq!(u10_hits.load(Ordering::SeqCst), 1);

        // Handle outlives the removal; unsubscribing stays harmless.
        sub_u1.unsubscribe();
        assert_eq!(bus.listener_count("whatsapp.message.u10"), 1);
    }

    #[test]
    fn test_shutdown_all() {
        let bus = EventBus::new();
        let a = bus.subscribe("whatsapp.message.a", |_: &Value| {});
        let b = bus.subscribe("whatsapp.message.b", |_: &Value| {});

        assert_eq!(bus.shutdown_all(), 2);
        assert_eq!(bus.topic_count(), 0);
        assert!(!a.is_active());
        assert!(!b.is_active());
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let bus = EventBus::new();
        let sub = bus.subscribe("t.e.u", |_: &Value| {});
        drop(bus);
        sub.unsubscribe();
        assert!(!sub.is_active());
    }
}
