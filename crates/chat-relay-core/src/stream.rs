//! Per-connection live streams.
//!
//! Every viewer connection gets its own [`LiveStream`]: a `connection`
//! greeting, then heartbeats and forwarded `message` events interleaved on
//! one ordered channel, in emission order.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use chrono::Utc;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};

use crate::{
    EventBus, LiveEvent, Subscription, UserId,
    event_bus::message_topic,
};

/// Default heartbeat cadence.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Smallest accepted heartbeat cadence.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Live stream settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Time between heartbeats on every open stream.
    pub heartbeat_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl StreamConfig {
    /// Config with a custom heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(heartbeat_interval: Duration) -> Self {
        Self { heartbeat_interval }
    }
}

type ConnectionCounts = Arc<DashMap<UserId, usize>>;

/// Opens live streams for viewer connections.
///
/// Clones share the same connections and the same shutdown signal.
#[derive(Clone)]
pub struct StreamManager {
    bus: EventBus,
    heartbeat_interval: Duration,
    connections: ConnectionCounts,
    shutdown: Arc<watch::Sender<bool>>,
}

impl StreamManager {
    /// Create a manager that forwards events from `bus`.
    #[must_use]
    pub fn new(bus: EventBus, config: &StreamConfig) -> Self {
        Self {
            bus,
            heartbeat_interval: config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL),
            connections: Arc::new(DashMap::new()),
            shutdown: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Heartbeat cadence in effect.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Open a live stream for one viewer of `user_id`.
    ///
    /// Must be called from within a tokio runtime: the heartbeat runs as a
    /// task. The returned stream releases its heartbeat and bus listener
    /// when closed or dropped, or once [`shutdown_all`](Self::shutdown_all)
    /// has run.
    #[must_use]
    pub fn open(&self, user_id: &UserId) -> LiveStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(LiveEvent::connection());

        let heartbeat = spawn_heartbeat(tx.clone(), self.heartbeat_interval);

        let subscription = self.bus.subscribe(message_topic(user_id), move |payload| {
            let _ = tx.send(LiveEvent::message(payload.clone()));
        });

        *self.connections.entry(user_id.clone()).or_default() += 1;
        tracing::debug!(user_id = %user_id, "live stream opened");

        LiveStream {
            user_id: user_id.clone(),
            rx: UnboundedReceiverStream::new(rx),
            heartbeat: Some(heartbeat),
            subscription: Some(subscription),
            connections: Arc::clone(&self.connections),
            shutdown: WatchStream::new(self.shutdown.subscribe()),
            closed: false,
        }
    }

    /// End every open stream and every stream opened from now on.
    ///
    /// Each stream closes itself on its next poll, so response bodies and
    /// socket loops waiting on it finish. Returns the number of streams
    /// that were open.
    pub fn shutdown_all(&self) -> usize {
        self.shutdown.send_replace(true);
        let open = self.connections.iter().map(|c| *c.value()).sum();
        tracing::info!(streams = open, "Shutting down live streams");
        open
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Number of open streams for `user_id`.
    #[must_use]
    pub fn active_connections(&self, user_id: &UserId) -> usize {
        self.connections.get(user_id).map_or(0, |c| *c.value())
    }
}

fn spawn_heartbeat(tx: mpsc::UnboundedSender<LiveEvent>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.send(LiveEvent::heartbeat(Utc::now())).is_err() {
                break;
            }
        }
    })
}

/// One viewer's live stream.
///
/// Closing (explicitly or by drop) cancels the heartbeat, removes the bus
/// listener and ends the stream before returning; nothing is yielded after
/// that, including events already queued.
pub struct LiveStream {
    user_id: UserId,
    rx: UnboundedReceiverStream<LiveEvent>,
    heartbeat: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
    connections: ConnectionCounts,
    shutdown: WatchStream<bool>,
    closed: bool,
}

impl LiveStream {
    /// User this stream belongs to.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Tear the stream down. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.rx.close();

        self.connections
            .remove_if_mut(&self.user_id, |_, count| {
                *count = count.saturating_sub(1);
                *count == 0
            });
        tracing::debug!(user_id = %self.user_id, "live stream closed");
    }
}

impl Stream for LiveStream {
    type Item = LiveEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        // A closed sender only means the manager is gone; keep streaming.
        while let Poll::Ready(Some(shut_down)) = self.shutdown.poll_next_unpin(cx) {
            if shut_down {
                self.close();
                return Poll::Ready(None);
            }
        }
        self.rx.poll_next_unpin(cx)
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        self.close();
    }
}
