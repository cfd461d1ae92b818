//! Session registry: one automation client per user.
//!
//! The registry owns every user's client handle and a single event loop.
//! Clients push their lifecycle events through an [`EventSink`] onto the
//! loop's channel; the loop applies them in arrival order to the challenge
//! cache, the session state, the event bus and the message store. Events
//! carry the generation of the session that produced them, so anything
//! emitted by a handle that has since been torn down or replaced is dropped.
//!
//! Client calls never run while a map entry is locked: the handle is cloned
//! out first and results are applied afterwards.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use chat_relay_core::{
    AutomationClient, ChallengeCache, ClientError, ClientEvent, ClientFactory, EventBus,
    EventSink, FormattedMessage, MessageRecord, MessageStore, NewMessage, PlatformMessage,
    SessionState, SinkEnvelope, StoreError, TeardownMode, UserId,
    event_bus::{disconnected_topic, message_topic, ready_topic},
};
use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};

use crate::views::{CHAT_HISTORY_LIMIT, ChatList, ChatMessageView, ChatSummary, ContactView};

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No active session for user: {0}")]
    SessionNotFound(UserId),
    #[error("Session for user {0} is not logged in")]
    NotReady(UserId),
    #[error("Client error for user {user_id}: {source}")]
    ExternalClient {
        user_id: UserId,
        #[source]
        source: ClientError,
    },
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl RegistryError {
    fn external(user_id: &UserId) -> impl FnOnce(ClientError) -> Self + '_ {
        move |source| Self::ExternalClient {
            user_id: user_id.clone(),
            source,
        }
    }
}

/// Result of [`SessionRegistry::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializeOutcome {
    /// A new client was created and started.
    Started,
    /// The session is already authenticated; nothing was done.
    AlreadyLoggedIn,
    /// A client for this user is already starting or awaiting its
    /// challenge; nothing was done.
    InProgress,
}

/// Result of [`SessionRegistry::challenge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeStatus {
    /// Latest challenge issued by the client.
    Available(String),
    /// The session is authenticated; there is nothing to answer.
    AlreadyAuthenticated,
    /// No challenge yet. Initialize first or wait for the client.
    Unavailable,
}

/// Result of [`SessionRegistry::logout`] and [`SessionRegistry::destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// There was no session to tear down.
    NoSession,
    /// The session was torn down and removed.
    Completed(TeardownMode),
}

struct Session {
    generation: u64,
    client: Arc<dyn AutomationClient>,
    state: watch::Sender<SessionState>,
}

enum LoopMessage {
    Client(SinkEnvelope),
    Flush(oneshot::Sender<()>),
}

/// Keeps at most one live automation client per user.
pub struct SessionRegistry {
    factory: Arc<dyn ClientFactory>,
    store: Arc<dyn MessageStore>,
    bus: EventBus,
    challenges: ChallengeCache,
    sessions: DashMap<UserId, Arc<Session>>,
    next_generation: AtomicU64,
    events: mpsc::UnboundedSender<LoopMessage>,
}

impl SessionRegistry {
    /// Create a registry and start its event loop.
    ///
    /// Must be called from within a tokio runtime. The loop stops once the
    /// registry is dropped.
    #[must_use]
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        store: Arc<dyn MessageStore>,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|registry: &Weak<Self>| {
            let (events, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_event_loop(registry.clone(), rx));
            Self {
                factory,
                store,
                bus,
                challenges: ChallengeCache::new(),
                sessions: DashMap::new(),
                next_generation: AtomicU64::new(1),
                events,
            }
        })
    }

    /// Event bus lifecycle and message events are published on.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Start a session for `user_id`.
    ///
    /// Concurrent calls for the same user create exactly one client: the
    /// first inserts it, the others observe it and return without effect.
    ///
    /// # Errors
    /// Returns `ExternalClient` if the client fails to start; the session
    /// is removed again in that case.
    pub async fn initialize(&self, user_id: &UserId) -> Result<InitializeOutcome, RegistryError> {
        let session = match self.sessions.entry(user_id.clone()) {
            Entry::Occupied(entry) => {
                let state = *entry.get().state.borrow();
                return Ok(if state == SessionState::Ready {
                    InitializeOutcome::AlreadyLoggedIn
                } else {
                    InitializeOutcome::InProgress
                });
            }
            Entry::Vacant(entry) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let client = self.factory.create(user_id, self.sink(user_id, generation));
                let (state, _) = watch::channel(SessionState::AwaitingChallenge);
                let session = Arc::new(Session {
                    generation,
                    client,
                    state,
                });
                entry.insert(Arc::clone(&session));
                session
            }
        };
        tracing::info!(user_id = %user_id, generation = session.generation, "Session created");

        if let Err(e) = session.client.start().await {
            tracing::error!(user_id = %user_id, "Failed to start client: {e}");
            self.sessions
                .remove_if(user_id, |_, s| s.generation == session.generation);
            self.challenges.clear(user_id);
            session.state.send_replace(SessionState::Destroyed);
            return Err(RegistryError::external(user_id)(e));
        }
        Ok(InitializeOutcome::Started)
    }

    /// Client handle for `user_id`, whatever its state.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if no session is registered.
    pub fn get_client(&self, user_id: &UserId) -> Result<Arc<dyn AutomationClient>, RegistryError> {
        self.session(user_id)
            .map(|s| Arc::clone(&s.client))
            .ok_or_else(|| RegistryError::SessionNotFound(user_id.clone()))
    }

    /// Whether a session exists and its client reports an identity.
    #[must_use]
    pub fn is_ready(&self, user_id: &UserId) -> bool {
        self.session(user_id)
            .is_some_and(|s| s.client.identity().is_some())
    }

    /// Current state; `Uninitialized` when no session is registered.
    #[must_use]
    pub fn state(&self, user_id: &UserId) -> SessionState {
        self.session(user_id)
            .map_or(SessionState::Uninitialized, |s| *s.state.borrow())
    }

    /// Follow a session's state. The receiver sees the final state when
    /// the session is torn down.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if no session is registered.
    pub fn watch_state(
        &self,
        user_id: &UserId,
    ) -> Result<watch::Receiver<SessionState>, RegistryError> {
        self.session(user_id)
            .map(|s| s.state.subscribe())
            .ok_or_else(|| RegistryError::SessionNotFound(user_id.clone()))
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Login challenge for `user_id`.
    ///
    /// A cached value is only reported while a session is registered.
    #[must_use]
    pub fn challenge(&self, user_id: &UserId) -> ChallengeStatus {
        if !self.sessions.contains_key(user_id) {
            return ChallengeStatus::Unavailable;
        }
        if self.is_ready(user_id) {
            return ChallengeStatus::AlreadyAuthenticated;
        }
        self.challenges
            .get(user_id)
            .map_or(ChallengeStatus::Unavailable, ChallengeStatus::Available)
    }

    /// Send a text message and record it.
    ///
    /// The stored record's sender is the session's own identity.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `NotReady`, `ExternalClient` if the send
    /// fails, or `Store` if recording fails.
    pub async fn send_message(
        &self,
        user_id: &UserId,
        to: &str,
        text: &str,
    ) -> Result<MessageRecord, RegistryError> {
        let (client, identity) = self.ready_client(user_id)?;
        client
            .send_message(to, text)
            .await
            .map_err(RegistryError::external(user_id))?;

        let record = self
            .store
            .store(NewMessage::new(identity, to, text, user_id.clone()))
            .await?;
        tracing::debug!(user_id = %user_id, to, "Message sent");
        Ok(record)
    }

    /// Sign the user out and remove the session.
    ///
    /// # Errors
    /// Returns `ExternalClient` if the client refuses; the session is left
    /// in place.
    pub async fn logout(&self, user_id: &UserId) -> Result<TeardownOutcome, RegistryError> {
        self.teardown(user_id, TeardownMode::Soft).await
    }

    /// Release every client resource and remove the session.
    ///
    /// # Errors
    /// Returns `ExternalClient` if the client refuses; the session is left
    /// in place.
    pub async fn destroy(&self, user_id: &UserId) -> Result<TeardownOutcome, RegistryError> {
        self.teardown(user_id, TeardownMode::Hard).await
    }

    async fn teardown(
        &self,
        user_id: &UserId,
        mode: TeardownMode,
    ) -> Result<TeardownOutcome, RegistryError> {
        let Some(session) = self.session(user_id) else {
            return Ok(TeardownOutcome::NoSession);
        };

        session
            .client
            .shutdown(mode)
            .await
            .map_err(RegistryError::external(user_id))?;

        self.sessions
            .remove_if(user_id, |_, s| s.generation == session.generation);
        let previous = session.state.send_replace(mode.final_state());
        if previous != SessionState::Ready {
            self.challenges.clear(user_id);
        }
        tracing::info!(user_id = %user_id, ?mode, "Session torn down");
        Ok(TeardownOutcome::Completed(mode))
    }

    /// Messages stored for `user_id`, including those from earlier sessions.
    ///
    /// # Errors
    /// Returns `Store` if the query fails.
    pub async fn list_messages(&self, user_id: &UserId) -> Result<Vec<MessageRecord>, RegistryError> {
        Ok(self.store.query_by_user(user_id).await?)
    }

    /// The user's chats with last message and avatar.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `NotReady`, or `ExternalClient`.
    pub async fn list_chats(&self, user_id: &UserId) -> Result<ChatList, RegistryError> {
        let (client, _) = self.ready_client(user_id)?;
        let chats = client
            .chats()
            .await
            .map_err(RegistryError::external(user_id))?;

        let avatars = futures::future::join_all(chats.iter().map(|chat| {
            let client = Arc::clone(&client);
            async move {
                client.profile_pic_url(&chat.id).await.unwrap_or_else(|e| {
                    tracing::warn!(chat_id = %chat.id, "Failed to fetch profile picture: {e}");
                    None
                })
            }
        }))
        .await;

        let now = Utc::now();
        let users = chats
            .into_iter()
            .zip(avatars)
            .map(|(chat, avatar)| ChatSummary::new(chat, avatar, now))
            .collect();
        Ok(ChatList { users })
    }

    /// The most recent messages of one chat, oldest first.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `NotReady`, or `ExternalClient`.
    pub async fn chat_messages(
        &self,
        user_id: &UserId,
        chat_id: &str,
    ) -> Result<Vec<ChatMessageView>, RegistryError> {
        let (client, _) = self.ready_client(user_id)?;
        let messages = client
            .chat_messages(chat_id, CHAT_HISTORY_LIMIT)
            .await
            .map_err(RegistryError::external(user_id))?;
        Ok(messages.into_iter().map(ChatMessageView::from).collect())
    }

    /// One contact's details.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `NotReady`, or `ExternalClient`.
    pub async fn contact(
        &self,
        user_id: &UserId,
        contact_id: &str,
    ) -> Result<ContactView, RegistryError> {
        let (client, _) = self.ready_client(user_id)?;
        let contact = client
            .contact(contact_id)
            .await
            .map_err(RegistryError::external(user_id))?;
        Ok(contact.into())
    }

    /// All contacts.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `NotReady`, or `ExternalClient`.
    pub async fn contacts(&self, user_id: &UserId) -> Result<Vec<ContactView>, RegistryError> {
        let (client, _) = self.ready_client(user_id)?;
        let contacts = client
            .contacts()
            .await
            .map_err(RegistryError::external(user_id))?;
        Ok(contacts.into_iter().map(ContactView::from).collect())
    }

    /// Wait until every client event queued before this call is applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(LoopMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Destroy every session and drop every bus listener.
    ///
    /// Returns the number of sessions torn down. Sessions whose client
    /// refuses are logged and left in place.
    pub async fn shutdown_all(&self) -> usize {
        let users: Vec<UserId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let results = futures::future::join_all(users.iter().map(|user_id| async move {
            match self.destroy(user_id).await {
                Ok(TeardownOutcome::Completed(_)) => true,
                Ok(TeardownOutcome::NoSession) => false,
                Err(e) => {
                    tracing::error!(user_id = %user_id, "Failed to destroy session: {e}");
                    false
                }
            }
        }))
        .await;

        let listeners = self.bus.shutdown_all();
        let destroyed = results.into_iter().filter(|done| *done).count();
        tracing::info!(sessions = destroyed, listeners, "Registry shut down");
        destroyed
    }

    fn session(&self, user_id: &UserId) -> Option<Arc<Session>> {
        self.sessions.get(user_id).map(|s| Arc::clone(s.value()))
    }

    fn ready_client(
        &self,
        user_id: &UserId,
    ) -> Result<(Arc<dyn AutomationClient>, String), RegistryError> {
        let client = self.get_client(user_id)?;
        let identity = client
            .identity()
            .ok_or_else(|| RegistryError::NotReady(user_id.clone()))?;
        Ok((client, identity))
    }

    fn sink(&self, user_id: &UserId, generation: u64) -> EventSink {
        let events = self.events.clone();
        EventSink::new(user_id.clone(), generation, move |envelope| {
            let _ = events.send(LoopMessage::Client(envelope));
        })
    }

    /// Session `user_id` if it is still the one `generation` belongs to.
    fn current(&self, user_id: &UserId, generation: u64) -> Option<Arc<Session>> {
        self.session(user_id)
            .filter(|s| s.generation == generation)
    }

    async fn apply(&self, envelope: SinkEnvelope) {
        let SinkEnvelope {
            user_id,
            generation,
            event,
        } = envelope;
        let Some(session) = self.current(&user_id, generation) else {
            tracing::debug!(user_id = %user_id, generation, "Dropping event from stale client");
            return;
        };

        match event {
            ClientEvent::Challenge(value) => {
                // Teardown removes the entry before clearing the cache, so
                // holding the entry across the store keeps the two ordered.
                let Some(entry) = self
                    .sessions
                    .get(&user_id)
                    .filter(|s| s.generation == generation)
                else {
                    return;
                };
                if *entry.state.borrow() == SessionState::Ready {
                    tracing::debug!(user_id = %user_id, "Ignoring challenge for ready session");
                    return;
                }
                tracing::info!(user_id = %user_id, "Login challenge issued");
                self.challenges.store(&user_id, value);
                drop(entry);
            }
            ClientEvent::Ready { identity } => {
                self.challenges.clear(&user_id);
                session.state.send_replace(SessionState::Ready);
                tracing::info!(user_id = %user_id, %identity, "Client ready");
                self.bus.publish(
                    &ready_topic(&user_id),
                    &json!({ "userId": user_id, "identity": identity }),
                );
            }
            ClientEvent::Message(msg) => self.on_message(&user_id, &msg).await,
            ClientEvent::Disconnected { reason } => {
                self.sessions.remove_if(&user_id, |_, s| s.generation == generation);
                self.challenges.clear(&user_id);
                session.state.send_replace(SessionState::LoggedOut);
                tracing::warn!(user_id = %user_id, %reason, "Client disconnected");
                self.bus.publish(
                    &disconnected_topic(&user_id),
                    &json!({ "userId": user_id, "reason": reason }),
                );
            }
        }
    }

    async fn on_message(&self, user_id: &UserId, msg: &PlatformMessage) {
        let formatted = FormattedMessage::from_platform(msg, Utc::now());
        match serde_json::to_value(&formatted) {
            Ok(payload) => {
                let delivered = self.bus.publish(&message_topic(user_id), &payload);
                tracing::debug!(user_id = %user_id, delivered, "Message received");
            }
            Err(e) => tracing::error!(user_id = %user_id, "Failed to encode message: {e}"),
        }

        let record = NewMessage::new(&msg.from, &msg.to, &msg.body, user_id.clone());
        if let Err(e) = self.store.store(record).await {
            tracing::error!(user_id = %user_id, "Failed to store message: {e}");
        }
    }
}

async fn run_event_loop(registry: Weak<SessionRegistry>, mut rx: mpsc::UnboundedReceiver<LoopMessage>) {
    while let Some(message) = rx.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        match message {
            LoopMessage::Client(envelope) => registry.apply(envelope).await,
            LoopMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Registry event loop stopped");
}
