//! In-process automation client.
//!
//! [`LoopbackClient`] simulates the messaging platform inside the process:
//! it issues challenges, logs in, keeps per-chat history and contacts, and
//! lets the caller inject inbound messages. It backs the demo server mode
//! and every registry test.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chat_relay_core::{
    AutomationClient, Chat, ClientError, ClientFactory, Contact, EventSink, PlatformMessage,
    TeardownMode, UserId,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

/// Loopback behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackOptions {
    /// Log in by itself this long after `start`.
    pub auto_login: Option<Duration>,
    /// Answer every sent message with an inbound copy from the recipient.
    pub echo: bool,
}

#[derive(Default)]
struct ChatLog {
    messages: Vec<PlatformMessage>,
    unread: u32,
}

#[derive(Default)]
struct State {
    started: bool,
    identity: Option<String>,
    challenges: u32,
    chats: BTreeMap<String, ChatLog>,
    contacts: BTreeMap<String, Contact>,
    avatars: HashMap<String, String>,
    sent: Vec<PlatformMessage>,
    fail_next: Option<String>,
    shutdown: Option<TeardownMode>,
}

impl State {
    fn take_failure(&mut self) -> Result<(), ClientError> {
        self.fail_next.take().map_or(Ok(()), |msg| Err(ClientError::Rejected(msg)))
    }

    fn require_ready(&mut self) -> Result<String, ClientError> {
        self.take_failure()?;
        self.identity.clone().ok_or(ClientError::NotConnected)
    }
}

struct Shared {
    user_id: UserId,
    sink: EventSink,
    options: LoopbackOptions,
    state: Mutex<State>,
}

/// Simulated automation client. Clones share the same session.
#[derive(Clone)]
pub struct LoopbackClient {
    shared: Arc<Shared>,
}

impl LoopbackClient {
    #[must_use]
    pub fn new(user_id: UserId, sink: EventSink, options: LoopbackOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                user_id,
                sink,
                options,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Address this client logs in as.
    #[must_use]
    pub fn account_id(&self) -> String {
        format!("{}@c.us", self.shared.user_id)
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Issue a fresh login challenge, superseding any earlier one.
    pub fn issue_challenge(&self) -> String {
        let challenge = {
            let mut state = self.shared.state.lock();
            state.challenges += 1;
            format!("loopback:{}:{}", self.shared.user_id, state.challenges)
        };
        self.shared.sink.push_challenge(challenge.clone());
        challenge
    }

    /// Complete the login as if the challenge had been answered.
    pub fn complete_login(&self) {
        let identity = self.account_id();
        self.shared.state.lock().identity = Some(identity.clone());
        self.shared.sink.push_ready(identity);
    }

    /// Deliver an inbound message from `from`.
    pub fn receive(&self, from: &str, body: &str) -> PlatformMessage {
        let msg = {
            let mut state = self.shared.state.lock();
            let to = state.identity.clone().unwrap_or_else(|| self.account_id());
            let msg = PlatformMessage {
                id: Uuid::new_v4().to_string(),
                from: from.to_string(),
                to,
                body: body.to_string(),
                timestamp: Utc::now().timestamp(),
                from_me: false,
            };
            let log = state.chats.entry(from.to_string()).or_default();
            log.messages.push(msg.clone());
            log.unread += 1;
            msg
        };
        self.shared.sink.push_message(msg.clone());
        msg
    }

    /// Drop the session as if the platform had signed the device out.
    pub fn disconnect(&self, reason: &str) {
        self.shared.state.lock().identity = None;
        self.shared.sink.push_disconnected(reason);
    }

    pub fn add_contact(&self, contact: Contact) {
        self.shared
            .state
            .lock()
            .contacts
            .insert(contact.id.clone(), contact);
    }

    pub fn set_avatar(&self, contact_id: &str, url: &str) {
        self.shared
            .state
            .lock()
            .avatars
            .insert(contact_id.to_string(), url.to_string());
    }

    /// Make the next client call fail with `Rejected(message)`.
    pub fn fail_next_request(&self, message: &str) {
        self.shared.state.lock().fail_next = Some(message.to_string());
    }

    /// Messages sent through this client, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<PlatformMessage> {
        self.shared.state.lock().sent.clone()
    }

    /// How the client was shut down, if it was.
    #[must_use]
    pub fn shutdown_mode(&self) -> Option<TeardownMode> {
        self.shared.state.lock().shutdown
    }

    fn schedule_login(&self, delay: Duration) {
        let client = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_waiting = {
                let state = client.shared.state.lock();
                state.shutdown.is_none() && state.identity.is_none()
            };
            if still_waiting {
                client.complete_login();
            }
        });
    }

    fn chat_name(state: &State, chat_id: &str) -> String {
        state
            .contacts
            .get(chat_id)
            .and_then(Contact::display_name)
            .unwrap_or(chat_id)
            .to_string()
    }
}

#[async_trait]
impl AutomationClient for LoopbackClient {
    async fn start(&self) -> Result<(), ClientError> {
        {
            let mut state = self.shared.state.lock();
            state.take_failure()?;
            state.started = true;
            state.shutdown = None;
        }
        tracing::debug!(user_id = %self.shared.user_id, "Loopback client started");

        self.issue_challenge();
        if let Some(delay) = self.shared.options.auto_login {
            self.schedule_login(delay);
        }
        Ok(())
    }

    fn identity(&self) -> Option<String> {
        self.shared.state.lock().identity.clone()
    }

    async fn send_message(&self, to: &str, text: &str) -> Result<(), ClientError> {
        {
            let mut state = self.shared.state.lock();
            let from = state.require_ready()?;
            let msg = PlatformMessage {
                id: Uuid::new_v4().to_string(),
                from,
                to: to.to_string(),
                body: text.to_string(),
                timestamp: Utc::now().timestamp(),
                from_me: true,
            };
            state
                .chats
                .entry(to.to_string())
                .or_default()
                .messages
                .push(msg.clone());
            state.sent.push(msg);
        }

        if self.shared.options.echo {
            self.receive(to, text);
        }
        Ok(())
    }

    async fn chats(&self) -> Result<Vec<Chat>, ClientError> {
        let mut state = self.shared.state.lock();
        state.require_ready()?;

        let mut chats: Vec<Chat> = state
            .chats
            .iter()
            .map(|(id, log)| Chat {
                id: id.clone(),
                name: Self::chat_name(&state, id),
                unread_count: log.unread,
                last_message: log.messages.last().cloned(),
            })
            .collect();
        chats.sort_by_key(|chat| {
            std::cmp::Reverse(chat.last_message.as_ref().map_or(0, |m| m.timestamp))
        });
        Ok(chats)
    }

    async fn chat_messages(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>, ClientError> {
        let mut state = self.shared.state.lock();
        state.require_ready()?;

        let log = state
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| ClientError::Rejected(format!("chat not found: {chat_id}")))?;
        log.unread = 0;
        let skip = log.messages.len().saturating_sub(limit);
        Ok(log.messages[skip..].to_vec())
    }

    async fn contact(&self, contact_id: &str) -> Result<Contact, ClientError> {
        let mut state = self.shared.state.lock();
        state.require_ready()?;

        Ok(state.contacts.get(contact_id).cloned().unwrap_or_else(|| Contact {
            id: contact_id.to_string(),
            name: None,
            push_name: None,
            number: contact_id
                .split_once('@')
                .map_or(contact_id, |(number, _)| number)
                .to_string(),
        }))
    }

    async fn contacts(&self) -> Result<Vec<Contact>, ClientError> {
        let mut state = self.shared.state.lock();
        state.require_ready()?;
        Ok(state.contacts.values().cloned().collect())
    }

    async fn profile_pic_url(&self, contact_id: &str) -> Result<Option<String>, ClientError> {
        let mut state = self.shared.state.lock();
        state.require_ready()?;
        Ok(state.avatars.get(contact_id).cloned())
    }

    async fn shutdown(&self, mode: TeardownMode) -> Result<(), ClientError> {
        let mut state = self.shared.state.lock();
        state.take_failure()?;
        state.started = false;
        state.identity = None;
        state.shutdown = Some(mode);
        tracing::debug!(user_id = %self.shared.user_id, ?mode, "Loopback client shut down");
        Ok(())
    }
}

/// Creates [`LoopbackClient`]s and keeps the latest one per user reachable.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    options: LoopbackOptions,
    clients: Arc<DashMap<UserId, LoopbackClient>>,
}

impl LoopbackFactory {
    #[must_use]
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            options,
            clients: Arc::new(DashMap::new()),
        }
    }

    /// Most recently created client for `user_id`.
    #[must_use]
    pub fn client(&self, user_id: &UserId) -> Option<LoopbackClient> {
        self.clients.get(user_id).map(|c| c.value().clone())
    }

    /// Number of users a client has been created for.
    #[must_use]
    pub fn users(&self) -> usize {
        self.clients.len()
    }
}

impl ClientFactory for LoopbackFactory {
    fn create(&self, user_id: &UserId, sink: EventSink) -> Arc<dyn AutomationClient> {
        let client = LoopbackClient::new(user_id.clone(), sink, self.options);
        self.clients.insert(user_id.clone(), client.clone());
        Arc::new(client)
    }
}
