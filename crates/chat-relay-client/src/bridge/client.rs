//! Automation client backed by a bridge process.

use std::{io, process::Stdio, sync::Arc};

use async_trait::async_trait;
use chat_relay_core::{
    AutomationClient, Chat, ClientError, Contact, EventSink, PlatformMessage, TeardownMode, UserId,
};
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use parking_lot::{Mutex, RwLock};
use tokio::{process::Command, task::JoinHandle};

use super::{
    BridgeConfig,
    protocol::{BridgeCommand, ProtocolPeer},
};
use crate::command::{CommandBuildError, CommandBuilder};

impl From<CommandBuildError> for ClientError {
    fn from(e: CommandBuildError) -> Self {
        let kind = match e {
            CommandBuildError::ExecutableNotFound(_) => io::ErrorKind::NotFound,
            _ => io::ErrorKind::InvalidInput,
        };
        Self::Io(io::Error::new(kind, e))
    }
}

struct Running {
    child: AsyncGroupChild,
    peer: ProtocolPeer,
    reader: JoinHandle<()>,
}

impl Running {
    /// Kill the process group without waiting for it.
    fn abort(mut self) {
        self.peer.set_closing(true);
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("Failed to kill bridge process: {e}");
        }
        self.reader.abort();
    }
}

/// One user's automation client, running as a bridge process.
///
/// The process is spawned by [`AutomationClient::start`], not on creation,
/// and killed on shutdown or drop.
pub struct BridgeClient {
    user_id: UserId,
    config: BridgeConfig,
    sink: EventSink,
    identity: Arc<RwLock<Option<String>>>,
    running: Mutex<Option<Running>>,
}

impl BridgeClient {
    #[must_use]
    pub fn new(user_id: UserId, sink: EventSink, config: BridgeConfig) -> Self {
        Self {
            user_id,
            config,
            sink,
            identity: Arc::new(RwLock::new(None)),
            running: Mutex::new(None),
        }
    }

    /// Whether the bridge process has been started and not shut down.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn peer(&self) -> Result<ProtocolPeer, ClientError> {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.peer.clone())
            .ok_or(ClientError::NotConnected)
    }

    async fn spawn_process(&self) -> Result<Running, ClientError> {
        let (program, args) = CommandBuilder::new(&self.config.command)
            .params(["--client-id", self.user_id.as_str()])
            .build()?
            .into_resolved()
            .await?;

        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command.group_spawn()?;
        let stdin = child.inner().stdin.take();
        let stdout = child.inner().stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.start_kill();
            return Err(ClientError::Protocol("bridge stdio unavailable".to_string()));
        };

        let (peer, reader) = ProtocolPeer::spawn(
            stdout,
            stdin,
            self.sink.clone(),
            Arc::clone(&self.identity),
            self.config.request_timeout,
        );
        tracing::info!(user_id = %self.user_id, pid = ?child.id(), "Bridge process started");

        Ok(Running {
            child,
            peer,
            reader,
        })
    }
}

#[async_trait]
impl AutomationClient for BridgeClient {
    async fn start(&self) -> Result<(), ClientError> {
        if self.is_running() {
            return Ok(());
        }

        let running = self.spawn_process().await?;
        let peer = running.peer.clone();
        if let Some(previous) = self.running.lock().replace(running) {
            previous.abort();
        }

        let initialized = peer
            .request(BridgeCommand::Initialize {
                client_id: self.user_id.to_string(),
            })
            .await;
        if let Err(e) = initialized {
            if let Some(running) = self.running.lock().take() {
                running.abort();
            }
            return Err(e);
        }
        Ok(())
    }

    fn identity(&self) -> Option<String> {
        self.identity.read().clone()
    }

    async fn send_message(&self, to: &str, text: &str) -> Result<(), ClientError> {
        self.peer()?
            .request(BridgeCommand::SendMessage {
                to: to.to_string(),
                text: text.to_string(),
            })
            .await
            .map(|_| ())
    }

    async fn chats(&self) -> Result<Vec<Chat>, ClientError> {
        self.peer()?.request_as(BridgeCommand::GetChats).await
    }

    async fn chat_messages(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>, ClientError> {
        self.peer()?
            .request_as(BridgeCommand::GetChatMessages {
                chat_id: chat_id.to_string(),
                limit,
            })
            .await
    }

    async fn contact(&self, contact_id: &str) -> Result<Contact, ClientError> {
        self.peer()?
            .request_as(BridgeCommand::GetContact {
                contact_id: contact_id.to_string(),
            })
            .await
    }

    async fn contacts(&self) -> Result<Vec<Contact>, ClientError> {
        self.peer()?.request_as(BridgeCommand::GetContacts).await
    }

    async fn profile_pic_url(&self, contact_id: &str) -> Result<Option<String>, ClientError> {
        self.peer()?
            .request_as(BridgeCommand::GetProfilePicUrl {
                contact_id: contact_id.to_string(),
            })
            .await
    }

    async fn shutdown(&self, mode: TeardownMode) -> Result<(), ClientError> {
        let Some(mut running) = self.running.lock().take() else {
            return Ok(());
        };

        let command = match mode {
            TeardownMode::Soft => BridgeCommand::Logout,
            TeardownMode::Hard => BridgeCommand::Destroy,
        };
        running.peer.set_closing(true);
        match running.peer.request(command).await {
            Ok(_) | Err(ClientError::NotConnected) => {}
            Err(e) => {
                // Bridge is still up and still owns the session.
                running.peer.set_closing(false);
                let mut slot = self.running.lock();
                if slot.is_none() {
                    *slot = Some(running);
                } else {
                    running.abort();
                }
                return Err(e);
            }
        }

        if let Err(e) = running.child.kill().await {
            tracing::debug!(user_id = %self.user_id, "Bridge process already gone: {e}");
        }
        running.reader.abort();
        *self.identity.write() = None;
        tracing::info!(user_id = %self.user_id, ?mode, "Bridge process stopped");
        Ok(())
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.abort();
        }
    }
}
