use std::sync::{Arc, Weak};

use async_trait::async_trait;
use media_session::{CallSession, MediaSessionController};
use shared::{
    domain::{ChatId, Role, SessionId, UserId},
    protocol::{MediaDescriptor, MessagePayload},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod backoff;
pub mod call;
pub mod chat;
pub mod chat_api;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_bus;
pub mod transport;

pub use call::{
    Acknowledgment, AudioCue, CallDisposition, CallSettings, CallSignal, CallSignalingStateMachine,
    CallSurface,
};
pub use chat::{ChatSettings, ChatSyncEngine, ConversationThread, ThreadLoadState};
pub use chat_api::{ChatApi, HttpChatApi};
pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState, Credentials};
pub use error::{RealtimeError, RealtimeResult};
pub use event_bus::{EventBus, Subscription};
pub use transport::{RealtimeTransport, WebSocketTransport};

/// UI-facing notifications published by every component on one broadcast channel.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    AuthorizationRevoked {
        reason: String,
    },
    ConnectionLost {
        attempts: u32,
    },
    ChatsUpdated,
    ThreadUpdated {
        chat_id: ChatId,
    },
    MessageReceived(MessagePayload),
    TypingChanged {
        chat_id: ChatId,
        typing: bool,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    CallRinging {
        session_id: SessionId,
    },
    CallAcknowledged {
        session_id: SessionId,
        disposition: CallDisposition,
    },
    SessionActivated {
        session_id: SessionId,
    },
    CallEnded {
        session_id: SessionId,
    },
    /// Recoverable problem worth showing to the user; cached state was kept.
    Notice(String),
    Error(String),
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn login(&self, token: &str, role: Role) -> RealtimeResult<()>;
    async fn logout(&self);
    async fn refresh_chats(&self) -> RealtimeResult<bool>;
    async fn select_thread(&self, chat_id: ChatId) -> RealtimeResult<bool>;
    async fn load_more_messages(&self) -> RealtimeResult<bool>;
    async fn send_message(
        &self,
        content: &str,
        media: Option<MediaDescriptor>,
    ) -> RealtimeResult<MessagePayload>;
    async fn join_call(&self) -> RealtimeResult<CallSession>;
    async fn skip_call(&self) -> RealtimeResult<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

struct ClientSessionState {
    identity: Option<Credentials>,
    lifecycle_task: Option<JoinHandle<()>>,
}

pub struct RealtimeClient {
    api: Arc<dyn ChatApi>,
    connection: Arc<ConnectionManager>,
    chat: Arc<ChatSyncEngine>,
    calls: Arc<CallSignalingStateMachine>,
    inner: Mutex<ClientSessionState>,
    events: broadcast::Sender<ClientEvent>,
    weak_self: Weak<RealtimeClient>,
}

impl RealtimeClient {
    pub fn new(
        settings: &ClientSettings,
        transport: Arc<dyn RealtimeTransport>,
        api: Arc<dyn ChatApi>,
        media: Arc<dyn MediaSessionController>,
        surface: Arc<dyn CallSurface>,
        audio: Arc<dyn AudioCue>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let connection = ConnectionManager::new(
            ConnectionSettings {
                endpoint: settings.realtime_endpoint.clone(),
                connect_timeout: settings.connect_timeout,
                backoff: settings.backoff_policy(),
                auto_reconnect: true,
            },
            transport,
            events.clone(),
        );
        let chat = ChatSyncEngine::new(
            ChatSettings {
                page_size: settings.page_size,
                typing_debounce: settings.typing_debounce,
                typing_expiry: settings.typing_expiry,
                presence_expiry: settings.presence_expiry,
                chat_list_ttl: settings.chat_list_ttl,
            },
            Arc::clone(&api),
            Arc::clone(&connection),
            events.clone(),
        );
        let calls = CallSignalingStateMachine::new(
            CallSettings {
                decision_window: settings.call_decision_window,
                attach_timeout: settings.connect_timeout,
            },
            Arc::clone(&connection),
            media,
            surface,
            audio,
            events.clone(),
        );
        Arc::new_cyclic(|weak_self| Self {
            api,
            connection,
            chat,
            calls,
            inner: Mutex::new(ClientSessionState {
                identity: None,
                lifecycle_task: None,
            }),
            events,
            weak_self: weak_self.clone(),
        })
    }

    /// Production wiring: websocket transport and the HTTP chat API.
    pub fn with_websocket(
        settings: &ClientSettings,
        media: Arc<dyn MediaSessionController>,
        surface: Arc<dyn CallSurface>,
        audio: Arc<dyn AudioCue>,
    ) -> Arc<Self> {
        Self::new(
            settings,
            Arc::new(WebSocketTransport),
            Arc::new(HttpChatApi::new(settings.api_base_url.clone())),
            media,
            surface,
            audio,
        )
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn chat(&self) -> &Arc<ChatSyncEngine> {
        &self.chat
    }

    pub fn calls(&self) -> &Arc<CallSignalingStateMachine> {
        &self.calls
    }

    pub async fn identity(&self) -> Option<Credentials> {
        self.inner.lock().await.identity.clone()
    }

    /// Connects under the identity, wires every component to the connection and loads the
    /// conversation list. Switching identity drops all state held for the previous one.
    pub async fn login(&self, token: &str, role: Role) -> RealtimeResult<()> {
        let credentials = Credentials::new(token, role);
        let previous = self.inner.lock().await.identity.clone();
        if let Some(previous) = previous.filter(|previous| previous != &credentials) {
            info!(from = %previous.role, to = %role, "client: identity changed, dropping session state");
            self.release_components().await;
        }

        self.api.authorize(Some(token)).await;
        if let Err(err) = self.connection.connect(token, role).await {
            if err.is_authorization() {
                self.api.authorize(None).await;
                self.inner.lock().await.identity = None;
            }
            return Err(err);
        }

        self.chat.set_local_role(Some(role)).await;
        self.chat.attach().await;
        self.calls.attach().await?;
        if let Err(err) = self.chat.announce_presence(true).await {
            debug!(%err, "client: presence announcement skipped");
        }

        {
            let mut guard = self.inner.lock().await;
            guard.identity = Some(credentials);
            if guard
                .lifecycle_task
                .as_ref()
                .map_or(true, |task| task.is_finished())
            {
                guard.lifecycle_task = Some(self.spawn_lifecycle_watcher());
            }
        }
        info!(%role, "client: logged in");

        self.chat.refresh_chats().await.map(|_| ())
    }

    /// Ends the session: leaves every room, drops the connection and forgets the identity.
    pub async fn logout(&self) {
        if let Err(err) = self.chat.announce_presence(false).await {
            debug!(%err, "client: offline announcement skipped");
        }
        self.release_components().await;
        {
            let mut guard = self.inner.lock().await;
            guard.identity = None;
            if let Some(task) = guard.lifecycle_task.take() {
                task.abort();
            }
        }
        self.connection.disconnect().await;
        self.api.authorize(None).await;
        info!("client: logged out");
    }

    async fn release_components(&self) {
        if let Err(err) = self.calls.end_call().await {
            warn!(%err, "client: media cleanup failed");
        }
        self.calls.detach().await;
        self.calls.reset().await;
        self.chat.teardown().await;
        self.chat.reset().await;
    }

    /// Foreground trigger: reconnects if needed and refreshes a stale conversation list.
    pub async fn on_foreground(&self) -> RealtimeResult<()> {
        self.connection.on_foreground().await?;
        if self.connection.is_connected() {
            self.chat.refresh_chats_if_stale().await?;
        }
        Ok(())
    }

    /// Reconnect trigger for the logged-in identity. `Ok(false)` when backoff held it.
    pub async fn ensure_connected(&self) -> RealtimeResult<bool> {
        let identity = self
            .identity()
            .await
            .ok_or_else(|| RealtimeError::InvalidState("not logged in".into()))?;
        self.connection
            .ensure_connected(&identity.token, identity.role)
            .await
    }

    /// Drops the session after the backend rejected the stored token outside of `login`.
    async fn handle_authorization_revoked(&self, reason: &str) {
        if self.connection.stored_credentials().await.is_some() {
            debug!("client: revocation superseded by a newer login");
            return;
        }
        if self.inner.lock().await.identity.is_none() {
            return;
        }
        warn!(reason, "client: token revoked, logging out");
        self.release_components().await;
        self.inner.lock().await.identity = None;
        self.api.authorize(None).await;
    }

    /// Re-joins rooms on every transition to Connected and logs out when the token is
    /// revoked. State changes are read from the event channel, which does not coalesce them.
    fn spawn_lifecycle_watcher(&self) -> JoinHandle<()> {
        let mut events_rx = self.events.subscribe();
        let client = self.weak_self.clone();
        tokio::spawn(async move {
            loop {
                let event = events_rx.recv().await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                match event {
                    Ok(ClientEvent::ConnectionStateChanged(ConnectionState::Connected)) => {
                        debug!("client: connection restored, re-joining rooms");
                        client.chat.resubscribe_rooms().await;
                        client.calls.resubscribe_rooms().await;
                        if let Err(err) = client.chat.refresh_chats_if_stale().await {
                            let _ = client.events.send(ClientEvent::Error(err.to_string()));
                        }
                    }
                    Ok(ClientEvent::AuthorizationRevoked { reason }) => {
                        client.handle_authorization_revoked(&reason).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "client: lifecycle watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl ClientHandle for RealtimeClient {
    async fn login(&self, token: &str, role: Role) -> RealtimeResult<()> {
        RealtimeClient::login(self, token, role).await
    }

    async fn logout(&self) {
        RealtimeClient::logout(self).await
    }

    async fn refresh_chats(&self) -> RealtimeResult<bool> {
        self.chat.refresh_chats().await
    }

    async fn select_thread(&self, chat_id: ChatId) -> RealtimeResult<bool> {
        self.chat.select_thread(chat_id).await
    }

    async fn load_more_messages(&self) -> RealtimeResult<bool> {
        self.chat.load_more_messages().await
    }

    async fn send_message(
        &self,
        content: &str,
        media: Option<MediaDescriptor>,
    ) -> RealtimeResult<MessagePayload> {
        self.chat.send_message(content, media).await
    }

    async fn join_call(&self) -> RealtimeResult<CallSession> {
        self.calls.join().await
    }

    async fn skip_call(&self) -> RealtimeResult<()> {
        self.calls.skip().await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
