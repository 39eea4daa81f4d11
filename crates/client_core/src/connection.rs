//! The single persistent realtime connection: authentication, reconnect backoff and room
//! membership. Everything else talks to the backend through this manager.

use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use shared::{
    domain::{ConnectionId, Role, RoomId},
    protocol::{ClientFrame, EventName, RealtimeEvent},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::{BackoffDecision, BackoffPolicy, ReconnectBackoff},
    error::{RealtimeError, RealtimeResult},
    event_bus::{EventBus, Subscription},
    transport::{HandshakeRequest, RealtimeTransport},
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub role: Role,
}

impl Credentials {
    pub fn new(token: impl Into<String>, role: Role) -> Self {
        Self {
            token: token.into(),
            role,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("role", &self.role)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Reconnect on its own after the link drops.
    pub auto_reconnect: bool,
}

struct LiveLink {
    credentials: Credentials,
    connection_id: ConnectionId,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    pump: JoinHandle<()>,
    epoch: u64,
}

struct ConnectionInner {
    credentials: Option<Credentials>,
    link: Option<LiveLink>,
    joined_rooms: HashSet<RoomId>,
    backoff: ReconnectBackoff,
    link_epoch: u64,
    reconnect_task: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    transport: Arc<dyn RealtimeTransport>,
    bus: Arc<EventBus>,
    inner: Mutex<ConnectionInner>,
    connect_lock: Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    weak_self: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        transport: Arc<dyn RealtimeTransport>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let backoff = ReconnectBackoff::new(settings.backoff);
        Arc::new_cyclic(|weak_self| Self {
            settings,
            transport,
            bus: Arc::new(EventBus::new()),
            inner: Mutex::new(ConnectionInner {
                credentials: None,
                link: None,
                joined_rooms: HashSet::new(),
                backoff,
                link_epoch: 0,
                reconnect_task: None,
            }),
            connect_lock: Mutex::new(()),
            state_tx,
            events,
            weak_self: weak_self.clone(),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Role of the live connection, if any.
    pub async fn current_role(&self) -> Option<Role> {
        let guard = self.inner.lock().await;
        guard.link.as_ref().map(|link| link.credentials.role)
    }

    pub async fn connection_id(&self) -> Option<ConnectionId> {
        let guard = self.inner.lock().await;
        guard.link.as_ref().map(|link| link.connection_id.clone())
    }

    pub async fn stored_credentials(&self) -> Option<Credentials> {
        self.inner.lock().await.credentials.clone()
    }

    pub async fn joined_rooms(&self) -> Vec<RoomId> {
        let guard = self.inner.lock().await;
        let mut rooms: Vec<RoomId> = guard.joined_rooms.iter().cloned().collect();
        rooms.sort();
        rooms
    }

    pub async fn reconnect_failures(&self) -> u32 {
        self.inner.lock().await.backoff.failures()
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(?state, "connection: state changed");
            let _ = self.events.send(ClientEvent::ConnectionStateChanged(state));
        }
    }

    /// Establishes the channel under the given identity. A live link under a different
    /// identity is torn down first; the same identity while connected is a no-op.
    pub async fn connect(&self, token: &str, role: Role) -> RealtimeResult<()> {
        let _connecting = self.connect_lock.lock().await;
        let credentials = Credentials::new(token, role);

        {
            let mut guard = self.inner.lock().await;
            if let Some(link) = &guard.link {
                if link.credentials == credentials && self.is_connected() {
                    debug!(%role, "connection: already connected with this identity");
                    return Ok(());
                }
                if link.credentials.role != role {
                    info!(
                        from = %link.credentials.role,
                        to = %role,
                        "connection: role switch forces teardown"
                    );
                } else {
                    info!("connection: credential change forces teardown");
                }
            }
            if guard.credentials.as_ref() != Some(&credentials) {
                guard.backoff.reset();
            }
            Self::teardown_link(&mut guard);
            guard.credentials = Some(credentials.clone());
        }

        let reconnecting = self.state() == ConnectionState::Reconnecting;
        if !reconnecting {
            self.set_state(ConnectionState::Connecting);
        }

        let request = HandshakeRequest {
            endpoint: self.settings.endpoint.clone(),
            token: credentials.token.clone(),
            role,
            timeout: self.settings.connect_timeout,
        };
        let opened = tokio::time::timeout(self.settings.connect_timeout, self.transport.open(&request))
            .await
            .unwrap_or(Err(RealtimeError::Timeout(self.settings.connect_timeout)));

        match opened {
            Ok(link) => {
                let mut guard = self.inner.lock().await;
                guard.link_epoch += 1;
                let epoch = guard.link_epoch;
                let pump = self.spawn_pump(epoch, link.inbound);
                info!(
                    connection_id = %link.connection_id,
                    %role,
                    "connection: established"
                );
                guard.link = Some(LiveLink {
                    credentials,
                    connection_id: link.connection_id,
                    outbound: link.outbound,
                    pump,
                    epoch,
                });
                guard.backoff.reset();
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(err) if err.is_authorization() => {
                error!(%err, %role, "connection: identity rejected");
                {
                    let mut guard = self.inner.lock().await;
                    guard.credentials = None;
                    guard.backoff.reset();
                }
                self.set_state(ConnectionState::Disconnected);
                let _ = self.events.send(ClientEvent::AuthorizationRevoked {
                    reason: err.to_string(),
                });
                Err(err)
            }
            Err(err) => {
                let delay = self.inner.lock().await.backoff.record_failure(Instant::now());
                warn!(%err, retry_in = ?delay, "connection: attempt failed");
                self.set_state(if reconnecting {
                    ConnectionState::Reconnecting
                } else {
                    ConnectionState::Disconnected
                });
                Err(err)
            }
        }
    }

    /// Reconnect trigger for an authenticated identity: connects when not connected or when
    /// connected under another identity. Returns `Ok(false)` while backoff holds the attempt.
    pub async fn ensure_connected(&self, token: &str, role: Role) -> RealtimeResult<bool> {
        {
            let guard = self.inner.lock().await;
            let matches_identity = guard
                .link
                .as_ref()
                .is_some_and(|link| link.credentials.token == token && link.credentials.role == role);
            if matches_identity && self.is_connected() {
                return Ok(true);
            }
            match guard.backoff.decide(Instant::now()) {
                BackoffDecision::Ready => {}
                BackoffDecision::Wait(remaining) => {
                    debug!(?remaining, "connection: reconnect held by backoff");
                    return Ok(false);
                }
                BackoffDecision::Exhausted { attempts } => {
                    return Err(RealtimeError::RetriesExhausted { attempts });
                }
            }
        }
        self.connect(token, role).await.map(|_| true)
    }

    /// Foreground trigger: reconnects with stored credentials when the link is down.
    pub async fn on_foreground(&self) -> RealtimeResult<bool> {
        if self.is_connected() {
            return Ok(false);
        }
        let Some(credentials) = self.stored_credentials().await else {
            return Ok(false);
        };
        self.ensure_connected(&credentials.token, credentials.role)
            .await
    }

    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| *state == ConnectionState::Connected))
                .await,
            Ok(Ok(_))
        );
        ready
    }

    /// Explicit logout: drops the link, the stored identity and any pending reconnect.
    pub async fn disconnect(&self) {
        let _connecting = self.connect_lock.lock().await;
        {
            let mut guard = self.inner.lock().await;
            if let Some(task) = guard.reconnect_task.take() {
                task.abort();
            }
            Self::teardown_link(&mut guard);
            guard.credentials = None;
            guard.backoff.reset();
        }
        info!("connection: disconnected");
        self.set_state(ConnectionState::Disconnected);
    }

    fn teardown_link(guard: &mut ConnectionInner) {
        if let Some(link) = guard.link.take() {
            link.pump.abort();
            debug!(connection_id = %link.connection_id, "connection: link torn down");
        }
        guard.joined_rooms.clear();
    }

    pub async fn join_room(&self, room: RoomId) -> RealtimeResult<()> {
        let mut guard = self.inner.lock().await;
        if guard.joined_rooms.contains(&room) {
            debug!(%room, "connection: room already joined");
            return Ok(());
        }
        let link = guard.link.as_ref().ok_or(RealtimeError::NotConnected)?;
        link.outbound
            .send(ClientFrame::JoinRoom { room: room.clone() })
            .map_err(|_| RealtimeError::Transport("connection closed".into()))?;
        info!(%room, "connection: joined room");
        guard.joined_rooms.insert(room);
        Ok(())
    }

    pub async fn leave_room(&self, room: RoomId) -> RealtimeResult<()> {
        let mut guard = self.inner.lock().await;
        if !guard.joined_rooms.remove(&room) {
            return Ok(());
        }
        if let Some(link) = &guard.link {
            let _ = link.outbound.send(ClientFrame::LeaveRoom { room: room.clone() });
        }
        info!(%room, "connection: left room");
        Ok(())
    }

    pub async fn emit(&self, frame: ClientFrame) -> RealtimeResult<()> {
        let guard = self.inner.lock().await;
        let link = guard.link.as_ref().ok_or(RealtimeError::NotConnected)?;
        link.outbound
            .send(frame)
            .map_err(|_| RealtimeError::Transport("connection closed".into()))
    }

    pub fn on<F, Fut>(&self, name: EventName, handler: F) -> Subscription
    where
        F: Fn(RealtimeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.bus.on(name, handler)
    }

    pub fn off(&self, subscription: Subscription) -> bool {
        self.bus.off(subscription)
    }

    fn spawn_pump(
        &self,
        epoch: u64,
        mut inbound: mpsc::UnboundedReceiver<RealtimeResult<RealtimeEvent>>,
    ) -> JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let events = self.events.clone();
        let manager = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(item) = inbound.recv().await {
                match item {
                    Ok(event) => {
                        bus.dispatch(event).await;
                    }
                    Err(err) => {
                        warn!(%err, "connection: dropping malformed event");
                        let _ = events.send(ClientEvent::Notice(err.to_string()));
                    }
                }
            }
            if let Some(manager) = manager.upgrade() {
                manager.handle_link_closed(epoch).await;
            }
        })
    }

    async fn handle_link_closed(&self, epoch: u64) {
        {
            let mut guard = self.inner.lock().await;
            let is_current = guard.link.as_ref().is_some_and(|link| link.epoch == epoch);
            if !is_current {
                return;
            }
            if let Some(link) = guard.link.take() {
                warn!(connection_id = %link.connection_id, "connection: link dropped");
            }
            guard.joined_rooms.clear();
        }
        self.set_state(ConnectionState::Reconnecting);
        if self.settings.auto_reconnect {
            self.schedule_reconnect().await;
        }
    }

    async fn schedule_reconnect(&self) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let mut guard = self.inner.lock().await;
        if guard
            .reconnect_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        guard.reconnect_task = Some(tokio::spawn(async move {
            manager.run_reconnect_loop().await;
        }));
    }

    async fn run_reconnect_loop(&self) {
        loop {
            let (credentials, decision) = {
                let guard = self.inner.lock().await;
                (guard.credentials.clone(), guard.backoff.decide(Instant::now()))
            };
            let Some(credentials) = credentials else {
                return;
            };
            match decision {
                BackoffDecision::Ready => {}
                BackoffDecision::Wait(remaining) => {
                    tokio::time::sleep(remaining).await;
                    continue;
                }
                BackoffDecision::Exhausted { attempts } => {
                    error!(attempts, "connection: reconnect gave up");
                    self.set_state(ConnectionState::Disconnected);
                    let _ = self.events.send(ClientEvent::ConnectionLost { attempts });
                    return;
                }
            }
            match self.connect(&credentials.token, credentials.role).await {
                Ok(()) => {
                    let mut guard = self.inner.lock().await;
                    if guard.link.is_none() {
                        continue;
                    }
                    // Lets the next drop schedule a fresh loop while this task winds down.
                    guard.reconnect_task = None;
                    info!("connection: reconnected");
                    return;
                }
                Err(err) if err.is_authorization() => return,
                // Every other failure was recorded against the backoff, which ends the loop.
                Err(err) => {
                    if !err.is_retryable() {
                        warn!(%err, "connection: unexpected failure while reconnecting");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
