//! Test doubles shared by the component tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use media_session::{CallRole, MediaSessionController};
use parking_lot::Mutex;
use shared::{
    domain::{ChatId, ConnectionId, MessageId, Role, SessionId, UserId},
    protocol::{
        ClientFrame, ConversationSummary, MessagePayload, RealtimeEvent, SendMessageRequest,
        UnreadCounts,
    },
};
use tokio::sync::{broadcast, mpsc};

use crate::{
    backoff::BackoffPolicy,
    call::{AudioCue, CallSurface},
    chat_api::ChatApi,
    connection::{ConnectionManager, ConnectionSettings},
    error::{RealtimeError, RealtimeResult},
    transport::{HandshakeRequest, RealtimeTransport, TransportLink},
    ClientEvent,
};

pub(crate) const TOKEN: &str = "tok-1";

/// Lets spawned tasks and the connection pump run to quiescence.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub(crate) fn drain_events(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub(crate) fn message(chat_id: &str, id: &str, sender_role: Role, offset_secs: i64) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        chat_id: ChatId::from(chat_id),
        sender_id: UserId::from(match sender_role {
            Role::EndUser => "mentee-1",
            Role::Provider => "mentor-1",
        }),
        sender_role,
        content: format!("body of {id}"),
        media: None,
        created_at: Utc
            .timestamp_opt(1_700_000_000 + offset_secs, 0)
            .single()
            .expect("valid timestamp"),
        read_by_recipient: false,
    }
}

pub(crate) fn page(chat_id: &str, prefix: &str, count: usize, start_offset: i64) -> Vec<MessagePayload> {
    (0..count)
        .map(|i| {
            let offset = start_offset - i as i64;
            message(chat_id, &format!("{prefix}-{i}"), Role::Provider, offset)
        })
        .collect()
}

pub(crate) fn summary(chat_id: &str, unread: UnreadCounts) -> ConversationSummary {
    ConversationSummary {
        id: ChatId::from(chat_id),
        participant_ids: vec![UserId::from("mentee-1"), UserId::from("mentor-1")],
        last_message_preview: None,
        unread,
    }
}

pub(crate) fn connection_settings(auto_reconnect: bool) -> ConnectionSettings {
    ConnectionSettings {
        endpoint: "http://realtime.test".into(),
        connect_timeout: Duration::from_secs(10),
        backoff: BackoffPolicy {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
            jitter: 0.0,
        },
        auto_reconnect,
    }
}

pub(crate) enum OpenOutcome {
    Accept,
    Fail(RealtimeError),
    Hang,
}

struct PeerInner {
    events: Option<mpsc::UnboundedSender<RealtimeResult<RealtimeEvent>>>,
    frames: mpsc::UnboundedReceiver<ClientFrame>,
}

/// Server side of one fake link.
#[derive(Clone)]
pub(crate) struct FakePeer {
    inner: Arc<Mutex<PeerInner>>,
}

impl FakePeer {
    pub(crate) fn push(&self, event: RealtimeEvent) {
        self.push_raw(Ok(event));
    }

    pub(crate) fn push_raw(&self, item: RealtimeResult<RealtimeEvent>) {
        if let Some(events) = &self.inner.lock().events {
            let _ = events.send(item);
        }
    }

    /// Simulates the server dropping the connection.
    pub(crate) fn close(&self) {
        self.inner.lock().events = None;
    }

    pub(crate) fn drain(&self) -> Vec<ClientFrame> {
        let mut guard = self.inner.lock();
        let mut frames = Vec::new();
        while let Ok(frame) = guard.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// True once the client dropped its end of the link.
    pub(crate) fn client_closed(&self) -> bool {
        let mut guard = self.inner.lock();
        loop {
            match guard.frames.try_recv() {
                Ok(_) => continue,
                Err(mpsc::error::TryRecvError::Empty) => return false,
                Err(mpsc::error::TryRecvError::Disconnected) => return true,
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    script: Mutex<VecDeque<OpenOutcome>>,
    requests: Mutex<Vec<(String, Role)>>,
    peers: Mutex<Vec<FakePeer>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Outcomes consumed by the next `open` calls; an empty script accepts.
    pub(crate) fn script(&self, outcomes: impl IntoIterator<Item = OpenOutcome>) {
        self.script.lock().extend(outcomes);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn requests(&self) -> Vec<(String, Role)> {
        self.requests.lock().clone()
    }

    pub(crate) fn peer(&self, index: usize) -> FakePeer {
        self.peers.lock()[index].clone()
    }

    pub(crate) fn latest_peer(&self) -> FakePeer {
        self.peers
            .lock()
            .last()
            .cloned()
            .expect("no link was opened")
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn open(&self, request: &HandshakeRequest) -> RealtimeResult<TransportLink> {
        self.requests
            .lock()
            .push((request.token.clone(), request.role));
        let outcome = self.script.lock().pop_front().unwrap_or(OpenOutcome::Accept);
        match outcome {
            OpenOutcome::Accept => {}
            OpenOutcome::Fail(err) => return Err(err),
            OpenOutcome::Hang => futures::future::pending::<()>().await,
        }

        let (outbound, frames) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        let mut peers = self.peers.lock();
        peers.push(FakePeer {
            inner: Arc::new(Mutex::new(PeerInner {
                events: Some(events),
                frames,
            })),
        });
        Ok(TransportLink {
            connection_id: ConnectionId::new(format!("conn-{}", peers.len())),
            outbound,
            inbound,
        })
    }
}

pub(crate) fn manager(
    transport: &Arc<FakeTransport>,
    auto_reconnect: bool,
) -> (Arc<ConnectionManager>, broadcast::Receiver<ClientEvent>) {
    let (events, rx) = broadcast::channel(256);
    let manager = ConnectionManager::new(
        connection_settings(auto_reconnect),
        Arc::clone(transport) as Arc<dyn RealtimeTransport>,
        events,
    );
    (manager, rx)
}

pub(crate) struct FakeChatApi {
    local_role: Role,
    conversations: Mutex<RealtimeResult<Vec<ConversationSummary>>>,
    pages: Mutex<HashMap<(ChatId, u32), RealtimeResult<Vec<MessagePayload>>>>,
    delays: Mutex<HashMap<ChatId, Duration>>,
    log: Mutex<Vec<String>>,
    tokens: Mutex<Vec<Option<String>>>,
    sent: AtomicU32,
}

impl FakeChatApi {
    pub(crate) fn new(local_role: Role) -> Arc<Self> {
        Arc::new(Self {
            local_role,
            conversations: Mutex::new(Ok(Vec::new())),
            pages: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            sent: AtomicU32::new(0),
        })
    }

    pub(crate) fn set_conversations(&self, result: RealtimeResult<Vec<ConversationSummary>>) {
        *self.conversations.lock() = result;
    }

    pub(crate) fn set_page(&self, chat_id: &str, page: u32, result: RealtimeResult<Vec<MessagePayload>>) {
        self.pages.lock().insert((ChatId::from(chat_id), page), result);
    }

    pub(crate) fn delay_chat(&self, chat_id: &str, delay: Duration) {
        self.delays.lock().insert(ChatId::from(chat_id), delay);
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub(crate) fn calls_matching(&self, prefix: &str) -> usize {
        self.log.lock().iter().filter(|entry| entry.starts_with(prefix)).count()
    }

    pub(crate) fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn authorize(&self, token: Option<&str>) {
        self.tokens.lock().push(token.map(str::to_string));
    }

    async fn fetch_conversations(&self) -> RealtimeResult<Vec<ConversationSummary>> {
        self.log.lock().push("conversations".into());
        self.conversations.lock().clone()
    }

    async fn fetch_messages(
        &self,
        chat_id: &ChatId,
        page: u32,
        limit: u32,
    ) -> RealtimeResult<Vec<MessagePayload>> {
        self.log.lock().push(format!("messages {chat_id} p{page} l{limit}"));
        let delay = self.delays.lock().get(chat_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.pages
            .lock()
            .get(&(chat_id.clone(), page))
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn send_message(
        &self,
        chat_id: &ChatId,
        request: &SendMessageRequest,
    ) -> RealtimeResult<MessagePayload> {
        self.log.lock().push(format!("send {chat_id}"));
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sent = message(chat_id.as_str(), &format!("sent-{n}"), self.local_role, 10_000 + i64::from(n));
        sent.content = request.content.clone();
        sent.media = request.media.clone();
        Ok(sent)
    }

    async fn mark_as_read(&self, chat_id: &ChatId) -> RealtimeResult<()> {
        self.log.lock().push(format!("read {chat_id}"));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingSurface {
    log: Mutex<Vec<String>>,
}

impl RecordingSurface {
    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl CallSurface for RecordingSurface {
    fn present(&self, session_id: &SessionId, window: Duration, needs_sound_unlock: bool) {
        self.log.lock().push(format!(
            "present {session_id} {}s unlock={needs_sound_unlock}",
            window.as_secs()
        ));
    }

    fn dismiss(&self, session_id: &SessionId) {
        self.log.lock().push(format!("dismiss {session_id}"));
    }

    fn open_lobby(&self, session_id: &SessionId, role: CallRole) {
        self.log.lock().push(format!("lobby {session_id} {role:?}"));
    }
}

pub(crate) struct RecordingAudio {
    unlock_allowed: bool,
    /// Blocks the calling thread inside `start_loop`, like a slow audio backend.
    start_delay: Option<Duration>,
    started: AtomicBool,
    log: Mutex<Vec<&'static str>>,
}

impl RecordingAudio {
    pub(crate) fn new(unlock_allowed: bool) -> Self {
        Self {
            unlock_allowed,
            start_delay: None,
            started: AtomicBool::new(false),
            log: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn slow_start(delay: Duration) -> Self {
        Self {
            start_delay: Some(delay),
            ..Self::new(true)
        }
    }

    pub(crate) fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn log(&self) -> Vec<&'static str> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl AudioCue for RecordingAudio {
    fn start_loop(&self) -> bool {
        self.log.lock().push("start");
        self.started.store(true, Ordering::SeqCst);
        if let Some(delay) = self.start_delay {
            std::thread::sleep(delay);
        }
        true
    }

    fn stop(&self) {
        self.log.lock().push("stop");
    }

    async fn unlock(&self) -> bool {
        self.log.lock().push("unlock");
        self.unlock_allowed
    }
}

#[derive(Default)]
pub(crate) struct RecordingMedia {
    fail: bool,
    log: Mutex<Vec<String>>,
}

impl RecordingMedia {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            log: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl MediaSessionController for RecordingMedia {
    async fn initialize(
        &self,
        session_id: &SessionId,
        role: CallRole,
        is_host: bool,
    ) -> anyhow::Result<bool> {
        self.log
            .lock()
            .push(format!("init {session_id} {role:?} host={is_host}"));
        if self.fail {
            return Err(anyhow!("camera unavailable"));
        }
        Ok(true)
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.log.lock().push("cleanup".into());
        Ok(())
    }
}
