//! Local, synchronized view of conversations and their message windows.
//!
//! The server owns every message; this engine only keeps a deduplicated cache of what it has
//! fetched or been pushed, and reconstructs display order from `(created_at, id)`.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
    time::Duration,
};

use shared::{
    domain::{ChatId, MessageId, Role, RoomId, UserId},
    protocol::{
        ClientFrame, ConversationSummary, EventName, MediaDescriptor, MessagePayload,
        MessagesReadPayload, RealtimeEvent, SendMessageRequest, TypingPayload, UnreadCounts,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    chat_api::ChatApi,
    connection::ConnectionManager,
    error::{RealtimeError, RealtimeResult},
    event_bus::Subscription,
    ClientEvent,
};

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub page_size: u32,
    pub typing_debounce: Duration,
    pub typing_expiry: Duration,
    pub presence_expiry: Duration,
    pub chat_list_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadLoadState {
    Unloaded,
    Loading,
    Loaded,
    LoadingMore,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct ConversationThread {
    pub id: ChatId,
    pub participant_ids: Vec<UserId>,
    pub last_message_preview: Option<String>,
    pub unread: UnreadCounts,
    /// Most recent first; reverse for chronological display.
    pub messages: Vec<MessagePayload>,
    /// Last page fetched into the window, 0 before the first fetch.
    pub page_cursor: u32,
    pub has_more: bool,
    pub load_state: ThreadLoadState,
    seen: HashMap<MessageId, SeenMessage>,
}

/// What the thread knows about an id, even after it left the message window.
#[derive(Debug, Clone, Copy)]
struct SeenMessage {
    recipient: Role,
    read: bool,
}

impl ConversationThread {
    fn new(id: ChatId) -> Self {
        Self {
            id,
            participant_ids: Vec::new(),
            last_message_preview: None,
            unread: UnreadCounts::default(),
            messages: Vec::new(),
            page_cursor: 0,
            has_more: true,
            load_state: ThreadLoadState::Unloaded,
            seen: HashMap::new(),
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    pub fn chronological(&self) -> impl Iterator<Item = &MessagePayload> {
        self.messages.iter().rev()
    }

    fn reset_window(&mut self) {
        self.messages.clear();
        self.page_cursor = 0;
        self.has_more = true;
    }

    fn sort_window(&mut self) {
        self.messages.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
    }

    /// Records a sighting of `message`. Returns true the first time the id is seen.
    fn observe(&mut self, message: &mut MessagePayload) -> bool {
        match self.seen.get(&message.id) {
            Some(seen) => {
                message.read_by_recipient |= seen.read;
                false
            }
            None => {
                self.seen.insert(
                    message.id.clone(),
                    SeenMessage {
                        recipient: message.recipient_role(),
                        read: message.read_by_recipient,
                    },
                );
                true
            }
        }
    }

    /// Appends a fetched page, skipping ids already present. Returns how many were new.
    fn merge_page(&mut self, page: Vec<MessagePayload>) -> usize {
        let mut present: HashSet<MessageId> = self.messages.iter().map(|m| m.id.clone()).collect();
        let before = self.messages.len();
        for mut message in page {
            if present.insert(message.id.clone()) {
                self.observe(&mut message);
                self.messages.push(message);
            }
        }
        self.sort_window();
        self.messages.len() - before
    }

    fn insert_message(&mut self, mut message: MessagePayload) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.observe(&mut message);
        self.messages.insert(0, message);
        self.sort_window();
        true
    }

    fn mark_window_read(&mut self, reader: Role) -> usize {
        for seen in self.seen.values_mut() {
            if seen.recipient == reader {
                seen.read = true;
            }
        }
        let mut flipped = 0;
        for message in &mut self.messages {
            if message.recipient_role() == reader && !message.read_by_recipient {
                message.read_by_recipient = true;
                flipped += 1;
            }
        }
        flipped
    }

    /// Applies a receipt for one id. Returns true when it moves `reader`'s unread counter:
    /// each id counts once, and only when it was addressed to `reader`. Ids never seen are
    /// taken as addressed to the reader and remembered as read.
    fn mark_read(&mut self, id: &MessageId, reader: Role) -> bool {
        let counted = match self.seen.get_mut(id) {
            Some(seen) if seen.recipient != reader || seen.read => false,
            Some(seen) => {
                seen.read = true;
                true
            }
            None => {
                self.seen.insert(
                    id.clone(),
                    SeenMessage {
                        recipient: reader,
                        read: true,
                    },
                );
                true
            }
        };
        if let Some(message) = self.messages.iter_mut().find(|m| &m.id == id) {
            if message.recipient_role() == reader {
                message.read_by_recipient = true;
            }
        }
        counted
    }
}

fn preview_of(message: &MessagePayload) -> String {
    if message.content.trim().is_empty() && message.media.is_some() {
        "[attachment]".to_string()
    } else {
        message.content.clone()
    }
}

struct ChatListCache {
    order: Vec<ChatId>,
    fetched_at: Option<Instant>,
}

impl ChatListCache {
    fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        self.fetched_at.is_some_and(|at| now.duration_since(at) < ttl)
    }
}

#[derive(Default)]
struct TypingDebounce {
    generation: u64,
    desired: bool,
    emitted: bool,
}

struct TypingFlag {
    expires_at: Instant,
}

struct PresenceEntry {
    online: bool,
    updated_at: Instant,
}

struct ChatState {
    local_role: Option<Role>,
    threads: HashMap<ChatId, ConversationThread>,
    list: ChatListCache,
    selected: Option<ChatId>,
    selection_generation: u64,
    fetch_in_flight: bool,
    subscribed_chats: HashSet<ChatId>,
    typing_outbound: HashMap<ChatId, TypingDebounce>,
    typing_inbound: HashMap<ChatId, TypingFlag>,
    presence: HashMap<UserId, PresenceEntry>,
    subscriptions: Vec<Subscription>,
}

impl ChatState {
    fn thread_mut(&mut self, chat_id: &ChatId) -> &mut ConversationThread {
        self.threads
            .entry(chat_id.clone())
            .or_insert_with(|| ConversationThread::new(chat_id.clone()))
    }

    fn is_current(&self, chat_id: &ChatId, generation: u64) -> bool {
        self.selection_generation == generation && self.selected.as_ref() == Some(chat_id)
    }
}

pub struct ChatSyncEngine {
    settings: ChatSettings,
    api: Arc<dyn ChatApi>,
    connection: Arc<ConnectionManager>,
    inner: Mutex<ChatState>,
    events: broadcast::Sender<ClientEvent>,
    weak_self: Weak<ChatSyncEngine>,
}

impl ChatSyncEngine {
    pub fn new(
        settings: ChatSettings,
        api: Arc<dyn ChatApi>,
        connection: Arc<ConnectionManager>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            settings,
            api,
            connection,
            inner: Mutex::new(ChatState {
                local_role: None,
                threads: HashMap::new(),
                list: ChatListCache {
                    order: Vec::new(),
                    fetched_at: None,
                },
                selected: None,
                selection_generation: 0,
                fetch_in_flight: false,
                subscribed_chats: HashSet::new(),
                typing_outbound: HashMap::new(),
                typing_inbound: HashMap::new(),
                presence: HashMap::new(),
                subscriptions: Vec::new(),
            }),
            events,
            weak_self: weak_self.clone(),
        })
    }

    pub async fn set_local_role(&self, role: Option<Role>) {
        self.inner.lock().await.local_role = role;
    }

    /// Registers the realtime listeners this engine consumes. Repeated calls are no-ops.
    pub async fn attach(&self) {
        let mut guard = self.inner.lock().await;
        if !guard.subscriptions.is_empty() {
            return;
        }
        for name in [
            EventName::NewMessage,
            EventName::MessagesRead,
            EventName::TypingStart,
            EventName::TypingStop,
            EventName::Online,
            EventName::Offline,
        ] {
            let engine = self.weak_self.clone();
            let subscription = self.connection.on(name, move |event| {
                let engine = engine.clone();
                async move {
                    if let Some(engine) = engine.upgrade() {
                        engine.handle_event(event).await;
                    }
                }
            });
            guard.subscriptions.push(subscription);
        }
    }

    pub async fn handle_event(&self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::NewMessage(message) => self.handle_new_message(message).await,
            RealtimeEvent::MessagesRead(payload) => self.handle_messages_read(payload).await,
            RealtimeEvent::TypingStart(payload) => self.handle_typing(payload, true).await,
            RealtimeEvent::TypingStop(payload) => self.handle_typing(payload, false).await,
            RealtimeEvent::Online(payload) => self.handle_presence(payload.user_id, true).await,
            RealtimeEvent::Offline(payload) => self.handle_presence(payload.user_id, false).await,
            other => debug!(event = %other.name(), "chat: ignoring event"),
        }
    }

    /// Fetches the conversation list. Recoverable failures keep the cache and return
    /// `Ok(false)`; authorization failures propagate.
    pub async fn refresh_chats(&self) -> RealtimeResult<bool> {
        let fetched = self
            .api
            .fetch_conversations()
            .await
            .map(|list| (!list.is_empty()).then_some(list));

        let mut guard = self.inner.lock().await;
        let list = match fetched {
            Ok(Some(list)) => list,
            Ok(None) if guard.threads.is_empty() => Vec::new(),
            Ok(None) => {
                drop(guard);
                return Ok(self.recoverable(RealtimeError::Data(
                    "conversation list came back empty".into(),
                )));
            }
            Err(err) if err.is_authorization() => return Err(err),
            Err(err) => {
                drop(guard);
                return Ok(self.recoverable(err));
            }
        };

        guard.list.order = list.iter().map(|summary| summary.id.clone()).collect();
        guard.list.fetched_at = Some(Instant::now());
        for summary in list {
            apply_summary(guard.thread_mut(&summary.id.clone()), summary);
        }
        info!(count = guard.list.order.len(), "chat: conversation list refreshed");
        drop(guard);
        let _ = self.events.send(ClientEvent::ChatsUpdated);
        Ok(true)
    }

    /// Refreshes the list only once the cached copy is older than the configured TTL.
    pub async fn refresh_chats_if_stale(&self) -> RealtimeResult<bool> {
        let fresh = {
            let guard = self.inner.lock().await;
            guard.list.is_fresh(self.settings.chat_list_ttl, Instant::now())
        };
        if fresh {
            return Ok(false);
        }
        self.refresh_chats().await
    }

    fn recoverable(&self, err: RealtimeError) -> bool {
        warn!(%err, "chat: keeping cached state after failed fetch");
        let _ = self.events.send(ClientEvent::Notice(err.to_string()));
        false
    }

    /// Makes `chat_id` the active thread: resets its window to page 1, fetches it and joins
    /// the chat room the first time the thread is selected.
    pub async fn select_thread(&self, chat_id: ChatId) -> RealtimeResult<bool> {
        let (generation, needs_join) = {
            let mut guard = self.inner.lock().await;
            guard.selected = Some(chat_id.clone());
            guard.selection_generation += 1;
            guard.fetch_in_flight = true;
            let thread = guard.thread_mut(&chat_id);
            thread.reset_window();
            thread.load_state = ThreadLoadState::Loading;
            let needs_join = guard.subscribed_chats.insert(chat_id.clone());
            (guard.selection_generation, needs_join)
        };

        if needs_join {
            if let Err(err) = self.connection.join_room(RoomId::chat(&chat_id)).await {
                warn!(%chat_id, %err, "chat: room join failed; will retry on next selection");
                self.inner.lock().await.subscribed_chats.remove(&chat_id);
            }
        }

        self.fetch_page(chat_id, 1, generation).await
    }

    /// Fetches the next page of the selected thread unless history is exhausted or a fetch
    /// is already running.
    pub async fn load_more_messages(&self) -> RealtimeResult<bool> {
        let (chat_id, page, generation) = {
            let mut guard = self.inner.lock().await;
            let Some(chat_id) = guard.selected.clone() else {
                return Ok(false);
            };
            if guard.fetch_in_flight {
                debug!(%chat_id, "chat: page fetch already in flight");
                return Ok(false);
            }
            let generation = guard.selection_generation;
            let thread = guard.thread_mut(&chat_id);
            if !thread.has_more {
                return Ok(false);
            }
            thread.load_state = ThreadLoadState::LoadingMore;
            let page = thread.page_cursor + 1;
            guard.fetch_in_flight = true;
            (chat_id, page, generation)
        };
        self.fetch_page(chat_id, page, generation).await
    }

    async fn fetch_page(&self, chat_id: ChatId, page: u32, generation: u64) -> RealtimeResult<bool> {
        let result = self
            .api
            .fetch_messages(&chat_id, page, self.settings.page_size)
            .await;

        let mut guard = self.inner.lock().await;
        if !guard.is_current(&chat_id, generation) {
            debug!(%chat_id, page, "chat: discarding page for stale selection");
            return Ok(false);
        }
        guard.fetch_in_flight = false;

        let messages = match result {
            Ok(messages) => messages,
            Err(err) => {
                let thread = guard.thread_mut(&chat_id);
                thread.load_state = if thread.page_cursor == 0 {
                    ThreadLoadState::Unloaded
                } else {
                    ThreadLoadState::Loaded
                };
                drop(guard);
                if err.is_authorization() {
                    return Err(err);
                }
                return Ok(self.recoverable(err));
            }
        };

        let page_size = self.settings.page_size as usize;
        let full_page = messages.len() == page_size;
        let thread = guard.thread_mut(&chat_id);
        let added = thread.merge_page(messages);
        thread.page_cursor = page;
        thread.has_more = full_page;
        thread.load_state = if full_page {
            ThreadLoadState::Loaded
        } else {
            ThreadLoadState::Exhausted
        };
        debug!(
            %chat_id,
            page,
            added,
            total = thread.messages.len(),
            has_more = thread.has_more,
            "chat: page merged"
        );
        drop(guard);
        let _ = self.events.send(ClientEvent::ThreadUpdated { chat_id });
        Ok(true)
    }

    /// Sends through the API and records the stored message once the server confirms it.
    /// The realtime echo of the same id is absorbed by deduplication.
    pub async fn send_message(
        &self,
        content: &str,
        media: Option<MediaDescriptor>,
    ) -> RealtimeResult<MessagePayload> {
        let chat_id = self
            .inner
            .lock()
            .await
            .selected
            .clone()
            .ok_or_else(|| RealtimeError::InvalidState("no conversation selected".into()))?;

        let request = SendMessageRequest {
            content: content.to_string(),
            media,
        };
        let message = self.api.send_message(&chat_id, &request).await?;

        {
            let mut guard = self.inner.lock().await;
            let thread = guard.thread_mut(&message.chat_id);
            let mut recorded = message.clone();
            if thread.observe(&mut recorded) {
                thread.last_message_preview = Some(preview_of(&message));
                *thread.unread.get_mut(message.recipient_role()) += 1;
            }
            thread.insert_message(recorded);
        }
        let _ = self.events.send(ClientEvent::ThreadUpdated {
            chat_id: message.chat_id.clone(),
        });
        Ok(message)
    }

    async fn handle_new_message(&self, message: MessagePayload) {
        let chat_id = message.chat_id.clone();
        let (first_seen, mark_read) = {
            let mut guard = self.inner.lock().await;
            let local_role = guard.local_role;
            let selected = guard.selected.as_ref() == Some(&chat_id);
            let thread = guard.thread_mut(&chat_id);

            let mut recorded = message.clone();
            let first_seen = thread.observe(&mut recorded);
            if first_seen {
                thread.last_message_preview = Some(preview_of(&message));
                *thread.unread.get_mut(message.recipient_role()) += 1;
            }

            let mut mark_read = false;
            if selected {
                thread.insert_message(recorded);
                if first_seen && local_role == Some(message.recipient_role()) {
                    thread.mark_window_read(message.recipient_role());
                    *thread.unread.get_mut(message.recipient_role()) = 0;
                    mark_read = true;
                }
            }
            (first_seen, mark_read)
        };

        if !first_seen {
            debug!(%chat_id, message_id = %message.id, "chat: duplicate message absorbed");
            return;
        }

        let _ = self.events.send(ClientEvent::MessageReceived(message));
        let _ = self.events.send(ClientEvent::ThreadUpdated {
            chat_id: chat_id.clone(),
        });

        if mark_read {
            let api = Arc::clone(&self.api);
            tokio::spawn(async move {
                if let Err(err) = api.mark_as_read(&chat_id).await {
                    warn!(%chat_id, %err, "chat: mark-as-read failed");
                }
            });
        }
    }

    async fn handle_messages_read(&self, payload: MessagesReadPayload) {
        let MessagesReadPayload {
            chat_id,
            reader_role,
            message_ids,
        } = payload;
        {
            let mut guard = self.inner.lock().await;
            let Some(thread) = guard.threads.get_mut(&chat_id) else {
                debug!(%chat_id, "chat: read receipt for unknown thread");
                return;
            };

            if message_ids.is_empty() {
                thread.mark_window_read(reader_role);
                *thread.unread.get_mut(reader_role) = 0;
            } else {
                let ids: HashSet<MessageId> = message_ids.into_iter().collect();
                let mut newly_read = 0u32;
                for id in &ids {
                    if thread.mark_read(id, reader_role) {
                        newly_read += 1;
                    }
                }
                let counter = thread.unread.get_mut(reader_role);
                *counter = counter.saturating_sub(newly_read);
            }
        }
        let _ = self.events.send(ClientEvent::ThreadUpdated { chat_id });
    }

    /// Debounced local typing signal for the selected thread. Only the state left after a
    /// quiet interval is emitted, and only when it differs from what was last sent.
    pub async fn set_typing(&self, is_typing: bool) {
        let (chat_id, generation) = {
            let mut guard = self.inner.lock().await;
            let Some(chat_id) = guard.selected.clone() else {
                return;
            };
            let entry = guard.typing_outbound.entry(chat_id.clone()).or_default();
            entry.generation += 1;
            entry.desired = is_typing;
            (chat_id, entry.generation)
        };

        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        let debounce = self.settings.typing_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            engine.flush_typing(chat_id, generation).await;
        });
    }

    async fn flush_typing(&self, chat_id: ChatId, generation: u64) {
        let frame = {
            let mut guard = self.inner.lock().await;
            let Some(entry) = guard.typing_outbound.get_mut(&chat_id) else {
                return;
            };
            if entry.generation != generation || entry.desired == entry.emitted {
                return;
            }
            entry.emitted = entry.desired;
            if entry.desired {
                ClientFrame::TypingStart {
                    chat_id: chat_id.clone(),
                }
            } else {
                ClientFrame::TypingStop {
                    chat_id: chat_id.clone(),
                }
            }
        };
        if let Err(err) = self.connection.emit(frame).await {
            debug!(%chat_id, %err, "chat: typing signal not sent");
        }
    }

    async fn handle_typing(&self, payload: TypingPayload, typing: bool) {
        let chat_id = payload.chat_id;
        {
            let mut guard = self.inner.lock().await;
            if typing {
                guard.typing_inbound.insert(
                    chat_id.clone(),
                    TypingFlag {
                        expires_at: Instant::now() + self.settings.typing_expiry,
                    },
                );
            } else if guard.typing_inbound.remove(&chat_id).is_none() {
                return;
            }
        }
        let _ = self.events.send(ClientEvent::TypingChanged {
            chat_id: chat_id.clone(),
            typing,
        });

        if typing {
            let Some(engine) = self.weak_self.upgrade() else {
                return;
            };
            let expiry = self.settings.typing_expiry;
            tokio::spawn(async move {
                tokio::time::sleep(expiry).await;
                engine.expire_typing(chat_id).await;
            });
        }
    }

    async fn expire_typing(&self, chat_id: ChatId) {
        {
            let mut guard = self.inner.lock().await;
            let expired = guard
                .typing_inbound
                .get(&chat_id)
                .is_some_and(|flag| flag.expires_at <= Instant::now());
            if !expired {
                return;
            }
            guard.typing_inbound.remove(&chat_id);
        }
        debug!(%chat_id, "chat: typing flag expired without stop event");
        let _ = self.events.send(ClientEvent::TypingChanged {
            chat_id,
            typing: false,
        });
    }

    pub async fn is_typing(&self, chat_id: &ChatId) -> bool {
        let guard = self.inner.lock().await;
        guard
            .typing_inbound
            .get(chat_id)
            .is_some_and(|flag| flag.expires_at > Instant::now())
    }

    async fn handle_presence(&self, user_id: UserId, online: bool) {
        self.inner.lock().await.presence.insert(
            user_id.clone(),
            PresenceEntry {
                online,
                updated_at: Instant::now(),
            },
        );
        let _ = self
            .events
            .send(ClientEvent::PresenceChanged { user_id, online });
    }

    /// Presence older than the expiry window reads as offline.
    pub async fn is_online(&self, user_id: &UserId) -> bool {
        let guard = self.inner.lock().await;
        guard.presence.get(user_id).is_some_and(|entry| {
            entry.online && entry.updated_at.elapsed() < self.settings.presence_expiry
        })
    }

    pub async fn announce_presence(&self, online: bool) -> RealtimeResult<()> {
        let frame = if online {
            ClientFrame::Online
        } else {
            ClientFrame::Offline
        };
        self.connection.emit(frame).await
    }

    /// Re-announces every subscribed chat room; membership does not survive a reconnect.
    pub async fn resubscribe_rooms(&self) {
        let chats: Vec<ChatId> = self.inner.lock().await.subscribed_chats.iter().cloned().collect();
        for chat_id in chats {
            if let Err(err) = self.connection.join_room(RoomId::chat(&chat_id)).await {
                warn!(%chat_id, %err, "chat: failed to re-join room after reconnect");
            }
        }
    }

    /// Leaves every joined chat room and drops the realtime listeners. The cache is kept.
    pub async fn teardown(&self) {
        let (chats, subscriptions) = {
            let mut guard = self.inner.lock().await;
            guard.selected = None;
            guard.selection_generation += 1;
            guard.fetch_in_flight = false;
            guard.typing_outbound.clear();
            let chats: Vec<ChatId> = guard.subscribed_chats.drain().collect();
            (chats, std::mem::take(&mut guard.subscriptions))
        };
        for chat_id in chats {
            if let Err(err) = self.connection.leave_room(RoomId::chat(&chat_id)).await {
                debug!(%chat_id, %err, "chat: leave failed during teardown");
            }
        }
        for subscription in subscriptions {
            self.connection.off(subscription);
        }
    }

    /// Drops every cached conversation; used when the identity changes.
    pub async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        guard.threads.clear();
        guard.list.order.clear();
        guard.list.fetched_at = None;
        guard.typing_inbound.clear();
        guard.presence.clear();
        guard.local_role = None;
    }

    pub async fn conversations(&self) -> Vec<ConversationThread> {
        let guard = self.inner.lock().await;
        guard
            .list
            .order
            .iter()
            .filter_map(|id| guard.threads.get(id).cloned())
            .collect()
    }

    pub async fn thread(&self, chat_id: &ChatId) -> Option<ConversationThread> {
        self.inner.lock().await.threads.get(chat_id).cloned()
    }

    pub async fn selected_thread(&self) -> Option<ConversationThread> {
        let guard = self.inner.lock().await;
        let chat_id = guard.selected.as_ref()?;
        guard.threads.get(chat_id).cloned()
    }

    pub async fn unread(&self, chat_id: &ChatId, role: Role) -> u32 {
        let guard = self.inner.lock().await;
        guard
            .threads
            .get(chat_id)
            .map_or(0, |thread| thread.unread.get(role))
    }

    pub async fn subscribed_chats(&self) -> Vec<ChatId> {
        let guard = self.inner.lock().await;
        let mut chats: Vec<ChatId> = guard.subscribed_chats.iter().cloned().collect();
        chats.sort();
        chats
    }
}

fn apply_summary(thread: &mut ConversationThread, summary: ConversationSummary) {
    thread.participant_ids = summary.participant_ids;
    if summary.last_message_preview.is_some() {
        thread.last_message_preview = summary.last_message_preview;
    }
    thread.unread = summary.unread;
}

#[cfg(test)]
#[path = "tests/chat_tests.rs"]
mod tests;
