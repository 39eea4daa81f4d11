//! Incoming-call signaling: a single ringing slot, a bounded decision window and the
//! handoff into the media session once the operator joins.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use media_session::{CallRole, CallSession, MediaSessionController};
use shared::{
    domain::{RoomId, SessionId},
    protocol::{CallInitiatedPayload, EventName, RealtimeEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    connection::ConnectionManager,
    error::{RealtimeError, RealtimeResult},
    event_bus::Subscription,
    ClientEvent,
};

/// Decision prompt shown while a call rings.
pub trait CallSurface: Send + Sync {
    /// `needs_sound_unlock` asks the surface to offer the enable-sound gesture.
    fn present(&self, session_id: &SessionId, window: Duration, needs_sound_unlock: bool);
    fn dismiss(&self, session_id: &SessionId);
    fn open_lobby(&self, session_id: &SessionId, role: CallRole);
}

#[async_trait]
pub trait AudioCue: Send + Sync {
    /// Starts the looping ring. Returns false when playback is blocked.
    fn start_loop(&self) -> bool;
    fn stop(&self);
    /// Zero-volume play/pause performed from a user gesture.
    async fn unlock(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDisposition {
    Joined,
    Skipped,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSignal {
    Idle,
    Ringing { session_id: SessionId, deadline: Instant },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    pub session_id: SessionId,
    pub disposition: CallDisposition,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub decision_window: Duration,
    pub attach_timeout: Duration,
}

/// Acknowledgments still waiting for `session-activated`; the oldest is evicted beyond this.
const MAX_PENDING_ACKNOWLEDGMENTS: usize = 16;

struct CallState {
    signal: CallSignal,
    ring_generation: u64,
    sound_unlocked: bool,
    cue_playing: bool,
    /// Oldest first.
    acknowledged: VecDeque<Acknowledgment>,
    last_acknowledgment: Option<Acknowledgment>,
    session_active: bool,
    call_session: Option<CallSession>,
    subscriptions: Vec<Subscription>,
}

impl CallState {
    /// Retires the ringing slot. Returns the ringing session and whether the cue was playing.
    fn acknowledge(&mut self, disposition: CallDisposition) -> Option<(SessionId, bool)> {
        let CallSignal::Ringing { session_id, .. } =
            std::mem::replace(&mut self.signal, CallSignal::Idle)
        else {
            return None;
        };
        self.ring_generation += 1;
        let acknowledgment = Acknowledgment {
            session_id: session_id.clone(),
            disposition,
            at: Instant::now(),
        };
        self.take_acknowledgment(&session_id);
        if self.acknowledged.len() >= MAX_PENDING_ACKNOWLEDGMENTS {
            self.acknowledged.pop_front();
        }
        self.acknowledged.push_back(acknowledgment.clone());
        self.last_acknowledgment = Some(acknowledgment);
        if disposition != CallDisposition::Joined {
            self.session_active = true;
        }
        Some((session_id, std::mem::take(&mut self.cue_playing)))
    }

    fn take_acknowledgment(&mut self, session_id: &SessionId) -> Option<Acknowledgment> {
        let index = self
            .acknowledged
            .iter()
            .position(|ack| &ack.session_id == session_id)?;
        self.acknowledged.remove(index)
    }
}

pub struct CallSignalingStateMachine {
    settings: CallSettings,
    connection: Arc<ConnectionManager>,
    media: Arc<dyn MediaSessionController>,
    surface: Arc<dyn CallSurface>,
    audio: Arc<dyn AudioCue>,
    attached: AtomicBool,
    inner: Mutex<CallState>,
    events: broadcast::Sender<ClientEvent>,
    weak_self: Weak<CallSignalingStateMachine>,
}

impl CallSignalingStateMachine {
    pub fn new(
        settings: CallSettings,
        connection: Arc<ConnectionManager>,
        media: Arc<dyn MediaSessionController>,
        surface: Arc<dyn CallSurface>,
        audio: Arc<dyn AudioCue>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            settings,
            connection,
            media,
            surface,
            audio,
            attached: AtomicBool::new(false),
            inner: Mutex::new(CallState {
                signal: CallSignal::Idle,
                ring_generation: 0,
                sound_unlocked: false,
                cue_playing: false,
                acknowledged: VecDeque::new(),
                last_acknowledgment: None,
                session_active: false,
                call_session: None,
                subscriptions: Vec::new(),
            }),
            events,
            weak_self: weak_self.clone(),
        })
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Waits for the connection, then registers the call listeners once.
    pub async fn attach(&self) -> RealtimeResult<()> {
        if self.attached.swap(true, Ordering::SeqCst) {
            debug!("call: listeners already attached");
            return Ok(());
        }
        if !self
            .connection
            .wait_for_connection(self.settings.attach_timeout)
            .await
        {
            self.attached.store(false, Ordering::SeqCst);
            warn!("call: connection not ready, listeners not attached");
            return Err(RealtimeError::Timeout(self.settings.attach_timeout));
        }

        let mut subscriptions = Vec::with_capacity(2);
        for name in [EventName::CallInitiated, EventName::SessionActivated] {
            let machine = self.weak_self.clone();
            subscriptions.push(self.connection.on(name, move |event| {
                let machine = machine.clone();
                async move {
                    if let Some(machine) = machine.upgrade() {
                        machine.handle_event(event).await;
                    }
                }
            }));
        }
        self.inner.lock().await.subscriptions = subscriptions;
        info!("call: listeners attached");
        Ok(())
    }

    /// Removes the listeners and cancels a pending decision.
    pub async fn detach(&self) {
        if !self.attached.swap(false, Ordering::SeqCst) {
            return;
        }
        let (subscriptions, ringing) = {
            let mut guard = self.inner.lock().await;
            guard.ring_generation += 1;
            let ringing = match std::mem::replace(&mut guard.signal, CallSignal::Idle) {
                CallSignal::Ringing { session_id, .. } => {
                    Some((session_id, std::mem::take(&mut guard.cue_playing)))
                }
                CallSignal::Idle => None,
            };
            (std::mem::take(&mut guard.subscriptions), ringing)
        };
        for subscription in subscriptions {
            self.connection.off(subscription);
        }
        if let Some((session_id, cue_playing)) = ringing {
            self.silence(&session_id, cue_playing);
        }
        debug!("call: listeners detached");
    }

    pub async fn handle_event(&self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::CallInitiated(payload) => self.handle_call_initiated(payload).await,
            RealtimeEvent::SessionActivated { session_id } => {
                self.handle_session_activated(session_id).await
            }
            other => debug!(event = %other.name(), "call: ignoring event"),
        }
    }

    async fn handle_call_initiated(&self, payload: CallInitiatedPayload) {
        let session_id = payload.session_id;
        let generation = {
            let mut guard = self.inner.lock().await;
            if let CallSignal::Ringing {
                session_id: ringing,
                ..
            } = &guard.signal
            {
                info!(
                    %session_id,
                    ringing = %ringing,
                    "call: dropping call while another is ringing"
                );
                return;
            }
            guard.ring_generation += 1;
            guard.signal = CallSignal::Ringing {
                session_id: session_id.clone(),
                deadline: Instant::now() + self.settings.decision_window,
            };

            // Cue and prompt only change while the slot is locked.
            info!(%session_id, caller = ?payload.caller_id, "call: ringing");
            let sound_unlocked = guard.sound_unlocked;
            if sound_unlocked {
                guard.cue_playing = self.audio.start_loop();
            }
            self.surface
                .present(&session_id, self.settings.decision_window, !sound_unlocked);
            let _ = self.events.send(ClientEvent::CallRinging {
                session_id: session_id.clone(),
            });
            guard.ring_generation
        };

        let Some(machine) = self.weak_self.upgrade() else {
            return;
        };
        let window = self.settings.decision_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            machine.expire(session_id, generation).await;
        });
    }

    async fn expire(&self, session_id: SessionId, generation: u64) {
        let acknowledged = {
            let mut guard = self.inner.lock().await;
            if guard.ring_generation != generation {
                return;
            }
            guard.acknowledge(CallDisposition::TimedOut)
        };
        if let Some((session_id, cue_playing)) = acknowledged {
            info!(%session_id, "call: decision window elapsed");
            self.finish_decline(session_id, cue_playing, CallDisposition::TimedOut);
        } else {
            debug!(%session_id, "call: timer fired with nothing ringing");
        }
    }

    async fn handle_session_activated(&self, session_id: SessionId) {
        {
            let mut guard = self.inner.lock().await;
            if guard.take_acknowledgment(&session_id).is_none() {
                debug!(%session_id, "call: activation before acknowledgment ignored");
                return;
            }
            guard.session_active = true;
        }
        info!(%session_id, "call: session active");
        let _ = self
            .events
            .send(ClientEvent::SessionActivated { session_id });
    }

    /// Accepts the ringing call and hands it to the media session in participant mode.
    pub async fn join(&self) -> RealtimeResult<CallSession> {
        let (session_id, cue_playing) = self
            .inner
            .lock()
            .await
            .acknowledge(CallDisposition::Joined)
            .ok_or_else(|| RealtimeError::InvalidState("no call is ringing".into()))?;
        self.silence(&session_id, cue_playing);

        if let Err(err) = self
            .connection
            .join_room(RoomId::session(&session_id))
            .await
        {
            warn!(%session_id, %err, "call: could not join session room");
            let _ = self
                .events
                .send(ClientEvent::Error(format!("could not join call {session_id}: {err}")));
            return Err(err);
        }
        let _ = self.events.send(ClientEvent::CallAcknowledged {
            session_id: session_id.clone(),
            disposition: CallDisposition::Joined,
        });

        let role = CallRole::Participant;
        let active = self
            .media
            .initialize(&session_id, role, role.is_host())
            .await
            .map_err(|err| {
                warn!(%session_id, %err, "call: media session failed to start");
                RealtimeError::Media(err.to_string())
            })?;
        if !active {
            warn!(%session_id, "call: media session declined to start");
        }

        let session = CallSession {
            session_id: session_id.clone(),
            role,
            active,
        };
        self.inner.lock().await.call_session = Some(session.clone());
        self.surface.open_lobby(&session_id, role);
        info!(%session_id, active, "call: joined");
        Ok(session)
    }

    /// Declines the ringing call without navigating anywhere.
    pub async fn skip(&self) -> RealtimeResult<()> {
        let (session_id, cue_playing) = self
            .inner
            .lock()
            .await
            .acknowledge(CallDisposition::Skipped)
            .ok_or_else(|| RealtimeError::InvalidState("no call is ringing".into()))?;
        info!(%session_id, "call: skipped");
        self.finish_decline(session_id, cue_playing, CallDisposition::Skipped);
        Ok(())
    }

    fn finish_decline(&self, session_id: SessionId, cue_playing: bool, disposition: CallDisposition) {
        self.silence(&session_id, cue_playing);
        let _ = self.events.send(ClientEvent::CallAcknowledged {
            session_id,
            disposition,
        });
    }

    fn silence(&self, session_id: &SessionId, cue_playing: bool) {
        if cue_playing {
            self.audio.stop();
        }
        self.surface.dismiss(session_id);
    }

    /// Unlocks audio from a user gesture and starts the ring if a call is still pending.
    pub async fn enable_sound(&self) -> bool {
        if !self.audio.unlock().await {
            warn!("call: audio unlock refused");
            return false;
        }
        let ringing = {
            let mut guard = self.inner.lock().await;
            guard.sound_unlocked = true;
            matches!(guard.signal, CallSignal::Ringing { .. }) && !guard.cue_playing
        };
        if ringing {
            let playing = self.audio.start_loop();
            let mut guard = self.inner.lock().await;
            if matches!(guard.signal, CallSignal::Ringing { .. }) {
                guard.cue_playing = playing;
            } else if playing {
                drop(guard);
                self.audio.stop();
            }
        }
        true
    }

    /// Tears down the active media session and leaves its room.
    pub async fn end_call(&self) -> RealtimeResult<()> {
        let session = {
            let mut guard = self.inner.lock().await;
            let Some(session) = guard.call_session.take() else {
                return Ok(());
            };
            guard.session_active = false;
            guard.take_acknowledgment(&session.session_id);
            session
        };
        let cleanup = self.media.cleanup().await;
        self.connection
            .leave_room(RoomId::session(&session.session_id))
            .await?;
        info!(session_id = %session.session_id, "call: ended");
        let _ = self.events.send(ClientEvent::CallEnded {
            session_id: session.session_id,
        });
        cleanup.map_err(|err| RealtimeError::Media(err.to_string()))
    }

    /// Re-joins the active session room after a reconnect.
    pub async fn resubscribe_rooms(&self) {
        let session_id = self
            .inner
            .lock()
            .await
            .call_session
            .as_ref()
            .map(|session| session.session_id.clone());
        if let Some(session_id) = session_id {
            if let Err(err) = self.connection.join_room(RoomId::session(&session_id)).await {
                warn!(%session_id, %err, "call: failed to re-join session room");
            }
        }
    }

    /// Forgets every acknowledgment; used when the identity changes.
    pub async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        guard.acknowledged.clear();
        guard.last_acknowledgment = None;
        guard.session_active = false;
    }

    pub async fn signal(&self) -> CallSignal {
        self.inner.lock().await.signal.clone()
    }

    pub async fn last_acknowledgment(&self) -> Option<Acknowledgment> {
        self.inner.lock().await.last_acknowledgment.clone()
    }

    pub async fn session_active(&self) -> bool {
        self.inner.lock().await.session_active
    }

    pub async fn call_session(&self) -> Option<CallSession> {
        self.inner.lock().await.call_session.clone()
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
