//! Contract for the peer media session that takes over once call signaling completes.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::SessionId;

/// How the local side takes part in a media session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Host,
    Participant,
}

impl CallRole {
    pub fn is_host(self) -> bool {
        matches!(self, CallRole::Host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub session_id: SessionId,
    pub role: CallRole,
    pub active: bool,
}

#[async_trait]
pub trait MediaSessionController: Send + Sync {
    /// Returns `Ok(false)` when the media layer declined to start without failing outright.
    async fn initialize(
        &self,
        session_id: &SessionId,
        role: CallRole,
        is_host: bool,
    ) -> anyhow::Result<bool>;
    async fn cleanup(&self) -> anyhow::Result<()>;
}

pub struct MissingMediaSessionController;

#[async_trait]
impl MediaSessionController for MissingMediaSessionController {
    async fn initialize(
        &self,
        session_id: &SessionId,
        _role: CallRole,
        _is_host: bool,
    ) -> anyhow::Result<bool> {
        Err(anyhow!(
            "media session controller is unavailable for session {session_id}"
        ))
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
