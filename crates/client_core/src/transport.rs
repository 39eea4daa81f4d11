//! Realtime transport seam. The websocket implementation performs the handshake and then
//! bridges the socket to a pair of channels owned by the connection manager.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ConnectionId, Role},
    protocol::{ClientFrame, HandshakeFrame, RealtimeEvent},
};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, warn};
use url::Url;

use crate::error::{RealtimeError, RealtimeResult};

#[derive(Clone)]
pub struct HandshakeRequest {
    pub endpoint: String,
    pub token: String,
    pub role: Role,
    pub timeout: Duration,
}

impl std::fmt::Debug for HandshakeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeRequest")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("role", &self.role)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// An established link. Dropping `outbound` closes the socket; `inbound` ends when the peer
/// goes away.
pub struct TransportLink {
    pub connection_id: ConnectionId,
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<RealtimeResult<RealtimeEvent>>,
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn open(&self, request: &HandshakeRequest) -> RealtimeResult<TransportLink>;
}

pub struct WebSocketTransport;

pub fn realtime_url(endpoint: &str, token: &str, role: Role) -> RealtimeResult<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|err| RealtimeError::Transport(format!("invalid endpoint {endpoint}: {err}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(RealtimeError::Transport(format!(
                "unsupported endpoint scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RealtimeError::Transport(format!("cannot use scheme {scheme}")))?;
    let path = format!("{}/realtime", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .append_pair("token", token)
        .append_pair("role", role.as_str());
    Ok(url)
}

fn map_connect_error(err: tungstenite::Error) -> RealtimeError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == 401 || status == 403 {
                RealtimeError::Authorization(format!("handshake rejected with {status}"))
            } else {
                RealtimeError::Transport(format!("handshake failed with {status}"))
            }
        }
        other => RealtimeError::Transport(other.to_string()),
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn open(&self, request: &HandshakeRequest) -> RealtimeResult<TransportLink> {
        let url = realtime_url(&request.endpoint, &request.token, request.role)?;
        let (ws_stream, _) = tokio::time::timeout(request.timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| RealtimeError::Timeout(request.timeout))?
            .map_err(map_connect_error)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let first = tokio::time::timeout(request.timeout, async {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => return Ok(text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => return Err(RealtimeError::Transport(err.to_string())),
                }
            }
            Err(RealtimeError::Transport(
                "connection closed before handshake completed".into(),
            ))
        })
        .await
        .map_err(|_| RealtimeError::Timeout(request.timeout))??;

        let handshake = serde_json::from_str::<HandshakeFrame>(&first).map_err(|err| {
            RealtimeError::Transport(format!("unreadable handshake frame: {err}"))
        })?;
        let connection_id = match handshake {
            HandshakeFrame::Ready { connection_id } => connection_id,
            HandshakeFrame::Rejected(err) => return Err(RealtimeError::from_api(err)),
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(%err, "transport: failed to encode outbound frame");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(%err, "transport: websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
            debug!("transport: writer finished");
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let item = match msg {
                    Ok(Message::Text(text)) => serde_json::from_str::<RealtimeEvent>(&text)
                        .map_err(|err| RealtimeError::Data(format!("invalid realtime event: {err}"))),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(%err, "transport: websocket receive failed");
                        break;
                    }
                };
                if inbound_tx.send(item).is_err() {
                    break;
                }
            }
            debug!("transport: reader finished");
        });

        Ok(TransportLink {
            connection_id,
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
