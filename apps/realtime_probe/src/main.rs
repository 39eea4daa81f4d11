use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    load_settings, AudioCue, CallSurface, ClientEvent, ClientHandle, RealtimeClient,
};
use media_session::{CallRole, MissingMediaSessionController};
use shared::domain::{ChatId, Role, SessionId};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `realtime_endpoint` from client.toml / APP__REALTIME_ENDPOINT.
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    role: Option<Role>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay connected and print realtime activity until ctrl-c.
    Watch {
        #[arg(long)]
        chat: Option<String>,
        #[arg(long, value_enum, default_value_t = Answer::Ignore)]
        answer: Answer,
    },
    /// Print the most recent pages of a conversation.
    History {
        chat: String,
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    Send {
        chat: String,
        text: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Answer {
    Join,
    Skip,
    Ignore,
}

struct LoggingSurface;

impl CallSurface for LoggingSurface {
    fn present(&self, session_id: &SessionId, window: Duration, needs_sound_unlock: bool) {
        info!(
            %session_id,
            window_secs = window.as_secs(),
            needs_sound_unlock,
            "probe: incoming call"
        );
    }

    fn dismiss(&self, session_id: &SessionId) {
        info!(%session_id, "probe: call prompt dismissed");
    }

    fn open_lobby(&self, session_id: &SessionId, role: CallRole) {
        info!(%session_id, ?role, "probe: lobby opened");
    }
}

struct SilentCue;

#[async_trait]
impl AudioCue for SilentCue {
    fn start_loop(&self) -> bool {
        true
    }

    fn stop(&self) {}

    async fn unlock(&self) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(endpoint) = cli.endpoint {
        settings.realtime_endpoint = endpoint;
    }
    if let Some(api_base_url) = cli.api_base_url {
        settings.api_base_url = api_base_url;
    }
    let token = cli
        .token
        .or_else(|| settings.auth_token.clone())
        .ok_or_else(|| anyhow!("no token: pass --token or set APP__AUTH_TOKEN"))?;
    let role = cli
        .role
        .or(settings.role)
        .ok_or_else(|| anyhow!("no role: pass --role or set APP__ROLE"))?;

    let client = RealtimeClient::with_websocket(
        &settings,
        Arc::new(MissingMediaSessionController),
        Arc::new(LoggingSurface),
        Arc::new(SilentCue),
    );
    client.login(&token, role).await?;

    match cli.command {
        Command::Watch { chat, answer } => {
            if let Some(chat) = chat {
                client.select_thread(ChatId::new(chat)).await?;
            }
            watch(&client, answer).await?;
        }
        Command::History { chat, pages } => {
            client.select_thread(ChatId::new(chat.clone())).await?;
            for _ in 1..pages {
                if !client.load_more_messages().await? {
                    break;
                }
            }
            let thread = client
                .chat()
                .selected_thread()
                .await
                .ok_or_else(|| anyhow!("conversation {chat} not loaded"))?;
            for message in thread.chronological() {
                println!(
                    "{} [{}] {}: {}",
                    message.created_at, message.sender_role, message.sender_id, message.content
                );
            }
            println!("has_more={}", thread.has_more);
        }
        Command::Send { chat, text } => {
            client.select_thread(ChatId::new(chat)).await?;
            let message = client.send_message(&text, None).await?;
            println!("sent message_id={}", message.id);
        }
    }

    client.logout().await;
    Ok(())
}

async fn watch(client: &Arc<RealtimeClient>, answer: Answer) -> Result<()> {
    let mut events = BroadcastStream::new(client.subscribe_events());
    let mut heartbeat = tokio::time::interval(Duration::from_secs(15));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("probe: interrupted, logging out");
                return Ok(());
            }
            _ = heartbeat.tick() => {
                match client.ensure_connected().await {
                    Ok(true) => {}
                    Ok(false) => info!("probe: reconnect held by backoff"),
                    Err(err) if err.is_authorization() => return Err(err.into()),
                    Err(err) => warn!(%err, "probe: reconnect attempt failed"),
                }
            }
            event = events.next() => {
                let Some(event) = event else {
                    return Ok(());
                };
                match event {
                    Ok(ClientEvent::CallRinging { session_id }) => {
                        info!(%session_id, ?answer, "probe: call ringing");
                        let outcome = match answer {
                            Answer::Join => client.join_call().await.map(|_| ()),
                            Answer::Skip => client.skip_call().await,
                            Answer::Ignore => Ok(()),
                        };
                        if let Err(err) = outcome {
                            warn!(%err, "probe: call action failed");
                        }
                    }
                    Ok(ClientEvent::AuthorizationRevoked { reason }) => {
                        return Err(anyhow!("authorization revoked: {reason}"));
                    }
                    Ok(event) => info!(?event, "probe: event"),
                    Err(err) => warn!(%err, "probe: event stream lagged"),
                }
            }
        }
    }
}
