//! Request/response collaborator for conversation data. The realtime connection only
//! carries notifications; history and sends go through this API.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use shared::{
    domain::ChatId,
    error::ApiError,
    protocol::{ConversationSummary, MessagePayload, MessagesPageQuery, SendMessageRequest},
};
use tokio::sync::RwLock;

use crate::error::{RealtimeError, RealtimeResult};

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Installs (or clears) the bearer token used for subsequent requests.
    async fn authorize(&self, _token: Option<&str>) {}
    async fn fetch_conversations(&self) -> RealtimeResult<Vec<ConversationSummary>>;
    async fn fetch_messages(
        &self,
        chat_id: &ChatId,
        page: u32,
        limit: u32,
    ) -> RealtimeResult<Vec<MessagePayload>>;
    async fn send_message(
        &self,
        chat_id: &ChatId,
        request: &SendMessageRequest,
    ) -> RealtimeResult<MessagePayload>;
    async fn mark_as_read(&self, chat_id: &ChatId) -> RealtimeResult<()>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        }
    }

    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.read().await.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> RealtimeResult<Response> {
        let response = self.authorized(request).await.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
            return Err(RealtimeError::from_api(api_error));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RealtimeError::Authorization(format!("request rejected with {status}")));
        }
        Err(RealtimeError::Transport(format!(
            "request failed with {status}: {body}"
        )))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn authorize(&self, token: Option<&str>) {
        *self.token.write().await = token.map(str::to_string);
    }

    async fn fetch_conversations(&self) -> RealtimeResult<Vec<ConversationSummary>> {
        let response = self
            .send(self.http.get(format!("{}/chats", self.base_url)))
            .await?;
        Ok(response.json().await?)
    }

    async fn fetch_messages(
        &self,
        chat_id: &ChatId,
        page: u32,
        limit: u32,
    ) -> RealtimeResult<Vec<MessagePayload>> {
        let response = self
            .send(
                self.http
                    .get(format!("{}/chats/{}/messages", self.base_url, chat_id))
                    .query(&MessagesPageQuery { page, limit }),
            )
            .await?;
        let messages: Vec<MessagePayload> = response.json().await?;
        if let Some(stray) = messages.iter().find(|m| &m.chat_id != chat_id) {
            return Err(RealtimeError::Data(format!(
                "page for chat {chat_id} contains message {} of chat {}",
                stray.id, stray.chat_id
            )));
        }
        Ok(messages)
    }

    async fn send_message(
        &self,
        chat_id: &ChatId,
        request: &SendMessageRequest,
    ) -> RealtimeResult<MessagePayload> {
        let response = self
            .send(
                self.http
                    .post(format!("{}/chats/{}/messages", self.base_url, chat_id))
                    .json(request),
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn mark_as_read(&self, chat_id: &ChatId) -> RealtimeResult<()> {
        self.send(
            self.http
                .post(format!("{}/chats/{}/read", self.base_url, chat_id)),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/chat_api_tests.rs"]
mod tests;
