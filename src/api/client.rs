use async_trait::async_trait;
use reqwest::Client as HttpClient;
use url::Url;

use crate::api::models::{Conversation, ConversationId, Message, SendRequest};
use crate::error::{ChatError, Result};

/// The remote persistence API the session talks to.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn history(&self, conversation: &ConversationId) -> Result<Vec<Message>>;
    async fn send(&self, request: &SendRequest) -> Result<Message>;
}

pub struct ApiClient {
    http: HttpClient,
    base_url: Url,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: Url, token: impl Into<String>) -> Self {
        Self::with_http(HttpClient::new(), base_url, token)
    }

    pub fn with_http(http: HttpClient, base_url: Url, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url,
            token: token.into(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(crate::utils::api_base(&self.base_url)?.join(path)?)
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.token))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        if !resp.status().is_success() {
            return Err(ChatError::Status(resp.status().as_u16()));
        }
        Ok(resp)
    }

    /// Fetch the user's conversations for the conversation list.
    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        let endpoint = self.endpoint("chat")?;
        let resp = self.with_auth(self.http.get(endpoint)).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn history(&self, conversation: &ConversationId) -> Result<Vec<Message>> {
        let mut endpoint = self.endpoint("message/")?;
        endpoint
            .path_segments_mut()
            .map_err(|_| ChatError::Config("base url cannot carry a path".into()))?
            .pop_if_empty()
            .push(&conversation.0);
        log::debug!("GET {}", endpoint);
        let resp = self.with_auth(self.http.get(endpoint)).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn send(&self, request: &SendRequest) -> Result<Message> {
        let endpoint = self.endpoint("message")?;
        log::debug!(
            "POST {} (client id {}, scheduled: {})",
            endpoint,
            request.client_id,
            request.scheduled_for.is_some()
        );
        let resp = self
            .with_auth(self.http.post(endpoint))
            .json(request)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}
