//! REST message history.
//!
//! Backfill for conversations: `GET {api}/chats/{id}/messages?page={n}`,
//! wrapped in the API's `{ success, data, error }` envelope.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::{ChatError, ErrorCode, Result};
use crate::protocol::WireMessage;

/// Source of older messages.
#[async_trait]
pub trait HistoryClient: Send + Sync {
    /// Fetch one page of a conversation, oldest first. Page 1 is the most
    /// recent page.
    async fn fetch_messages(&self, conversation_id: &str, page: u32) -> Result<Vec<WireMessage>>;
}

/// API response wrapper matching the server's envelope.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// The server returns either a bare list or a paginated object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessagePage {
    List(Vec<WireMessage>),
    Paged { messages: Vec<WireMessage> },
}

impl MessagePage {
    fn into_messages(self) -> Vec<WireMessage> {
        match self {
            Self::List(messages) | Self::Paged { messages } => messages,
        }
    }
}

/// [`HistoryClient`] over HTTP.
#[derive(Debug, Clone)]
pub struct RestHistoryClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl RestHistoryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ChatError::invalid_config(format!("Invalid API URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::invalid_config(format!(
                "API URL {} cannot carry a path",
                base_url
            )));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// `{base}/chats/{id}/messages`, with the id escaped as one path segment.
    fn messages_url(&self, conversation_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["chats", conversation_id, "messages"]);
        }
        url
    }
}

#[async_trait]
impl HistoryClient for RestHistoryClient {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn fetch_messages(&self, conversation_id: &str, page: u32) -> Result<Vec<WireMessage>> {
        let url = self.messages_url(conversation_id);
        let mut request = self.client.get(url.clone()).query(&[("page", page)]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let code = match status.as_u16() {
                401 | 403 => ErrorCode::AuthError,
                _ => ErrorCode::HistoryFetchFailed,
            };
            return Err(ChatError::with_internal(
                code,
                "Failed to load message history",
                format!("GET {} returned {}: {}", url, status, body),
            ));
        }

        let envelope: ApiResponse<MessagePage> = response.json().await?;
        if !envelope.success {
            return Err(ChatError::with_internal(
                ErrorCode::HistoryFetchFailed,
                "Failed to load message history",
                envelope.error.unwrap_or_else(|| "Unknown error".into()),
            ));
        }

        let mut messages = envelope
            .data
            .map(MessagePage::into_messages)
            .unwrap_or_default();
        for message in &mut messages {
            if message.conversation_id.is_empty() {
                message.conversation_id = conversation_id.to_string();
            }
        }

        debug!(conversation_id, page, count = messages.len(), "Fetched history page");
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_unwraps_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chats/c1/messages"))
            .and(query_param("page", "2"))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": [
                    {"_id": "m1", "sender": "u2", "content": "old", "type": "text"},
                    {"_id": "m2", "sender": "u1", "content": "older", "type": "image"}
                ]
            })))
            .mount(&server)
            .await;

        let client = RestHistoryClient::new(&server.uri(), Duration::from_secs(5))
            .unwrap()
            .with_bearer_token("t0k");
        let messages = client.fetch_messages("c1", 2).await.unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].server_id, "m1");
        assert_eq!(messages[0].conversation_id, "c1");
        assert_eq!(messages[1].message_type, crate::message::MessageType::Image);
    }

    #[tokio::test]
    async fn test_fetch_accepts_paged_shape() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chats/c1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {"messages": [{"_id": "m9", "chatId": "c1", "sender": "u2", "content": "x"}], "page": 1}
            })))
            .mount(&server)
            .await;

        let client = RestHistoryClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let messages = client.fetch_messages("c1", 1).await.unwrap();
        assert_eq!(messages[0].server_id, "m9");
    }

    #[tokio::test]
    async fn test_conversation_id_is_one_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chats/team%2F1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": [{"_id": "m1", "sender": "u2", "content": "hi"}]
            })))
            .mount(&server)
            .await;

        let base = format!("{}/api/", server.uri());
        let client = RestHistoryClient::new(&base, Duration::from_secs(5)).unwrap();
        let messages = client.fetch_messages("team/1", 1).await.unwrap();
        assert_eq!(messages[0].conversation_id, "team/1");
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let err = RestHistoryClient::new("not a url", Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[tokio::test]
    async fn test_unsuccessful_envelope_is_history_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "chat not found"
            })))
            .mount(&server)
            .await;

        let client = RestHistoryClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let err = client.fetch_messages("c1", 1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::HistoryFetchFailed);
        assert_eq!(err.internal_message(), Some("chat not found"));
    }

    #[tokio::test]
    async fn test_http_error_status_maps_to_error_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = RestHistoryClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let err = client.fetch_messages("c1", 1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthError);
    }
}
