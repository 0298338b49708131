use log::{info, warn};
use reqwest::Method;

use crate::client::config::ClientConfig;
use crate::client::services::chat_connection::{ChatConnection, ChatError};
use crate::client::services::http::{ApiClient, ApiError, ApiResult};
use crate::client::services::message_parser;
use crate::client::services::websocket_client::WebSocketConnector;
use crate::common::models::{ChatMessage, UserProfile};

/// Destination the server routes person-to-person messages from.
pub const SEND_DESTINATION: &str = "/app/chat";

/// Queue on which `me` receives the messages `peer` sends them.
pub fn conversation_topic(me: &str, peer: &str) -> String {
    format!("/user/{}/queue/messages/{}", me, peer)
}

/// Chat endpoints: the live connection plus the history lookups served
/// next to it.
#[derive(Clone)]
pub struct ChatService {
    api: ApiClient,
    connection: ChatConnection,
}

impl ChatService {
    pub fn new(api: ApiClient, connection: ChatConnection) -> Self {
        Self { api, connection }
    }

    /// Wires a WebSocket-backed connection from the configuration. Nothing is
    /// dialled until the connection is first used.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ApiError> {
        let api = ApiClient::new(&config.websocket_base_url, config.http_timeout)?;
        let connector = WebSocketConnector::new(config.websocket_url()?)
            .with_handshake_timeout(config.ws_handshake_timeout);
        let connection = ChatConnection::new(connector, config.reconnect_interval);
        info!("[CHAT_SERVICE] Chat endpoint {}", config.websocket_base_url);
        Ok(Self::new(api, connection))
    }

    pub fn connection(&self) -> &ChatConnection {
        &self.connection
    }

    pub async fn send_message(&self, message: &ChatMessage) -> Result<(), ChatError> {
        self.connection.send_json(SEND_DESTINATION, message).await
    }

    /// Everyone `sender` has chatted with.
    pub async fn recipients_by_sender(&self, sender_id: &str) -> ApiResult<Vec<String>> {
        let builder = self
            .api
            .request(Method::GET, &["recipients", sender_id])?;
        let recipients: Option<Vec<String>> = self
            .api
            .send_raw(builder, "Error fetching recipients")
            .await?;
        Ok(recipients.unwrap_or_default())
    }

    pub async fn chat_exists(&self, sender_id: &str, recipient_id: &str) -> ApiResult<bool> {
        let builder = self
            .api
            .request(Method::GET, &["exists", sender_id, recipient_id])?;
        self.api
            .send_raw(builder, "Error checking chat existence")
            .await
    }

    /// Stored history between two users, oldest first.
    pub async fn chat_messages(&self, sender_id: &str, recipient_id: &str) -> ApiResult<Vec<ChatMessage>> {
        let builder = self
            .api
            .request(Method::GET, &["messages", sender_id, recipient_id])?;
        let body = self
            .api
            .send_text(builder, "Error fetching chat messages")
            .await?;
        Ok(message_parser::parse_history(&body)?)
    }

    /// Name and picture for a chat header. Failures degrade to empty fields.
    pub async fn user_summary(&self, email: &str) -> UserProfile {
        match self
            .api
            .get::<UserProfile>(&["api", "users", email], "Error fetching user profile")
            .await
        {
            Ok(profile) => profile,
            Err(e) => {
                warn!("[CHAT_SERVICE] Error fetching user profile for {}: {}", email, e);
                UserProfile {
                    email: email.to_string(),
                    ..Default::default()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_topic() {
        assert_eq!(
            conversation_topic("b@x.io", "a@x.io"),
            "/user/b@x.io/queue/messages/a@x.io"
        );
    }
}
