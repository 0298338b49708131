// Parsing of chat payloads received from the server
use crate::client::services::stomp::{Command, Frame};
use crate::common::models::ChatMessage;

/// Parse the JSON body of a STOMP MESSAGE frame into a [`ChatMessage`].
pub fn parse_chat_message(frame: &Frame) -> Result<ChatMessage, String> {
    if frame.command != Command::Message {
        return Err(format!("expected MESSAGE frame, got {}", frame.command));
    }
    let body = frame.body.trim();
    if body.is_empty() {
        return Err("empty message body".to_string());
    }
    serde_json::from_str::<ChatMessage>(body).map_err(|e| format!("invalid chat payload: {}", e))
}

/// Parse a history response (plain JSON array) into messages, oldest first.
pub fn parse_history(body: &str) -> Result<Vec<ChatMessage>, serde_json::Error> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(vec![]);
    }
    let mut messages: Vec<ChatMessage> = serde_json::from_str(trimmed)?;
    // stable: untimestamped messages lead, in server order
    messages.sort_by_key(|m| m.timestamp);
    Ok(messages)
}
