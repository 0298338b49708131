use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDateTime;
use log::debug;

use crate::client::services::chat_connection::{ChatConnection, ChatError, Subscription};
use crate::client::services::chat_service::{conversation_topic, SEND_DESTINATION};
use crate::common::models::ChatMessage;

pub const OWN_LABEL: &str = "You";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub id: Option<String>,
    /// "You" for own messages, the peer's display name otherwise.
    pub sender: String,
    pub content: String,
    pub timestamp: Option<NaiveDateTime>,
}

/// One open chat between the logged-in user and a peer. Entries live only
/// as long as the conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    me: String,
    peer: String,
    peer_name: String,
    entries: Arc<Mutex<Vec<ConversationEntry>>>,
}

impl Conversation {
    pub fn new(me: impl Into<String>, peer: impl Into<String>, peer_name: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            peer: peer.into(),
            peer_name: peer_name.into(),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn topic(&self) -> String {
        conversation_topic(&self.me, &self.peer)
    }

    pub fn entries(&self) -> Vec<ConversationEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Subscribes to the peer's messages; each delivery appends one entry.
    pub async fn open(&self, chat: &ChatConnection) -> Result<Subscription, ChatError> {
        let me = self.me.clone();
        let peer_name = self.peer_name.clone();
        let entries = self.entries.clone();
        chat.subscribe(&self.topic(), move |message| {
            let entry = to_entry(&me, &peer_name, message);
            entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(entry);
        })
        .await
    }

    pub fn close(&self, chat: &ChatConnection) {
        chat.unsubscribe(&self.topic());
    }

    /// Appends the message locally, then publishes it. Blank input is ignored.
    pub async fn send_text(&self, chat: &ChatConnection, content: &str) -> Result<Option<ChatMessage>, ChatError> {
        if content.trim().is_empty() {
            debug!("[CHAT] Ignoring blank message");
            return Ok(None);
        }
        let message = ChatMessage::outgoing(&self.me, &self.peer, content);
        self.push(message.clone());
        chat.send_json(SEND_DESTINATION, &message).await?;
        Ok(Some(message))
    }

    /// Replaces the entries with stored history.
    pub fn load_history(&self, history: Vec<ChatMessage>) {
        let loaded: Vec<ConversationEntry> = history
            .into_iter()
            .map(|m| to_entry(&self.me, &self.peer_name, m))
            .collect();
        *self.lock() = loaded;
    }

    pub fn push(&self, message: ChatMessage) {
        let entry = to_entry(&self.me, &self.peer_name, message);
        self.lock().push(entry);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ConversationEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn to_entry(me: &str, peer_name: &str, message: ChatMessage) -> ConversationEntry {
    let sender = if message.sender_id == me {
        OWN_LABEL.to_string()
    } else {
        peer_name.to_string()
    };
    ConversationEntry {
        id: message.id,
        sender,
        content: message.content,
        timestamp: message.timestamp,
    }
}
