use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use crate::history::HistoryStore;
use crate::models::chat::{ ChatMessage, Conversation };

#[derive(Default)]
pub struct MemoryHistoryStore {
    conversations: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn add_message(&self, conversation_id: &str, message: ChatMessage) {
        let mut conversations = self.conversations.write().await;
        conversations.entry(conversation_id.to_string()).or_default().push(message);
    }

    async fn get_conversation(&self, conversation_id: &str) -> Conversation {
        let conversations = self.conversations.read().await;
        Conversation {
            id: conversation_id.to_string(),
            messages: conversations.get(conversation_id).cloned().unwrap_or_default(),
        }
    }
}
