mod memory;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use crate::models::chat::{ ChatMessage, Conversation };

pub use memory::MemoryHistoryStore;

/// Per-user ordered conversation log.
///
/// A user id that has never been written reads back as an empty conversation.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn add_message(&self, conversation_id: &str, message: ChatMessage);

    async fn get_conversation(&self, conversation_id: &str) -> Conversation;
}

pub fn initialize_history_store() -> Arc<dyn HistoryStore> {
    info!("Chat history will be kept in process memory");
    Arc::new(MemoryHistoryStore::new())
}
