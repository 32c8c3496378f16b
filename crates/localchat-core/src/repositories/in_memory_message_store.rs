use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::{RepositoryError, RepositoryResult};
use super::message_store::{
    BoxFuture, ConversationMetaPatch, ConversationRecord, ConversationSummary, MessageRecord,
    MessageStore,
};

#[derive(Default)]
struct StoreState {
    conversations: HashMap<String, ConversationRecord>,
    // Vec keeps insertion order, which is the ordering contract of list_messages.
    messages: Vec<MessageRecord>,
}

/// In-memory message store.
/// Useful for testing and for sessions that should leave nothing on disk.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_count(&self) -> usize {
        self.state.lock().conversations.len()
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn get_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<ConversationRecord>>> {
        let state = self.state.clone();
        let id = id.to_string();
        Box::pin(async move { Ok(state.lock().conversations.get(&id).cloned()) })
    }

    fn list_conversations(&self) -> BoxFuture<'static, RepositoryResult<Vec<ConversationRecord>>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut result: Vec<ConversationRecord> =
                state.lock().conversations.values().cloned().collect();
            result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(result)
        })
    }

    fn create_conversation(&self, record: ConversationRecord) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.lock();
            if state.conversations.contains_key(&record.id) {
                return Err(RepositoryError::InvalidData {
                    message: format!("Conversation {} already exists", record.id),
                });
            }
            state.conversations.insert(record.id.clone(), record);
            Ok(())
        })
    }

    fn update_conversation_meta(
        &self,
        id: &str,
        patch: ConversationMetaPatch,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        let id = id.to_string();
        Box::pin(async move {
            let mut state = state.lock();
            if let Some(record) = state.conversations.get_mut(&id) {
                if let Some(title) = patch.title {
                    record.title = title;
                }
                if let Some(pinned) = patch.pinned {
                    record.pinned = pinned;
                }
                if let Some(folder) = patch.folder {
                    record.folder = Some(folder);
                }
                record.updated_at = patch.updated_at;
            }
            Ok(())
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        let id = id.to_string();
        Box::pin(async move {
            state.lock().conversations.remove(&id);
            Ok(())
        })
    }

    fn delete_messages(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            state
                .lock()
                .messages
                .retain(|m| m.conversation_id != conversation_id);
            Ok(())
        })
    }

    fn insert_message(&self, record: MessageRecord) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.lock();
            if state.messages.iter().any(|m| m.id == record.id) {
                return Err(RepositoryError::InvalidData {
                    message: format!("Message {} already exists", record.id),
                });
            }
            state.messages.push(record);
            Ok(())
        })
    }

    fn update_message_content(&self, message_id: &str, content: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        let message_id = message_id.to_string();
        let content = content.to_string();
        Box::pin(async move {
            if let Some(message) = state
                .lock()
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
            {
                message.content = content;
            }
            Ok(())
        })
    }

    fn list_messages(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<MessageRecord>>> {
        let state = self.state.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            Ok(state
                .lock()
                .messages
                .iter()
                .filter(|m| m.conversation_id == conversation_id)
                .cloned()
                .collect())
        })
    }

    fn list_conversation_summaries(&self) -> BoxFuture<'static, RepositoryResult<Vec<ConversationSummary>>> {
        let state = self.state.clone();
        Box::pin(async move {
            let state = state.lock();
            let mut conversations: Vec<&ConversationRecord> = state.conversations.values().collect();
            conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

            Ok(conversations
                .into_iter()
                .map(|conv| {
                    let messages: Vec<&MessageRecord> = state
                        .messages
                        .iter()
                        .filter(|m| m.conversation_id == conv.id)
                        .collect();
                    let last = messages.last();
                    ConversationSummary {
                        conversation_id: conv.id.clone(),
                        last_message_content: last.map(|m| m.content.clone()),
                        last_message_time: last.map(|m| m.created_at),
                        message_count: messages.len() as i64,
                    }
                })
                .collect())
        })
    }
}
