use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, TimeZone, Utc};

use super::error::RepositoryResult;
use crate::models::{Conversation, Message, MessageContent, Role};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Conversation row. Timestamps are Unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub id: String,
    pub title: String,
    pub pinned: bool,
    pub folder: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&Conversation> for ConversationRecord {
    fn from(conv: &Conversation) -> Self {
        Self {
            id: conv.id().to_string(),
            title: conv.title().to_string(),
            pinned: conv.is_pinned(),
            folder: Some(conv.folder().to_string()),
            created_at: conv.created_at().timestamp_millis(),
            updated_at: conv.updated_at().timestamp_millis(),
        }
    }
}

/// Message row. `content` is never null; an empty reply is stored as "".
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
}

impl From<&Message> for MessageRecord {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            role: message.role,
            content: message.text().to_string(),
            created_at: message.created_at.timestamp_millis(),
        }
    }
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Self {
            id: record.id,
            conversation_id: record.conversation_id,
            role: record.role,
            content: MessageContent::text(record.content),
            created_at: millis_to_datetime(record.created_at),
            edited_at: None,
        }
    }
}

/// Partial metadata update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationMetaPatch {
    pub title: Option<String>,
    pub pinned: Option<bool>,
    pub folder: Option<String>,
    pub updated_at: i64,
}

/// Denormalized list row used to populate the sidebar without loading bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub last_message_content: Option<String>,
    pub last_message_time: Option<i64>,
    pub message_count: i64,
}

pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Durable copy of conversations and their messages.
///
/// Every operation is a single row-level call; the engine sequences them.
pub trait MessageStore: Send + Sync + 'static {
    fn get_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<ConversationRecord>>>;

    /// All conversation rows, most recently updated first.
    fn list_conversations(&self) -> BoxFuture<'static, RepositoryResult<Vec<ConversationRecord>>>;

    fn create_conversation(&self, record: ConversationRecord) -> BoxFuture<'static, RepositoryResult<()>>;

    fn update_conversation_meta(
        &self,
        id: &str,
        patch: ConversationMetaPatch,
    ) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Delete the conversation row only. Messages go through `delete_messages`.
    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>>;

    fn delete_messages(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<()>>;

    fn insert_message(&self, record: MessageRecord) -> BoxFuture<'static, RepositoryResult<()>>;

    fn update_message_content(&self, message_id: &str, content: &str) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Messages of a conversation in insertion order.
    fn list_messages(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<MessageRecord>>>;

    fn list_conversation_summaries(&self) -> BoxFuture<'static, RepositoryResult<Vec<ConversationSummary>>>;
}
