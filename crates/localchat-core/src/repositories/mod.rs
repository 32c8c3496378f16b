pub mod error;
pub mod in_memory_message_store;
pub mod message_store;
pub mod sqlite_message_store;

pub use error::{RepositoryError, RepositoryResult};
pub use in_memory_message_store::InMemoryMessageStore;
pub use message_store::{
    BoxFuture, ConversationMetaPatch, ConversationRecord, ConversationSummary, MessageRecord,
    MessageStore,
};
pub use sqlite_message_store::SqliteMessageStore;
