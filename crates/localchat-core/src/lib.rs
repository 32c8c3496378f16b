//! Conversation synchronization core for a chat client talking to a locally
//! hosted language model.
//!
//! The [`engine::ConversationSyncEngine`] owns the in-memory working set and
//! reconciles it with a durable [`repositories::MessageStore`] and a streaming
//! [`services::InferenceService`].

pub mod engine;
pub mod error;
pub mod ids;
pub mod logging;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use engine::{ConversationSyncEngine, EngineConfig, EngineEvent, EngineSnapshot};
pub use error::{ErrorKind, InferenceFailure, SyncError, SyncResult};
pub use models::{Conversation, ConversationList, Message, MessageContent, Role, TurnStatus};
pub use repositories::{InMemoryMessageStore, MessageStore, RepositoryError, SqliteMessageStore};
pub use services::{InferenceError, InferenceService, RigInferenceService};
