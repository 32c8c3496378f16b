pub mod conversation;
pub mod conversation_list;
pub mod message;
pub mod streaming_turn;

pub use conversation::Conversation;
pub use conversation_list::{ConversationList, ConversationListItem};
pub use message::{Message, MessageContent, Role};
pub use streaming_turn::{StreamingTurn, TurnStatus};
