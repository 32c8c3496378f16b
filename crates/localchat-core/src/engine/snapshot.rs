use crate::error::ErrorKind;
use crate::models::{Conversation, ConversationList, TurnStatus};

/// Read-only view published to the presentation layer after every change.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineSnapshot {
    pub conversations: ConversationList,
    pub selected: Option<Conversation>,
    /// Status of the selected conversation's current or last turn.
    pub streaming_status: Option<TurnStatus>,
    /// Partial reply of the selected conversation while a turn is in flight.
    pub partial_text: Option<String>,
    pub last_error: Option<ErrorKind>,
    /// Conversations with a turn in flight, selected or not.
    pub active_streams: Vec<String>,
}

impl EngineSnapshot {
    pub fn selected_id(&self) -> Option<&str> {
        self.selected.as_ref().map(|c| c.id())
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.active_streams.iter().any(|id| id == conversation_id)
    }
}

/// Events emitted by the engine for incremental rendering.
/// Each variant is tagged with `conversation_id` so subscribers can filter.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    TextDelta {
        conversation_id: String,
        text: String,
    },
    TurnStatusChanged {
        conversation_id: String,
        status: TurnStatus,
    },
    TurnEnded {
        conversation_id: String,
        status: TurnStatus,
    },
    PersistenceFailed {
        conversation_id: String,
        operation: &'static str,
        message: String,
    },
}
