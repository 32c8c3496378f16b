use super::message::Message;

/// Lifecycle of one request/response cycle.
///
/// `Sending -> Streaming -> Finalizing -> Done`, with `Errored` and
/// `Cancelled` reachable from the in-flight states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TurnStatus {
    Sending,
    Streaming,
    Finalizing,
    Done,
    Errored,
    Cancelled,
}

impl TurnStatus {
    /// States in which `pause` has an effect.
    pub fn is_pausable(&self) -> bool {
        matches!(self, TurnStatus::Sending | TurnStatus::Streaming)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnStatus::Done | TurnStatus::Errored | TurnStatus::Cancelled
        )
    }
}

/// Ephemeral, never persisted. At most one per conversation.
#[derive(Clone, Debug)]
pub struct StreamingTurn {
    pub conversation_id: String,
    pub pending_user_message: Message,
    pub partial_assistant_text: String,
    pub status: TurnStatus,
}

impl StreamingTurn {
    pub fn new(pending_user_message: Message) -> Self {
        Self {
            conversation_id: pending_user_message.conversation_id.clone(),
            pending_user_message,
            partial_assistant_text: String::new(),
            status: TurnStatus::Sending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_turn_starts_sending() {
        let turn = StreamingTurn::new(Message::user("conv_1_a", "Hello"));
        assert_eq!(turn.status, TurnStatus::Sending);
        assert_eq!(turn.conversation_id, "conv_1_a");
        assert!(turn.partial_assistant_text.is_empty());
    }

    #[test]
    fn test_pausable_states() {
        assert!(TurnStatus::Sending.is_pausable());
        assert!(TurnStatus::Streaming.is_pausable());
        assert!(!TurnStatus::Finalizing.is_pausable());
        assert!(TurnStatus::Cancelled.is_terminal());
        assert!(!TurnStatus::Streaming.is_terminal());
    }
}
