use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::debug;

use crate::models::{StreamingTurn, TurnStatus};

/// Cancellation token shared between the engine and a running turn.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // Stores a permit when nobody is waiting yet.
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

/// Per-conversation stream state.
struct StreamState {
    turn: StreamingTurn,
    turn_id: u64,
    cancel: CancelHandle,
}

/// Stream lifecycle bookkeeping, one entry per conversation with a turn in flight.
///
/// Every mutation from a running turn carries its `turn_id`. A turn that was
/// paused, or replaced by a newer one, no longer matches and its late
/// deltas or completions are dropped.
#[derive(Default)]
pub struct StreamManager {
    streams: HashMap<String, StreamState>,
    /// Terminal status of the last finished turn per conversation.
    last_status: HashMap<String, TurnStatus>,
    next_turn_id: u64,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a turn. Returns `None` when the conversation already has one.
    pub fn register_stream(&mut self, turn: StreamingTurn) -> Option<(u64, CancelHandle)> {
        let conv_id = turn.conversation_id.clone();
        if self.streams.contains_key(&conv_id) {
            return None;
        }

        self.next_turn_id += 1;
        let turn_id = self.next_turn_id;
        let cancel = CancelHandle::new();

        self.last_status.remove(&conv_id);
        self.streams.insert(
            conv_id.clone(),
            StreamState {
                turn,
                turn_id,
                cancel: cancel.clone(),
            },
        );
        debug!(conv_id = %conv_id, turn_id, "Registered stream");

        Some((turn_id, cancel))
    }

    pub fn is_streaming(&self, conv_id: &str) -> bool {
        self.streams.contains_key(conv_id)
    }

    pub fn has_active_streams(&self) -> bool {
        !self.streams.is_empty()
    }

    /// Conversations with a turn in flight, sorted.
    pub fn active_conversations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn turn(&self, conv_id: &str) -> Option<&StreamingTurn> {
        self.streams.get(conv_id).map(|s| &s.turn)
    }

    /// Status of the active turn, or of the last one that ended.
    pub fn status(&self, conv_id: &str) -> Option<TurnStatus> {
        self.turn(conv_id)
            .map(|t| t.status)
            .or_else(|| self.last_status.get(conv_id).copied())
    }

    fn current_mut(&mut self, conv_id: &str, turn_id: u64) -> Option<&mut StreamState> {
        self.streams
            .get_mut(conv_id)
            .filter(|s| s.turn_id == turn_id && !s.cancel.is_cancelled())
    }

    /// Returns false when the turn is no longer the current one.
    pub fn set_status(&mut self, conv_id: &str, turn_id: u64, status: TurnStatus) -> bool {
        match self.current_mut(conv_id, turn_id) {
            Some(state) => {
                state.turn.status = status;
                true
            }
            None => false,
        }
    }

    /// Append a delta to the partial text. Deltas of a cancelled or stale
    /// turn are discarded.
    pub fn handle_delta(&mut self, conv_id: &str, turn_id: u64, text: &str) -> bool {
        match self.current_mut(conv_id, turn_id) {
            Some(state) => {
                state.turn.partial_assistant_text.push_str(text);
                true
            }
            None => false,
        }
    }

    /// Remove a turn that reached `status` on its own (done or errored).
    pub fn finish(&mut self, conv_id: &str, turn_id: u64, status: TurnStatus) -> Option<StreamingTurn> {
        if self.streams.get(conv_id).is_none_or(|s| s.turn_id != turn_id) {
            return None;
        }
        let mut state = self.streams.remove(conv_id)?;
        state.turn.status = status;
        self.last_status.insert(conv_id.to_string(), status);
        Some(state.turn)
    }

    /// Gracefully stop a pausable stream using its cancellation token.
    /// No-op when nothing is in flight or the turn is already finalizing.
    pub fn stop_stream(&mut self, conv_id: &str) -> Option<StreamingTurn> {
        if !self.streams.get(conv_id)?.turn.status.is_pausable() {
            return None;
        }
        self.cancel_stream(conv_id)
    }

    /// Cancel a turn whatever its status. Used when the conversation goes away.
    pub fn cancel_stream(&mut self, conv_id: &str) -> Option<StreamingTurn> {
        let mut state = self.streams.remove(conv_id)?;
        state.cancel.cancel();
        state.turn.status = TurnStatus::Cancelled;
        self.last_status.insert(conv_id.to_string(), TurnStatus::Cancelled);
        debug!(conv_id = %conv_id, turn_id = state.turn_id, "Stream stopped gracefully");
        Some(state.turn)
    }

    /// Stop all active streams (shutdown).
    pub fn stop_all(&mut self) -> Vec<StreamingTurn> {
        let keys: Vec<String> = self.streams.keys().cloned().collect();
        keys.iter().filter_map(|key| self.cancel_stream(key)).collect()
    }

    /// Drop every trace of a conversation.
    pub fn forget(&mut self, conv_id: &str) {
        self.cancel_stream(conv_id);
        self.last_status.remove(conv_id);
    }

    /// Mirror an edit into the in-flight copy of the user message.
    pub fn update_pending_user_message(&mut self, conv_id: &str, message_id: &str, text: &str) -> bool {
        match self.streams.get_mut(conv_id) {
            Some(state) if state.turn.pending_user_message.id == message_id => {
                state.turn.pending_user_message.edit(text, chrono::Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn pending_user_text(&self, conv_id: &str, message_id: &str) -> Option<String> {
        self.turn(conv_id)
            .filter(|t| t.pending_user_message.id == message_id)
            .map(|t| t.pending_user_message.text().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn turn(conv_id: &str) -> StreamingTurn {
        StreamingTurn::new(Message::user(conv_id, "Hello"))
    }

    #[test]
    fn test_new_stream_manager_is_empty() {
        let mgr = StreamManager::new();
        assert!(!mgr.has_active_streams());
        assert!(!mgr.is_streaming("test"));
        assert_eq!(mgr.status("test"), None);
    }

    #[test]
    fn test_one_turn_per_conversation() {
        let mut mgr = StreamManager::new();
        assert!(mgr.register_stream(turn("a")).is_some());
        assert!(mgr.register_stream(turn("a")).is_none());
        assert!(mgr.register_stream(turn("b")).is_some());
        assert_eq!(mgr.active_conversations(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_deltas_after_stop_are_discarded() {
        let mut mgr = StreamManager::new();
        let (turn_id, cancel) = mgr.register_stream(turn("a")).unwrap();
        assert!(mgr.set_status("a", turn_id, TurnStatus::Streaming));
        assert!(mgr.handle_delta("a", turn_id, "Hi"));
        assert_eq!(mgr.turn("a").unwrap().partial_assistant_text, "Hi");

        let stopped = mgr.stop_stream("a").unwrap();
        assert_eq!(stopped.status, TurnStatus::Cancelled);
        assert!(cancel.is_cancelled());
        assert!(!mgr.handle_delta("a", turn_id, " there"));
        assert_eq!(mgr.status("a"), Some(TurnStatus::Cancelled));
    }

    #[test]
    fn test_stale_turn_cannot_touch_newer_one() {
        let mut mgr = StreamManager::new();
        let (old_id, _) = mgr.register_stream(turn("a")).unwrap();
        mgr.stop_stream("a");
        let (new_id, _) = mgr.register_stream(turn("a")).unwrap();

        assert!(!mgr.handle_delta("a", old_id, "late"));
        assert!(mgr.finish("a", old_id, TurnStatus::Done).is_none());
        assert!(mgr.is_streaming("a"));
        assert!(mgr.finish("a", new_id, TurnStatus::Done).is_some());
        assert_eq!(mgr.status("a"), Some(TurnStatus::Done));
    }

    #[test]
    fn test_finalizing_turn_is_not_pausable() {
        let mut mgr = StreamManager::new();
        let (turn_id, _) = mgr.register_stream(turn("a")).unwrap();
        mgr.set_status("a", turn_id, TurnStatus::Finalizing);
        assert!(mgr.stop_stream("a").is_none());
        assert!(mgr.is_streaming("a"));
    }

    #[test]
    fn test_stop_all() {
        let mut mgr = StreamManager::new();
        let (_, cancel_a) = mgr.register_stream(turn("a")).unwrap();
        let (_, cancel_b) = mgr.register_stream(turn("b")).unwrap();
        assert_eq!(mgr.stop_all().len(), 2);
        assert!(cancel_a.is_cancelled() && cancel_b.is_cancelled());
        assert!(!mgr.has_active_streams());
    }

    #[test]
    fn test_pending_user_message_mirrors_edits() {
        let mut mgr = StreamManager::new();
        let t = turn("a");
        let message_id = t.pending_user_message.id.clone();
        mgr.register_stream(t);
        assert!(mgr.update_pending_user_message("a", &message_id, "edited"));
        assert_eq!(mgr.pending_user_text("a", &message_id).as_deref(), Some("edited"));
        assert!(!mgr.update_pending_user_message("a", "msg_other", "x"));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_cancel() {
        let handle = CancelHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        handle.cancel();
        task.await.unwrap();
        // Already cancelled handles resolve immediately.
        handle.cancelled().await;
    }
}
