use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::snapshot::{EngineEvent, EngineSnapshot};
use super::stream_manager::{CancelHandle, StreamManager};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::models::conversation::{DEFAULT_TITLE, title_from_message};
use crate::models::conversation_list::folder_counts;
use crate::models::{Conversation, ConversationList, Message, StreamingTurn, TurnStatus};
use crate::repositories::message_store::millis_to_datetime;
use crate::repositories::{
    ConversationMetaPatch, ConversationRecord, ConversationSummary, MessageRecord, MessageStore,
    RepositoryError, RepositoryResult,
};
use crate::services::{CompletionRequest, HistoryEntry, InferenceError, InferenceService, StreamChunk};
use crate::settings::inference_settings::{
    DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SYSTEM_PROMPT, DEFAULT_TEMPERATURE,
};

const EVENT_CAPACITY: usize = 1024;

/// Fixed parameters attached to every completion request.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub system_prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Upper bound on a whole request, connect included.
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct EngineState {
    conversations: HashMap<String, Conversation>,
    selected: Option<String>,
    streams: StreamManager,
    last_error: Option<ErrorKind>,
    /// Message ids whose store write failed, per conversation, in insertion order.
    pending_retry: HashMap<String, Vec<String>>,
    /// Deleted conversation ids. Ids are never reused, so entries are kept.
    deleted: HashSet<String>,
}

impl EngineState {
    fn has_pending_writes(&self, conv_id: &str) -> bool {
        self.pending_retry.get(conv_id).is_some_and(|ids| !ids.is_empty())
    }

    fn queue_retry(&mut self, conv_id: &str, message_id: &str) {
        if !self.conversations.contains_key(conv_id) {
            return;
        }
        let queue = self.pending_retry.entry(conv_id.to_string()).or_default();
        if !queue.iter().any(|id| id == message_id) {
            queue.push(message_id.to_string());
        }
    }

    fn snapshot(&self) -> EngineSnapshot {
        let selected = self
            .selected
            .as_ref()
            .and_then(|id| self.conversations.get(id))
            .cloned();
        let selected_id = selected.as_ref().map(|c| c.id().to_string());

        EngineSnapshot {
            conversations: ConversationList::derive(self.conversations.values(), ""),
            streaming_status: selected_id.as_deref().and_then(|id| self.streams.status(id)),
            partial_text: selected_id
                .as_deref()
                .and_then(|id| self.streams.turn(id))
                .map(|t| t.partial_assistant_text.clone()),
            selected,
            last_error: self.last_error.clone(),
            active_streams: self.streams.active_conversations(),
        }
    }
}

struct EngineInner {
    state: Mutex<EngineState>,
    store: Arc<dyn MessageStore>,
    inference: Arc<dyn InferenceService>,
    config: EngineConfig,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    events_tx: broadcast::Sender<EngineEvent>,
}

/// Everything a spawned turn needs to run without holding the state lock.
struct TurnContext {
    conversation_id: String,
    turn_id: u64,
    cancel: CancelHandle,
    user_message: Message,
    history: Vec<HistoryEntry>,
}

/// Owner of the conversation working set.
///
/// All mutations go through this type. State lives behind one mutex that is
/// never held across an await; store and inference calls run outside it and
/// merge their results back in. Cloning is cheap and shares the same engine.
#[derive(Clone)]
pub struct ConversationSyncEngine {
    inner: Arc<EngineInner>,
}

impl ConversationSyncEngine {
    pub fn new(
        store: Arc<dyn MessageStore>,
        inference: Arc<dyn InferenceService>,
        config: EngineConfig,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(EngineSnapshot::default());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState::default()),
                store,
                inference,
                config,
                snapshot_tx,
                events_tx,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.inner.state.lock().snapshot()
    }

    // Sent while the state lock is held so snapshots are never published out of order.
    fn publish(&self, state: &EngineState) {
        self.inner.snapshot_tx.send_replace(state.snapshot());
    }

    fn emit(&self, event: EngineEvent) {
        // No receivers is fine.
        let _ = self.inner.events_tx.send(event);
    }

    fn emit_persistence_failure(&self, conversation_id: &str, operation: &'static str, error: &RepositoryError) {
        self.emit(EngineEvent::PersistenceFailed {
            conversation_id: conversation_id.to_string(),
            operation,
            message: error.to_string(),
        });
    }

    // ── Queries ────────────────────────────────────────────────────────────

    pub fn list_conversations(&self) -> ConversationList {
        self.list_conversations_filtered("")
    }

    /// Pinned/recent derivation over conversations whose title or preview
    /// contains `query`.
    pub fn list_conversations_filtered(&self, query: &str) -> ConversationList {
        let state = self.inner.state.lock();
        ConversationList::derive(state.conversations.values(), query)
    }

    pub fn folder_counts(&self, folders: &[String]) -> BTreeMap<String, usize> {
        let state = self.inner.state.lock();
        folder_counts(state.conversations.values(), folders)
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.inner.state.lock().conversations.get(conversation_id).cloned()
    }

    pub fn selected_id(&self) -> Option<String> {
        self.inner.state.lock().selected.clone()
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.inner.state.lock().streams.is_streaming(conversation_id)
    }

    /// Message ids whose store write is still outstanding.
    pub fn pending_retry(&self, conversation_id: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .pending_retry
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Resolves once the conversation has no turn in flight.
    pub async fn wait_idle(&self, conversation_id: &str) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| !s.is_streaming(conversation_id)).await;
    }

    // ── Conversation lifecycle ─────────────────────────────────────────────

    /// Populate the working set from store summaries. Message bodies are
    /// loaded lazily on selection. Conversations already in memory are kept.
    pub async fn load_conversations(&self) -> SyncResult<usize> {
        let records = self.inner.store.list_conversations().await?;
        let summaries: HashMap<String, ConversationSummary> = self
            .inner
            .store
            .list_conversation_summaries()
            .await?
            .into_iter()
            .map(|s| (s.conversation_id.clone(), s))
            .collect();

        let mut state = self.inner.state.lock();
        let mut added = 0;
        for record in records {
            if state.conversations.contains_key(&record.id) || state.deleted.contains(&record.id) {
                continue;
            }
            let summary = summaries.get(&record.id);
            let conv = Conversation::from_stored(
                record.id.clone(),
                record.title,
                record.pinned,
                record.folder,
                millis_to_datetime(record.created_at),
                millis_to_datetime(record.updated_at),
                summary.map(|s| s.message_count.max(0) as usize).unwrap_or(0),
                summary.and_then(|s| s.last_message_content.as_deref()),
            );
            state.conversations.insert(record.id, conv);
            added += 1;
        }
        self.publish(&state);
        drop(state);

        info!(count = added, "Loaded conversations from store");
        Ok(added)
    }

    /// Insert an empty placeholder and select it. Nothing is written to the
    /// store until the first message.
    pub fn create_conversation(&self) -> String {
        let conv = Conversation::placeholder();
        let id = conv.id().to_string();

        let mut state = self.inner.state.lock();
        state.conversations.insert(id.clone(), conv);
        state.selected = Some(id.clone());
        self.publish(&state);
        drop(state);

        debug!(conv_id = %id, "Created placeholder conversation");
        id
    }

    /// Select a conversation, loading its messages on first use. Turns
    /// running in other conversations are left alone.
    pub async fn select_conversation(&self, conversation_id: &str) -> SyncResult<()> {
        {
            let mut state = self.inner.state.lock();
            if !state.conversations.contains_key(conversation_id) {
                return Err(SyncError::validation(format!(
                    "Unknown conversation: {}",
                    conversation_id
                )));
            }
            state.selected = Some(conversation_id.to_string());
            self.publish(&state);
        }

        self.ensure_loaded(conversation_id).await
    }

    async fn ensure_loaded(&self, conversation_id: &str) -> SyncResult<()> {
        let loaded = self
            .inner
            .state
            .lock()
            .conversations
            .get(conversation_id)
            .is_none_or(|c| c.is_loaded());
        if loaded {
            return Ok(());
        }

        let records = self
            .inner
            .store
            .list_messages(conversation_id)
            .await
            .inspect_err(|e| warn!(error = ?e, conv_id = %conversation_id, "Failed to load messages"))?;

        let mut state = self.inner.state.lock();
        if let Some(conv) = state.conversations.get_mut(conversation_id)
            && !conv.is_loaded()
        {
            conv.replace_messages(records.into_iter().map(Message::from).collect());
            debug!(conv_id = %conversation_id, count = conv.message_count(), "Loaded messages");
        }
        self.publish(&state);
        Ok(())
    }

    /// Delete messages, then the conversation row, then the in-memory copy.
    /// Store failures are logged; the conversation leaves the working set
    /// regardless and selection falls back to none. Writes of a turn that were
    /// already in flight remove their own rows when they land.
    pub async fn delete_conversation(&self, conversation_id: &str) -> SyncResult<()> {
        let cancelled = {
            let mut state = self.inner.state.lock();
            if !state.conversations.contains_key(conversation_id) {
                return Err(SyncError::validation(format!(
                    "Unknown conversation: {}",
                    conversation_id
                )));
            }
            // Turn writes still in flight undo themselves once they see this.
            state.deleted.insert(conversation_id.to_string());
            let cancelled = state.streams.cancel_stream(conversation_id);
            if cancelled.is_some() {
                self.publish(&state);
            }
            cancelled
        };
        if cancelled.is_some() {
            self.emit(EngineEvent::TurnEnded {
                conversation_id: conversation_id.to_string(),
                status: TurnStatus::Cancelled,
            });
        }

        let store = &self.inner.store;
        let result = match store.delete_messages(conversation_id).await {
            Ok(()) => store.delete_conversation(conversation_id).await,
            Err(e) => Err(e),
        };

        {
            let mut state = self.inner.state.lock();
            state.conversations.remove(conversation_id);
            state.pending_retry.remove(conversation_id);
            state.streams.forget(conversation_id);
            if state.selected.as_deref() == Some(conversation_id) {
                state.selected = None;
            }
            self.publish(&state);
        }

        match result {
            Ok(()) => info!(conv_id = %conversation_id, "Deleted conversation"),
            Err(e) => {
                warn!(error = ?e, conv_id = %conversation_id, "Failed to delete conversation from store");
                self.emit_persistence_failure(conversation_id, "delete_conversation", &e);
            }
        }
        Ok(())
    }

    /// Flip the pinned flag. Returns the new value.
    pub async fn toggle_pin(&self, conversation_id: &str) -> SyncResult<bool> {
        let (pinned, patch) = {
            let mut state = self.inner.state.lock();
            let conv = state
                .conversations
                .get_mut(conversation_id)
                .ok_or_else(|| SyncError::validation(format!("Unknown conversation: {}", conversation_id)))?;
            let pinned = conv.toggle_pinned();
            let patch = conv.is_persisted().then(|| ConversationMetaPatch {
                pinned: Some(pinned),
                updated_at: conv.updated_at().timestamp_millis(),
                ..Default::default()
            });
            self.publish(&state);
            (pinned, patch)
        };

        if let Some(patch) = patch {
            self.patch_meta(conversation_id, patch).await;
        }
        Ok(pinned)
    }

    pub async fn rename_conversation(&self, conversation_id: &str, title: &str) -> SyncResult<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SyncError::validation("Title is empty"));
        }

        let patch = {
            let mut state = self.inner.state.lock();
            let conv = state
                .conversations
                .get_mut(conversation_id)
                .ok_or_else(|| SyncError::validation(format!("Unknown conversation: {}", conversation_id)))?;
            conv.set_title(title.to_string());
            let patch = conv.is_persisted().then(|| ConversationMetaPatch {
                title: Some(title.to_string()),
                updated_at: conv.updated_at().timestamp_millis(),
                ..Default::default()
            });
            self.publish(&state);
            patch
        };

        if let Some(patch) = patch {
            self.patch_meta(conversation_id, patch).await;
        }
        Ok(())
    }

    // Failures are logged and never rolled back in memory.
    async fn patch_meta(&self, conversation_id: &str, patch: ConversationMetaPatch) {
        if let Err(e) = self
            .inner
            .store
            .update_conversation_meta(conversation_id, patch)
            .await
        {
            warn!(error = ?e, conv_id = %conversation_id, "Failed to update conversation metadata");
            self.emit_persistence_failure(conversation_id, "update_conversation_meta", &e);
        }
    }

    // ── Submission ─────────────────────────────────────────────────────────

    /// Append a user message and start a response turn in the background.
    /// Returns the id of the new user message.
    pub async fn submit(&self, conversation_id: &str, text: &str) -> SyncResult<String> {
        if text.trim().is_empty() {
            return Err(SyncError::validation("Message text is empty"));
        }
        self.check_can_submit(conversation_id)?;
        self.ensure_loaded(conversation_id).await?;

        let ctx = {
            let mut state = self.inner.state.lock();
            // Re-checked: another submit may have won while messages loaded.
            if state.streams.is_streaming(conversation_id) {
                return Err(SyncError::validation("A response is already in progress"));
            }
            let conv = state
                .conversations
                .get_mut(conversation_id)
                .ok_or_else(|| SyncError::validation(format!("Unknown conversation: {}", conversation_id)))?;

            if conv.messages().is_empty() && conv.title() == DEFAULT_TITLE {
                conv.set_title(title_from_message(text));
            }
            let user_message = Message::user(conversation_id, text);
            conv.push_message(user_message.clone());
            let history: Vec<HistoryEntry> = conv.messages().iter().map(HistoryEntry::from).collect();

            let (turn_id, cancel) = state
                .streams
                .register_stream(StreamingTurn::new(user_message.clone()))
                .ok_or_else(|| SyncError::validation("A response is already in progress"))?;
            state.last_error = None;
            self.publish(&state);

            TurnContext {
                conversation_id: conversation_id.to_string(),
                turn_id,
                cancel,
                user_message,
                history,
            }
        };

        let message_id = ctx.user_message.id.clone();
        info!(conv_id = %conversation_id, message_id = %message_id, "Submitted user message");
        self.emit(EngineEvent::TurnStatusChanged {
            conversation_id: conversation_id.to_string(),
            status: TurnStatus::Sending,
        });

        tokio::spawn(self.clone().run_turn(ctx));
        Ok(message_id)
    }

    fn check_can_submit(&self, conversation_id: &str) -> SyncResult<()> {
        let state = self.inner.state.lock();
        if !state.conversations.contains_key(conversation_id) {
            return Err(SyncError::validation(format!(
                "Unknown conversation: {}",
                conversation_id
            )));
        }
        if state.streams.is_streaming(conversation_id) {
            return Err(SyncError::validation("A response is already in progress"));
        }
        Ok(())
    }

    async fn run_turn(self, ctx: TurnContext) {
        self.persist_user_message(&ctx.user_message).await;

        if ctx.cancel.is_cancelled() {
            debug!(conv_id = %ctx.conversation_id, "Turn cancelled before inference");
            return;
        }

        let request = CompletionRequest {
            history: ctx.history.clone(),
            system: self.inner.config.system_prompt.clone(),
            max_tokens: self.inner.config.max_output_tokens,
            temperature: self.inner.config.temperature,
        };

        match self.stream_response(&ctx, request).await {
            Ok(Some(text)) => self.finalize_turn(&ctx, text).await,
            Ok(None) => debug!(conv_id = %ctx.conversation_id, "Turn cancelled, partial reply discarded"),
            Err(e) => self.fail_turn(&ctx, e),
        }
    }

    /// Drive the inference stream. `Ok(None)` means the turn was cancelled.
    async fn stream_response(
        &self,
        ctx: &TurnContext,
        request: CompletionRequest,
    ) -> Result<Option<String>, InferenceError> {
        let timeout = self.inner.config.request_timeout;
        let deadline = Instant::now() + timeout;

        let mut stream = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Ok(None),
            started = tokio::time::timeout_at(deadline, self.inner.inference.complete(request)) => {
                started.map_err(|_| InferenceError::Timeout(timeout))??
            }
        };

        if !self.set_turn_status(ctx, TurnStatus::Streaming) {
            return Ok(None);
        }

        let mut accumulated = String::new();
        loop {
            // Dropping `stream` on any return tears the request down.
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Ok(None),
                next = tokio::time::timeout_at(deadline, stream.next()) => {
                    next.map_err(|_| InferenceError::Timeout(timeout))?
                }
            };

            match next {
                Some(Ok(StreamChunk::Text(delta))) => {
                    if !self.apply_delta(ctx, &delta) {
                        return Ok(None);
                    }
                    accumulated.push_str(&delta);
                }
                Some(Ok(StreamChunk::Done { final_text })) => {
                    if accumulated.is_empty() && !final_text.is_empty() {
                        return Ok(Some(final_text));
                    }
                    return Ok(Some(accumulated));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(InferenceError::Malformed(
                        "Stream ended without a completion event".into(),
                    ));
                }
            }
        }
    }

    fn set_turn_status(&self, ctx: &TurnContext, status: TurnStatus) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !state.streams.set_status(&ctx.conversation_id, ctx.turn_id, status) {
                return false;
            }
            self.publish(&state);
        }
        self.emit(EngineEvent::TurnStatusChanged {
            conversation_id: ctx.conversation_id.clone(),
            status,
        });
        true
    }

    /// Publish one delta. Returns false once the turn was cancelled or replaced.
    fn apply_delta(&self, ctx: &TurnContext, delta: &str) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !state.streams.handle_delta(&ctx.conversation_id, ctx.turn_id, delta) {
                return false;
            }
            self.publish(&state);
        }
        self.emit(EngineEvent::TextDelta {
            conversation_id: ctx.conversation_id.clone(),
            text: delta.to_string(),
        });
        true
    }

    async fn finalize_turn(&self, ctx: &TurnContext, text: String) {
        let conv_id = ctx.conversation_id.as_str();

        let (assistant, write_now) = {
            let mut state = self.inner.state.lock();
            if !state.streams.set_status(conv_id, ctx.turn_id, TurnStatus::Finalizing) {
                return;
            }
            let assistant = Message::assistant(conv_id, text);
            let write_now = match state.conversations.get_mut(conv_id) {
                Some(conv) => {
                    conv.push_message(assistant.clone());
                    conv.is_persisted()
                }
                None => {
                    state.streams.finish(conv_id, ctx.turn_id, TurnStatus::Cancelled);
                    self.publish(&state);
                    return;
                }
            };
            // Keep store order: nothing overtakes a message waiting for retry.
            let write_now = write_now && !state.has_pending_writes(conv_id);
            if !write_now {
                state.queue_retry(conv_id, &assistant.id);
            }
            self.publish(&state);
            (assistant, write_now)
        };
        self.emit(EngineEvent::TurnStatusChanged {
            conversation_id: conv_id.to_string(),
            status: TurnStatus::Finalizing,
        });

        if write_now {
            if let Err(e) = self.inner.store.insert_message(MessageRecord::from(&assistant)).await {
                warn!(error = ?e, conv_id = %conv_id, "Failed to persist assistant message");
                self.emit_persistence_failure(conv_id, "insert_message", &e);
                let mut state = self.inner.state.lock();
                state.queue_retry(conv_id, &assistant.id);
                self.publish(&state);
            } else if self.discard_if_deleted(conv_id).await {
                return;
            }

            let updated_at = self
                .inner
                .state
                .lock()
                .conversations
                .get(conv_id)
                .map(|c| c.updated_at().timestamp_millis());
            if let Some(updated_at) = updated_at {
                self.patch_meta(
                    conv_id,
                    ConversationMetaPatch {
                        updated_at,
                        ..Default::default()
                    },
                )
                .await;
            }
        }

        {
            let mut state = self.inner.state.lock();
            if state.streams.finish(conv_id, ctx.turn_id, TurnStatus::Done).is_none() {
                return;
            }
            self.publish(&state);
        }
        info!(conv_id = %conv_id, message_id = %assistant.id, "Turn completed");
        self.emit(EngineEvent::TurnStatusChanged {
            conversation_id: conv_id.to_string(),
            status: TurnStatus::Done,
        });
        self.emit(EngineEvent::TurnEnded {
            conversation_id: conv_id.to_string(),
            status: TurnStatus::Done,
        });
    }

    fn fail_turn(&self, ctx: &TurnContext, error: InferenceError) {
        let error = SyncError::from(error);
        {
            let mut state = self.inner.state.lock();
            if state
                .streams
                .finish(&ctx.conversation_id, ctx.turn_id, TurnStatus::Errored)
                .is_none()
            {
                return;
            }
            state.last_error = Some(error.kind());
            self.publish(&state);
        }
        warn!(error = %error, conv_id = %ctx.conversation_id, "Turn failed");
        self.emit(EngineEvent::TurnStatusChanged {
            conversation_id: ctx.conversation_id.clone(),
            status: TurnStatus::Errored,
        });
        self.emit(EngineEvent::TurnEnded {
            conversation_id: ctx.conversation_id.clone(),
            status: TurnStatus::Errored,
        });
    }

    /// Create the conversation row if needed, then insert the message.
    /// On failure the message stays in memory and is queued for retry.
    async fn persist_user_message(&self, message: &Message) {
        let conv_id = message.conversation_id.as_str();

        let (create, queued) = {
            let mut state = self.inner.state.lock();
            let Some(conv) = state.conversations.get(conv_id) else {
                debug!(conv_id = %conv_id, "Conversation deleted before its first write");
                return;
            };
            let create = (!conv.is_persisted()).then(|| ConversationRecord::from(conv));
            let queued = state.has_pending_writes(conv_id);
            if queued {
                state.queue_retry(conv_id, &message.id);
            }
            (create, queued)
        };
        if queued {
            debug!(conv_id = %conv_id, "Earlier writes pending, message queued for retry");
            return;
        }

        if let Some(record) = create {
            let stored = match self.ensure_conversation_row(record).await {
                Ok(stored) => stored,
                Err(e) => {
                    error!(error = ?e, conv_id = %conv_id, "Failed to create conversation in store");
                    self.emit_persistence_failure(conv_id, "create_conversation", &e);
                    let mut state = self.inner.state.lock();
                    if state.conversations.contains_key(conv_id) {
                        state.last_error = Some(SyncError::from(e).kind());
                        state.queue_retry(conv_id, &message.id);
                        self.publish(&state);
                    }
                    return;
                }
            };
            if self.discard_if_deleted(conv_id).await {
                return;
            }
            self.mark_persisted(&stored).await;
        }

        let record = self
            .current_record(conv_id, &message.id)
            .unwrap_or_else(|| MessageRecord::from(message));
        if let Err(e) = self.inner.store.insert_message(record.clone()).await {
            warn!(error = ?e, conv_id = %conv_id, "Failed to persist user message, queued for retry");
            self.emit_persistence_failure(conv_id, "insert_message", &e);
            let mut state = self.inner.state.lock();
            state.queue_retry(conv_id, &message.id);
            self.publish(&state);
            return;
        }
        if self.discard_if_deleted(conv_id).await {
            return;
        }

        // An edit that raced the insert found no row to update.
        if let Some(current) = self.current_record(conv_id, &message.id)
            && current.content != record.content
            && let Err(e) = self
                .inner
                .store
                .update_message_content(&message.id, &current.content)
                .await
        {
            warn!(error = ?e, message_id = %message.id, "Failed to persist message edit");
            self.emit_persistence_failure(conv_id, "update_message_content", &e);
        }
    }

    fn current_record(&self, conv_id: &str, message_id: &str) -> Option<MessageRecord> {
        self.inner
            .state
            .lock()
            .conversations
            .get(conv_id)
            .and_then(|c| c.message(message_id))
            .map(MessageRecord::from)
    }

    /// Returns the row as the store now holds it.
    async fn ensure_conversation_row(&self, record: ConversationRecord) -> RepositoryResult<ConversationRecord> {
        if let Some(existing) = self.inner.store.get_conversation(&record.id).await? {
            return Ok(existing);
        }
        self.inner.store.create_conversation(record.clone()).await?;
        Ok(record)
    }

    /// Flag the conversation as stored, then write any pin, rename or folder
    /// change made while the row was being created.
    async fn mark_persisted(&self, stored: &ConversationRecord) {
        let patch = {
            let mut state = self.inner.state.lock();
            let Some(conv) = state.conversations.get_mut(&stored.id) else {
                return;
            };
            conv.mark_persisted();
            let current = ConversationRecord::from(&*conv);
            self.publish(&state);

            let patch = ConversationMetaPatch {
                title: (current.title != stored.title).then(|| current.title.clone()),
                pinned: (current.pinned != stored.pinned).then_some(current.pinned),
                folder: current.folder.clone().filter(|f| stored.folder.as_ref() != Some(f)),
                updated_at: current.updated_at,
            };
            (patch.title.is_some() || patch.pinned.is_some() || patch.folder.is_some()).then_some(patch)
        };

        if let Some(patch) = patch {
            debug!(conv_id = %stored.id, "Writing metadata changed during conversation create");
            self.patch_meta(&stored.id, patch).await;
        }
    }

    /// Remove rows a turn wrote after its conversation was deleted.
    /// Returns true when the conversation is gone.
    async fn discard_if_deleted(&self, conv_id: &str) -> bool {
        let deleted = self.inner.state.lock().deleted.contains(conv_id);
        if !deleted {
            return false;
        }

        let store = &self.inner.store;
        let result = match store.delete_messages(conv_id).await {
            Ok(()) => store.delete_conversation(conv_id).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(conv_id = %conv_id, "Removed rows written after delete"),
            Err(e) => {
                warn!(error = ?e, conv_id = %conv_id, "Failed to remove rows written after delete");
                self.emit_persistence_failure(conv_id, "delete_conversation", &e);
            }
        }
        true
    }

    /// Replay queued writes in order. Stops at the first failure.
    /// Returns the number of messages written.
    pub async fn retry_pending_writes(&self, conversation_id: &str) -> SyncResult<usize> {
        let (create, ids) = {
            let state = self.inner.state.lock();
            let conv = state
                .conversations
                .get(conversation_id)
                .ok_or_else(|| SyncError::validation(format!("Unknown conversation: {}", conversation_id)))?;
            let create = (!conv.is_persisted()).then(|| ConversationRecord::from(conv));
            (create, state.pending_retry.get(conversation_id).cloned().unwrap_or_default())
        };

        if let Some(record) = create {
            let stored = self.ensure_conversation_row(record).await?;
            if self.discard_if_deleted(conversation_id).await {
                return Ok(0);
            }
            self.mark_persisted(&stored).await;
            let mut state = self.inner.state.lock();
            if matches!(state.last_error, Some(ErrorKind::Persistence(_))) {
                state.last_error = None;
            }
            self.publish(&state);
        }

        let mut written = 0;
        for message_id in ids {
            if let Some(record) = self.current_record(conversation_id, &message_id) {
                self.inner.store.insert_message(record).await?;
                if self.discard_if_deleted(conversation_id).await {
                    return Ok(written);
                }
                written += 1;
            }

            let mut state = self.inner.state.lock();
            if let Some(queue) = state.pending_retry.get_mut(conversation_id) {
                queue.retain(|id| id != &message_id);
            }
            self.publish(&state);
        }

        {
            let mut state = self.inner.state.lock();
            if state.pending_retry.get(conversation_id).is_some_and(|q| q.is_empty()) {
                state.pending_retry.remove(conversation_id);
            }
        }

        info!(conv_id = %conversation_id, count = written, "Replayed pending writes");
        Ok(written)
    }

    // ── Edit, resend, pause ────────────────────────────────────────────────

    /// Edit a message in place. Unknown message ids are a no-op and return
    /// `Ok(false)`. A failed store write is logged; the edit stays visible.
    pub async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        new_content: &str,
    ) -> SyncResult<bool> {
        if new_content.trim().is_empty() {
            return Err(SyncError::validation("Message text is empty"));
        }

        let write = {
            let mut state = self.inner.state.lock();
            let Some(conv) = state.conversations.get_mut(conversation_id) else {
                return Err(SyncError::validation(format!(
                    "Unknown conversation: {}",
                    conversation_id
                )));
            };
            let edited = conv.edit_message(message_id, new_content, Utc::now());
            let mirrored = state
                .streams
                .update_pending_user_message(conversation_id, message_id, new_content);
            if !edited && !mirrored {
                debug!(conv_id = %conversation_id, message_id = %message_id, "Edit of unknown message ignored");
                return Ok(false);
            }
            self.publish(&state);
            // A queued message is written with its current content on retry.
            !state
                .pending_retry
                .get(conversation_id)
                .is_some_and(|q| q.iter().any(|id| id == message_id))
        };

        if write
            && let Err(e) = self
                .inner
                .store
                .update_message_content(message_id, new_content)
                .await
        {
            warn!(error = ?e, message_id = %message_id, "Failed to persist message edit");
            self.emit_persistence_failure(conversation_id, "update_message_content", &e);
        }
        Ok(true)
    }

    /// Submit a message's current content again as a new user turn. The
    /// original message is left untouched. Returns `Ok(None)` when there is
    /// no content to resend.
    pub async fn resend_message(&self, conversation_id: &str, message_id: &str) -> SyncResult<Option<String>> {
        let content = {
            let state = self.inner.state.lock();
            state
                .streams
                .pending_user_text(conversation_id, message_id)
                .or_else(|| {
                    state
                        .conversations
                        .get(conversation_id)
                        .and_then(|c| c.message(message_id))
                        .map(|m| m.text().to_string())
                })
        };

        match content {
            Some(content) if !content.trim().is_empty() => {
                self.submit(conversation_id, &content).await.map(Some)
            }
            _ => {
                debug!(conv_id = %conversation_id, message_id = %message_id, "Nothing to resend");
                Ok(None)
            }
        }
    }

    /// Stop the conversation's turn. Idempotent; returns whether a turn stopped.
    pub fn pause(&self, conversation_id: &str) -> bool {
        let stopped = {
            let mut state = self.inner.state.lock();
            let stopped = state.streams.stop_stream(conversation_id);
            if stopped.is_some() {
                self.publish(&state);
            }
            stopped
        };

        let Some(turn) = stopped else {
            return false;
        };
        info!(
            conv_id = %conversation_id,
            discarded_chars = turn.partial_assistant_text.len(),
            "Paused turn"
        );
        self.emit(EngineEvent::TurnStatusChanged {
            conversation_id: conversation_id.to_string(),
            status: TurnStatus::Cancelled,
        });
        self.emit(EngineEvent::TurnEnded {
            conversation_id: conversation_id.to_string(),
            status: TurnStatus::Cancelled,
        });
        true
    }

    /// Cancel every turn in flight. Nothing partial is persisted.
    pub fn stop_all(&self) -> usize {
        let stopped = {
            let mut state = self.inner.state.lock();
            let stopped = state.streams.stop_all();
            self.publish(&state);
            stopped
        };
        for turn in &stopped {
            self.emit(EngineEvent::TurnEnded {
                conversation_id: turn.conversation_id.clone(),
                status: TurnStatus::Cancelled,
            });
        }
        stopped.len()
    }

    pub fn dismiss_error(&self) {
        let mut state = self.inner.state.lock();
        state.last_error = None;
        self.publish(&state);
    }

    // ── Selected-conversation intents ──────────────────────────────────────

    /// Submit to the selected conversation, creating one when none is selected.
    /// Returns the conversation id and the new message id.
    pub async fn submit_to_selected(&self, text: &str) -> SyncResult<(String, String)> {
        if text.trim().is_empty() {
            return Err(SyncError::validation("Message text is empty"));
        }
        let conversation_id = match self.selected_id() {
            Some(id) => id,
            None => self.create_conversation(),
        };
        let message_id = self.submit(&conversation_id, text).await?;
        Ok((conversation_id, message_id))
    }

    pub async fn edit_selected_message(&self, message_id: &str, new_content: &str) -> SyncResult<bool> {
        let conversation_id = self.require_selected()?;
        self.edit_message(&conversation_id, message_id, new_content).await
    }

    pub async fn resend_selected_message(&self, message_id: &str) -> SyncResult<Option<String>> {
        let conversation_id = self.require_selected()?;
        self.resend_message(&conversation_id, message_id).await
    }

    pub fn pause_selected(&self) -> bool {
        self.selected_id().is_some_and(|id| self.pause(&id))
    }

    fn require_selected(&self) -> SyncResult<String> {
        self.selected_id()
            .ok_or_else(|| SyncError::validation("No conversation selected"))
    }
}
