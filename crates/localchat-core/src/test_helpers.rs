//! Shared test doubles for engine tests.
//!
//! `MockInferenceService` replays scripted responses in call order and
//! records every request. `FailingMessageStore` wraps an
//! [`InMemoryMessageStore`] with switchable failure injection and can park a
//! call mid-flight.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::repositories::{
    BoxFuture, ConversationMetaPatch, ConversationRecord, ConversationSummary, InMemoryMessageStore,
    MessageRecord, MessageStore, RepositoryError, RepositoryResult,
};
use crate::services::{CompletionRequest, InferenceError, InferenceService, ResponseStream, StreamChunk};

enum Step {
    Delta(String),
    Finish,
    Fail(InferenceError),
    Stall,
}

/// One scripted completion.
pub struct Script {
    start_error: Option<InferenceError>,
    steps: Vec<Step>,
    gate: Option<Arc<Notify>>,
}

impl Script {
    /// Stream the deltas, then complete.
    pub fn reply(deltas: &[&str]) -> Self {
        let mut steps: Vec<Step> = deltas.iter().map(|d| Step::Delta(d.to_string())).collect();
        steps.push(Step::Finish);
        Self {
            start_error: None,
            steps,
            gate: None,
        }
    }

    /// A stream that never yields anything.
    pub fn stall() -> Self {
        Self {
            start_error: None,
            steps: vec![Step::Stall],
            gate: None,
        }
    }

    /// `complete` itself fails.
    pub fn fail(error: InferenceError) -> Self {
        Self {
            start_error: Some(error),
            steps: Vec::new(),
            gate: None,
        }
    }

    /// Replace the completion with an endless wait.
    pub fn then_stall(mut self) -> Self {
        self.steps.pop();
        self.steps.push(Step::Stall);
        self
    }

    /// Replace the completion with a mid-stream error.
    pub fn then_fail(mut self, error: InferenceError) -> Self {
        self.steps.pop();
        self.steps.push(Step::Fail(error));
        self
    }
}

/// Holds a gated script back until opened.
pub struct Gate(Arc<Notify>);

impl Gate {
    pub fn open(&self) {
        self.0.notify_one();
    }
}

/// In-memory mock of [`InferenceService`] for unit tests.
#[derive(Default)]
pub struct MockInferenceService {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockInferenceService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    /// Queue a script whose stream waits for the returned gate before yielding.
    pub fn push_gated(&self, mut script: Script) -> Gate {
        let notify = Arc::new(Notify::new());
        script.gate = Some(notify.clone());
        self.push(script);
        Gate(notify)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

impl InferenceService for MockInferenceService {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'static, Result<ResponseStream, InferenceError>> {
        self.requests.lock().push(request);
        // Unscripted calls get an empty reply.
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Script::reply(&[]));

        Box::pin(async move {
            if let Some(error) = script.start_error {
                return Err(error);
            }

            let Script { steps, gate, .. } = script;
            let stream: ResponseStream = Box::pin(async_stream::stream! {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                let mut text = String::new();
                for step in steps {
                    match step {
                        Step::Delta(delta) => {
                            text.push_str(&delta);
                            yield Ok(StreamChunk::Text(delta));
                        }
                        Step::Finish => {
                            yield Ok(StreamChunk::Done { final_text: text.clone() });
                            return;
                        }
                        Step::Fail(error) => {
                            yield Err(error);
                            return;
                        }
                        Step::Stall => {
                            futures::future::pending::<()>().await;
                        }
                    }
                }
            });
            Ok(stream)
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetConversation,
    ListConversations,
    CreateConversation,
    UpdateConversationMeta,
    DeleteConversation,
    DeleteMessages,
    InsertMessage,
    UpdateMessageContent,
    ListMessages,
    ListConversationSummaries,
}

/// A store call parked before it touches the inner store.
pub struct HeldCall {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

impl HeldCall {
    /// Resolves once the held call is waiting.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// [`InMemoryMessageStore`] with failure injection and a call log.
#[derive(Clone, Default)]
pub struct FailingMessageStore {
    inner: InMemoryMessageStore,
    failing: Arc<Mutex<HashSet<StoreOp>>>,
    held: Arc<Mutex<HashMap<StoreOp, (Arc<Notify>, Arc<Notify>)>>>,
    calls: Arc<Mutex<Vec<StoreOp>>>,
}

impl FailingMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `op` fail until `recover`.
    pub fn fail(&self, op: StoreOp) {
        self.failing.lock().insert(op);
    }

    pub fn recover(&self) {
        self.failing.lock().clear();
    }

    /// Park the next call of `op` until the returned handle releases it.
    pub fn hold(&self, op: StoreOp) -> HeldCall {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        self.held.lock().insert(op, (reached.clone(), release.clone()));
        HeldCall { reached, release }
    }

    pub fn calls(&self) -> Vec<StoreOp> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, op: StoreOp) -> usize {
        self.calls.lock().iter().filter(|c| **c == op).count()
    }

    pub fn inner(&self) -> &InMemoryMessageStore {
        &self.inner
    }

    fn call<T: Send + 'static>(
        &self,
        op: StoreOp,
        start: impl FnOnce() -> BoxFuture<'static, RepositoryResult<T>>,
    ) -> BoxFuture<'static, RepositoryResult<T>> {
        self.calls.lock().push(op);
        if self.failing.lock().contains(&op) {
            let error = RepositoryError::InvalidData {
                message: format!("injected {:?} failure", op),
            };
            return Box::pin(async move { Err(error) });
        }

        // Inner futures do their work when first polled.
        let call = start();
        match self.held.lock().remove(&op) {
            None => call,
            Some((reached, release)) => Box::pin(async move {
                reached.notify_one();
                release.notified().await;
                call.await
            }),
        }
    }
}

impl MessageStore for FailingMessageStore {
    fn get_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<ConversationRecord>>> {
        self.call(StoreOp::GetConversation, || self.inner.get_conversation(id))
    }

    fn list_conversations(&self) -> BoxFuture<'static, RepositoryResult<Vec<ConversationRecord>>> {
        self.call(StoreOp::ListConversations, || self.inner.list_conversations())
    }

    fn create_conversation(&self, record: ConversationRecord) -> BoxFuture<'static, RepositoryResult<()>> {
        self.call(StoreOp::CreateConversation, || self.inner.create_conversation(record))
    }

    fn update_conversation_meta(
        &self,
        id: &str,
        patch: ConversationMetaPatch,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        self.call(StoreOp::UpdateConversationMeta, || {
            self.inner.update_conversation_meta(id, patch)
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        self.call(StoreOp::DeleteConversation, || self.inner.delete_conversation(id))
    }

    fn delete_messages(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        self.call(StoreOp::DeleteMessages, || self.inner.delete_messages(conversation_id))
    }

    fn insert_message(&self, record: MessageRecord) -> BoxFuture<'static, RepositoryResult<()>> {
        self.call(StoreOp::InsertMessage, || self.inner.insert_message(record))
    }

    fn update_message_content(&self, message_id: &str, content: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        self.call(StoreOp::UpdateMessageContent, || {
            self.inner.update_message_content(message_id, content)
        })
    }

    fn list_messages(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<MessageRecord>>> {
        self.call(StoreOp::ListMessages, || self.inner.list_messages(conversation_id))
    }

    fn list_conversation_summaries(&self) -> BoxFuture<'static, RepositoryResult<Vec<ConversationSummary>>> {
        self.call(StoreOp::ListConversationSummaries, || {
            self.inner.list_conversation_summaries()
        })
    }
}
