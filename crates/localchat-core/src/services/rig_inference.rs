use futures::StreamExt;
use rig::agent::Agent;
use rig::client::CompletionClient;
use rig::completion::Message as RigMessage;
use rig::streaming::StreamingPrompt;
use tracing::debug;

use super::inference_service::{
    CompletionRequest, HistoryEntry, InferenceError, InferenceService, ResponseStream, StreamChunk,
};
use crate::models::Role;
use crate::repositories::BoxFuture;
use crate::settings::{InferenceSettings, ProviderKind};

/// Enum-based agent wrapper for the supported local backends
#[derive(Clone)]
pub enum AgentClient {
    OpenAiCompatible(Agent<rig::providers::openai::completion::CompletionModel>),
    Ollama(Agent<rig::providers::ollama::CompletionModel>),
}

impl AgentClient {
    /// Build an agent carrying the request's preamble, temperature and token limit.
    pub fn from_settings(
        settings: &InferenceSettings,
        request: &CompletionRequest,
    ) -> Result<Self, InferenceError> {
        match settings.provider {
            ProviderKind::OpenAiCompatible => {
                let client = rig::providers::openai::Client::builder()
                    .api_key(&settings.api_key)
                    .base_url(&settings.base_url)
                    .build()
                    .map_err(|e| InferenceError::Configuration(e.to_string()))?
                    .completions_api();

                let agent = client
                    .agent(&settings.model)
                    .preamble(&request.system)
                    .temperature(request.temperature as f64)
                    .max_tokens(request.max_tokens as u64)
                    .build();

                Ok(AgentClient::OpenAiCompatible(agent))
            }
            ProviderKind::Ollama => {
                let client = rig::providers::ollama::Client::builder()
                    .api_key(rig::client::Nothing)
                    .base_url(&settings.base_url)
                    .build()
                    .map_err(|e| InferenceError::Configuration(e.to_string()))?;

                let agent = client
                    .agent(&settings.model)
                    .preamble(&request.system)
                    .temperature(request.temperature as f64)
                    .max_tokens(request.max_tokens as u64)
                    .build();

                Ok(AgentClient::Ollama(agent))
            }
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            AgentClient::OpenAiCompatible(_) => "OpenAI-compatible",
            AgentClient::Ollama(_) => "Ollama",
        }
    }
}

/// Helper macro to turn an agent stream into a `ResponseStream`
macro_rules! process_agent_stream {
    ($stream:expr) => {
        Box::pin(async_stream::stream! {
            let mut final_text = String::new();
            while let Some(item) = $stream.next().await {
                match item {
                    Ok(rig::agent::MultiTurnStreamItem::StreamAssistantItem(
                        rig::streaming::StreamedAssistantContent::Text(text),
                    )) => {
                        final_text.push_str(&text.text);
                        yield Ok(StreamChunk::Text(text.text));
                    }
                    Err(e) => {
                        yield Err(InferenceError::Request(e.to_string()));
                        return;
                    }
                    _ => {}
                }
            }
            yield Ok(StreamChunk::Done { final_text });
        })
    };
}

fn to_rig_message(entry: &HistoryEntry) -> RigMessage {
    match entry.role {
        Role::User => RigMessage::user(entry.content.clone()),
        Role::Assistant => RigMessage::assistant(entry.content.clone()),
    }
}

/// Stream a completion through an agent. The last history entry is the prompt.
pub async fn stream_prompt(
    agent: &AgentClient,
    history: &[HistoryEntry],
) -> Result<ResponseStream, InferenceError> {
    let (prompt, earlier) = history.split_last().ok_or(InferenceError::EmptyHistory)?;
    if prompt.role != Role::User {
        return Err(InferenceError::Malformed(
            "Last history entry must be a user message".into(),
        ));
    }

    let prompt = to_rig_message(prompt);
    let history_snapshot: Vec<RigMessage> = earlier.iter().map(to_rig_message).collect();

    let stream: ResponseStream = match agent {
        AgentClient::OpenAiCompatible(agent) => {
            let mut stream = agent.stream_prompt(prompt).with_history(history_snapshot).await;
            process_agent_stream!(stream)
        }
        AgentClient::Ollama(agent) => {
            let mut stream = agent.stream_prompt(prompt).with_history(history_snapshot).await;
            process_agent_stream!(stream)
        }
    };

    Ok(stream)
}

/// Inference service backed by a rig agent talking to a local model server.
#[derive(Clone)]
pub struct RigInferenceService {
    settings: InferenceSettings,
}

impl RigInferenceService {
    pub fn new(settings: InferenceSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &InferenceSettings {
        &self.settings
    }
}

impl InferenceService for RigInferenceService {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'static, Result<ResponseStream, InferenceError>> {
        let settings = self.settings.clone();
        Box::pin(async move {
            let agent = AgentClient::from_settings(&settings, &request)?;
            debug!(
                provider = agent.provider_name(),
                model = %settings.model,
                history_len = request.history.len(),
                "Starting completion"
            );
            stream_prompt(&agent, &request.history).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_history_is_rejected_before_any_request() {
        let settings = InferenceSettings::default();
        let request = CompletionRequest {
            history: Vec::new(),
            system: settings.system_prompt.clone(),
            max_tokens: 16,
            temperature: 0.7,
        };
        let agent = AgentClient::from_settings(&settings, &request).unwrap();
        assert!(matches!(
            stream_prompt(&agent, &request.history).await,
            Err(InferenceError::EmptyHistory)
        ));
    }

    #[tokio::test]
    async fn test_trailing_assistant_entry_is_malformed() {
        let mut settings = InferenceSettings::default();
        settings.provider = ProviderKind::Ollama;
        settings.base_url = "http://127.0.0.1:11434".into();
        let request = CompletionRequest {
            history: vec![HistoryEntry {
                role: Role::Assistant,
                content: "hi".into(),
            }],
            system: String::new(),
            max_tokens: 16,
            temperature: 0.7,
        };
        let agent = AgentClient::from_settings(&settings, &request).unwrap();
        assert_eq!(agent.provider_name(), "Ollama");
        assert!(matches!(
            stream_prompt(&agent, &request.history).await,
            Err(InferenceError::Malformed(_))
        ));
    }
}
