pub mod inference_service;
pub mod rig_inference;

pub use inference_service::{
    CompletionRequest, HistoryEntry, InferenceError, InferenceService, ResponseStream, StreamChunk,
};
pub use rig_inference::{AgentClient, RigInferenceService, stream_prompt};
