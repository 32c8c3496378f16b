pub mod snapshot;
pub mod stream_manager;
pub mod sync_engine;

pub use snapshot::{EngineEvent, EngineSnapshot};
pub use stream_manager::{CancelHandle, StreamManager};
pub use sync_engine::{ConversationSyncEngine, EngineConfig};
