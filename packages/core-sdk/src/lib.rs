pub mod chat;
pub mod config;
pub mod db;
pub mod endpoint;
pub mod error;
pub mod extract;
pub mod llm;
pub mod models;
pub mod persist;
pub mod relay;
pub mod request;
pub mod server;
pub mod sse;
pub mod telemetry;
pub mod transcode;

/**
 * \brief Common imports for the CLI and embedders.
 */
pub mod prelude {
    pub use crate::chat::{run_chat, ChatOutcome, CompletionReply};
    pub use crate::config::Config;
    pub use crate::db;
    pub use crate::error::ChatError;
    pub use crate::llm;
    pub use crate::models::{ChatRequest, GenerationSettings, InputMessage, NewProfile, Role};
    pub use crate::relay::RelayEvent;
    pub use crate::server;
    pub use crate::telemetry;
}
