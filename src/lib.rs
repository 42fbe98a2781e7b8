pub mod config;
pub mod error;
pub mod generation;
pub mod history;
pub mod manager;
pub mod orchestrator;
pub mod personality;
pub mod prompts;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod sink;
pub mod stt;
pub mod transport;
pub mod tts;

pub use error::{EngineError, Result};
