mod engine;
mod types;

#[cfg(feature = "tch-backend")]
pub mod tch_backend;

pub use engine::{BuildSpec, EngineError, InferenceEngine, ModelHandle, ProgressFn, TokenStreamer};
pub use types::{ChatMessage, Role, RunOutput, RunParams};
