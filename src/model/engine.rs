use async_trait::async_trait;
use thiserror::Error;

use crate::{
    model::{RunOutput, RunParams},
    session::negotiation::{Backend, BuildProgress, Precision},
};

/// Marker the dependency uses when an artifact for a precision is absent.
const MISSING_FILE_MARKER: &str = "could not locate file";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not locate file for precision {precision}: {detail}")]
    MissingResource { precision: Precision, detail: String },
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// Raised by a token streamer to unwind an in-flight run.
    #[error("generation cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    pub fn is_missing_resource(&self) -> bool {
        match self {
            EngineError::MissingResource { .. } => true,
            EngineError::Failed(message) => message.to_lowercase().contains(MISSING_FILE_MARKER),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub model_id: String,
    pub precision: Precision,
    pub backend: Backend,
}

pub type ProgressFn = Box<dyn FnMut(BuildProgress) + Send>;

/// Receives each decoded fragment. Returning an error aborts the run with it.
pub type TokenStreamer = Box<dyn FnMut(&str) -> Result<(), EngineError> + Send>;

/// The opaque inference library.
#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    async fn build(
        &self,
        spec: &BuildSpec,
        progress: Option<ProgressFn>,
    ) -> Result<Box<dyn ModelHandle>, EngineError>;
}

#[async_trait]
pub trait ModelHandle: Send + Sync + 'static {
    async fn run(
        &self,
        prompt: &str,
        params: &RunParams,
        streamer: Option<TokenStreamer>,
    ) -> Result<RunOutput, EngineError>;
}
