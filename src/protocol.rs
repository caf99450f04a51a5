//! Messages exchanged between the session controller and its executor.
//!
//! Every request carries a [`RequestId`]; the executor answers with any number
//! of `STATUS`, `TOKEN` and `BANNER` responses followed by exactly one terminal
//! `READY`, `DONE` or `ERROR` for that id.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::session::negotiation::{Backend, Precision};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces `<unix millis>-<sequence>` ids; never repeats within a process.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    seq: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> RequestId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        RequestId(format!("{millis}-{seq}"))
    }
}

/// Configuration the executor actually committed after negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model_id: String,
    pub precision: Precision,
    pub backend: Backend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub kind: RequestKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    Init(InitPayload),
    Generate(GeneratePayload),
    Abort(AbortPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitPayload {
    pub model_id: String,
    pub precision: Precision,
    pub backend: Backend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratePayload {
    pub prompt: String,
    pub max_new_tokens: usize,
    pub temperature: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbortPayload {
    pub target_request_id: Option<RequestId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub kind: ResponseKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseKind {
    Ready { config: SessionConfig },
    Token(TokenPayload),
    Done(DonePayload),
    Error(ErrorPayload),
    Status(StatusPayload),
    Banner(Banner),
}

impl ResponseKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponseKind::Ready { .. } | ResponseKind::Done(_) | ResponseKind::Error(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResponseKind::Ready { .. } => "READY",
            ResponseKind::Token(_) => "TOKEN",
            ResponseKind::Done(_) => "DONE",
            ResponseKind::Error(_) => "ERROR",
            ResponseKind::Status(_) => "STATUS",
            ResponseKind::Banner(_) => "BANNER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub text: String,
    pub is_final: bool,
}

/// Result of a generation as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub text: String,
    pub aborted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonePayload {
    pub text: String,
    pub aborted: bool,
    /// Configuration in effect when the generation settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SessionConfig>,
}

impl DonePayload {
    pub fn into_outcome(self) -> GenerationOutcome {
        GenerationOutcome {
            text: self.text,
            aborted: self.aborted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Init,
    Generate,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitStep {
    Fetch,
    Runtime,
    Warmup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<InitStep>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
}

impl StatusPayload {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            step: None,
            message: message.into(),
            percent: None,
        }
    }

    pub fn init(step: InitStep, message: impl Into<String>, percent: Option<u8>) -> Self {
        Self {
            stage: Stage::Init,
            step: Some(step),
            message: message.into(),
            percent: percent.map(|p| p.min(100)),
        }
    }
}

/// Advisory notice that the executor substituted a backend or precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Banner {
    pub message: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InitTimeout,
    GenerateTimeout,
    MissingPrecisionResource,
    BackendUnavailable,
    EmptyResult,
    NotInitialized,
    Busy,
    Unclassified,
}

/// Instruction to the controller attached to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    RestartOnSafeBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<Precision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ErrorAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SessionConfig>,
}
