use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::{
    protocol::{ErrorAction, ErrorPayload, FailureKind, SessionConfig, Stage},
    session::negotiation::Precision,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    InitTimeout(String),
    #[error("generation timed out")]
    GenerateTimeout,
    #[error("precision \"{precision}\" is not available for this model: {message}")]
    MissingPrecisionResource { precision: Precision, message: String },
    /// Backend failed in a way only a fresh executor on the safe backend can recover from.
    #[error("{0}")]
    BackendUnavailable(String),
    #[error("empty generation result")]
    EmptyResult,
    #[error("model not initialized")]
    NotInitialized,
    #[error("a generation is already in progress")]
    GenerationInProgress,
    #[error("executor crashed")]
    ExecutorCrash,
    #[error("session reset: {0}")]
    Reset(String),
    #[error("unexpected {0} response")]
    UnexpectedResponse(&'static str),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Unclassified(String),
}

impl SessionError {
    pub fn requires_restart(&self) -> bool {
        matches!(self, SessionError::BackendUnavailable(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::InitTimeout(_) | SessionError::GenerateTimeout)
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::InitTimeout(_) => FailureKind::InitTimeout,
            SessionError::GenerateTimeout => FailureKind::GenerateTimeout,
            SessionError::MissingPrecisionResource { .. } => FailureKind::MissingPrecisionResource,
            SessionError::BackendUnavailable(_) => FailureKind::BackendUnavailable,
            SessionError::EmptyResult => FailureKind::EmptyResult,
            SessionError::NotInitialized => FailureKind::NotInitialized,
            SessionError::GenerationInProgress => FailureKind::Busy,
            _ => FailureKind::Unclassified,
        }
    }

    /// Serializes the error for the trip back across the executor boundary.
    pub fn to_payload(&self, config: Option<SessionConfig>) -> ErrorPayload {
        let precision = match self {
            SessionError::MissingPrecisionResource { precision, .. } => Some(*precision),
            _ => None,
        };
        let action = self
            .requires_restart()
            .then_some(ErrorAction::RestartOnSafeBackend);
        let message = match self {
            SessionError::MissingPrecisionResource { message, .. } => message.clone(),
            other => other.to_string(),
        };

        ErrorPayload {
            kind: self.kind(),
            message,
            precision,
            action,
            config,
        }
    }

    pub fn notice(&self, stage: Stage) -> ErrorNotice {
        ErrorNotice::classify(&self.to_string(), stage)
    }
}

impl From<ErrorPayload> for SessionError {
    fn from(payload: ErrorPayload) -> Self {
        if payload.action == Some(ErrorAction::RestartOnSafeBackend) {
            return SessionError::BackendUnavailable(payload.message);
        }
        match payload.kind {
            FailureKind::InitTimeout => SessionError::InitTimeout(payload.message),
            FailureKind::GenerateTimeout => SessionError::GenerateTimeout,
            FailureKind::MissingPrecisionResource => SessionError::MissingPrecisionResource {
                precision: payload.precision.unwrap_or(Precision::Auto),
                message: payload.message,
            },
            FailureKind::BackendUnavailable => SessionError::BackendUnavailable(payload.message),
            FailureKind::EmptyResult => SessionError::EmptyResult,
            FailureKind::NotInitialized => SessionError::NotInitialized,
            FailureKind::Busy => SessionError::GenerationInProgress,
            FailureKind::Unclassified => SessionError::Unclassified(payload.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Oom,
    Network,
    Init,
    Generate,
    Unknown,
}

/// User-facing summary of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorNotice {
    pub kind: NoticeKind,
    pub title: &'static str,
    pub message: &'static str,
    pub details: Option<String>,
}

const OOM_MARKERS: &[&str] = &[
    "out of memory",
    "oom",
    "memory allocation",
    "cannot allocate memory",
    "allocation failed",
];
const NETWORK_MARKERS: &[&str] = &[
    "failed to fetch",
    "networkerror",
    "load failed",
    "err_internet_disconnected",
    "fetch",
];
const INIT_MARKERS: &[&str] = &[
    "initialization timed out",
    "no available backend found",
    "executor crashed",
];

impl ErrorNotice {
    pub fn classify(message: &str, stage: Stage) -> Self {
        let lower = message.to_lowercase();
        let contains_any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        let details = (!message.is_empty()).then(|| message.to_string());

        let (kind, title, hint) = if contains_any(OOM_MARKERS) {
            (
                NoticeKind::Oom,
                "Out of memory",
                "Try a smaller precision or the safe backend. If it persists, reset the session.",
            )
        } else if contains_any(NETWORK_MARKERS) {
            (
                NoticeKind::Network,
                "Network error while loading model files",
                "Check your connection, then retry init.",
            )
        } else if stage == Stage::Init || contains_any(INIT_MARKERS) {
            (
                NoticeKind::Init,
                "Model initialization failed",
                "Retry init. If it keeps failing, reset the session.",
            )
        } else if stage == Stage::Generate {
            (
                NoticeKind::Generate,
                "Generation failed",
                "Try again. If it persists, reset the session.",
            )
        } else {
            (
                NoticeKind::Unknown,
                "Session error",
                "Try again. If it persists, reset the session.",
            )
        };

        ErrorNotice {
            kind,
            title,
            message: hint,
            details,
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match self {
            SessionError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SessionError::NotInitialized | SessionError::GenerationInProgress => {
                StatusCode::CONFLICT
            }
            SessionError::InitTimeout(_) | SessionError::GenerateTimeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            SessionError::BackendUnavailable(_) | SessionError::ExecutorCrash => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let stage = match self {
            SessionError::InitTimeout(_)
            | SessionError::MissingPrecisionResource { .. }
            | SessionError::BackendUnavailable(_) => Stage::Init,
            _ => Stage::Generate,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "notice": self.notice(stage),
        });

        (status, axum::Json(body)).into_response()
    }
}
