use tokio::sync::mpsc;

use crate::protocol::{Banner, StatusPayload, TokenPayload};

/// Per-request observer for non-terminal executor responses.
pub trait EventSink: Send + Sync {
    fn on_token(&self, _token: &TokenPayload) {}
    fn on_status(&self, _status: &StatusPayload) {}
    fn on_banner(&self, _banner: &Banner) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Token(TokenPayload),
    Status(StatusPayload),
    Banner(Banner),
}

/// Forwards every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_token(&self, token: &TokenPayload) {
        let _ = self.tx.send(SessionEvent::Token(token.clone()));
    }

    fn on_status(&self, status: &StatusPayload) {
        let _ = self.tx.send(SessionEvent::Status(status.clone()));
    }

    fn on_banner(&self, banner: &Banner) {
        let _ = self.tx.send(SessionEvent::Banner(banner.clone()));
    }
}
