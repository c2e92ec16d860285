use std::sync::{Mutex, PoisonError};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub severity: Severity,
    pub text: String,
}

/// Best-effort user-facing channel for failures the engine swallows.
pub trait MessageSink: Send + Sync {
    fn add_warning(&self, text: String);

    fn add_error(&self, text: String);
}

/// Buffers messages until the caller drains them.
#[derive(Debug, Default)]
pub struct MessageAggregator {
    messages: Mutex<Vec<Message>>,
}

impl MessageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, severity: Severity, text: String) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Message { severity, text });
    }

    pub fn drain(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_empty(&self) -> bool {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl MessageSink for MessageAggregator {
    fn add_warning(&self, text: String) {
        self.push(Severity::Warning, text);
    }

    fn add_error(&self, text: String) {
        self.push(Severity::Error, text);
    }
}
