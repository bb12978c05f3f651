//! Typed callback slots of a conversation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;

use crate::error::MsbError;
use crate::message::{Acknowledge, CorrelationId, Message};

const LOG_TARGET: &str = "msb::collector::events";

/// Why a conversation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    /// Every expected response arrived and no ack window was open
    AllResponsesReceived,
    /// The (possibly extended) response deadline passed
    ResponseTimeout,
    /// The ack window closed with no further responses outstanding
    AckTimeout,
}

/// Terminal summary of a conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEnd {
    pub correlation_id: CorrelationId,
    pub reason: EndReason,
    /// Messages carrying a payload, in arrival order
    pub payloads: Vec<Message>,
    /// Messages carrying an ack block, in arrival order
    pub acks: Vec<Message>,
}

pub type AcknowledgeCallback = Arc<dyn Fn(&Acknowledge, &Message) + Send + Sync>;
pub type ResponseCallback = Arc<dyn Fn(&Message) + Send + Sync>;
pub type EndCallback = Arc<dyn Fn(&ConversationEnd) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&MsbError) + Send + Sync>;

/// Application callbacks of one conversation.
///
/// Callbacks run on broker delivery or timer threads, never while the
/// collector's lock is held. A panicking callback is logged and contained.
#[derive(Clone, Default)]
pub struct EventHandlers {
    on_acknowledge: Option<AcknowledgeCallback>,
    on_response: Option<ResponseCallback>,
    on_end: Option<EndCallback>,
    on_error: Option<ErrorCallback>,
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_acknowledge", &self.on_acknowledge.is_some())
            .field("on_response", &self.on_response.is_some())
            .field("on_end", &self.on_end.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_acknowledge(
        mut self,
        callback: impl Fn(&Acknowledge, &Message) + Send + Sync + 'static,
    ) -> Self {
        self.on_acknowledge = Some(Arc::new(callback));
        self
    }

    pub fn on_response(mut self, callback: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.on_response = Some(Arc::new(callback));
        self
    }

    pub fn on_end(mut self, callback: impl Fn(&ConversationEnd) + Send + Sync + 'static) -> Self {
        self.on_end = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&MsbError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub(crate) fn emit_acknowledge(&self, ack: &Acknowledge, message: &Message) {
        if let Some(callback) = &self.on_acknowledge {
            guarded("acknowledge", || callback(ack, message));
        }
    }

    pub(crate) fn emit_response(&self, message: &Message) {
        if let Some(callback) = &self.on_response {
            guarded("response", || callback(message));
        }
    }

    pub(crate) fn emit_end(&self, end: &ConversationEnd) {
        if let Some(callback) = &self.on_end {
            guarded("end", || callback(end));
        }
    }

    pub(crate) fn emit_error(&self, error: &MsbError) {
        if let Some(callback) = &self.on_error {
            guarded("error", || callback(error));
        }
    }
}

fn guarded(name: &str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        log::warn!(target: LOG_TARGET, "The '{}' callback panicked", name);
    }
}
