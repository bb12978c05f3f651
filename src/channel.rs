//! Topic-level producers and consumers.
//!
//! [`ChannelManager`] owns one [`Producer`] and at most one [`Consumer`] per
//! topic. Both are created lazily on first use and cached by topic name. A
//! consumer carries exactly one [`MessageHandler`]; everything that needs
//! messages from a shared topic (e.g. many conversations waiting on one
//! response topic) goes through a single demultiplexing handler.

mod consumer;
mod manager;
mod producer;

use std::sync::Arc;

use crate::acknowledge::AcknowledgementHandler;
use crate::error::HandlerResult;
use crate::message::Message;

pub use consumer::Consumer;
pub use manager::ChannelManager;
pub use producer::Producer;

/// Receives decoded, unexpired messages of one topic.
///
/// Returning `Ok` auto-confirms the delivery, returning `Err` asks for a
/// redelivery, and a panic rejects it. Explicit calls on the
/// [`AcknowledgementHandler`] take precedence over all three.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: Message, ack: &Arc<AcknowledgementHandler>)
    -> HandlerResult;
}

impl<F> MessageHandler for F
where
    F: Fn(Message, &Arc<AcknowledgementHandler>) -> HandlerResult + Send + Sync,
{
    fn handle_message(
        &self,
        message: Message,
        ack: &Arc<AcknowledgementHandler>,
    ) -> HandlerResult {
        self(message, ack)
    }
}
