use std::time::Duration;

use crate::collector::WaitForResponses;
use crate::message::MessageTemplate;

/// Per-requester settings.
///
/// A request opens a conversation when it waits for responses or has a
/// non-zero ack timeout; otherwise it is fire-and-forget.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Window, from sending, during which acks keep the conversation open
    pub ack_timeout: Option<Duration>,
    /// Falls back to `defaultResponseTimeoutMs` when unset
    pub response_timeout: Option<Duration>,
    pub wait_for_responses: WaitForResponses,
    pub routing_key: Option<String>,
    /// Namespace a responder should forward the request to
    pub forward_namespace: Option<String>,
    pub message_template: MessageTemplate,
}

impl RequestOptions {
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn with_wait_for_responses(mut self, wait: impl Into<WaitForResponses>) -> Self {
        self.wait_for_responses = wait.into();
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_forward_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.forward_namespace = Some(namespace.into());
        self
    }

    pub fn with_message_template(mut self, template: MessageTemplate) -> Self {
        self.message_template = template;
        self
    }

    /// Whether a request sent with these options needs a collector.
    pub fn expects_conversation(&self) -> bool {
        self.ack_timeout.is_some_and(|timeout| !timeout.is_zero())
            || self.wait_for_responses.expects_responses()
    }
}

/// Per-responder settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponderOptions {
    pub message_template: MessageTemplate,
}

impl ResponderOptions {
    pub fn with_message_template(mut self, template: MessageTemplate) -> Self {
        self.message_template = template;
        self
    }
}
