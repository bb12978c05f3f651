use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::acknowledge::AcknowledgementHandler;
use crate::channel::MessageHandler;
use crate::context::ContextInner;
use crate::error::{HandlerError, HandlerResult, MsbResult};
use crate::message::{Acknowledge, Message, MessageTemplate, Payload, generate_id};

use super::ResponderOptions;

const LOG_TARGET: &str = "msb::protocol::responder";

/// Sends acks and responses answering one request.
///
/// The responder id is generated once, so every ack of this responder is
/// folded into the same per-responder entry on the requester side.
#[derive(Clone)]
pub struct Responder {
    context: Arc<ContextInner>,
    responder_id: String,
    original: Message,
    template: MessageTemplate,
}

impl Responder {
    pub(crate) fn new(
        context: Arc<ContextInner>,
        original: &Message,
        options: &ResponderOptions,
    ) -> Self {
        Self {
            context,
            responder_id: generate_id(),
            original: original.clone(),
            template: options.message_template.clone(),
        }
    }

    pub fn responder_id(&self) -> &str {
        &self.responder_id
    }

    /// The request being answered.
    pub fn original(&self) -> &Message {
        &self.original
    }

    /// Extend the requester's deadline and/or announce more responses.
    ///
    /// `timeout` is measured from when the request was sent;
    /// `responses_remaining` defaults to one.
    pub fn send_ack(
        &self,
        timeout: Option<Duration>,
        responses_remaining: Option<i32>,
    ) -> MsbResult<()> {
        let ack = Acknowledge {
            responder_id: self.responder_id.clone(),
            responses_remaining: Some(responses_remaining.unwrap_or(1)),
            timeout_ms: timeout.map(|timeout| timeout.as_millis() as u64),
        };
        self.publish(Some(ack), None)
    }

    /// Send one response, consuming one of the responses this responder announced.
    pub fn send<P: Serialize + ?Sized>(&self, payload: &P) -> MsbResult<()> {
        let payload = serde_json::to_value(payload)?;
        let ack = Acknowledge {
            responder_id: self.responder_id.clone(),
            responses_remaining: Some(-1),
            timeout_ms: None,
        };
        self.publish(Some(ack), Some(payload))
    }

    fn publish(
        &self,
        ack: Option<Acknowledge>,
        payload: Option<serde_json::Value>,
    ) -> MsbResult<()> {
        let Some(to) = self.original.topics.response.as_deref() else {
            log::debug!(
                target: LOG_TARGET,
                "[correlation id: {}] Request {} has no response topic, not responding",
                self.original.correlation_id,
                self.original.id
            );
            return Ok(());
        };

        let message =
            self.context
                .factory
                .response_message(&self.original, &self.template, ack, payload)?;
        let producer = self.context.channel_manager.find_or_create_producer(to)?;
        producer.publish(&message)?;
        log::debug!(
            target: LOG_TARGET,
            "[correlation id: {}] Responder {} sent {} to {}",
            message.correlation_id,
            self.responder_id,
            if message.has_payload() { "response" } else { "ack" },
            to
        );
        Ok(())
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("responder_id", &self.responder_id)
            .field("request", &self.original.id)
            .finish_non_exhaustive()
    }
}

/// Everything a request handler needs about the request it is handling.
///
/// Passed explicitly down the dispatch chain, including to error handlers.
#[derive(Debug)]
pub struct ResponderContext {
    responder: Responder,
    ack: Arc<AcknowledgementHandler>,
    original: Message,
}

impl ResponderContext {
    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    /// Broker-level acknowledgement of the request delivery.
    pub fn ack(&self) -> &Arc<AcknowledgementHandler> {
        &self.ack
    }

    pub fn original(&self) -> &Message {
        &self.original
    }
}

/// Application handler of incoming requests.
pub trait RequestHandler: Send + Sync {
    fn handle_request(&self, request: &Message, context: &ResponderContext) -> HandlerResult;
}

impl<F> RequestHandler for F
where
    F: Fn(&Message, &ResponderContext) -> HandlerResult + Send + Sync,
{
    fn handle_request(&self, request: &Message, context: &ResponderContext) -> HandlerResult {
        self(request, context)
    }
}

/// Replaces the default `500` response when a request handler fails.
pub type ResponderErrorHandler = Arc<dyn Fn(&HandlerError, &ResponderContext) + Send + Sync>;

/// Serves requests arriving on one namespace.
pub struct ResponderServer {
    namespace: String,
    dispatcher: Arc<Dispatcher>,
}

impl ResponderServer {
    pub(crate) fn new(
        context: Arc<ContextInner>,
        namespace: String,
        options: ResponderOptions,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher {
                context,
                namespace: namespace.clone(),
                options,
                handler,
                error_handler: None,
            }),
            namespace,
        }
    }

    /// Handle failed requests with `handler` instead of answering `500`.
    ///
    /// The request is still rejected afterwards unless the handler resolved
    /// its acknowledgement itself.
    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&HandlerError, &ResponderContext) + Send + Sync + 'static,
    ) -> Self {
        let mut dispatcher = (*self.dispatcher).clone();
        dispatcher.error_handler = Some(Arc::new(handler));
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Start consuming requests.
    pub fn listen(&self) -> MsbResult<()> {
        let handler: Arc<dyn MessageHandler> = Arc::clone(&self.dispatcher) as _;
        self.dispatcher
            .context
            .channel_manager
            .subscribe(&self.namespace, handler)?;
        log::info!(target: LOG_TARGET, "Listening for requests on {}", self.namespace);
        Ok(())
    }

    /// Stop consuming requests.
    pub fn stop(&self) -> MsbResult<()> {
        self.dispatcher
            .context
            .channel_manager
            .unsubscribe(&self.namespace)
    }
}

impl std::fmt::Debug for ResponderServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponderServer")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct Dispatcher {
    context: Arc<ContextInner>,
    namespace: String,
    options: ResponderOptions,
    handler: Arc<dyn RequestHandler>,
    error_handler: Option<ResponderErrorHandler>,
}

impl Dispatcher {
    fn handle_failure(&self, error: HandlerError, context: &ResponderContext) {
        match &self.error_handler {
            Some(error_handler) => {
                if catch_unwind(AssertUnwindSafe(|| error_handler(&error, context))).is_err() {
                    log::error!(
                        target: LOG_TARGET,
                        "Error handler on {} panicked",
                        self.namespace
                    );
                }
            }
            None => {
                log::error!(
                    target: LOG_TARGET,
                    "[correlation id: {}] Request {} on {} failed: {}",
                    context.original.correlation_id,
                    context.original.id,
                    self.namespace,
                    error
                );
                let payload = Payload::server_error(error.to_string());
                if let Err(err) = context.responder.send(&payload) {
                    log::error!(
                        target: LOG_TARGET,
                        "[correlation id: {}] Failed to send error response: {}",
                        context.original.correlation_id,
                        err
                    );
                }
            }
        }
        context.ack.auto_reject();
    }
}

impl MessageHandler for Dispatcher {
    fn handle_message(&self, message: Message, ack: &Arc<AcknowledgementHandler>) -> HandlerResult {
        let context = ResponderContext {
            responder: Responder::new(Arc::clone(&self.context), &message, &self.options),
            ack: Arc::clone(ack),
            original: message,
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| {
            self.handler.handle_request(&context.original, &context)
        })) {
            Ok(outcome) => outcome,
            Err(panic) => Err(panic_message(panic.as_ref()).into()),
        };
        if let Err(error) = outcome {
            self.handle_failure(error, &context);
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "request handler panicked".to_string()
    }
}
