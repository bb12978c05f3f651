use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::collector::{
    Collector, CollectorConfig, ConversationEnd, EventHandlers, WaitForResponses,
};
use crate::context::ContextInner;
use crate::error::{MsbError, MsbResult};
use crate::message::{Acknowledge, CorrelationId, Message};

use super::RequestOptions;

const LOG_TARGET: &str = "msb::protocol::requester";

/// Sends requests to one namespace and tracks their conversations.
///
/// ```text
/// publish(payload)
///   ├─ fire-and-forget? ── publish ──► Ok(None)
///   └─ collector.listen ─► publish ─► collector.wait ──► Ok(Some(Conversation))
///                            │ error
///                            └─► collector.abort, on_error, Err
/// ```
///
/// The collector is registered before the request goes out so a fast
/// responder cannot answer into an unsubscribed response topic.
#[derive(Clone)]
pub struct Requester {
    context: Arc<ContextInner>,
    namespace: String,
    options: RequestOptions,
    original: Option<Message>,
    handlers: EventHandlers,
}

impl Requester {
    pub(crate) fn new(
        context: Arc<ContextInner>,
        namespace: String,
        options: RequestOptions,
    ) -> Self {
        Self {
            context,
            namespace,
            options,
            original: None,
            handlers: EventHandlers::new(),
        }
    }

    /// Join the conversation of `original` (a request being handled while
    /// this one is sent) by inheriting its correlation id.
    pub fn with_original(mut self, original: &Message) -> Self {
        self.original = Some(original.clone());
        self
    }

    pub fn on_acknowledge(
        mut self,
        callback: impl Fn(&Acknowledge, &Message) + Send + Sync + 'static,
    ) -> Self {
        self.handlers = self.handlers.on_acknowledge(callback);
        self
    }

    pub fn on_response(mut self, callback: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.handlers = self.handlers.on_response(callback);
        self
    }

    pub fn on_end(mut self, callback: impl Fn(&ConversationEnd) + Send + Sync + 'static) -> Self {
        self.handlers = self.handlers.on_end(callback);
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&MsbError) + Send + Sync + 'static) -> Self {
        self.handlers = self.handlers.on_error(callback);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Send `payload`.
    ///
    /// Returns `None` for fire-and-forget requests, otherwise a handle that
    /// resolves when the conversation ends. Failures are also reported to
    /// the error callback.
    pub fn publish<P: Serialize + ?Sized>(&self, payload: &P) -> MsbResult<Option<Conversation>> {
        let message = self
            .build_message(payload)
            .inspect_err(|err| self.handlers.emit_error(err))?;
        let producer = self
            .context
            .channel_manager
            .find_or_create_producer(&self.namespace)
            .inspect_err(|err| self.handlers.emit_error(err))?;

        if !self.options.expects_conversation() {
            producer
                .publish(&message)
                .inspect_err(|err| self.handlers.emit_error(err))?;
            log::debug!(
                target: LOG_TARGET,
                "[correlation id: {}] Published {} to {} without waiting",
                message.correlation_id,
                message.id,
                self.namespace
            );
            return Ok(None);
        }

        let response_topic = self.context.factory.response_topic_for(&self.namespace);
        let (collector, completion) = Collector::new(
            &message,
            self.collector_config(),
            self.handlers.clone(),
            Arc::clone(&self.context.scheduler),
            self.context.multiplexers.find_or_create(&response_topic),
        )
        .inspect_err(|err| self.handlers.emit_error(err))?;

        collector
            .listen_for_responses()
            .inspect_err(|err| self.handlers.emit_error(err))?;
        if let Err(err) = producer.publish(&message) {
            collector.abort(&err);
            return Err(err);
        }
        collector.wait_for_responses();

        log::debug!(
            target: LOG_TARGET,
            "[correlation id: {}] Published {} to {}, waiting on {}",
            message.correlation_id,
            message.id,
            self.namespace,
            response_topic
        );
        Ok(Some(Conversation {
            correlation_id: message.correlation_id,
            completion,
        }))
    }

    /// Send `payload` and wait for exactly one response.
    ///
    /// Fails with [`MsbError::NoResponse`] when the conversation ends
    /// without a payload.
    pub async fn request<P: Serialize + ?Sized>(&self, payload: &P) -> MsbResult<Message> {
        let mut single = self.clone();
        single.options.wait_for_responses = WaitForResponses::Exactly(1);

        let conversation = single
            .publish(payload)?
            .ok_or_else(|| MsbError::internal("single-response request opened no conversation"))?;
        let correlation_id = conversation.correlation_id().clone();
        let end = conversation.finished().await?;

        end.payloads
            .into_iter()
            .next()
            .ok_or_else(|| MsbError::NoResponse {
                correlation_id: correlation_id.to_string(),
            })
    }

    fn build_message<P: Serialize + ?Sized>(&self, payload: &P) -> MsbResult<Message> {
        let payload = serde_json::to_value(payload)?;
        let payload = (!payload.is_null()).then_some(payload);
        Ok(self.context.factory.request_message(
            &self.namespace,
            &self.options,
            self.original.as_ref(),
            payload,
        ))
    }

    fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            response_timeout: self
                .options
                .response_timeout
                .unwrap_or_else(|| self.context.config.default_response_timeout()),
            ack_timeout: self.options.ack_timeout,
            wait_for_responses: self.options.wait_for_responses,
        }
    }
}

impl std::fmt::Debug for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester")
            .field("namespace", &self.namespace)
            .field("options", &self.options)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

/// Asynchronous handle of one open conversation.
#[derive(Debug)]
pub struct Conversation {
    correlation_id: CorrelationId,
    completion: oneshot::Receiver<ConversationEnd>,
}

impl Conversation {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Wait for the conversation to end.
    ///
    /// Fails with [`MsbError::ConversationAborted`] when it was torn down
    /// without ending, e.g. by a context shutdown.
    pub async fn finished(self) -> MsbResult<ConversationEnd> {
        self.completion
            .await
            .map_err(|_| MsbError::ConversationAborted {
                correlation_id: self.correlation_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryBroker;
    use crate::collector::EndReason;
    use crate::config::{MsbConfig, ServiceDetailsConfig};
    use crate::context::MsbContext;
    use crate::error::HandlerResult;
    use crate::message::Payload;
    use crate::protocol::{ResponderContext, ResponderOptions};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    const NAMESPACE: &str = "test:requests";
    const RESPONSE_TOPIC: &str = "test:requests:response:requester-1";

    fn context(broker: &MemoryBroker) -> MsbContext {
        MsbContext::builder()
            .config(MsbConfig {
                service_details: ServiceDetailsConfig {
                    instance_id: Some("requester-1".to_string()),
                    ..ServiceDetailsConfig::default()
                },
                ..MsbConfig::default()
            })
            .adapter(Arc::new(broker.clone()))
            .build()
            .unwrap()
    }

    #[test]
    fn fire_and_forget_opens_no_conversation() {
        let broker = MemoryBroker::new();
        let context = context(&broker);

        let conversation = context
            .requester(NAMESPACE, RequestOptions::default())
            .publish(&json!({"event": "created"}))
            .unwrap();

        assert!(conversation.is_none());
        assert_eq!(broker.published_count(), 1);
        assert_eq!(broker.subscribe_count(RESPONSE_TOPIC), 0);
        assert_eq!(broker.backlog_len(NAMESPACE), 1);
    }

    #[tokio::test]
    async fn request_resolves_with_first_response() {
        let broker = MemoryBroker::new();
        let context = context(&broker);
        let server = context.responder_server(
            NAMESPACE,
            ResponderOptions::default(),
            |request: &Message, ctx: &ResponderContext| -> HandlerResult {
                let n: i64 = request.payload_as()?.unwrap_or_default();
                ctx.responder().send(&json!(n * 2))?;
                Ok(())
            },
        );
        server.listen().unwrap();

        let response = context
            .requester(NAMESPACE, RequestOptions::default())
            .request(&21)
            .await
            .unwrap();

        assert_eq!(response.payload, Some(json!(42)));
        assert!(!broker.is_subscribed(RESPONSE_TOPIC));
    }

    #[tokio::test]
    async fn request_without_response_fails_after_timeout() {
        let broker = MemoryBroker::new();
        let context = context(&broker);

        let err = context
            .requester(
                NAMESPACE,
                RequestOptions::default().with_response_timeout(Duration::from_millis(50)),
            )
            .request(&json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, MsbError::NoResponse { .. }));
    }

    #[tokio::test]
    async fn callbacks_see_acks_responses_and_end() {
        let broker = MemoryBroker::new();
        let context = context(&broker);
        context
            .responder_server(
                NAMESPACE,
                ResponderOptions::default(),
                |_: &Message, ctx: &ResponderContext| -> HandlerResult {
                    ctx.responder().send_ack(None, Some(2))?;
                    ctx.responder().send(&json!("one"))?;
                    ctx.responder().send(&json!("two"))?;
                    Ok(())
                },
            )
            .listen()
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let (acks, responses, ends) = (Arc::clone(&events), Arc::clone(&events), Arc::clone(&events));
        let conversation = context
            .requester(
                NAMESPACE,
                RequestOptions::default().with_wait_for_responses(1),
            )
            .on_acknowledge(move |_, _| acks.lock().unwrap().push("ack".to_string()))
            .on_response(move |message| {
                responses
                    .lock()
                    .unwrap()
                    .push(message.payload.clone().unwrap().to_string())
            })
            .on_end(move |_| ends.lock().unwrap().push("end".to_string()))
            .publish(&json!({}))
            .unwrap()
            .unwrap();

        let end = conversation.finished().await.unwrap();
        assert_eq!(end.reason, EndReason::AllResponsesReceived);
        assert_eq!(end.payloads.len(), 2);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["ack", "\"one\"", "\"two\"", "end"]
        );
    }

    #[test]
    fn publish_failure_aborts_conversation_and_reports_error() {
        let broker = MemoryBroker::new();
        let context = context(&broker);
        let errors = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&errors);
        let requester = context
            .requester(NAMESPACE, RequestOptions::default().with_wait_for_responses(1))
            .on_error(move |_| *seen.lock().unwrap() += 1);

        // Break the transport after the channel layer is ready.
        context
            .channel_manager()
            .find_or_create_producer(NAMESPACE)
            .unwrap();
        crate::adapter::BrokerAdapter::shutdown(&broker);

        let err = requester.publish(&json!({})).unwrap_err();
        assert!(err.is_transport() || matches!(err, MsbError::ShutDown));
        assert_eq!(*errors.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn responder_failure_becomes_server_error_response() {
        let broker = MemoryBroker::new();
        let context = context(&broker);
        context
            .responder_server(
                NAMESPACE,
                ResponderOptions::default(),
                |_: &Message, _: &ResponderContext| -> HandlerResult { Err("boom".into()) },
            )
            .listen()
            .unwrap();

        let response = context
            .requester(NAMESPACE, RequestOptions::default())
            .request(&json!({}))
            .await
            .unwrap();

        let payload: Payload = response.payload_as().unwrap().unwrap();
        assert_eq!(payload.status_code, Some(500));
        assert_eq!(payload.status_message.as_deref(), Some("boom"));
    }
}
