//! Construction of outgoing messages.

use std::time::SystemTime;

use crate::error::{MsbError, MsbResult};
use crate::protocol::RequestOptions;

use super::{
    Acknowledge, CorrelationId, Message, MetaMessage, ServiceDetails, Topics, generate_id,
    response_topic,
};

/// Defaults applied to every message built from a set of options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageTemplate {
    /// Time-to-live in milliseconds
    pub ttl: Option<u64>,
    pub tags: Vec<String>,
}

impl MessageTemplate {
    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Builds request and response envelopes stamped with this instance's identity.
#[derive(Debug, Clone)]
pub struct MessageFactory {
    service_details: ServiceDetails,
}

impl MessageFactory {
    pub fn new(service_details: ServiceDetails) -> Self {
        Self { service_details }
    }

    pub fn service_details(&self) -> &ServiceDetails {
        &self.service_details
    }

    /// Response topic this instance listens on for requests sent to `namespace`.
    pub fn response_topic_for(&self, namespace: &str) -> String {
        response_topic(namespace, &self.service_details.instance_id)
    }

    /// Build a request addressed to `namespace`.
    ///
    /// When `original` is given (a request being handled while this one is
    /// sent), the new request joins its conversation by inheriting the
    /// correlation id.
    pub fn request_message(
        &self,
        namespace: &str,
        options: &RequestOptions,
        original: Option<&Message>,
        payload: Option<serde_json::Value>,
    ) -> Message {
        let correlation_id = original
            .map(|message| message.correlation_id.clone())
            .unwrap_or_else(CorrelationId::generate);

        Message {
            id: generate_id(),
            correlation_id,
            tags: options.message_template.tags.clone(),
            topics: Topics {
                to: namespace.to_string(),
                response: Some(self.response_topic_for(namespace)),
                forward: options.forward_namespace.clone(),
                routing_key: options.routing_key.clone(),
            },
            meta: self.meta(&options.message_template),
            ack: None,
            payload,
        }
    }

    /// Build an ack and/or response answering `original`.
    ///
    /// Fails when `original` has no response topic to answer on.
    pub fn response_message(
        &self,
        original: &Message,
        template: &MessageTemplate,
        ack: Option<Acknowledge>,
        payload: Option<serde_json::Value>,
    ) -> MsbResult<Message> {
        let to = original
            .topics
            .response
            .clone()
            .ok_or_else(|| MsbError::MissingResponseTopic {
                message_id: original.id.clone(),
            })?;

        Ok(Message {
            id: generate_id(),
            correlation_id: original.correlation_id.clone(),
            tags: template.tags.clone(),
            topics: Topics {
                to,
                response: None,
                forward: None,
                routing_key: None,
            },
            meta: self.meta(template),
            ack,
            payload,
        })
    }

    fn meta(&self, template: &MessageTemplate) -> MetaMessage {
        MetaMessage {
            ttl: template.ttl,
            created_at: SystemTime::now(),
            published_at: None,
            duration_ms: None,
            service_details: self.service_details.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::tests::service_details;
    use serde_json::json;

    fn factory() -> MessageFactory {
        MessageFactory::new(service_details())
    }

    #[test]
    fn request_gets_private_response_topic() {
        let options = RequestOptions::default()
            .with_routing_key("eu")
            .with_forward_namespace("audit:log");
        let request = factory().request_message("orders:create", &options, None, None);

        assert_eq!(request.topics.to, "orders:create");
        assert_eq!(
            request.topics.response.as_deref(),
            Some("orders:create:response:instance-1")
        );
        assert_eq!(request.topics.routing_key.as_deref(), Some("eu"));
        assert_eq!(request.topics.forward.as_deref(), Some("audit:log"));
    }

    #[test]
    fn chained_request_inherits_correlation_id() {
        let factory = factory();
        let options = RequestOptions::default();
        let first = factory.request_message("a:b", &options, None, None);
        let chained = factory.request_message("c:d", &options, Some(&first), None);
        let fresh = factory.request_message("c:d", &options, None, None);

        assert_eq!(chained.correlation_id, first.correlation_id);
        assert_ne!(fresh.correlation_id, first.correlation_id);
        assert_ne!(chained.id, first.id);
    }

    #[test]
    fn template_seeds_ttl_and_tags() {
        let options = RequestOptions::default()
            .with_message_template(MessageTemplate::default().with_ttl(250).with_tag("urgent"));
        let request = factory().request_message("a:b", &options, None, Some(json!(1)));

        assert_eq!(request.meta.ttl, Some(250));
        assert_eq!(request.tags, vec!["urgent".to_string()]);
    }

    #[test]
    fn response_goes_to_request_response_topic() {
        let factory = factory();
        let request = factory.request_message("a:b", &RequestOptions::default(), None, None);
        let response = factory
            .response_message(
                &request,
                &MessageTemplate::default(),
                None,
                Some(json!({"ok": true})),
            )
            .unwrap();

        assert_eq!(Some(response.topics.to.clone()), request.topics.response);
        assert_eq!(response.correlation_id, request.correlation_id);
        assert!(response.topics.response.is_none());
    }

    #[test]
    fn response_without_response_topic_fails() {
        let mut request = crate::message::tests::message("c", None, None);
        request.topics.response = None;

        let err = factory()
            .response_message(&request, &MessageTemplate::default(), None, None)
            .unwrap_err();
        assert!(matches!(err, MsbError::MissingResponseTopic { .. }));
    }
}
