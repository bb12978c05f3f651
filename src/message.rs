//! Message envelope shared by requests, acknowledgements and responses.
//!
//! Every message carries a correlation id that ties it to one conversation.
//! Acknowledgements and responses reuse the correlation id of the request
//! they answer, which is how the collector layer routes them back to the
//! requester that is waiting for them.

pub mod factory;
pub mod topic;

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::MsbConfig;
use crate::error::MsbResult;

pub use factory::{MessageFactory, MessageTemplate};
pub use topic::{is_service_topic, response_topic, validate_topic};

/// Generate a fresh identifier for messages, conversations and responders.
///
/// ULIDs are lower-cased so identifiers can be embedded in topic names.
pub fn generate_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

/// Identifier shared by a request and every ack/response in its conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new, unique correlation id.
    pub fn generate() -> Self {
        Self(generate_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Destinations of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topics {
    /// Topic the message is published to
    pub to: String,
    /// Private topic of the requester instance; absent for responses and broadcasts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Namespace a responder should forward the request to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<String>,
    /// Broker routing key, interpreted by the adapter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
}

/// Identity of the service instance that produced a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDetails {
    pub name: String,
    pub version: String,
    pub instance_id: String,
    pub hostname: String,
    pub pid: u32,
}

impl ServiceDetails {
    /// Build the service identity from configuration and the running process.
    pub fn from_config(config: &MsbConfig) -> Self {
        let details = &config.service_details;
        Self {
            name: details.name.clone(),
            version: details.version.clone(),
            instance_id: details.instance_id.clone().unwrap_or_else(generate_id),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
        }
    }
}

/// Timing and provenance metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaMessage {
    /// Time-to-live in milliseconds, counted from `created_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    pub created_at: SystemTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<SystemTime>,
    /// Milliseconds between creation and publication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub service_details: ServiceDetails,
}

/// Protocol-level acknowledgement sent by a responder.
///
/// Distinct from the broker-level delivery acknowledgement handled by
/// [`crate::acknowledge::AcknowledgementHandler`]. An ack lets a responder
/// extend the requester's deadline and announce further responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledge {
    pub responder_id: String,
    /// Further responses announced by this responder; `-1` consumes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses_remaining: Option<i32>,
    /// Suggested response deadline, relative to when the request was sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// The envelope exchanged over the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub topics: Topics,
    pub meta: MetaMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<Acknowledge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Message {
    /// Whether the message carries a payload. JSON `null` counts as absent.
    pub fn has_payload(&self) -> bool {
        matches!(&self.payload, Some(value) if !value.is_null())
    }

    /// Whether `created_at + ttl` has elapsed at `now`.
    ///
    /// Messages without a ttl never expire.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        let Some(ttl) = self.meta.ttl else {
            return false;
        };
        match self
            .meta
            .created_at
            .checked_add(Duration::from_millis(ttl))
        {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }

    /// Deserialize the payload into an application type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> MsbResult<Option<T>> {
        match &self.payload {
            Some(value) if !value.is_null() => Ok(Some(T::deserialize(value)?)),
            _ => Ok(None),
        }
    }

    /// Stamp publication time and the creation-to-publication duration.
    pub fn mark_published(&mut self, now: SystemTime) {
        self.meta.published_at = Some(now);
        self.meta.duration_ms = now
            .duration_since(self.meta.created_at)
            .ok()
            .map(|elapsed| elapsed.as_millis() as u64);
    }
}

/// REST-style payload body used for server-side failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl Payload {
    /// A `500` response describing a failed request handler.
    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            status_code: Some(500),
            status_message: Some(message.into()),
            ..Self::default()
        }
    }
}
