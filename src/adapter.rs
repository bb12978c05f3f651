//! Broker adapter contract.
//!
//! The messaging core never talks to a broker directly. Everything it needs
//! from a transport is expressed by [`BrokerAdapter`] (publish and topic
//! subscriptions) and [`AcknowledgementAdapter`] (broker-level fate of one
//! delivered message). Routing policy, exchange/queue declaration and
//! connection recovery all belong to the adapter implementation.

pub mod memory;

use std::sync::Arc;

use crate::error::MsbResult;

pub use memory::MemoryBroker;

/// Broker-level acknowledgement primitives for one delivered message.
pub trait AcknowledgementAdapter: Send + Sync {
    /// The message was processed and can be discarded.
    fn confirm(&self) -> MsbResult<()>;
    /// The message must be discarded without redelivery.
    fn reject(&self) -> MsbResult<()>;
    /// The message should be redelivered.
    fn retry(&self) -> MsbResult<()>;
}

/// One delivery handed to a subscribed topic handler.
pub struct RawDelivery {
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    pub ack: Box<dyn AcknowledgementAdapter>,
}

impl std::fmt::Debug for RawDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawDelivery")
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Callback invoked by the adapter for each message delivered on a topic.
pub type RawMessageHandler = Arc<dyn Fn(RawDelivery) + Send + Sync>;

/// Transport used by the channel layer.
///
/// Implementations must provide at-least-once delivery and report
/// redeliveries through [`RawDelivery::redelivered`].
///
/// Handlers must never be invoked inline from `subscribe` or `publish`: the
/// channel layer calls both while holding per-topic locks that the handler
/// path also takes. `unsubscribe` may be called from inside a handler running
/// on the delivery thread of the same topic and must not wait for that
/// thread to finish.
pub trait BrokerAdapter: Send + Sync {
    fn publish(&self, topic: &str, body: &[u8], routing_key: Option<&str>) -> MsbResult<()>;

    /// Start delivering messages of `topic` to `handler`.
    fn subscribe(&self, topic: &str, handler: RawMessageHandler) -> MsbResult<()>;

    /// Stop delivering messages of `topic`.
    fn unsubscribe(&self, topic: &str) -> MsbResult<()>;

    /// Release connections and stop every delivery.
    fn shutdown(&self) {}
}
