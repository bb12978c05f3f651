use std::sync::Arc;
use std::time::SystemTime;

use crate::adapter::BrokerAdapter;
use crate::codec::MessageCodec;
use crate::error::MsbResult;
use crate::message::Message;
use crate::monitor::MonitorSlot;

const LOG_TARGET: &str = "msb::channel::producer";

/// Publishes envelopes to one topic.
pub struct Producer {
    topic: String,
    adapter: Arc<dyn BrokerAdapter>,
    codec: Arc<dyn MessageCodec>,
    monitor: Arc<MonitorSlot>,
}

impl Producer {
    pub(crate) fn new(
        topic: String,
        adapter: Arc<dyn BrokerAdapter>,
        codec: Arc<dyn MessageCodec>,
        monitor: Arc<MonitorSlot>,
    ) -> Self {
        Self {
            topic,
            adapter,
            codec,
            monitor,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stamp publication metadata, encode and hand the message to the broker.
    ///
    /// Transport failures are returned to the caller, never swallowed.
    pub fn publish(&self, message: &Message) -> MsbResult<()> {
        let mut outgoing = message.clone();
        outgoing.mark_published(SystemTime::now());
        let body = self.codec.encode(&outgoing)?;

        log::debug!(
            target: LOG_TARGET,
            "[correlation id: {}] Publishing message {} to {}",
            outgoing.correlation_id,
            outgoing.id,
            self.topic
        );
        log::trace!(target: LOG_TARGET, "Outgoing {}: {}", self.topic, String::from_utf8_lossy(&body));

        if let Err(err) =
            self.adapter
                .publish(&self.topic, &body, outgoing.topics.routing_key.as_deref())
        {
            log::error!(
                target: LOG_TARGET,
                "Failed to publish message {} to {}: {}",
                outgoing.id,
                self.topic,
                err
            );
            return Err(err);
        }

        self.monitor
            .notify(|agent| agent.producer_message_sent(&self.topic));
        Ok(())
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
