use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use super::MessageHandler;
use crate::acknowledge::AcknowledgementHandler;
use crate::adapter::{BrokerAdapter, RawDelivery, RawMessageHandler};
use crate::codec::MessageCodec;
use crate::error::{LockResultExt, MsbError, MsbResult};
use crate::monitor::MonitorSlot;

const LOG_TARGET: &str = "msb::channel::consumer";

#[derive(Default)]
struct ConsumerState {
    handler: Option<Arc<dyn MessageHandler>>,
    closed: bool,
}

/// The single logical consumer of one topic.
///
/// Decodes raw deliveries, drops malformed and expired messages, and hands
/// the rest to the attached handler together with a fresh
/// [`AcknowledgementHandler`].
pub struct Consumer {
    topic: String,
    adapter: Arc<dyn BrokerAdapter>,
    codec: Arc<dyn MessageCodec>,
    monitor: Arc<MonitorSlot>,
    state: Mutex<ConsumerState>,
}

impl Consumer {
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
            state: Mutex::new(ConsumerState::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_subscribed(&self) -> bool {
        self.state
            .lock()
            .recover_poison("Consumer::is_subscribed")
            .handler
            .is_some()
    }

    /// Attach `handler` and start broker delivery.
    ///
    /// Returns `Ok(false)` when the consumer was closed concurrently; the
    /// caller should retry with a fresh consumer.
    pub(crate) fn attach(self: &Arc<Self>, handler: Arc<dyn MessageHandler>) -> MsbResult<bool> {
        let mut state = self.state.lock().recover_poison("Consumer::attach");
        if state.closed {
            return Ok(false);
        }
        if state.handler.is_some() {
            return Err(MsbError::already_subscribed(&self.topic));
        }

        let consumer: Weak<Consumer> = Arc::downgrade(self);
        let raw: RawMessageHandler = Arc::new(move |delivery: RawDelivery| {
            match consumer.upgrade() {
                Some(consumer) => consumer.handle_raw(delivery),
                None => {
                    let _ = delivery.ack.reject();
                }
            }
        });
        self.adapter.subscribe(&self.topic, raw)?;
        state.handler = Some(handler);
        log::debug!(target: LOG_TARGET, "Subscribed handler to {}", self.topic);
        Ok(true)
    }

    /// Detach the handler and stop broker delivery. Idempotent.
    pub(crate) fn close(&self) -> MsbResult<()> {
        let mut state = self.state.lock().recover_poison("Consumer::close");
        state.closed = true;
        if state.handler.take().is_some() {
            log::debug!(target: LOG_TARGET, "Unsubscribing from {}", self.topic);
            self.adapter.unsubscribe(&self.topic)?;
        }
        Ok(())
    }

    fn handle_raw(&self, delivery: RawDelivery) {
        let RawDelivery {
            body,
            redelivered,
            ack,
        } = delivery;
        let ack = Arc::new(AcknowledgementHandler::new(ack, &self.topic, redelivered));
        self.monitor
            .notify(|agent| agent.consumer_message_received(&self.topic));

        let message = match self.codec.decode(&body) {
            Ok(message) => message,
            Err(err) => {
                log::error!(
                    target: LOG_TARGET,
                    "Dropping undecodable message on {}: {}",
                    self.topic,
                    err
                );
                ack.auto_reject();
                return;
            }
        };
        log::trace!(target: LOG_TARGET, "Incoming {}: {}", self.topic, String::from_utf8_lossy(&body));

        if message.is_expired(SystemTime::now()) {
            log::warn!(
                target: LOG_TARGET,
                "[correlation id: {}] Dropping expired message {} on {}",
                message.correlation_id,
                message.id,
                self.topic
            );
            ack.auto_reject();
            return;
        }

        let handler = self
            .state
            .lock()
            .recover_poison("Consumer::handle_raw")
            .handler
            .clone();
        let Some(handler) = handler else {
            log::warn!(
                target: LOG_TARGET,
                "No handler attached to {}, rejecting message {}",
                self.topic,
                message.id
            );
            ack.auto_reject();
            return;
        };

        let message_id = message.id.clone();
        match catch_unwind(AssertUnwindSafe(|| handler.handle_message(message, &ack))) {
            Ok(Ok(())) => ack.auto_confirm(),
            Ok(Err(err)) => {
                log::warn!(
                    target: LOG_TARGET,
                    "Handler on {} failed for message {}: {}",
                    self.topic,
                    message_id,
                    err
                );
                ack.auto_retry();
            }
            Err(_) => {
                log::error!(
                    target: LOG_TARGET,
                    "Handler on {} panicked for message {}",
                    self.topic,
                    message_id
                );
                ack.auto_reject();
            }
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("topic", &self.topic)
            .field("subscribed", &self.is_subscribed())
            .finish_non_exhaustive()
    }
}
