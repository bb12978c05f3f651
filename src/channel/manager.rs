//! Topic-keyed cache of producers and consumers.
//!
//! Creation is check-then-create under the per-key lock of a `DashMap`
//! entry, so concurrent first access to one topic creates exactly one
//! producer/consumer while unrelated topics never contend on a shared lock.
//! Monitor notifications fire only after the entry guard is released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{Consumer, MessageHandler, Producer};
use crate::adapter::BrokerAdapter;
use crate::codec::MessageCodec;
use crate::config::MsbConfig;
use crate::error::{MsbError, MsbResult};
use crate::message::validate_topic;
use crate::monitor::{ChannelMonitorAgent, MonitorSlot};

const LOG_TARGET: &str = "msb::channel";

/// Owns every producer and consumer of a messaging context.
pub struct ChannelManager {
    adapter: Arc<dyn BrokerAdapter>,
    codec: Arc<dyn MessageCodec>,
    validate_topics: bool,
    producers: DashMap<String, Arc<Producer>>,
    consumers: DashMap<String, Arc<Consumer>>,
    monitor: Arc<MonitorSlot>,
    shut_down: AtomicBool,
}

impl ChannelManager {
    pub fn new(
        config: &MsbConfig,
        adapter: Arc<dyn BrokerAdapter>,
        codec: Arc<dyn MessageCodec>,
    ) -> Self {
        Self {
            adapter,
            codec,
            validate_topics: config.validate_topics,
            producers: DashMap::new(),
            consumers: DashMap::new(),
            monitor: Arc::new(MonitorSlot::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Install or replace the monitoring agent.
    pub fn set_monitor_agent(&self, agent: Arc<dyn ChannelMonitorAgent>) {
        self.monitor.install(agent);
    }

    /// Cached producer for `topic`, created on first use.
    pub fn find_or_create_producer(&self, topic: &str) -> MsbResult<Arc<Producer>> {
        self.ensure_running()?;
        if let Some(producer) = self.producers.get(topic) {
            return Ok(Arc::clone(producer.value()));
        }
        self.check_topic(topic)?;

        let (producer, created) = match self.producers.entry(topic.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let producer = Arc::new(Producer::new(
                    topic.to_string(),
                    Arc::clone(&self.adapter),
                    Arc::clone(&self.codec),
                    Arc::clone(&self.monitor),
                ));
                entry.insert(Arc::clone(&producer));
                (producer, true)
            }
        };

        if created {
            log::debug!(target: LOG_TARGET, "Created producer for {}", topic);
            self.monitor
                .notify(|agent| agent.producer_topic_created(topic));
        }
        Ok(producer)
    }

    /// Cached consumer for `topic`, created on first use.
    ///
    /// A fresh consumer has no handler; see [`ChannelManager::subscribe`].
    pub fn find_or_create_consumer(&self, topic: &str) -> MsbResult<Arc<Consumer>> {
        self.ensure_running()?;
        if let Some(consumer) = self.consumers.get(topic) {
            return Ok(Arc::clone(consumer.value()));
        }
        self.check_topic(topic)?;

        let (consumer, created) = match self.consumers.entry(topic.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let consumer = Arc::new(Consumer::new(
                    topic.to_string(),
                    Arc::clone(&self.adapter),
                    Arc::clone(&self.codec),
                    Arc::clone(&self.monitor),
                ));
                entry.insert(Arc::clone(&consumer));
                (consumer, true)
            }
        };

        if created {
            log::debug!(target: LOG_TARGET, "Created consumer for {}", topic);
            self.monitor
                .notify(|agent| agent.consumer_topic_created(topic));
        }
        Ok(consumer)
    }

    /// Attach the single handler of `topic` and start consuming.
    ///
    /// Fails with [`MsbError::AlreadySubscribed`] if the topic already has a handler.
    pub fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> MsbResult<()> {
        loop {
            let consumer = self.find_or_create_consumer(topic)?;
            if consumer.attach(Arc::clone(&handler))? {
                return Ok(());
            }
            // Closed by a concurrent unsubscribe after we looked it up.
            self.consumers
                .remove_if(topic, |_, cached| Arc::ptr_eq(cached, &consumer));
        }
    }

    /// Detach the handler of `topic` and drop its consumer. No-op for unknown topics.
    pub fn unsubscribe(&self, topic: &str) -> MsbResult<()> {
        let Some((_, consumer)) = self.consumers.remove(topic) else {
            log::trace!(target: LOG_TARGET, "Nothing subscribed to {}", topic);
            return Ok(());
        };
        let result = consumer.close();
        self.monitor
            .notify(|agent| agent.consumer_topic_removed(topic));
        result
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.consumers
            .get(topic)
            .is_some_and(|consumer| consumer.is_subscribed())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Close every consumer, drop every producer and release the adapter.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(target: LOG_TARGET, "Shutting down channels");

        let topics: Vec<String> = self.consumers.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            if let Err(err) = self.unsubscribe(&topic) {
                log::warn!(target: LOG_TARGET, "Failed to unsubscribe {}: {}", topic, err);
            }
        }

        let topics: Vec<String> = self.producers.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            if self.producers.remove(&topic).is_some() {
                self.monitor
                    .notify(|agent| agent.producer_topic_removed(&topic));
            }
        }

        self.adapter.shutdown();
    }

    fn ensure_running(&self) -> MsbResult<()> {
        if self.is_shut_down() {
            Err(MsbError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn check_topic(&self, topic: &str) -> MsbResult<()> {
        if self.validate_topics {
            validate_topic(topic)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("producers", &self.producers.len())
            .field("consumers", &self.consumers.len())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
