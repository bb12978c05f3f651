//! Demultiplexing of one shared response topic.
//!
//! All requests sent to the same namespace by one service instance share a
//! response topic and therefore one broker subscription. The multiplexer is
//! that subscription's single handler: it routes each message to the
//! collector registered under the message's correlation id.
//!
//! # Subscription lifecycle
//!
//! ```text
//! live count   0 ──register──▶ 1 ──register──▶ 2 ──unregister──▶ 1 ──unregister──▶ 0
//! consumer     -   subscribe   ✓               ✓                  ✓   unsubscribe    -
//! ```
//!
//! Register and unregister hold the multiplexer's lock across the
//! subscribe/unsubscribe call, so the live count always agrees with whether
//! the consumer is subscribed.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use super::Collector;
use crate::acknowledge::AcknowledgementHandler;
use crate::channel::{ChannelManager, MessageHandler};
use crate::error::{HandlerResult, LockResultExt, MsbError, MsbResult};
use crate::message::{CorrelationId, Message};

const LOG_TARGET: &str = "msb::collector::multiplexer";

#[derive(Debug, Default)]
struct SubscriptionState {
    live: usize,
    subscribed: bool,
}

/// Routes messages of one response topic to their collectors.
pub struct CollectorMultiplexer {
    topic: String,
    channel_manager: Arc<ChannelManager>,
    collectors: DashMap<CorrelationId, Arc<Collector>>,
    subscription: Mutex<SubscriptionState>,
}

impl CollectorMultiplexer {
    pub fn new(topic: impl Into<String>, channel_manager: Arc<ChannelManager>) -> Self {
        Self {
            topic: topic.into(),
            channel_manager,
            collectors: DashMap::new(),
            subscription: Mutex::new(SubscriptionState::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Add `collector` and make sure the topic is subscribed.
    ///
    /// On subscription failure the registration is rolled back.
    pub fn register(self: &Arc<Self>, collector: &Arc<Collector>) -> MsbResult<()> {
        let mut subscription = self
            .subscription
            .lock()
            .recover_poison("CollectorMultiplexer::register");

        let correlation_id = collector.correlation_id().clone();
        match self
            .collectors
            .insert(correlation_id.clone(), Arc::clone(collector))
        {
            None => subscription.live += 1,
            Some(previous) if !Arc::ptr_eq(&previous, collector) => {
                log::warn!(
                    target: LOG_TARGET,
                    "[correlation id: {}] Replacing a collector still registered on {}",
                    correlation_id,
                    self.topic
                );
            }
            Some(_) => {}
        }

        if !subscription.subscribed {
            let handler: Arc<dyn MessageHandler> = Arc::clone(self) as Arc<dyn MessageHandler>;
            if let Err(err) = self.channel_manager.subscribe(&self.topic, handler) {
                if self
                    .collectors
                    .remove_if(&correlation_id, |_, c| Arc::ptr_eq(c, collector))
                    .is_some()
                {
                    subscription.live -= 1;
                }
                log::error!(
                    target: LOG_TARGET,
                    "Failed to subscribe to response topic {}: {}",
                    self.topic,
                    err
                );
                return Err(err);
            }
            subscription.subscribed = true;
        }

        log::trace!(
            target: LOG_TARGET,
            "[correlation id: {}] Registered on {} ({} live)",
            correlation_id,
            self.topic,
            subscription.live
        );
        Ok(())
    }

    /// Remove `collector`; the last one out unsubscribes the topic.
    pub fn unregister(&self, collector: &Arc<Collector>) {
        let mut subscription = self
            .subscription
            .lock()
            .recover_poison("CollectorMultiplexer::unregister");

        let removed = self
            .collectors
            .remove_if(collector.correlation_id(), |_, c| Arc::ptr_eq(c, collector))
            .is_some();
        if !removed {
            return;
        }
        subscription.live -= 1;

        if subscription.live == 0 && subscription.subscribed {
            subscription.subscribed = false;
            log::debug!(
                target: LOG_TARGET,
                "No conversations left on {}, unsubscribing",
                self.topic
            );
            if let Err(err) = self.channel_manager.unsubscribe(&self.topic) {
                log::warn!(
                    target: LOG_TARGET,
                    "Failed to unsubscribe from {}: {}",
                    self.topic,
                    err
                );
            }
        }
    }

    /// Number of registered collectors.
    pub fn live_count(&self) -> usize {
        self.subscription
            .lock()
            .recover_poison("CollectorMultiplexer::live_count")
            .live
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .recover_poison("CollectorMultiplexer::is_subscribed")
            .subscribed
    }

    fn collectors(&self) -> Vec<Arc<Collector>> {
        self.collectors
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl MessageHandler for CollectorMultiplexer {
    fn handle_message(&self, message: Message, ack: &Arc<AcknowledgementHandler>) -> HandlerResult {
        let collector = self
            .collectors
            .get(&message.correlation_id)
            .map(|entry| Arc::clone(entry.value()));

        match collector {
            Some(collector) => collector.handle_message(message),
            None => {
                log::warn!(
                    target: LOG_TARGET,
                    "[correlation id: {}] No conversation waiting on {}, dropping message {}",
                    message.correlation_id,
                    self.topic,
                    message.id
                );
                ack.auto_reject();
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CollectorMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorMultiplexer")
            .field("topic", &self.topic)
            .field("collectors", &self.collectors.len())
            .finish_non_exhaustive()
    }
}

/// Cache of multiplexers keyed by response topic.
pub struct MultiplexerRegistry {
    channel_manager: Arc<ChannelManager>,
    multiplexers: DashMap<String, Arc<CollectorMultiplexer>>,
}

impl MultiplexerRegistry {
    pub fn new(channel_manager: Arc<ChannelManager>) -> Self {
        Self {
            channel_manager,
            multiplexers: DashMap::new(),
        }
    }

    /// The multiplexer of `topic`, created on first use.
    pub fn find_or_create(&self, topic: &str) -> Arc<CollectorMultiplexer> {
        if let Some(multiplexer) = self.multiplexers.get(topic) {
            return Arc::clone(multiplexer.value());
        }
        Arc::clone(
            self.multiplexers
                .entry(topic.to_string())
                .or_insert_with(|| {
                    Arc::new(CollectorMultiplexer::new(
                        topic,
                        Arc::clone(&self.channel_manager),
                    ))
                })
                .value(),
        )
    }
}

impl MultiplexerRegistry {
    /// Abort every live conversation on every cached topic.
    pub(crate) fn abort_all(&self, error: &MsbError) {
        let multiplexers: Vec<_> = self
            .multiplexers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for multiplexer in multiplexers {
            let collectors = multiplexer.collectors();
            if !collectors.is_empty() {
                log::debug!(
                    target: LOG_TARGET,
                    "Aborting {} conversations on {}",
                    collectors.len(),
                    multiplexer.topic
                );
            }
            for collector in collectors {
                collector.abort(error);
            }
        }
    }
}

impl std::fmt::Debug for MultiplexerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexerRegistry")
            .field("topics", &self.multiplexers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acknowledge::tests::RecordingAck;
    use crate::adapter::MemoryBroker;
    use crate::codec::JsonCodec;
    use crate::collector::{CollectorConfig, EventHandlers, TimeoutScheduler, WaitForResponses};
    use crate::config::MsbConfig;
    use crate::message::tests::message;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;

    const TOPIC: &str = "test:response:instance-1";

    struct Fixture {
        broker: MemoryBroker,
        channels: Arc<ChannelManager>,
        scheduler: Arc<TimeoutScheduler>,
        registry: MultiplexerRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let broker = MemoryBroker::new();
            let channels = Arc::new(ChannelManager::new(
                &MsbConfig::default(),
                Arc::new(broker.clone()),
                Arc::new(JsonCodec),
            ));
            Self {
                broker,
                registry: MultiplexerRegistry::new(Arc::clone(&channels)),
                channels,
                scheduler: Arc::new(TimeoutScheduler::new(1).unwrap()),
            }
        }

        fn collector(
            &self,
            correlation_id: &str,
        ) -> (Arc<Collector>, oneshot::Receiver<crate::collector::ConversationEnd>) {
            let mut request = message(correlation_id, None, None);
            request.topics.response = Some(TOPIC.to_string());
            Collector::new(
                &request,
                CollectorConfig {
                    response_timeout: Duration::from_secs(5),
                    ack_timeout: None,
                    wait_for_responses: WaitForResponses::Exactly(1),
                },
                EventHandlers::new(),
                Arc::clone(&self.scheduler),
                self.registry.find_or_create(TOPIC),
            )
            .unwrap()
        }
    }

    #[test]
    fn registry_returns_one_multiplexer_per_topic() {
        let fixture = Fixture::new();
        let a = fixture.registry.find_or_create(TOPIC);
        let b = fixture.registry.find_or_create(TOPIC);
        let other = fixture.registry.find_or_create("other:response:x");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn shared_topic_unsubscribes_once_after_last_collector() {
        let fixture = Fixture::new();
        let multiplexer = fixture.registry.find_or_create(TOPIC);
        let (first, _rx1) = fixture.collector("corr-1");
        let (second, _rx2) = fixture.collector("corr-2");

        first.listen_for_responses().unwrap();
        second.listen_for_responses().unwrap();
        assert_eq!(multiplexer.live_count(), 2);
        assert_eq!(fixture.broker.subscribe_count(TOPIC), 1);

        multiplexer.unregister(&first);
        assert_eq!(multiplexer.live_count(), 1);
        assert!(fixture.broker.is_subscribed(TOPIC));
        assert_eq!(fixture.broker.unsubscribe_count(TOPIC), 0);

        multiplexer.unregister(&second);
        multiplexer.unregister(&second);
        assert_eq!(multiplexer.live_count(), 0);
        assert!(!multiplexer.is_subscribed());
        assert_eq!(fixture.broker.unsubscribe_count(TOPIC), 1);
    }

    #[test]
    fn routes_by_correlation_id() {
        let fixture = Fixture::new();
        let multiplexer = fixture.registry.find_or_create(TOPIC);
        let (first, rx1) = fixture.collector("corr-1");
        let (second, _rx2) = fixture.collector("corr-2");
        first.listen_for_responses().unwrap();
        second.listen_for_responses().unwrap();

        let ack = Arc::new(AcknowledgementHandler::new(
            Box::new(RecordingAck::default()),
            TOPIC,
            false,
        ));
        multiplexer
            .handle_message(message("corr-1", None, Some(json!("hi"))), &ack)
            .unwrap();

        let end = rx1.blocking_recv().unwrap();
        assert_eq!(end.correlation_id.as_str(), "corr-1");
        assert!(first.is_ended());
        assert!(!second.is_ended());
        assert_eq!(multiplexer.live_count(), 1);
    }

    #[test]
    fn unmatched_correlation_id_is_dropped() {
        let fixture = Fixture::new();
        let multiplexer = fixture.registry.find_or_create(TOPIC);
        let recorder = RecordingAck::default();
        let ack = Arc::new(AcknowledgementHandler::new(
            Box::new(recorder.clone()),
            TOPIC,
            false,
        ));

        let result = multiplexer.handle_message(message("nobody", None, Some(json!(1))), &ack);

        assert!(result.is_ok());
        assert_eq!(recorder.calls(), vec!["reject"]);
    }

    #[test]
    fn failed_subscription_rolls_back_registration() {
        let fixture = Fixture::new();
        let multiplexer = fixture.registry.find_or_create(TOPIC);
        let (collector, _rx) = fixture.collector("corr-1");
        fixture.channels.shutdown();

        assert!(collector.listen_for_responses().is_err());
        assert_eq!(multiplexer.live_count(), 0);
        assert!(!multiplexer.is_subscribed());
    }

    #[test]
    fn abort_all_releases_every_conversation() {
        let fixture = Fixture::new();
        let multiplexer = fixture.registry.find_or_create(TOPIC);
        let (first, rx1) = fixture.collector("corr-1");
        let (second, rx2) = fixture.collector("corr-2");
        first.listen_for_responses().unwrap();
        second.listen_for_responses().unwrap();

        fixture.registry.abort_all(&MsbError::ShutDown);

        assert!(rx1.blocking_recv().is_err());
        assert!(rx2.blocking_recv().is_err());
        assert_eq!(multiplexer.live_count(), 0);
        assert_eq!(fixture.broker.unsubscribe_count(TOPIC), 1);
    }

    #[test]
    fn concurrent_register_unregister_keeps_count_consistent() {
        let fixture = Arc::new(Fixture::new());
        let multiplexer = fixture.registry.find_or_create(TOPIC);

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let fixture = Arc::clone(&fixture);
                let multiplexer = Arc::clone(&multiplexer);
                std::thread::spawn(move || {
                    for round in 0..25 {
                        let (collector, _rx) = fixture.collector(&format!("corr-{i}-{round}"));
                        collector.listen_for_responses().unwrap();
                        multiplexer.unregister(&collector);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(multiplexer.live_count(), 0);
        assert!(!multiplexer.is_subscribed());
        assert!(!fixture.broker.is_subscribed(TOPIC));
        assert_eq!(
            fixture.broker.subscribe_count(TOPIC),
            fixture.broker.unsubscribe_count(TOPIC)
        );
    }
}
