//! Channel monitoring hooks.
//!
//! The channel layer reports topic lifecycle and traffic to an optional
//! [`ChannelMonitorAgent`]. Notifications are pure observation: they run
//! inline on the calling thread, so agents must return quickly and never
//! block.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use serde::Serialize;

use crate::message::is_service_topic;

/// Observer of producer/consumer lifecycle and message traffic.
///
/// Every hook defaults to a no-op.
pub trait ChannelMonitorAgent: Send + Sync {
    fn producer_topic_created(&self, _topic: &str) {}
    fn producer_topic_removed(&self, _topic: &str) {}
    fn consumer_topic_created(&self, _topic: &str) {}
    fn consumer_topic_removed(&self, _topic: &str) {}
    fn producer_message_sent(&self, _topic: &str) {}
    fn consumer_message_received(&self, _topic: &str) {}
}

struct InstalledAgent(Arc<dyn ChannelMonitorAgent>);

/// Hot-swappable slot holding the active agent.
///
/// Readers load the agent lock-free, so installing or replacing an agent
/// never blocks message flow.
pub(crate) struct MonitorSlot {
    agent: ArcSwapOption<InstalledAgent>,
}

impl Default for MonitorSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorSlot {
    pub(crate) fn new() -> Self {
        Self {
            agent: ArcSwapOption::empty(),
        }
    }

    pub(crate) fn install(&self, agent: Arc<dyn ChannelMonitorAgent>) {
        self.agent.store(Some(Arc::new(InstalledAgent(agent))));
    }

    pub(crate) fn notify(&self, event: impl FnOnce(&dyn ChannelMonitorAgent)) {
        let guard = self.agent.load();
        if let Some(installed) = &*guard {
            event(installed.0.as_ref());
        }
    }
}

/// Per-topic usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicStats {
    pub producers: bool,
    pub consumers: bool,
    pub last_produced_at: Option<SystemTime>,
    pub last_consumed_at: Option<SystemTime>,
}

/// Agent that aggregates [`TopicStats`] for every non-service topic.
#[derive(Default)]
pub struct TopicStatsAgent {
    stats: DashMap<String, TopicStats>,
}

impl TopicStatsAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the statistics collected so far.
    pub fn snapshot(&self) -> HashMap<String, TopicStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn topic(&self, topic: &str) -> Option<TopicStats> {
        self.stats.get(topic).map(|stats| stats.clone())
    }

    fn update(&self, topic: &str, apply: impl FnOnce(&mut TopicStats)) {
        if is_service_topic(topic) {
            return;
        }
        apply(&mut self.stats.entry(topic.to_string()).or_default());
    }
}

impl ChannelMonitorAgent for TopicStatsAgent {
    fn producer_topic_created(&self, topic: &str) {
        self.update(topic, |stats| stats.producers = true);
    }

    fn producer_topic_removed(&self, topic: &str) {
        self.update(topic, |stats| stats.producers = false);
    }

    fn consumer_topic_created(&self, topic: &str) {
        self.update(topic, |stats| stats.consumers = true);
    }

    fn consumer_topic_removed(&self, topic: &str) {
        self.update(topic, |stats| stats.consumers = false);
    }

    fn producer_message_sent(&self, topic: &str) {
        self.update(topic, |stats| stats.last_produced_at = Some(SystemTime::now()));
    }

    fn consumer_message_received(&self, topic: &str) {
        self.update(topic, |stats| stats.last_consumed_at = Some(SystemTime::now()));
    }
}
