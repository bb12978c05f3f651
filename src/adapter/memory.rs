//! In-process broker used by tests and the demo binary.
//!
//! Each topic owns a backlog that buffers messages while nobody is
//! subscribed. A subscription drains the backlog into an unbounded channel
//! read by a dedicated delivery thread, so handlers always run off the
//! publishing thread.
//!
//! # Unsubscribe from the delivery thread
//!
//! Ending a conversation on its last message unsubscribes the response topic
//! from inside the handler, i.e. on the delivery thread itself. Unsubscribing
//! therefore only cancels the worker and drops its sender; it never joins the
//! thread. Envelopes still buffered in the channel are handed back to the
//! topic once the worker notices the cancellation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AcknowledgementAdapter, BrokerAdapter, RawDelivery, RawMessageHandler};
use crate::error::{MsbError, MsbResult};

const LOG_TARGET: &str = "msb::adapter::memory";

struct Envelope {
    body: Vec<u8>,
    redelivered: bool,
}

struct Subscription {
    sender: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct TopicQueue {
    subscription: Option<Subscription>,
    backlog: VecDeque<Envelope>,
}

#[derive(Default)]
struct Inner {
    topics: DashMap<String, TopicQueue>,
    subscribe_calls: DashMap<String, usize>,
    unsubscribe_calls: DashMap<String, usize>,
    published: AtomicUsize,
    confirmed: AtomicUsize,
    rejected: AtomicUsize,
    retried: AtomicUsize,
    shut_down: AtomicBool,
}

impl Inner {
    /// Hand an envelope to the live subscription, or buffer it.
    fn enqueue(&self, topic: &str, envelope: Envelope) {
        let mut queue = self.topics.entry(topic.to_string()).or_default();
        let envelope = match queue.subscription.as_ref() {
            Some(subscription) => match subscription.sender.send(envelope) {
                Ok(()) => return,
                Err(mpsc::error::SendError(envelope)) => envelope,
            },
            None => envelope,
        };
        queue.backlog.push_back(envelope);
    }
}

/// Broker living entirely in process memory.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("topics", &self.inner.topics.len())
            .field("published", &self.published_count())
            .finish_non_exhaustive()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a handler is currently attached to `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner
            .topics
            .get(topic)
            .is_some_and(|queue| queue.subscription.is_some())
    }

    /// Messages buffered on `topic` while nobody is subscribed.
    pub fn backlog_len(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map_or(0, |queue| queue.backlog.len())
    }

    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.inner.subscribe_calls.get(topic).map_or(0, |n| *n)
    }

    pub fn unsubscribe_count(&self, topic: &str) -> usize {
        self.inner.unsubscribe_calls.get(topic).map_or(0, |n| *n)
    }

    pub fn published_count(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn confirmed_count(&self) -> usize {
        self.inner.confirmed.load(Ordering::SeqCst)
    }

    pub fn rejected_count(&self) -> usize {
        self.inner.rejected.load(Ordering::SeqCst)
    }

    pub fn retried_count(&self) -> usize {
        self.inner.retried.load(Ordering::SeqCst)
    }

    fn ensure_running(&self, topic: &str) -> MsbResult<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            Err(MsbError::transport(topic, "memory broker is shut down"))
        } else {
            Ok(())
        }
    }
}

impl BrokerAdapter for MemoryBroker {
    fn publish(&self, topic: &str, body: &[u8], routing_key: Option<&str>) -> MsbResult<()> {
        self.ensure_running(topic)?;
        log::trace!(
            target: LOG_TARGET,
            "Publishing {} bytes to {} (routing key {:?})",
            body.len(),
            topic,
            routing_key
        );
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        self.inner.enqueue(
            topic,
            Envelope {
                body: body.to_vec(),
                redelivered: false,
            },
        );
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: RawMessageHandler) -> MsbResult<()> {
        self.ensure_running(topic)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = DeliveryWorker {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            receiver,
            cancel: cancel.clone(),
            handler,
        };
        std::thread::Builder::new()
            .name(format!("msb-memory-{topic}"))
            .spawn(move || worker.run())?;

        let mut queue = self.inner.topics.entry(topic.to_string()).or_default();
        if queue.subscription.is_some() {
            // Dropping the sender stops the worker that was just started.
            cancel.cancel();
            return Err(MsbError::transport(topic, "topic is already subscribed"));
        }
        while let Some(envelope) = queue.backlog.pop_front() {
            if let Err(mpsc::error::SendError(envelope)) = sender.send(envelope) {
                queue.backlog.push_front(envelope);
                break;
            }
        }
        queue.subscription = Some(Subscription { sender, cancel });
        drop(queue);

        *self
            .inner
            .subscribe_calls
            .entry(topic.to_string())
            .or_default() += 1;
        log::debug!(target: LOG_TARGET, "Subscribed to {}", topic);
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> MsbResult<()> {
        let subscription = self
            .inner
            .topics
            .get_mut(topic)
            .and_then(|mut queue| queue.subscription.take());

        if let Some(subscription) = subscription {
            subscription.cancel.cancel();
            *self
                .inner
                .unsubscribe_calls
                .entry(topic.to_string())
                .or_default() += 1;
            log::debug!(target: LOG_TARGET, "Unsubscribed from {}", topic);
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for mut queue in self.inner.topics.iter_mut() {
            if let Some(subscription) = queue.subscription.take() {
                subscription.cancel.cancel();
            }
        }
        log::info!(target: LOG_TARGET, "Memory broker shut down");
    }
}

/// Delivery loop of one subscription.
struct DeliveryWorker {
    inner: Arc<Inner>,
    topic: String,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
    handler: RawMessageHandler,
}

impl DeliveryWorker {
    fn run(mut self) {
        log::trace!(target: LOG_TARGET, "Delivery worker for {} started", self.topic);
        while let Some(envelope) = self.receiver.blocking_recv() {
            if self.cancel.is_cancelled() {
                self.requeue(envelope);
                break;
            }
            let ack = MemoryAck {
                inner: Arc::clone(&self.inner),
                topic: self.topic.clone(),
                body: envelope.body.clone(),
            };
            (self.handler)(RawDelivery {
                body: envelope.body,
                redelivered: envelope.redelivered,
                ack: Box::new(ack),
            });
            if self.cancel.is_cancelled() {
                break;
            }
        }

        self.receiver.close();
        while let Ok(envelope) = self.receiver.try_recv() {
            self.requeue(envelope);
        }
        log::trace!(target: LOG_TARGET, "Delivery worker for {} stopped", self.topic);
    }

    fn requeue(&self, envelope: Envelope) {
        if !self.inner.shut_down.load(Ordering::SeqCst) {
            self.inner.enqueue(&self.topic, envelope);
        }
    }
}

/// Broker-level acknowledgement of one in-memory delivery.
struct MemoryAck {
    inner: Arc<Inner>,
    topic: String,
    body: Vec<u8>,
}

impl AcknowledgementAdapter for MemoryAck {
    fn confirm(&self) -> MsbResult<()> {
        self.inner.confirmed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reject(&self) -> MsbResult<()> {
        self.inner.rejected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn retry(&self) -> MsbResult<()> {
        self.inner.retried.fetch_add(1, Ordering::SeqCst);
        self.inner.enqueue(
            &self.topic,
            Envelope {
                body: self.body.clone(),
                redelivered: true,
            },
        );
        Ok(())
    }
}
