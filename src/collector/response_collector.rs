//! Per-conversation correlation and adaptive-timeout state machine.
//!
//! # Message handling
//!
//! ```text
//! handle_message(msg)
//!       │
//!       ├─► payload?   record as response, consume one expected response
//!       │   otherwise  record as ack
//!       ├─► ack block? fold: extend deadline, update responder count
//!       │
//!       └─► still awaiting responses? ── yes ─► keep waiting
//!                 │ no
//!                 ├─► ack window open? ── yes ─► arm ack timer (once)
//!                 │ no
//!                 └─► end
//! ```
//!
//! Every decision is taken under the collector's mutex from one consistent
//! snapshot. Callbacks, multiplexer unregistration and completion run after
//! the lock is released, responses and acks before the end notification.
//!
//! # Responder bookkeeping
//!
//! Each ack may name a new deadline (relative to the request) and a count of
//! further responses. Deadlines fold monotonically: the effective response
//! timeout is the maximum of the current one and every responder's last
//! suggestion, and the timer is re-armed only when that maximum changes.
//! Counts are tracked per responder: a negative count from a responder never
//! heard of is ignored, zero pins the responder at zero, anything else is
//! added to its count (floored at zero). The count used for termination is
//! `max(global counter, sum of per-responder counts)`, which favours waiting
//! longer over ending early when responders disagree. A redelivered message
//! still extends deadlines but does not touch the counts again.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::events::{ConversationEnd, EndReason, EventHandlers};
use super::multiplexer::CollectorMultiplexer;
use super::timeout::{TimeoutHandle, TimeoutScheduler};
use crate::error::{LockResultExt, MsbError, MsbResult};
use crate::message::{Acknowledge, CorrelationId, Message};

const LOG_TARGET: &str = "msb::collector";

/// How many responses a request waits for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitForResponses {
    /// Fire-and-forget; only an ack window can keep a conversation open
    #[default]
    None,
    /// End once this many responses arrived, unless acks announce more
    Exactly(u32),
    /// Never end on the response count, only on a timer
    UntilTimeout,
}

impl WaitForResponses {
    /// Responses expected before acks are taken into account.
    pub fn expected(&self) -> u32 {
        match self {
            WaitForResponses::Exactly(n) => *n,
            WaitForResponses::None | WaitForResponses::UntilTimeout => 0,
        }
    }

    pub fn expects_responses(&self) -> bool {
        match self {
            WaitForResponses::None => false,
            WaitForResponses::Exactly(n) => *n > 0,
            WaitForResponses::UntilTimeout => true,
        }
    }
}

/// `0` waits for nothing, `-1` (or any negative value) waits until timeout.
impl From<i32> for WaitForResponses {
    fn from(value: i32) -> Self {
        match value {
            0 => WaitForResponses::None,
            n if n < 0 => WaitForResponses::UntilTimeout,
            n => WaitForResponses::Exactly(n as u32),
        }
    }
}

/// Timing and count parameters of one collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    pub response_timeout: Duration,
    /// Window, from the request, during which acks keep the conversation open
    pub ack_timeout: Option<Duration>,
    pub wait_for_responses: WaitForResponses,
}

struct CollectorState {
    current_timeout: Duration,
    ack_deadline: Option<Instant>,
    responses_remaining: u32,
    timeout_by_responder: HashMap<String, Duration>,
    remaining_by_responder: HashMap<String, u32>,
    ack_messages: Vec<Message>,
    payload_messages: Vec<Message>,
    handled_ids: HashSet<String>,
    response_timer: Option<TimeoutHandle>,
    ack_timer: Option<TimeoutHandle>,
    response_timer_arms: usize,
    ended: bool,
    completion: Option<oneshot::Sender<ConversationEnd>>,
}

impl CollectorState {
    fn aggregate_remaining(&self) -> u32 {
        if self.remaining_by_responder.is_empty() {
            return self.responses_remaining;
        }
        let sum = self
            .remaining_by_responder
            .values()
            .fold(0u32, |acc, n| acc.saturating_add(*n));
        self.responses_remaining.max(sum)
    }

    fn record_responses_remaining(&mut self, responder_id: &str, value: i32) {
        match self.remaining_by_responder.get_mut(responder_id) {
            None if value < 0 => {}
            None => {
                self.remaining_by_responder
                    .insert(responder_id.to_string(), value as u32);
            }
            Some(count) if value == 0 => *count = 0,
            Some(count) => *count = count.saturating_add_signed(value),
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.response_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.ack_timer.take() {
            timer.cancel();
        }
    }
}

/// Terminal transition computed under the lock, delivered after it.
struct Finished {
    end: ConversationEnd,
    completion: Option<oneshot::Sender<ConversationEnd>>,
}

/// Collects the acks and responses of one outstanding request.
pub struct Collector {
    correlation_id: CorrelationId,
    response_topic: String,
    started_at: Instant,
    ack_timeout: Option<Duration>,
    until_timeout: bool,
    handlers: EventHandlers,
    scheduler: Arc<TimeoutScheduler>,
    multiplexer: Arc<CollectorMultiplexer>,
    state: Mutex<CollectorState>,
}

impl Collector {
    /// Create the collector for `request`.
    ///
    /// Returns the receiving half of the completion channel, resolved with
    /// the [`ConversationEnd`] once the conversation terminates.
    pub fn new(
        request: &Message,
        config: CollectorConfig,
        handlers: EventHandlers,
        scheduler: Arc<TimeoutScheduler>,
        multiplexer: Arc<CollectorMultiplexer>,
    ) -> MsbResult<(Arc<Self>, oneshot::Receiver<ConversationEnd>)> {
        let response_topic =
            request
                .topics
                .response
                .clone()
                .ok_or_else(|| MsbError::MissingResponseTopic {
                    message_id: request.id.clone(),
                })?;
        let (completion, receiver) = oneshot::channel();

        let collector = Arc::new(Self {
            correlation_id: request.correlation_id.clone(),
            response_topic,
            started_at: Instant::now(),
            ack_timeout: config.ack_timeout,
            until_timeout: config.wait_for_responses == WaitForResponses::UntilTimeout,
            handlers,
            scheduler,
            multiplexer,
            state: Mutex::new(CollectorState {
                current_timeout: config.response_timeout,
                ack_deadline: None,
                responses_remaining: config.wait_for_responses.expected(),
                timeout_by_responder: HashMap::new(),
                remaining_by_responder: HashMap::new(),
                ack_messages: Vec::new(),
                payload_messages: Vec::new(),
                handled_ids: HashSet::new(),
                response_timer: None,
                ack_timer: None,
                response_timer_arms: 0,
                ended: false,
                completion: Some(completion),
            }),
        });
        Ok((collector, receiver))
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn response_topic(&self) -> &str {
        &self.response_topic
    }

    /// Open the ack window and register with the response topic's multiplexer.
    pub fn listen_for_responses(self: &Arc<Self>) -> MsbResult<()> {
        if let Some(ack_timeout) = self.ack_timeout.filter(|timeout| !timeout.is_zero()) {
            self.lock().ack_deadline = Some(self.started_at + ack_timeout);
        }

        if let Err(err) = self.multiplexer.register(self) {
            let mut state = self.lock();
            state.ended = true;
            state.completion = None;
            return Err(err);
        }
        log::debug!(
            target: LOG_TARGET,
            "[correlation id: {}] Listening for responses on {}",
            self.correlation_id,
            self.response_topic
        );
        Ok(())
    }

    /// Arm the response timer once the request is on the wire.
    ///
    /// If nothing is outstanding but an ack window is open, the ack timer is
    /// armed as well so an ack-only conversation ends with its window.
    pub fn wait_for_responses(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.ended {
            return;
        }
        self.arm_response_timer(&mut state);
        if !self.awaiting_responses(&state) {
            self.arm_ack_timer_once(&mut state);
        }
    }

    /// Handle one message correlated with this conversation.
    pub fn handle_message(self: &Arc<Self>, message: Message) {
        let has_payload = message.has_payload();

        let finished = {
            let mut state = self.lock();
            if state.ended {
                log::debug!(
                    target: LOG_TARGET,
                    "[correlation id: {}] Ignoring message {} for ended conversation",
                    self.correlation_id,
                    message.id
                );
                return;
            }

            // Redeliveries are recorded but consume an expected response only once.
            let first_delivery = state.handled_ids.insert(message.id.clone());
            if has_payload {
                state.payload_messages.push(message.clone());
                if first_delivery {
                    state.responses_remaining = state.responses_remaining.saturating_sub(1);
                }
            } else if message.ack.is_some() {
                state.ack_messages.push(message.clone());
            }
            if let Some(ack) = &message.ack {
                self.fold_ack(&mut state, ack, first_delivery);
            }

            if self.awaiting_responses(&state) {
                log::trace!(
                    target: LOG_TARGET,
                    "[correlation id: {}] {} responses remaining",
                    self.correlation_id,
                    state.aggregate_remaining()
                );
                None
            } else if self.arm_ack_timer_once(&mut state) {
                None
            } else {
                Some(self.finish(&mut state, EndReason::AllResponsesReceived))
            }
        };

        if has_payload {
            self.handlers.emit_response(&message);
        } else if let Some(ack) = &message.ack {
            self.handlers.emit_acknowledge(ack, &message);
        }
        if let Some(finished) = finished {
            self.complete(finished);
        }
    }

    /// Fired by the response timer identified by `timer_id`.
    pub(crate) fn on_response_timeout(self: &Arc<Self>, timer_id: u64) {
        let finished = {
            let mut state = self.lock();
            if state.ended || !is_current(&state.response_timer, timer_id) {
                log::trace!(
                    target: LOG_TARGET,
                    "[correlation id: {}] Ignoring stale response timer {}",
                    self.correlation_id,
                    timer_id
                );
                return;
            }
            state.response_timer = None;
            log::debug!(
                target: LOG_TARGET,
                "[correlation id: {}] Response timeout after {:?}",
                self.correlation_id,
                state.current_timeout
            );
            self.finish(&mut state, EndReason::ResponseTimeout)
        };
        self.complete(finished);
    }

    /// Fired by the ack timer identified by `timer_id`.
    ///
    /// A late ack may have announced more responses since the timer was
    /// armed; the conversation then stays open until the response timer.
    pub(crate) fn on_ack_timeout(self: &Arc<Self>, timer_id: u64) {
        let finished = {
            let mut state = self.lock();
            if state.ended || !is_current(&state.ack_timer, timer_id) {
                return;
            }
            state.ack_timer = None;
            if self.awaiting_responses(&state) {
                log::debug!(
                    target: LOG_TARGET,
                    "[correlation id: {}] Ack window closed, still awaiting responses",
                    self.correlation_id
                );
                return;
            }
            log::debug!(
                target: LOG_TARGET,
                "[correlation id: {}] Ack timeout",
                self.correlation_id
            );
            self.finish(&mut state, EndReason::AckTimeout)
        };
        self.complete(finished);
    }

    /// Tear the conversation down without an end notification.
    ///
    /// Used when the request could not be sent. The completion channel is
    /// dropped and `error` goes to the error callback.
    pub fn abort(self: &Arc<Self>, error: &MsbError) {
        let was_active = {
            let mut state = self.lock();
            if state.ended {
                false
            } else {
                state.ended = true;
                state.cancel_timers();
                state.completion = None;
                true
            }
        };
        if was_active {
            self.multiplexer.unregister(self);
        }
        log::debug!(
            target: LOG_TARGET,
            "[correlation id: {}] Conversation aborted: {}",
            self.correlation_id,
            error
        );
        self.handlers.emit_error(error);
    }

    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }

    /// Responses still expected: `max(global counter, sum per responder)`.
    pub fn responses_remaining(&self) -> u32 {
        self.lock().aggregate_remaining()
    }

    pub fn is_awaiting_responses(&self) -> bool {
        self.awaiting_responses(&self.lock())
    }

    pub fn is_awaiting_acks(&self) -> bool {
        self.lock()
            .ack_deadline
            .is_some_and(|deadline| deadline > Instant::now())
    }

    /// Effective response deadline, relative to when the request was sent.
    pub fn current_timeout(&self) -> Duration {
        self.lock().current_timeout
    }

    /// How many times the response timer has been (re)armed.
    pub fn response_timer_arms(&self) -> usize {
        self.lock().response_timer_arms
    }

    pub fn ack_messages(&self) -> Vec<Message> {
        self.lock().ack_messages.clone()
    }

    pub fn payload_messages(&self) -> Vec<Message> {
        self.lock().payload_messages.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().recover_poison("Collector::state")
    }

    fn awaiting_responses(&self, state: &CollectorState) -> bool {
        self.until_timeout || state.aggregate_remaining() > 0
    }

    /// Fold an ack block into the per-responder state. The remaining count
    /// of a redelivered message was already applied on its first delivery.
    fn fold_ack(
        self: &Arc<Self>,
        state: &mut CollectorState,
        ack: &Acknowledge,
        first_delivery: bool,
    ) {
        if let Some(remaining) = ack.responses_remaining.filter(|_| first_delivery) {
            state.record_responses_remaining(&ack.responder_id, remaining);
            log::debug!(
                target: LOG_TARGET,
                "[correlation id: {}] Responder {} announced {} responses remaining",
                self.correlation_id,
                ack.responder_id,
                remaining
            );
        }

        if let Some(timeout_ms) = ack.timeout_ms {
            state
                .timeout_by_responder
                .insert(ack.responder_id.clone(), Duration::from_millis(timeout_ms));
        }

        let new_timeout = state
            .timeout_by_responder
            .values()
            .copied()
            .fold(state.current_timeout, Duration::max);
        if new_timeout != state.current_timeout {
            log::debug!(
                target: LOG_TARGET,
                "[correlation id: {}] Extending response timeout from {:?} to {:?}",
                self.correlation_id,
                state.current_timeout,
                new_timeout
            );
            state.current_timeout = new_timeout;
            self.arm_response_timer(state);
        }
    }

    /// Cancel any pending response timer and arm a new one for the rest of
    /// the current timeout.
    fn arm_response_timer(self: &Arc<Self>, state: &mut CollectorState) {
        if let Some(previous) = state.response_timer.take() {
            previous.cancel();
        }
        let delay = state
            .current_timeout
            .saturating_sub(self.started_at.elapsed());
        log::debug!(
            target: LOG_TARGET,
            "[correlation id: {}] Waiting for responses for {:?}",
            self.correlation_id,
            delay
        );
        state.response_timer = self.scheduler.schedule_response_timeout(delay, self);
        state.response_timer_arms += 1;
    }

    /// Arm the ack timer unless already armed. Returns whether the ack
    /// window is still open.
    fn arm_ack_timer_once(self: &Arc<Self>, state: &mut CollectorState) -> bool {
        let now = Instant::now();
        let Some(deadline) = state.ack_deadline.filter(|deadline| *deadline > now) else {
            return false;
        };
        if state.ack_timer.is_none() {
            log::debug!(
                target: LOG_TARGET,
                "[correlation id: {}] Waiting for acks for {:?}",
                self.correlation_id,
                deadline - now
            );
            state.ack_timer = self.scheduler.schedule_ack_timeout(deadline - now, self);
        }
        true
    }

    fn finish(&self, state: &mut CollectorState, reason: EndReason) -> Finished {
        state.ended = true;
        state.cancel_timers();
        Finished {
            end: ConversationEnd {
                correlation_id: self.correlation_id.clone(),
                reason,
                payloads: state.payload_messages.clone(),
                acks: state.ack_messages.clone(),
            },
            completion: state.completion.take(),
        }
    }

    fn complete(self: &Arc<Self>, finished: Finished) {
        let Finished { end, completion } = finished;
        self.multiplexer.unregister(self);
        log::debug!(
            target: LOG_TARGET,
            "[correlation id: {}] Conversation ended ({:?}) with {} responses and {} acks",
            self.correlation_id,
            end.reason,
            end.payloads.len(),
            end.acks.len()
        );
        self.handlers.emit_end(&end);
        if let Some(completion) = completion {
            let _ = completion.send(end);
        }
    }
}

fn is_current(timer: &Option<TimeoutHandle>, timer_id: u64) -> bool {
    timer.as_ref().is_some_and(|timer| timer.id() == timer_id)
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("correlation_id", &self.correlation_id)
            .field("response_topic", &self.response_topic)
            .field("ended", &self.is_ended())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryBroker;
    use crate::channel::ChannelManager;
    use crate::codec::JsonCodec;
    use crate::config::MsbConfig;
    use crate::message::tests::message;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    const RESPONSE_TOPIC: &str = "test:response:instance-1";

    struct Fixture {
        broker: MemoryBroker,
        scheduler: Arc<TimeoutScheduler>,
        multiplexer: Arc<CollectorMultiplexer>,
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
                scheduler: Arc::new(TimeoutScheduler::new(1).unwrap()),
                multiplexer: Arc::new(CollectorMultiplexer::new(RESPONSE_TOPIC, channels)),
            }
        }

        fn collector(
            &self,
            config: CollectorConfig,
            handlers: EventHandlers,
        ) -> (Arc<Collector>, oneshot::Receiver<ConversationEnd>) {
            let mut request = message("corr-1", None, Some(json!({"q": 1})));
            request.topics.response = Some(RESPONSE_TOPIC.to_string());
            Collector::new(
                &request,
                config,
                handlers,
                Arc::clone(&self.scheduler),
                Arc::clone(&self.multiplexer),
            )
            .unwrap()
        }
    }

    fn config(wait: WaitForResponses, timeout_ms: u64, ack_ms: Option<u64>) -> CollectorConfig {
        CollectorConfig {
            response_timeout: Duration::from_millis(timeout_ms),
            ack_timeout: ack_ms.map(Duration::from_millis),
            wait_for_responses: wait,
        }
    }

    fn ack(responder: &str, remaining: Option<i32>, timeout_ms: Option<u64>) -> Acknowledge {
        Acknowledge {
            responder_id: responder.to_string(),
            responses_remaining: remaining,
            timeout_ms,
        }
    }

    fn ack_message(responder: &str, remaining: Option<i32>, timeout_ms: Option<u64>) -> Message {
        message("corr-1", Some(ack(responder, remaining, timeout_ms)), None)
    }

    fn payload_message() -> Message {
        message("corr-1", None, Some(json!({"answer": 42})))
    }

    #[test]
    fn single_response_ends_conversation_and_unregisters() {
        let fixture = Fixture::new();
        let responses = Arc::new(StdMutex::new(0));
        let seen = Arc::clone(&responses);
        let handlers = EventHandlers::new().on_response(move |_| *seen.lock().unwrap() += 1);
        let (collector, rx) =
            fixture.collector(config(WaitForResponses::Exactly(1), 3000, None), handlers);

        collector.listen_for_responses().unwrap();
        collector.wait_for_responses();
        assert_eq!(fixture.multiplexer.live_count(), 1);
        assert!(fixture.broker.is_subscribed(RESPONSE_TOPIC));

        collector.handle_message(payload_message());

        let end = rx.blocking_recv().unwrap();
        assert_eq!(end.reason, EndReason::AllResponsesReceived);
        assert_eq!(end.payloads.len(), 1);
        assert_eq!(*responses.lock().unwrap(), 1);
        assert!(collector.is_ended());
        assert_eq!(fixture.multiplexer.live_count(), 0);
        assert!(!fixture.broker.is_subscribed(RESPONSE_TOPIC));
    }

    #[test]
    fn response_timeout_ends_with_no_payloads() {
        let fixture = Fixture::new();
        let (collector, rx) =
            fixture.collector(config(WaitForResponses::Exactly(1), 50, None), EventHandlers::new());
        collector.listen_for_responses().unwrap();
        collector.wait_for_responses();

        let end = rx.blocking_recv().unwrap();
        assert_eq!(end.reason, EndReason::ResponseTimeout);
        assert!(end.payloads.is_empty());
        assert_eq!(fixture.multiplexer.live_count(), 0);
    }

    #[test]
    fn increasing_ack_timeouts_rearm_only_on_new_maximum() {
        let fixture = Fixture::new();
        let (collector, _rx) = fixture.collector(
            config(WaitForResponses::Exactly(1), 1_000, None),
            EventHandlers::new(),
        );
        collector.listen_for_responses().unwrap();
        collector.wait_for_responses();
        assert_eq!(collector.response_timer_arms(), 1);

        collector.handle_message(ack_message("r1", None, Some(5_000)));
        assert_eq!(collector.response_timer_arms(), 2);
        assert_eq!(collector.current_timeout(), Duration::from_millis(5_000));

        // Same responder, same value: no re-arm.
        collector.handle_message(ack_message("r1", None, Some(5_000)));
        assert_eq!(collector.response_timer_arms(), 2);

        // Lower values never shorten the deadline.
        collector.handle_message(ack_message("r2", None, Some(1_000)));
        collector.handle_message(ack_message("r1", None, Some(50)));
        assert_eq!(collector.response_timer_arms(), 2);
        assert_eq!(collector.current_timeout(), Duration::from_millis(5_000));

        collector.handle_message(ack_message("r2", None, Some(6_000)));
        assert_eq!(collector.response_timer_arms(), 3);
        assert_eq!(collector.current_timeout(), Duration::from_millis(6_000));
    }

    #[rstest]
    #[case::announce_then_consume(&[("r1", 2), ("r1", -1)], 1, 1)]
    #[case::unknown_responder_done_is_ignored(&[("r1", -1)], 1, 1)]
    #[case::zero_pins_responder(&[("r1", 5), ("r1", 0)], 1, 1)]
    #[case::counts_accumulate(&[("r1", 2), ("r1", 2)], 1, 4)]
    #[case::never_negative(&[("r1", 1), ("r1", -1), ("r1", -1)], 1, 1)]
    #[case::responders_sum(&[("r1", 2), ("r2", 3)], 1, 5)]
    #[case::global_counter_dominates(&[("r1", 1)], 4, 4)]
    fn aggregate_is_max_of_global_and_sum_per_responder(
        #[case] acks: &[(&str, i32)],
        #[case] wait: u32,
        #[case] expected: u32,
    ) {
        let fixture = Fixture::new();
        let (collector, _rx) = fixture.collector(
            config(WaitForResponses::Exactly(wait), 5_000, None),
            EventHandlers::new(),
        );
        collector.listen_for_responses().unwrap();

        for (responder, remaining) in acks {
            collector.handle_message(ack_message(responder, Some(*remaining), None));
        }
        assert_eq!(collector.responses_remaining(), expected);
    }

    #[test]
    fn redelivered_payload_is_counted_once() {
        let fixture = Fixture::new();
        let (collector, _rx) = fixture.collector(
            config(WaitForResponses::Exactly(2), 5_000, None),
            EventHandlers::new(),
        );
        collector.listen_for_responses().unwrap();

        let response = payload_message();
        collector.handle_message(response.clone());
        collector.handle_message(response);

        assert_eq!(collector.responses_remaining(), 1);
        assert_eq!(collector.payload_messages().len(), 2);
        assert!(!collector.is_ended());
    }

    #[test]
    fn redelivered_response_consumes_announced_count_once() {
        let fixture = Fixture::new();
        let (collector, _rx) = fixture.collector(
            config(WaitForResponses::Exactly(1), 5_000, None),
            EventHandlers::new(),
        );
        collector.listen_for_responses().unwrap();
        collector.wait_for_responses();

        collector.handle_message(ack_message("r1", Some(3), None));
        let mut response = payload_message();
        response.ack = Some(ack("r1", Some(-1), None));
        collector.handle_message(response.clone());
        assert_eq!(collector.responses_remaining(), 2);

        collector.handle_message(response);
        assert_eq!(collector.responses_remaining(), 2);
        assert_eq!(collector.payload_messages().len(), 2);
        assert!(!collector.is_ended());
    }

    #[test]
    fn response_with_ack_block_is_recorded_as_response_only() {
        let fixture = Fixture::new();
        let events = Arc::new(StdMutex::new(Vec::new()));
        let (on_ack, on_response, on_end) =
            (Arc::clone(&events), Arc::clone(&events), Arc::clone(&events));
        let handlers = EventHandlers::new()
            .on_acknowledge(move |_, _| on_ack.lock().unwrap().push("ack"))
            .on_response(move |_| on_response.lock().unwrap().push("response"))
            .on_end(move |_| on_end.lock().unwrap().push("end"));
        let (collector, rx) =
            fixture.collector(config(WaitForResponses::Exactly(1), 5_000, None), handlers);
        collector.listen_for_responses().unwrap();

        collector.handle_message(ack_message("r1", Some(2), None));
        let mut response = payload_message();
        response.ack = Some(ack("r1", Some(-1), None));
        collector.handle_message(response);
        assert_eq!(collector.responses_remaining(), 1);

        let mut last = payload_message();
        last.ack = Some(ack("r1", Some(-1), None));
        collector.handle_message(last);

        let end = rx.blocking_recv().unwrap();
        assert_eq!(end.payloads.len(), 2);
        assert_eq!(end.acks.len(), 1);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["ack", "response", "response", "end"]
        );
    }

    #[test]
    fn until_timeout_ignores_counter() {
        let fixture = Fixture::new();
        let (collector, rx) = fixture.collector(
            config(WaitForResponses::UntilTimeout, 80, None),
            EventHandlers::new(),
        );
        collector.listen_for_responses().unwrap();
        collector.wait_for_responses();

        collector.handle_message(payload_message());
        collector.handle_message(payload_message());
        assert!(!collector.is_ended());

        let end = rx.blocking_recv().unwrap();
        assert_eq!(end.reason, EndReason::ResponseTimeout);
        assert_eq!(end.payloads.len(), 2);
    }

    #[test]
    fn ack_window_keeps_conversation_open_after_last_response() {
        let fixture = Fixture::new();
        let (collector, rx) = fixture.collector(
            config(WaitForResponses::Exactly(1), 5_000, Some(300)),
            EventHandlers::new(),
        );
        collector.listen_for_responses().unwrap();
        collector.wait_for_responses();
        assert!(collector.is_awaiting_acks());

        collector.handle_message(payload_message());
        assert!(!collector.is_ended());

        let end = rx.blocking_recv().unwrap();
        assert_eq!(end.reason, EndReason::AckTimeout);
        assert_eq!(end.payloads.len(), 1);
    }

    #[test]
    fn ack_timeout_is_noop_while_responses_are_announced() {
        let fixture = Fixture::new();
        let (collector, rx) = fixture.collector(
            config(WaitForResponses::None, 500, Some(100)),
            EventHandlers::new(),
        );
        collector.listen_for_responses().unwrap();
        collector.wait_for_responses();

        collector.handle_message(ack_message("r1", Some(1), None));
        std::thread::sleep(Duration::from_millis(200));
        assert!(!collector.is_ended(), "ack timer must not end an open conversation");

        let end = rx.blocking_recv().unwrap();
        assert_eq!(end.reason, EndReason::ResponseTimeout);
    }

    #[test]
    fn late_message_after_end_is_ignored() {
        let fixture = Fixture::new();
        let (collector, rx) = fixture.collector(
            config(WaitForResponses::Exactly(1), 5_000, None),
            EventHandlers::new(),
        );
        collector.listen_for_responses().unwrap();
        collector.handle_message(payload_message());
        collector.handle_message(payload_message());

        let end = rx.blocking_recv().unwrap();
        assert_eq!(end.payloads.len(), 1);
        assert_eq!(collector.payload_messages().len(), 1);
    }

    #[test]
    fn stale_timer_ids_have_no_effect() {
        let fixture = Fixture::new();
        let (collector, _rx) = fixture.collector(
            config(WaitForResponses::Exactly(1), 5_000, None),
            EventHandlers::new(),
        );
        collector.listen_for_responses().unwrap();
        collector.wait_for_responses();

        collector.on_response_timeout(u64::MAX);
        collector.on_ack_timeout(u64::MAX);
        assert!(!collector.is_ended());
    }

    #[test]
    fn scheduling_after_shutdown_is_silent() {
        let fixture = Fixture::new();
        fixture.scheduler.shutdown();
        let (collector, _rx) = fixture.collector(
            config(WaitForResponses::Exactly(1), 10, Some(10)),
            EventHandlers::new(),
        );
        collector.listen_for_responses().unwrap();
        collector.wait_for_responses();

        assert!(!collector.is_ended());
        assert_eq!(collector.response_timer_arms(), 1);
    }

    #[test]
    fn abort_drops_completion_and_reports_error() {
        let fixture = Fixture::new();
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        let handlers =
            EventHandlers::new().on_error(move |err| seen.lock().unwrap().push(err.to_string()));
        let (collector, rx) =
            fixture.collector(config(WaitForResponses::Exactly(1), 5_000, None), handlers);
        collector.listen_for_responses().unwrap();

        collector.abort(&MsbError::transport("test:topic", "down"));

        assert!(rx.blocking_recv().is_err());
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(fixture.multiplexer.live_count(), 0);
    }

    #[rstest]
    #[case::zero(0, WaitForResponses::None)]
    #[case::until_timeout(-1, WaitForResponses::UntilTimeout)]
    #[case::any_negative(-7, WaitForResponses::UntilTimeout)]
    #[case::exact(3, WaitForResponses::Exactly(3))]
    fn wait_for_responses_from_count(#[case] raw: i32, #[case] expected: WaitForResponses) {
        assert_eq!(WaitForResponses::from(raw), expected);
    }
}
