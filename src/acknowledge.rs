//! Broker-level acknowledgement of one inbound message.
//!
//! # State machine
//!
//! ```text
//! Pending ──confirm──▶ Confirmed
//!    │
//!    ├────reject────▶ Rejected
//!    │
//!    └────retry─────▶ Retried   (Rejected if the delivery was already a redelivery)
//! ```
//!
//! The first transition out of `Pending` wins and is the only one forwarded
//! to the broker adapter. Every later call, explicit or automatic, is a
//! no-op. Explicit double calls are logged at warn level.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::adapter::AcknowledgementAdapter;

const LOG_TARGET: &str = "msb::acknowledge";

/// Resolution state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckState {
    Pending = 0,
    Confirmed = 1,
    Rejected = 2,
    Retried = 3,
}

impl AckState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AckState::Confirmed,
            2 => AckState::Rejected,
            3 => AckState::Retried,
            _ => AckState::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckAction {
    Confirm,
    Reject,
    Retry,
}

/// Gives the application explicit control over the broker-level fate of a
/// delivered message.
///
/// One instance exists per delivery and is never shared across messages.
pub struct AcknowledgementHandler {
    adapter: Box<dyn AcknowledgementAdapter>,
    topic: String,
    redelivered: bool,
    state: AtomicU8,
    auto_acknowledgement: AtomicBool,
}

impl std::fmt::Debug for AcknowledgementHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcknowledgementHandler")
            .field("topic", &self.topic)
            .field("redelivered", &self.redelivered)
            .field("state", &self.state())
            .field("auto_acknowledgement", &self.is_auto_acknowledgement())
            .finish()
    }
}

impl AcknowledgementHandler {
    pub fn new(
        adapter: Box<dyn AcknowledgementAdapter>,
        topic: impl Into<String>,
        redelivered: bool,
    ) -> Self {
        Self {
            adapter,
            topic: topic.into(),
            redelivered,
            state: AtomicU8::new(AckState::Pending as u8),
            auto_acknowledgement: AtomicBool::new(true),
        }
    }

    pub fn state(&self) -> AckState {
        AckState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn is_auto_acknowledgement(&self) -> bool {
        self.auto_acknowledgement.load(Ordering::Acquire)
    }

    /// Opt out of (or back into) automatic acknowledgement after the handler returns.
    pub fn set_auto_acknowledgement(&self, enabled: bool) {
        self.auto_acknowledgement.store(enabled, Ordering::Release);
    }

    pub fn confirm_message(&self) {
        self.resolve(AckAction::Confirm, true);
    }

    pub fn reject_message(&self) {
        self.resolve(AckAction::Reject, true);
    }

    /// Ask for redelivery. Downgraded to a reject for redelivered messages.
    pub fn retry_message(&self) {
        self.resolve(AckAction::Retry, true);
    }

    pub fn auto_confirm(&self) {
        self.resolve_auto(AckAction::Confirm);
    }

    pub fn auto_reject(&self) {
        self.resolve_auto(AckAction::Reject);
    }

    pub fn auto_retry(&self) {
        self.resolve_auto(AckAction::Retry);
    }

    fn resolve_auto(&self, action: AckAction) {
        if self.is_auto_acknowledgement() {
            self.resolve(action, false);
        } else {
            log::trace!(
                target: LOG_TARGET,
                "Auto acknowledgement disabled on {}, skipping {:?}",
                self.topic,
                action
            );
        }
    }

    fn resolve(&self, requested: AckAction, explicit: bool) {
        let action = match requested {
            AckAction::Retry if self.redelivered => AckAction::Reject,
            other => other,
        };
        let target = match action {
            AckAction::Confirm => AckState::Confirmed,
            AckAction::Reject => AckState::Rejected,
            AckAction::Retry => AckState::Retried,
        };

        if let Err(current) = self.state.compare_exchange(
            AckState::Pending as u8,
            target as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            if explicit {
                log::warn!(
                    target: LOG_TARGET,
                    "Acknowledgement was already sent on {} ({:?}), ignoring {:?}",
                    self.topic,
                    AckState::from_u8(current),
                    requested
                );
            }
            return;
        }

        if action != requested {
            log::warn!(
                target: LOG_TARGET,
                "Message on {} was already redelivered, rejecting instead of retrying",
                self.topic
            );
        }

        let result = match action {
            AckAction::Confirm => self.adapter.confirm(),
            AckAction::Reject => self.adapter.reject(),
            AckAction::Retry => self.adapter.retry(),
        };
        if let Err(err) = result {
            log::error!(
                target: LOG_TARGET,
                "Broker rejected {:?} on {}: {}",
                action,
                self.topic,
                err
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::MsbResult;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};

    /// Adapter recording every broker-level call.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingAck {
        pub(crate) calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl RecordingAck {
        pub(crate) fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl AcknowledgementAdapter for RecordingAck {
        fn confirm(&self) -> MsbResult<()> {
            self.calls.lock().unwrap().push("confirm");
            Ok(())
        }

        fn reject(&self) -> MsbResult<()> {
            self.calls.lock().unwrap().push("reject");
            Ok(())
        }

        fn retry(&self) -> MsbResult<()> {
            self.calls.lock().unwrap().push("retry");
            Ok(())
        }
    }

    fn handler(redelivered: bool) -> (AcknowledgementHandler, RecordingAck) {
        let recorder = RecordingAck::default();
        let handler = AcknowledgementHandler::new(Box::new(recorder.clone()), "a:b", redelivered);
        (handler, recorder)
    }

    #[test]
    fn confirm_twice_has_single_broker_effect() {
        let (ack, recorder) = handler(false);
        ack.confirm_message();
        ack.confirm_message();

        assert_eq!(recorder.calls(), vec!["confirm"]);
        assert_eq!(ack.state(), AckState::Confirmed);
    }

    #[rstest]
    #[case::confirm_first(&["confirm", "reject", "retry"], "confirm", AckState::Confirmed)]
    #[case::reject_first(&["reject", "retry", "confirm"], "reject", AckState::Rejected)]
    #[case::retry_first(&["retry", "confirm", "reject"], "retry", AckState::Retried)]
    #[case::auto_after_explicit(&["auto_reject", "confirm"], "reject", AckState::Rejected)]
    fn first_call_wins(
        #[case] calls: &[&str],
        #[case] expected_effect: &str,
        #[case] expected_state: AckState,
    ) {
        let (ack, recorder) = handler(false);
        for call in calls {
            match *call {
                "confirm" => ack.confirm_message(),
                "reject" => ack.reject_message(),
                "retry" => ack.retry_message(),
                "auto_reject" => ack.auto_reject(),
                other => panic!("unknown call {other}"),
            }
        }

        assert_eq!(recorder.calls(), vec![expected_effect]);
        assert_eq!(ack.state(), expected_state);
    }

    #[rstest]
    #[case::explicit_retry(true)]
    #[case::auto_retry(false)]
    fn retry_of_redelivered_message_rejects(#[case] explicit: bool) {
        let (ack, recorder) = handler(true);
        if explicit {
            ack.retry_message();
        } else {
            ack.auto_retry();
        }

        assert_eq!(recorder.calls(), vec!["reject"]);
        assert_eq!(ack.state(), AckState::Rejected);
    }

    #[test]
    fn auto_actions_respect_opt_out() {
        let (ack, recorder) = handler(false);
        ack.set_auto_acknowledgement(false);
        ack.auto_confirm();
        ack.auto_reject();
        ack.auto_retry();
        assert!(recorder.calls().is_empty());
        assert_eq!(ack.state(), AckState::Pending);

        ack.reject_message();
        assert_eq!(recorder.calls(), vec!["reject"]);
    }

    #[test]
    fn concurrent_calls_resolve_exactly_once() {
        let recorder = RecordingAck::default();
        let ack = Arc::new(AcknowledgementHandler::new(
            Box::new(recorder.clone()),
            "a:b",
            false,
        ));

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let ack = Arc::clone(&ack);
                std::thread::spawn(move || match i % 3 {
                    0 => ack.confirm_message(),
                    1 => ack.reject_message(),
                    _ => ack.auto_retry(),
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(recorder.calls().len(), 1);
        assert_ne!(ack.state(), AckState::Pending);
    }
}
