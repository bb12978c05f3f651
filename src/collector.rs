//! Requester-side conversation tracking.
//!
//! ```text
//! broker ──► Consumer ──► CollectorMultiplexer ──► Collector ──► EventHandlers
//!            (1/topic)    (1/response topic)       (1/request)   + Conversation
//!                                                     ▲
//!                                  TimeoutScheduler ──┘ response/ack timers
//! ```
//!
//! A [`Collector`] exists for every request that waits for acks or
//! responses. Collectors waiting on the same response topic share one
//! subscription through their topic's [`CollectorMultiplexer`]; the
//! [`MultiplexerRegistry`] caches one multiplexer per topic.

mod events;
mod multiplexer;
mod response_collector;
mod timeout;

pub use events::{
    AcknowledgeCallback, ConversationEnd, EndCallback, EndReason, ErrorCallback, EventHandlers,
    ResponseCallback,
};
pub use multiplexer::{CollectorMultiplexer, MultiplexerRegistry};
pub use response_collector::{Collector, CollectorConfig, WaitForResponses};
pub use timeout::{TimeoutHandle, TimeoutKind, TimeoutScheduler};
