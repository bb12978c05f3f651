//! Transport-agnostic request/response messaging for microservices.
//!
//! Services talk over a publish/subscribe broker through an [`MsbContext`].
//! A request goes to a namespace topic; responders answer on the requester's
//! private response topic, optionally sending acks first to extend the
//! requester's deadline or announce further responses.
//!
//! ```text
//! Requester ──► Producer(ns) ──► broker ──► Consumer(ns) ──► ResponderServer
//!     ▲                                                           │
//!     │                                                       Responder
//!     │                                                           │
//! Collector ◄── Multiplexer ◄── Consumer(ns:response:id) ◄── broker
//! ```

pub mod acknowledge;
pub mod adapter;
pub mod channel;
pub mod codec;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod monitor;
pub mod protocol;

pub use acknowledge::{AckState, AcknowledgementHandler};
pub use adapter::{AcknowledgementAdapter, BrokerAdapter, MemoryBroker};
pub use collector::{ConversationEnd, EndReason, WaitForResponses};
pub use config::MsbConfig;
pub use context::{MsbContext, MsbContextBuilder};
pub use error::{HandlerError, HandlerResult, MsbError, MsbResult};
pub use message::{Acknowledge, CorrelationId, Message, MessageTemplate, Payload};
pub use protocol::{
    Conversation, RequestOptions, Requester, Responder, ResponderContext, ResponderOptions,
    ResponderServer,
};
