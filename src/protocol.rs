//! Application-facing conversation objects.
//!
//! A [`Requester`] sends to a namespace and, when the request waits for acks
//! or responses, opens a [`Conversation`] backed by a collector. A
//! [`ResponderServer`] consumes a namespace and hands each request to a
//! [`RequestHandler`] together with a [`ResponderContext`], whose
//! [`Responder`] sends acks and responses back to the requester's private
//! response topic.

mod options;
mod requester;
mod responder;

pub use options::{RequestOptions, ResponderOptions};
pub use requester::{Conversation, Requester};
pub use responder::{
    RequestHandler, Responder, ResponderContext, ResponderErrorHandler, ResponderServer,
};
