//! Conversion between message envelopes and wire bytes.

use crate::error::MsbResult;
use crate::message::Message;

/// Serializes envelopes for the broker adapter.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, message: &Message) -> MsbResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> MsbResult<Message>;
}

/// JSON wire format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, message: &Message) -> MsbResult<Vec<u8>> {
        Ok(serde_json::to_vec(message)?)
    }

    fn decode(&self, bytes: &[u8]) -> MsbResult<Message> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
