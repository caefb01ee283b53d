use bytes::Bytes;

use crate::brokers::queue::message::Message;

/// Turns a message into the bytes shipped to consumers. Called once per send,
/// the result is shared by every receiver of that send.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, message: &Message) -> anyhow::Result<Bytes>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn decode(&self, bytes: &[u8]) -> anyhow::Result<Message> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl MessageCodec for JsonCodec {
    fn encode(&self, message: &Message) -> anyhow::Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }
}
