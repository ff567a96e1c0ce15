//! The platform-canonical message envelope carried on the internal bus.
//!
//! The wire form is protobuf with tags pinned by the platform-wide schema;
//! peer services (writers, readers, the other protocol adapters) already
//! speak it, so the numbering here must never change. Unknown fields from
//! newer peers are skipped by the decoder.

use bytes::Bytes;
use prost::Message;

/// `protocol` value stamped on every envelope this adapter produces, and the
/// value the inbound bridge drops to suppress adapter-to-adapter loops.
pub const PROTOCOL_MQTT: &str = "mqtt";

/// Raw message envelope. Payload bytes are opaque to the adapter.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RawMessage {
    #[prost(string, tag = "1")]
    pub channel: String,
    #[prost(string, tag = "2")]
    pub subtopic: String,
    #[prost(string, tag = "3")]
    pub publisher: String,
    #[prost(string, tag = "4")]
    pub protocol: String,
    #[prost(bytes = "bytes", tag = "5")]
    pub payload: Bytes,
}

impl RawMessage {
    pub fn encode_to_bytes(&self) -> Bytes {
        self.encode_to_vec().into()
    }

    pub fn decode_from(bytes: &[u8]) -> Result<RawMessage, prost::DecodeError> {
        RawMessage::decode(bytes)
    }
}
