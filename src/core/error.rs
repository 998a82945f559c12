use thiserror::Error;

use crate::core::packet::PacketType;

/// Violations of the MQTT wire format.
///
/// Every variant is fatal to the connection that produced it; none of them
/// is ever answered with an error packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("reserved packet type nibble {0:#x}")]
    ReservedPacketType(u8),

    #[error("invalid fixed header flags {flags:#x} for {packet_type}")]
    InvalidFlags { packet_type: PacketType, flags: u8 },

    #[error("malformed remaining length")]
    MalformedRemainingLength,

    #[error("remaining length {0} exceeds the protocol maximum")]
    RemainingLengthTooLarge(usize),

    #[error("packet truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("{0} trailing bytes after packet body")]
    TrailingBytes(usize),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("string field of {0} bytes does not fit a 16-bit length prefix")]
    StringTooLong(usize),

    #[error("CONNECT too short ({0} bytes)")]
    ConnectTooShort(usize),

    #[error("unsupported protocol name {0:?}")]
    InvalidProtocolName(String),

    #[error("invalid CONNECT flags: {0}")]
    InvalidConnectFlags(&'static str),

    #[error("invalid QoS value {0}")]
    InvalidQos(u8),

    #[error("packet identifier must be non-zero")]
    ZeroPacketId,

    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("topic contains a null character")]
    NullInTopic,

    #[error("topic name {0:?} contains wildcards")]
    WildcardInTopicName(String),

    #[error("{0} carries no topic filters")]
    NoTopicFilters(PacketType),

    #[error("invalid CONNACK return code {0}")]
    InvalidReturnCode(u8),
}
