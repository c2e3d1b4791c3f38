use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    #[default]
    Binary,
    String,
    Control,
    Reset,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum ReliabilityType {
    #[default]
    Reliable = 0,
    Rexmit,
    Timed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reliability {
    // It true, the channel does not enforce message ordering and out-of-order delivery is allowed
    pub unordered: bool,

    // If both max_packet_life_time or max_retransmits are unset, the channel is reliable.
    // If either max_packet_life_time or max_retransmits is set, the channel is unreliable.
    pub max_packet_life_time: Option<Duration>,
    pub max_retransmits: Option<usize>,
}

impl Reliability {
    pub fn reliability_type(&self) -> ReliabilityType {
        if self.max_retransmits.is_some() {
            ReliabilityType::Rexmit
        } else if self.max_packet_life_time.is_some() {
            ReliabilityType::Timed
        } else {
            ReliabilityType::Reliable
        }
    }
}

/// A unit of data crossing a transport boundary. The payload is owned, so the
/// producer is free to reuse its buffers once the message is built.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub stream: u16, // Stream id (SCTP stream)
    pub reliability: Option<Arc<Reliability>>,
    pub payload: Bytes,
}

impl Message {
    /// Copies `data` into a binary message on stream 0.
    pub fn from_slice(data: &[u8]) -> Self {
        Message {
            payload: Bytes::copy_from_slice(data),
            ..Default::default()
        }
    }

    pub fn new(message_type: MessageType, stream: u16, payload: impl Into<Bytes>) -> Self {
        Message {
            message_type,
            stream,
            reliability: None,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// First byte of the payload; for control messages this is the opcode.
    pub fn first_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Receives messages from a transport. Transports keep observers as weak
/// references and skip delivery once the observer is gone.
pub trait MessageObserver: Send + Sync {
    fn on_message(&self, message: Message);
}
