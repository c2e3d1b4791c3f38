use std::sync::Arc;

use shared::error::Result;
use shared::message::{Message, Reliability};

use crate::transport::SctpTransport;

/// First payload byte of a DATA_CHANNEL_OPEN control message.
/// <https://tools.ietf.org/html/draft-ietf-rtcweb-data-protocol-09#section-8.2.1>
pub const DATA_CHANNEL_OPEN: u8 = 0x03;

/// First payload byte of a DATA_CHANNEL_ACK control message.
pub const DATA_CHANNEL_ACK: u8 = 0x02;

/// Callback fired once a data channel is open.
pub type OnOpenHdlrFn = Box<dyn Fn() + Send + Sync>;

/// One logical channel bound to an SCTP stream. Buffering, flow control and
/// the open handshake belong to the implementation.
pub trait DataChannel: Send + Sync {
    fn stream(&self) -> u16;

    fn label(&self) -> String;

    fn protocol(&self) -> String;

    /// Opens the channel over `transport`. Opening an open channel is a no-op.
    fn open(&self, transport: Arc<dyn SctpTransport>);

    /// Sets the callback fired when the channel opens. The last registration wins.
    fn on_open(&self, f: OnOpenHdlrFn);

    /// Feeds one inbound message of this channel's stream.
    fn incoming(&self, message: Message);

    /// Returns false if the channel is not open.
    fn send(&self, message: Message) -> bool;
}

pub trait DataChannelFactory: Send + Sync {
    /// A channel created locally, not yet bound to a transport.
    fn new_data_channel(
        &self,
        stream: u16,
        label: &str,
        protocol: &str,
        reliability: Reliability,
    ) -> Result<Arc<dyn DataChannel>>;

    /// A channel the remote peer is opening on `stream`. Its label and
    /// protocol come from the open message it is about to receive.
    fn accept_data_channel(
        &self,
        stream: u16,
        transport: Arc<dyn SctpTransport>,
    ) -> Result<Arc<dyn DataChannel>>;
}
