use std::sync::{Arc, Weak};

use shared::error::Result;
use shared::message::{Message, MessageObserver};

use super::dtls_transport::DtlsTransport;

pub trait MultiplexReadyObserver: Send + Sync {
    /// The association is established and streams can be opened.
    fn on_multiplex_ready(&self);
}

/// Reliable multiplexed stream transport. Messages carry their stream id.
pub trait SctpTransport: Send + Sync {
    fn send(&self, message: Message) -> bool;

    /// Resets `stream` in both directions.
    fn reset(&self, stream: u16);

    fn is_ready(&self) -> bool;
}

pub trait SctpTransportFactory: Send + Sync {
    /// Starts an association on `port` over `lower`. Inbound messages of every
    /// stream go to `receiver`. The observers may be called before this returns.
    fn new_sctp_transport(
        &self,
        lower: Arc<dyn DtlsTransport>,
        port: u16,
        observer: Weak<dyn MultiplexReadyObserver>,
        receiver: Weak<dyn MessageObserver>,
    ) -> Result<Arc<dyn SctpTransport>>;
}
