use std::sync::{Arc, Weak};

use ice::IceTransport;
use shared::error::Result;
use shared::message::{Message, MessageObserver};

use crate::peer_connection::certificate::Certificate;

/// Observes the DTLS handshake running over an `IceTransport`.
pub trait EncryptionReadyObserver: Send + Sync {
    /// Called once the remote certificate is known. Returning false aborts
    /// the handshake; no application data is carried afterwards.
    fn verify_fingerprint(&self, fingerprint: &str) -> bool;

    /// The handshake completed and the fingerprint was accepted.
    fn on_encryption_ready(&self);
}

/// Encrypted datagram transport.
pub trait DtlsTransport: Send + Sync {
    /// Returns false until the handshake is complete.
    fn send(&self, message: Message) -> bool;

    /// Registers the receiver of decrypted datagrams. The last registration wins.
    fn on_message(&self, receiver: Weak<dyn MessageObserver>);
}

pub trait DtlsTransportFactory: Send + Sync {
    /// Starts a handshake over `lower`, authenticating with `certificate`.
    /// The observer may be called before this returns.
    fn new_dtls_transport(
        &self,
        lower: Arc<IceTransport>,
        certificate: &Certificate,
        observer: Weak<dyn EncryptionReadyObserver>,
    ) -> Result<Arc<dyn DtlsTransport>>;
}
