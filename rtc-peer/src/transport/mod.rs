//! Seams for the encrypted and multiplexed layers of the cascade. The peer
//! connection builds them through factories once the layer below is ready,
//! and implements their observer traits itself.

pub mod dtls_transport;
pub mod sctp_transport;

pub use dtls_transport::{DtlsTransport, DtlsTransportFactory, EncryptionReadyObserver};
pub use sctp_transport::{MultiplexReadyObserver, SctpTransport, SctpTransportFactory};
