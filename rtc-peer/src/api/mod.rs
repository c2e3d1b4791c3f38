
use std::sync::Arc;

use ice::{AgentFactory, LogSink, NoopLogSink};
use shared::error::{Error, Result};

use crate::data_channel::DataChannelFactory;
use crate::peer_connection::PeerConnection;
use crate::peer_connection::configuration::RTCConfiguration;
use crate::transport::{DtlsTransportFactory, SctpTransportFactory};

/// API bundles the collaborators a PeerConnection builds its cascade from:
/// the connectivity agent, the DTLS and SCTP transports and the data
/// channels. Peer connections created from one API share them.
pub struct API {
    pub(crate) agent_factory: Arc<dyn AgentFactory>,
    pub(crate) dtls_transport_factory: Arc<dyn DtlsTransportFactory>,
    pub(crate) sctp_transport_factory: Arc<dyn SctpTransportFactory>,
    pub(crate) data_channel_factory: Arc<dyn DataChannelFactory>,
    pub(crate) log_sink: Arc<dyn LogSink>,
}

impl API {
    /// new_peer_connection creates a new PeerConnection with the provided
    /// configuration against the received API object.
    pub fn new_peer_connection(&self, configuration: RTCConfiguration) -> Result<Arc<PeerConnection>> {
        PeerConnection::new(self, configuration)
    }
}

#[derive(Default)]
pub struct APIBuilder {
    agent_factory: Option<Arc<dyn AgentFactory>>,
    dtls_transport_factory: Option<Arc<dyn DtlsTransportFactory>>,
    sctp_transport_factory: Option<Arc<dyn SctpTransportFactory>>,
    data_channel_factory: Option<Arc<dyn DataChannelFactory>>,
    log_sink: Option<Arc<dyn LogSink>>,
}

impl APIBuilder {
    pub fn new() -> Self {
        APIBuilder::default()
    }

    /// Fails with [`Error::ErrMissingFactory`] unless every factory was provided.
    pub fn build(mut self) -> Result<API> {
        Ok(API {
            agent_factory: self
                .agent_factory
                .take()
                .ok_or(Error::ErrMissingFactory("agent"))?,
            dtls_transport_factory: self
                .dtls_transport_factory
                .take()
                .ok_or(Error::ErrMissingFactory("dtls transport"))?,
            sctp_transport_factory: self
                .sctp_transport_factory
                .take()
                .ok_or(Error::ErrMissingFactory("sctp transport"))?,
            data_channel_factory: self
                .data_channel_factory
                .take()
                .ok_or(Error::ErrMissingFactory("data channel"))?,
            log_sink: if let Some(log_sink) = self.log_sink.take() {
                log_sink
            } else {
                Arc::new(NoopLogSink)
            },
        })
    }

    /// with_agent_factory sets the connectivity agent implementation, e.g. a
    /// `LoopbackNetwork` for in-process peers.
    pub fn with_agent_factory(mut self, agent_factory: Arc<dyn AgentFactory>) -> Self {
        self.agent_factory = Some(agent_factory);
        self
    }

    pub fn with_dtls_transport_factory(
        mut self,
        dtls_transport_factory: Arc<dyn DtlsTransportFactory>,
    ) -> Self {
        self.dtls_transport_factory = Some(dtls_transport_factory);
        self
    }

    pub fn with_sctp_transport_factory(
        mut self,
        sctp_transport_factory: Arc<dyn SctpTransportFactory>,
    ) -> Self {
        self.sctp_transport_factory = Some(sctp_transport_factory);
        self
    }

    pub fn with_data_channel_factory(
        mut self,
        data_channel_factory: Arc<dyn DataChannelFactory>,
    ) -> Self {
        self.data_channel_factory = Some(data_channel_factory);
        self
    }

    /// with_log_sink routes agent diagnostics. Defaults to [`NoopLogSink`].
    pub fn with_log_sink(mut self, log_sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(log_sink);
        self
    }
}
