use ice::IceConfiguration;
use ice::server::IceServer;

use crate::peer_connection::certificate::Certificate;

/// SCTP port announced and used when the remote description carries none.
pub const DEFAULT_SCTP_PORT: u16 = 5000;

/// A Configuration defines how a PeerConnection establishes connectivity and
/// identifies itself. It is read-only once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RTCConfiguration {
    /// ice holds the STUN servers, the local port range and the seed used to
    /// pick a server.
    pub(crate) ice: IceConfiguration,

    /// certificate authenticates the local peer during the DTLS handshake. If
    /// absent, one is generated for each PeerConnection.
    pub(crate) certificate: Option<Certificate>,

    /// sctp_port is announced with `a=sctp-port` until a remote description
    /// overrides it.
    pub(crate) sctp_port: u16,
}

impl Default for RTCConfiguration {
    fn default() -> Self {
        RTCConfiguration {
            ice: IceConfiguration::default(),
            certificate: None,
            sctp_port: DEFAULT_SCTP_PORT,
        }
    }
}

impl RTCConfiguration {
    pub fn ice(&self) -> &IceConfiguration {
        &self.ice
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    pub fn sctp_port(&self) -> u16 {
        self.sctp_port
    }
}

#[derive(Default)]
pub struct RTCConfigurationBuilder {
    configuration: RTCConfiguration,
}

impl RTCConfigurationBuilder {
    pub fn new() -> Self {
        RTCConfigurationBuilder::default()
    }

    /// Replaces the ICE part wholesale, e.g. with one loaded from a file.
    pub fn with_ice_configuration(mut self, ice: IceConfiguration) -> Self {
        self.configuration.ice = ice;
        self
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServer>) -> Self {
        self.configuration.ice.servers = ice_servers;
        self
    }

    pub fn with_port_range(mut self, begin: u16, end: u16) -> Self {
        self.configuration.ice.port_range_begin = begin;
        self.configuration.ice.port_range_end = end;
        self
    }

    /// Fixes the seed of the STUN server shuffle.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.configuration.ice.seed = Some(seed);
        self
    }

    pub fn with_certificate(mut self, certificate: Certificate) -> Self {
        self.configuration.certificate = Some(certificate);
        self
    }

    pub fn with_sctp_port(mut self, sctp_port: u16) -> Self {
        self.configuration.sctp_port = sctp_port;
        self
    }

    pub fn build(self) -> RTCConfiguration {
        self.configuration
    }
}
