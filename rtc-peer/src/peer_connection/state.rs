use std::fmt;

/// Progress of a PeerConnection through its transport cascade. It only moves
/// forward; a stage that fails leaves the connection where it stopped.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum PeerConnectionState {
    /// No transport exists yet.
    #[default]
    Idle,

    /// The ICE transport is gathering candidates and checking pairs.
    AwaitingConnectivity,

    /// The DTLS handshake is running over the validated ICE path.
    AwaitingEncryption,

    /// The SCTP association is being established.
    AwaitingMultiplexing,

    /// Data channels can be opened and carry messages.
    Operational,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            PeerConnectionState::Idle => "idle",
            PeerConnectionState::AwaitingConnectivity => "awaiting-connectivity",
            PeerConnectionState::AwaitingEncryption => "awaiting-encryption",
            PeerConnectionState::AwaitingMultiplexing => "awaiting-multiplexing",
            PeerConnectionState::Operational => "operational",
        };
        write!(f, "{s}")
    }
}
