
use std::fmt;

/// State of the single data component, as reported by the agent.
/// Gathering may overlap with connectivity checks.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No activity yet, or the path was lost.
    #[default]
    Disconnected,

    /// Agent is gathering local candidates.
    Gathering,

    /// Agent has been given remote candidates and is checking pairs.
    Connecting,

    /// A pair has been validated; the component can carry data.
    Connected,

    /// Connectivity checks failed for every pair.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Disconnected => "Disconnected",
            Self::Gathering => "Gathering",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Gathering,
            2 => Self::Connecting,
            3 => Self::Connected,
            4 => Self::Failed,
            _ => Self::Disconnected,
        }
    }
}

impl From<ConnectionState> for u8 {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => 0,
            ConnectionState::Gathering => 1,
            ConnectionState::Connecting => 2,
            ConnectionState::Connected => 3,
            ConnectionState::Failed => 4,
        }
    }
}
