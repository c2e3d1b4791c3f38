use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::server::IceServer;

/// Collects the arguments to `IceTransport` construction into a single
/// structure, for future-proofness of the interface.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfiguration {
    /// STUN servers, tried in a shuffled order; the first one that resolves
    /// is handed to the agent.
    #[serde(default)]
    pub servers: Vec<IceServer>,

    /// Local port range for host candidates. `0` on both ends leaves the
    /// choice to the agent.
    #[serde(default)]
    pub port_range_begin: u16,
    #[serde(default)]
    pub port_range_end: u16,

    /// Seed for the server shuffle. Defaults to a time-derived value so the
    /// load spreads across servers between runs.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl IceConfiguration {
    pub(crate) fn shuffle_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default()
        })
    }
}
