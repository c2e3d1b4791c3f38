use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shared::error::{Error, Result};

/// Role carried by the `a=setup` attribute. It decides which side starts the
/// DTLS handshake and which parity of SCTP stream ids a side allocates from.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "passive")]
    Passive,
    #[default]
    #[serde(rename = "actpass")]
    ActPass,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Role::Active => "active",
            Role::Passive => "passive",
            Role::ActPass => "actpass",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "active" => Ok(Role::Active),
            "passive" => Ok(Role::Passive),
            "actpass" => Ok(Role::ActPass),
            other => Err(Error::ErrInvalidRole(other.to_owned())),
        }
    }
}

impl Role {
    /// <https://tools.ietf.org/html/draft-ietf-rtcweb-data-protocol-09#section-6>
    /// The active side must use streams with even identifiers, whereas the
    /// passive side must use streams with odd identifiers. A side still in
    /// actpass never initiated, so it allocates like the passive side.
    pub fn stream_parity(self) -> u16 {
        match self {
            Role::Active => 0,
            Role::Passive | Role::ActPass => 1,
        }
    }

    /// Parity of the stream ids the remote party allocates from.
    pub fn remote_stream_parity(self) -> u16 {
        1 - self.stream_parity()
    }

    /// Resolves the local role from the role announced by the remote party.
    /// Only an undecided local side changes.
    pub fn resolve(self, remote: Role) -> Role {
        match (self, remote) {
            (Role::ActPass, Role::Active) => Role::Passive,
            (Role::ActPass, Role::Passive) => Role::Active,
            (local, _) => local,
        }
    }
}
