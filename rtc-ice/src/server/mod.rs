
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use shared::error::{Error, Result};

/// STUN UDP port
pub const DEFAULT_STUN_PORT: &str = "3478";

const SCHEME_STUN: &str = "stun";

/// A STUN server the agent may use to discover server reflexive candidates.
/// An empty `service` means [`DEFAULT_STUN_PORT`].
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub hostname: String,
    #[serde(default)]
    pub service: String,
}

impl IceServer {
    pub fn new(hostname: &str, service: &str) -> Self {
        IceServer {
            hostname: hostname.to_owned(),
            service: service.to_owned(),
        }
    }

    fn port(&self) -> Result<u16> {
        let service = if self.service.is_empty() {
            DEFAULT_STUN_PORT
        } else {
            self.service.as_str()
        };
        Ok(service.parse()?)
    }
}

impl fmt::Display for IceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.service.is_empty() {
            write!(f, "{SCHEME_STUN}:{}", self.hostname)
        } else {
            write!(f, "{SCHEME_STUN}:{}:{}", self.hostname, self.service)
        }
    }
}

/// Parses `stun:host[:port]` or `host[:port]`.
impl FromStr for IceServer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = match s.split_once(':') {
            Some((scheme, rest)) if !scheme.contains('.') && rest.parse::<u16>().is_err() => {
                if scheme != SCHEME_STUN {
                    return Err(Error::ErrSchemeType);
                }
                rest
            }
            _ => s,
        };

        let (hostname, service) = rest.split_once(':').unwrap_or((rest, ""));
        if hostname.is_empty() {
            return Err(Error::ErrHost);
        }
        if !service.is_empty() {
            service.parse::<u16>()?;
        }

        Ok(IceServer::new(hostname, service))
    }
}

/// Shuffles `servers` with a generator seeded by `seed`, then resolves them in
/// order and returns the first address found. Entries without a hostname,
/// with an invalid port or that fail to resolve are skipped.
pub fn select_stun_server<F>(servers: &[IceServer], seed: u64, mut resolve: F) -> Option<SocketAddr>
where
    F: FnMut(&str, u16) -> Result<SocketAddr>,
{
    let mut servers = servers.to_vec();
    servers.shuffle(&mut StdRng::seed_from_u64(seed));

    for server in &servers {
        if server.hostname.is_empty() {
            continue;
        }

        let port = match server.port() {
            Ok(port) => port,
            Err(err) => {
                log::warn!("skipping STUN server {server}: {err}");
                continue;
            }
        };

        match resolve(&server.hostname, port) {
            Ok(addr) => {
                log::debug!("using STUN server {server} at {addr}");
                return Some(addr);
            }
            Err(err) => log::debug!("unable to resolve STUN server {server}: {err}"),
        }
    }

    None
}
