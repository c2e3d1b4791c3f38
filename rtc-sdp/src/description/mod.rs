
use std::fmt;

use crate::role::Role;
use shared::error::{Error, Result};

pub const ATTR_KEY_SETUP: &str = "setup";
pub const ATTR_KEY_FINGERPRINT: &str = "fingerprint";
pub const ATTR_KEY_SCTP_PORT: &str = "sctp-port";
pub const ATTR_KEY_CANDIDATE: &str = "candidate";
pub const ATTR_KEY_ICE_UFRAG: &str = "ice-ufrag";
pub const ATTR_KEY_ICE_PWD: &str = "ice-pwd";

/// Hash algorithm announced with `a=fingerprint`.
pub const FINGERPRINT_ALGORITHM: &str = "sha-256";

const END_LINE: &str = "\r\n";

/// Description is the subset of a session description the peer connection
/// reads and writes: the setup role, the certificate fingerprint and the SCTP
/// port. Every other line is carried through untouched, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    role: Role,
    fingerprint: Option<String>,
    sctp_port: Option<u16>,
    lines: Vec<String>,
}

impl Description {
    /// Parses `sdp`. `role` is used unless the text carries an `a=setup` line.
    pub fn new(role: Role, sdp: &str) -> Result<Self> {
        let mut description = Description {
            role,
            fingerprint: None,
            sctp_port: None,
            lines: vec![],
        };

        for raw in sdp.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if !is_sdp_line(line) {
                return Err(Error::ErrMalformedSdpLine(line.to_owned()));
            }

            match split_attribute(line) {
                Some((ATTR_KEY_SETUP, value)) => {
                    description.role = value.parse()?;
                }
                Some((ATTR_KEY_FINGERPRINT, value)) => {
                    // a=fingerprint:sha-256 AB:CD:...
                    let value = value
                        .split_once(' ')
                        .map(|(_, fingerprint)| fingerprint)
                        .unwrap_or(value)
                        .trim();
                    if value.is_empty() {
                        return Err(Error::ErrMalformedSdpLine(line.to_owned()));
                    }
                    description.fingerprint = Some(value.to_owned());
                }
                Some((ATTR_KEY_SCTP_PORT, value)) => {
                    let port = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|_| Error::ErrInvalidSctpPort(value.to_owned()))?;
                    description.sctp_port = Some(port);
                }
                _ => description.lines.push(line.to_owned()),
            }
        }

        Ok(description)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    /// Returns the fingerprint value, without the hash algorithm prefix.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn set_fingerprint(&mut self, fingerprint: String) {
        self.fingerprint = Some(fingerprint);
    }

    pub fn sctp_port(&self) -> Option<u16> {
        self.sctp_port
    }

    pub fn set_sctp_port(&mut self, port: u16) {
        self.sctp_port = Some(port);
    }

    /// Returns the `a=candidate` lines carried by the description.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|line| matches!(split_attribute(line), Some((ATTR_KEY_CANDIDATE, _))))
            .map(String::as_str)
    }

    pub fn ice_ufrag(&self) -> Option<&str> {
        self.attribute(ATTR_KEY_ICE_UFRAG)
    }

    pub fn ice_pwd(&self) -> Option<&str> {
        self.attribute(ATTR_KEY_ICE_PWD)
    }

    /// Returns the value of the first `a=<key>:<value>` line that is not one
    /// of the attributes modelled explicitly.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .filter_map(|line| split_attribute(line))
            .find(|(k, _)| *k == key)
            .map(|(_, value)| value)
    }
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            write!(f, "{line}{END_LINE}")?;
        }
        write!(f, "a={ATTR_KEY_SETUP}:{}{END_LINE}", self.role)?;
        if let Some(fingerprint) = &self.fingerprint {
            write!(
                f,
                "a={ATTR_KEY_FINGERPRINT}:{FINGERPRINT_ALGORITHM} {fingerprint}{END_LINE}"
            )?;
        }
        if let Some(port) = self.sctp_port {
            write!(f, "a={ATTR_KEY_SCTP_PORT}:{port}{END_LINE}")?;
        }
        Ok(())
    }
}

// <type>=<value>, where <type> is exactly one case-significant character.
fn is_sdp_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b'='
}

fn split_attribute(line: &str) -> Option<(&str, &str)> {
    let attribute = line.strip_prefix("a=")?;
    Some(attribute.split_once(':').unwrap_or((attribute, "")))
}
