
use std::fmt;

use serde::{Deserialize, Serialize};
use shared::error::*;

const CANDIDATE_PREFIX: &str = "candidate:";
const ATTRIBUTE_PREFIX: &str = "a=";

/// Represents the type of candidate `CandidateType` enum.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateType {
    #[default]
    #[serde(rename = "unspecified")]
    Unspecified,
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relay,
}

// String makes CandidateType printable
impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
            CandidateType::Unspecified => "Unknown candidate type",
        };
        write!(f, "{s}")
    }
}

impl CandidateType {
    /// Returns the preference weight of a `CandidateType`.
    ///
    /// 4.1.2.2.  Guidelines for Choosing Type and Local Preferences
    /// The RECOMMENDED values are 126 for host candidates, 100
    /// for server reflexive candidates, 110 for peer reflexive candidates,
    /// and 0 for relayed candidates.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay | CandidateType::Unspecified => 0,
        }
    }

    fn from_typ(typ: &str) -> Result<Self> {
        match typ {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            _ => Err(Error::Other(format!(
                "{:?} ({})",
                Error::ErrUnknownCandidateType,
                typ
            ))),
        }
    }
}

/// Convey transport addresses related to the candidate, useful for diagnostics and other purposes.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct CandidateRelatedAddress {
    pub address: String,
    pub port: u16,
}

// String makes CandidateRelatedAddress printable
impl fmt::Display for CandidateRelatedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " related {}:{}", self.address, self.port)
    }
}

/// The fields of one `candidate` attribute.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct CandidateFields {
    pub foundation: String,
    pub component: u16,
    pub network: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    pub related_address: Option<CandidateRelatedAddress>,
    pub tcp_type: Option<String>,
}

impl CandidateFields {
    /// Returns the string representation of the ICECandidate.
    pub fn marshal(&self) -> String {
        let mut val = format!(
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.network,
            self.priority,
            self.address,
            self.port,
            self.candidate_type
        );

        if let Some(tcp_type) = &self.tcp_type {
            val += format!(" tcptype {tcp_type}").as_str();
        }

        if let Some(related_address) = &self.related_address {
            val += format!(
                " raddr {} rport {}",
                related_address.address, related_address.port,
            )
            .as_str();
        }

        val
    }
}

/// Candidate is one local or remote transport address, in its textual
/// attribute form, bound to the media stream identification (mid) it belongs
/// to. It is immutable once built.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Candidate {
    candidate: String,
    mid: String,
}

impl Candidate {
    /// Accepts `a=candidate:...`, `candidate:...` or the bare attribute value.
    pub fn new(candidate: &str, mid: &str) -> Self {
        let trimmed = candidate.trim();
        let value = trimmed.strip_prefix(ATTRIBUTE_PREFIX).unwrap_or(trimmed);
        let value = value.strip_prefix(CANDIDATE_PREFIX).unwrap_or(value);

        Candidate {
            candidate: format!("{CANDIDATE_PREFIX}{value}"),
            mid: mid.to_owned(),
        }
    }

    /// Returns the candidate in its `candidate:...` form.
    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    /// Returns the attribute value, without the `candidate:` prefix.
    pub fn value(&self) -> &str {
        &self.candidate[CANDIDATE_PREFIX.len()..]
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    /// Parses the attribute value into its fields.
    pub fn parse(&self) -> Result<CandidateFields> {
        unmarshal_candidate(self.value())
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ATTRIBUTE_PREFIX}{}", self.candidate)
    }
}

/// Creates CandidateFields from its string representation.
pub fn unmarshal_candidate(raw: &str) -> Result<CandidateFields> {
    let split: Vec<&str> = raw.split_whitespace().collect();
    if split.len() < 8 {
        return Err(Error::Other(format!(
            "{:?} ({})",
            Error::ErrAttributeTooShortIceCandidate,
            split.len()
        )));
    }

    // Foundation
    let foundation = split[0].to_owned();

    // Component
    let component: u16 = split[1].parse()?;

    // Network
    let network = split[2].to_owned();

    // Priority
    let priority: u32 = split[3].parse()?;

    // Address
    let address = split[4].to_owned();

    // Port
    let port: u16 = split[5].parse()?;

    if split[6] != "typ" {
        return Err(Error::ErrParseType);
    }
    let candidate_type = CandidateType::from_typ(split[7])?;

    let mut related_address = None;
    let mut tcp_type = None;

    let mut rest = &split[8..];
    while !rest.is_empty() {
        match rest[0] {
            "raddr" => {
                if rest.len() < 4 || rest[2] != "rport" {
                    return Err(Error::Other(format!(
                        "{:?}: incorrect length",
                        Error::ErrParseRelatedAddr
                    )));
                }

                related_address = Some(CandidateRelatedAddress {
                    address: rest[1].to_owned(),
                    port: rest[3].parse()?,
                });
                rest = &rest[4..];
            }
            "tcptype" => {
                if rest.len() < 2 {
                    return Err(Error::Other(format!(
                        "{:?}: incorrect length",
                        Error::ErrParseType
                    )));
                }

                tcp_type = Some(rest[1].to_owned());
                rest = &rest[2..];
            }
            // Extension attributes (generation, ufrag, network-id, ...) come in pairs.
            _ => rest = &rest[rest.len().min(2)..],
        }
    }

    Ok(CandidateFields {
        foundation,
        component,
        network,
        priority,
        address,
        port,
        candidate_type,
        related_address,
        tcp_type,
    })
}
