#![allow(dead_code)]

use std::io;
use std::num::ParseIntError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //Initialization errors
    #[error("ice: failed to create the connectivity agent: {0}")]
    ErrAgentCreate(String),
    #[error("ice: failed to start the agent event loop")]
    ErrEventLoopCreate,
    #[error("ice: failed to add a stream")]
    ErrAddStream,
    #[error("api: no {0} factory configured")]
    ErrMissingFactory(&'static str),

    //Protocol errors
    #[error("sdp: unable to parse remote description: {0}")]
    ErrParseRemoteDescription(String),
    #[error("sdp: malformed line {0:?}")]
    ErrMalformedSdpLine(String),
    #[error("sdp: invalid setup role {0:?}")]
    ErrInvalidRole(String),
    #[error("sdp: invalid sctp-port {0:?}")]
    ErrInvalidSctpPort(String),
    #[error("sdp: remote description conflicts with the one already applied")]
    ErrConflictingRemoteDescription,

    //Operation errors
    #[error("ice: candidate gathering already started")]
    ErrGatheringAlreadyStarted,
    #[error("ice: unable to gather local candidates: {0}")]
    ErrGatherCandidates(String),
    #[error("ice: no validated candidate pair")]
    ErrNoValidatedPair,

    //Resource errors
    #[error("datachannel: no stream id left for a new data channel")]
    ErrMaxDataChannels,

    //ICE candidate errors
    #[error("attribute not long enough to be ICE candidate")]
    ErrAttributeTooShortIceCandidate,
    #[error("could not parse related addresses")]
    ErrParseRelatedAddr,
    #[error("could not parse type")]
    ErrParseType,
    #[error("unknown candidate type")]
    ErrUnknownCandidateType,

    //STUN errors
    #[error("stun: {0}")]
    ErrStun(String),

    //ICE server errors
    #[error("unknown scheme type")]
    ErrSchemeType,
    #[error("invalid hostname")]
    ErrHost,
    #[error("failed to parse address")]
    ErrAddressParseFailed,

    //Third Party Error
    #[error("{0}")]
    RcGen(#[from] rcgen::Error),
    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("mutex poison: {0}")]
    PoisonError(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The agent, its event loop or its stream could not be set up; the
    /// instance being constructed is unusable.
    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            Error::ErrAgentCreate(_)
                | Error::ErrEventLoopCreate
                | Error::ErrAddStream
                | Error::ErrMissingFactory(_)
                | Error::RcGen(_)
        )
    }

    /// Malformed remote text. Retrying with the same input will fail again.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::ErrParseRemoteDescription(_)
                | Error::ErrMalformedSdpLine(_)
                | Error::ErrInvalidRole(_)
                | Error::ErrInvalidSctpPort(_)
                | Error::ErrConflictingRemoteDescription
        )
    }

    /// An operation was invoked outside of its valid state.
    pub fn is_operation(&self) -> bool {
        matches!(
            self,
            Error::ErrGatheringAlreadyStarted
                | Error::ErrGatherCandidates(_)
                | Error::ErrNoValidatedPair
        )
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Error::ErrMaxDataChannels)
    }
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::PoisonError(e.to_string())
    }
}
