use core::fmt;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use std::convert::From;
use std::error::Error;
use weft::entry::EntryError;
use weft::errors::WeftError;
use weft::log::LogError;
use weft::store::{StoreDelError, StoreGetError, StorePutError};

#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Clone)]
#[repr(u16)]
pub enum ProtocolError {
    CannotSend = 1,
    SignatureInvalid,
    AccessDenied,
    Undecodable,
    NotALeader,
    Timeout,
    Closed,
    NoRoute,
    TransportFatal,
    InvalidState,
    ActorError,
    SerializationError,
    PeerUnknown,
    StoreError,
    NotFound,
    MessageExpired,
    Closing,
}

impl ProtocolError {
    /// Errors that are dropped with a trace log instead of being
    /// surfaced to the caller
    pub fn is_recovered(&self) -> bool {
        matches!(
            self,
            ProtocolError::SignatureInvalid
                | ProtocolError::AccessDenied
                | ProtocolError::Undecodable
                | ProtocolError::MessageExpired
        )
    }
}

impl Error for ProtocolError {}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<WeftError> for ProtocolError {
    fn from(e: WeftError) -> Self {
        match e {
            WeftError::InvalidSignature => ProtocolError::SignatureInvalid,
            WeftError::SerializationError => ProtocolError::SerializationError,
            WeftError::DecryptionError => ProtocolError::Undecodable,
        }
    }
}

impl From<EntryError> for ProtocolError {
    fn from(e: EntryError) -> Self {
        match e {
            EntryError::Undecodable => ProtocolError::Undecodable,
            _ => ProtocolError::SignatureInvalid,
        }
    }
}

impl From<LogError> for ProtocolError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::InvalidSignature => ProtocolError::SignatureInvalid,
            LogError::PermissionDenied => ProtocolError::AccessDenied,
            LogError::Undecodable => ProtocolError::Undecodable,
            LogError::SerializationError => ProtocolError::SerializationError,
        }
    }
}

impl From<StoreGetError> for ProtocolError {
    fn from(e: StoreGetError) -> Self {
        match e {
            StoreGetError::NotFound => ProtocolError::NotFound,
            _ => ProtocolError::StoreError,
        }
    }
}

impl From<StorePutError> for ProtocolError {
    fn from(_e: StorePutError) -> Self {
        ProtocolError::StoreError
    }
}

impl From<StoreDelError> for ProtocolError {
    fn from(e: StoreDelError) -> Self {
        match e {
            StoreDelError::NotFound => ProtocolError::NotFound,
            _ => ProtocolError::StoreError,
        }
    }
}

impl From<serde_bare::error::Error> for ProtocolError {
    fn from(_e: serde_bare::error::Error) -> Self {
        ProtocolError::SerializationError
    }
}
