#[derive(Debug)]
pub enum WeftError {
    InvalidSignature,
    SerializationError,
    DecryptionError,
}

impl From<serde_bare::error::Error> for WeftError {
    fn from(_e: serde_bare::error::Error) -> Self {
        WeftError::SerializationError
    }
}

impl From<ed25519_dalek::ed25519::Error> for WeftError {
    fn from(_e: ed25519_dalek::ed25519::Error) -> Self {
        WeftError::InvalidSignature
    }
}
