//! Error taxonomy shared by the store, feeder, session, and protocol layers.

use thiserror::Error;

/// Every fallible operation in the daemon returns this. Variants line up
/// with the error taxonomy in the design notes: invalid input never
/// retried, not-found that a caller may wait-and-retry, idempotent replay
/// rejection, corrupted state, backend failure, and protocol-level faults.
#[derive(Error, Debug)]
pub enum JalError {
    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("not found")]
    NotFound,

    #[error("serial id out of sequence")]
    OutOfSequence,

    #[error("already confirmed")]
    AlreadyConfirmed,

    #[error("corrupted state: {0}")]
    Corrupted(String),

    #[error("store backend error: {0}")]
    Store(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("wire encoding error: {0}")]
    WireEncoding(#[from] postcard::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer disconnected")]
    Disconnected,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, JalError>;

impl JalError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        JalError::Invalid(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        JalError::Corrupted(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        JalError::Protocol(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(JalError::NotFound.to_string(), "not found");
        assert_eq!(
            JalError::invalid("missing system metadata").to_string(),
            "invalid input: missing system metadata"
        );
    }
}
