use std::{io, time::Duration};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

/**
 * Everything that can go wrong between submitting a command and draining its reply
 */
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /** Malformed line, unknown prefix or an error-typed reply; the raw line is kept */
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Precondition failed: {0}")]
    Precondition(&'static str),

    #[error("Unsafe command argument rejected: {0:?}")]
    FormatRejected(String),

    #[error("Invalid Redis URL: {0}")]
    InvalidUri(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl ChannelError {
    /** Reply rejected by the decoder or an error-typed reply */
    pub fn is_protocol(&self) -> bool {
        matches!(self, ChannelError::Protocol(_))
    }
}
