use thiserror::Error;

use crate::MAX_PIPE_MSG_LEN;

/// Errors produced by the tunnel manager core.
///
/// A registry miss is deliberately *not* represented here: callers
/// branch on `Option` to decide between reusing a tunnel and creating
/// one. `Fatal` marks conditions the manager cannot continue from; it
/// is surfaced to the process supervisor rather than aborting inside
/// library code.
#[derive(Debug, Error)]
pub enum SdpError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("message exceeds {limit} bytes")]
    MessageTooLarge { limit: usize },

    #[error("no stanza resolves service id {0}")]
    ServiceNotFound(u32),

    #[error("stanza for service id {0} has no gateway address")]
    ServiceUnresolved(u32),

    #[error("registry already holds an entry for key {0}")]
    DuplicateKey(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("gave up connecting to {gateway} after {attempts} attempts")]
    RetriesExhausted { gateway: String, attempts: u32 },

    /// Unrecoverable. Reserved for the process supervisor; library
    /// code reports it and stops, it never aborts.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SdpError {
    /// Shorthand for the pipe-message size cap.
    pub fn message_too_large() -> Self {
        SdpError::MessageTooLarge {
            limit: MAX_PIPE_MSG_LEN,
        }
    }
}

pub type SdpResult<T> = Result<T, SdpError>;
