//! sdpc-proto: Shared protocol library for the SDP client tunnel manager.
//!
//! Provides the JSON action message vocabulary, the codec, protocol
//! limits, and the error type shared by every sdpc crate.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, decode_value, encode, encode_message};
pub use error::{SdpError, SdpResult};
pub use messages::{Action, ProtocolMessage};

/// Maximum identity token length in bytes.
pub const ID_TOKEN_MAX_LEN: usize = 2048;

/// Maximum size of a single pipe/control message in bytes.
pub const MAX_PIPE_MSG_LEN: usize = 65536;

/// Default gateway tunnel port.
pub const TUNNEL_PORT: u16 = 8282;

/// Connection attempts before a tunnel is abandoned.
pub const MAX_CON_ATTEMPTS: u32 = 5;

/// Base retry delay in seconds; attempt N+1 waits `base * N`.
pub const INITIAL_RETRY_DELAY_SECS: u64 = 1;
