//! # Error Types
//!
//! Error handling for the ICP engine.
//!
//! ## Error Categories
//! - **Decode Errors**: truncated datagrams, invalid opcodes, broken URLs.
//!   Always local to one datagram; the listener logs them and moves on.
//! - **Protocol Errors**: response preconditions violated by the caller
//!   (answering a non-query, SRC_RTT not requested, missing payload).
//! - **Unsupported**: an in-place rewrite asked for an opcode the lazy view
//!   cannot produce.
//! - **I/O and Lifecycle Errors**: socket failures, port reservation,
//!   start/stop misuse, configuration problems.
//!
//! ## Example Usage
//! ```rust
//! use icp_protocol::core::codec::WireCodec;
//! use icp_protocol::error::IcpError;
//! use tracing::debug;
//!
//! let codec = WireCodec::new();
//! match codec.decode(&[0xFF, 2, 0, 0]) {
//!     Err(IcpError::Malformed(reason)) => debug!(%reason, "Dropping datagram"),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use crate::core::message::Opcode;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    pub const ERR_HANDLERS_LOCK: &str = "Failed to acquire lock on handler registry";
    pub const ERR_RATE_LIMITER_LOCK: &str = "Failed to acquire lock on rate limiter";
}

/// Why a byte sequence is not (or cannot become) a valid ICP frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid opcode: {0}")]
    InvalidOpcode(u8),

    #[error("unexpected end of data while reading {field}")]
    Truncated { field: &'static str },

    #[error("payload URL is not NUL-terminated")]
    UnterminatedUrl,

    #[error("payload URL contains non-ASCII bytes")]
    NonAsciiUrl,

    #[error("payload URL contains a NUL byte")]
    EmbeddedNul,
}

/// IcpError is the primary error type for all ICP operations
#[derive(Error, Debug)]
pub enum IcpError {
    #[error("malformed ICP datagram: {0}")]
    Malformed(#[from] FrameError),

    #[error("{0} is not a query; responses can only be built from ICP_OP_QUERY")]
    NotAQuery(Opcode),

    #[error("query does not request the source return trip time")]
    SrcRttNotRequested,

    #[error("HIT_OBJ response requires a payload object")]
    NilPayload,

    #[error("in-place response to {0} is not supported")]
    Unsupported(Opcode),

    #[error("message too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("UDP port {0} is not available")]
    PortUnavailable(u16),

    #[error("ICP listener is not running")]
    NotRunning,

    #[error("ICP listener is already running")]
    AlreadyRunning,

    #[error("Synchronization primitive poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("Invalid rate limit: {0}")]
    InvalidRateLimit(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl IcpError {
    /// Whether this error is a protocol-level failure while building a
    /// response, as opposed to an I/O or lifecycle failure.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            IcpError::Malformed(_)
                | IcpError::NotAQuery(_)
                | IcpError::SrcRttNotRequested
                | IcpError::NilPayload
                | IcpError::Unsupported(_)
                | IcpError::PayloadTooLarge(_)
        )
    }
}

/// Type alias for Results using IcpError
pub type Result<T> = std::result::Result<T, IcpError>;
