//! # ICP Protocol
//!
//! Internet Cache Protocol (ICP v2, RFC 2186/2187) for cache peers: a UDP
//! request/response protocol for asking "do you have this URL?" and
//! answering HIT, MISS or ERROR.
//!
//! ## Layout
//! - [`core`]: message type, eager codec, lazy in-place codec
//! - [`protocol`]: response/query builders, handler dispatch
//! - [`transport`]: UDP listener loop
//! - [`service`]: collaborator traits and the responder coordinator
//! - [`config`], [`error`], [`utils`]: ambient configuration, errors,
//!   rate limiting, watchdog, metrics and logging
//!
//! ## Example
//! ```rust
//! use icp_protocol::{QueryBuilder, ResponseBuilder, WireCodec};
//! use std::net::Ipv4Addr;
//!
//! let query = QueryBuilder::new().query(Ipv4Addr::LOCALHOST, "http://example.org/");
//! let response = ResponseBuilder::new().miss_no_fetch(&query).unwrap();
//! assert_eq!(response.length(), query.length() - 4);
//!
//! let codec = WireCodec::new();
//! let bytes = codec.encode(&response).unwrap();
//! assert_eq!(codec.decode(&bytes).unwrap(), response);
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::{IcpConfig, IcpSection, LoggingConfig};
pub use crate::core::codec::{Codec, WireCodec};
pub use crate::core::lazy::{LazyCodec, LazyView};
pub use crate::core::message::{
    compute_length, Message, Opcode, FLAG_HIT_OBJ, FLAG_SRC_RTT, ICP_PORT, ICP_VERSION,
    MAX_DATAGRAM_SIZE,
};
pub use crate::error::{FrameError, IcpError, Result};
pub use crate::protocol::builder::{QueryBuilder, ResponseBuilder};
pub use crate::protocol::dispatcher::{DispatchReport, HandlerId, MessageHandler};
pub use crate::service::collaborators::{
    Authorizer, CacheLookup, NoopWatchdog, PortRegistry, RateLimiter, ResourceManager, Watchdog,
};
pub use crate::service::coordinator::{Collaborators, IcpCoordinator, QueryResponder};
pub use crate::transport::udp::{Listener, ListenerHandle, ListenerOptions};
