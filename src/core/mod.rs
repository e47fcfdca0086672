//! # Core Protocol Components
//!
//! The ICP message type and the two codecs that read and write it.
//!
//! ## Components
//! - **Message**: logical content of one ICP v2 datagram
//! - **WireCodec**: eager decode into a `Message`, and encode
//! - **LazyView**: parse-on-demand view with in-place query-to-response
//!   rewriting
//!
//! ## Wire Format
//! ```text
//! [Opcode(1)] [Version(1)] [Length(2)] [RequestNumber(4)] [Options(4)]
//! [OptionData(4)] [Sender(4)] [Requester(4), QUERY only] [URL\0]
//! [PayloadLength(2) Payload(N), HIT_OBJ only]
//! ```
//!
//! ## Limits
//! - Maximum datagram size: 1450 bytes
//! - Decoding never reads past the buffer; short input is `Malformed`

pub mod codec;
pub mod lazy;
pub mod message;
