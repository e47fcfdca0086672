//! Eager ICP wire codec.
//!
//! ## Wire Format
//! ```text
//! offset 0   : opcode         (1)
//! offset 1   : version        (1)
//! offset 2   : length         (2, unsigned)
//! offset 4   : request number (4)
//! offset 8   : options        (4)
//! offset 12  : option data    (4)
//! offset 16  : sender IP      (4)
//! offset 20  : requester IP   (4)     QUERY only
//! offset 20/24 : URL, ASCII, NUL-terminated
//! then, HIT_OBJ only:
//!              payload length (2)
//!              payload object (payload length bytes)
//! ```
//! All integers are big-endian.

use crate::core::message::{compute_length, Message, Opcode, MAX_DATAGRAM_SIZE};
use crate::error::{FrameError, IcpError, Result};
use crate::protocol::builder::ResponseBuilder;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddr};

/// Common contract of the ICP codecs.
///
/// [`WireCodec`] materializes every field into a [`Message`]; the lazy codec
/// keeps the received buffer and parses on demand. Callers pick one based on
/// throughput needs and drive it through this trait.
pub trait Codec {
    /// Decoded representation of a datagram.
    type Message;

    /// Decode a received datagram, recording its transport origin.
    fn decode_datagram(
        &self,
        datagram: BytesMut,
        source: Option<SocketAddr>,
    ) -> Result<Self::Message>;

    /// Produce the bytes to put on the wire.
    fn encode_message(&self, message: &Self::Message) -> Result<Bytes>;

    /// Turn a decoded query into the plain response `opcode`
    /// (DENIED, ERR, HIT, MISS or MISS_NOFETCH, without options).
    ///
    /// Implementations that cannot produce `opcode` return
    /// [`IcpError::Unsupported`].
    fn respond(&self, query: Self::Message, opcode: Opcode) -> Result<Self::Message>;
}

/// Eager encoder/decoder between bytes and [`Message`]. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl WireCodec {
    pub fn new() -> Self {
        Self
    }

    /// Decode a datagram into a [`Message`] without transport information.
    pub fn decode(&self, datagram: &[u8]) -> Result<Message> {
        decode_fields(datagram).map_err(IcpError::Malformed)
    }

    /// Decode a datagram received from `source`.
    pub fn decode_from(&self, datagram: &[u8], source: SocketAddr) -> Result<Message> {
        Ok(self.decode(datagram)?.with_source(source))
    }

    /// Encode `message` into a new buffer.
    pub fn encode(&self, message: &Message) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(message.length() as usize);
        self.encode_into(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the wire form of `message` to `buf`.
    pub fn encode_into(&self, message: &Message, buf: &mut BytesMut) -> Result<()> {
        let url = message.payload_url().as_bytes();
        if !url.is_ascii() {
            return Err(FrameError::NonAsciiUrl.into());
        }
        if url.contains(&0) {
            return Err(FrameError::EmbeddedNul.into());
        }
        let payload = message.payload_object().unwrap_or_default();
        if payload.len() > u16::MAX as usize {
            return Err(IcpError::PayloadTooLarge(payload.len()));
        }
        let length = compute_length(message);
        if length > u16::MAX as usize {
            return Err(IcpError::PayloadTooLarge(length));
        }

        buf.reserve(length);
        buf.put_u8(message.opcode().as_u8());
        buf.put_u8(message.version());
        buf.put_u16(message.length());
        buf.put_u32(message.request_number());
        buf.put_u32(message.options());
        buf.put_u32(message.option_data());
        buf.put_slice(&message.sender().octets());
        if let Some(requester) = message.requester() {
            buf.put_slice(&requester.octets());
        }
        buf.put_slice(url);
        buf.put_u8(0);
        if message.opcode() == Opcode::HitObj {
            buf.put_u16(message.payload_object_length().unwrap_or_default());
            buf.put_slice(payload);
        }
        Ok(())
    }

    /// Encode and check the result against the datagram size limit.
    pub fn encode_datagram(&self, message: &Message, max_size: usize) -> Result<Bytes> {
        let bytes = self.encode(message)?;
        if bytes.len() > max_size.min(MAX_DATAGRAM_SIZE) {
            return Err(IcpError::PayloadTooLarge(bytes.len()));
        }
        Ok(bytes)
    }
}

impl Codec for WireCodec {
    type Message = Message;

    fn decode_datagram(&self, datagram: BytesMut, source: Option<SocketAddr>) -> Result<Message> {
        let message = self.decode(&datagram)?;
        Ok(match source {
            Some(source) => message.with_source(source),
            None => message,
        })
    }

    fn encode_message(&self, message: &Message) -> Result<Bytes> {
        self.encode(message)
    }

    fn respond(&self, query: Message, opcode: Opcode) -> Result<Message> {
        ResponseBuilder::new().respond(&query, opcode)
    }
}

fn decode_fields(mut buf: &[u8]) -> std::result::Result<Message, FrameError> {
    let opcode = Opcode::try_from(read_u8(&mut buf, "opcode")?)?;
    let version = read_u8(&mut buf, "version")?;
    let length = read_u16(&mut buf, "length")?;
    let request_number = read_u32(&mut buf, "request number")?;
    let options = read_u32(&mut buf, "options")?;
    let option_data = read_u32(&mut buf, "option data")?;
    let sender = read_ipv4(&mut buf, "sender")?;
    let requester = match opcode {
        Opcode::Query => Some(read_ipv4(&mut buf, "requester")?),
        _ => None,
    };
    let url = read_url(&mut buf)?;

    let mut message = Message::new(opcode, request_number, url)
        .with_version(version)
        .with_options(options, option_data)
        .with_sender(sender);
    if let Some(requester) = requester {
        message = message.with_requester(requester);
    }
    if opcode == Opcode::HitObj {
        let payload_length = read_u16(&mut buf, "payload object length")?;
        if buf.remaining() < payload_length as usize {
            return Err(FrameError::Truncated {
                field: "payload object",
            });
        }
        let payload = buf.copy_to_bytes(payload_length as usize);
        message = message
            .with_payload_object(payload)
            .with_declared_payload_length(payload_length);
    }
    Ok(message.with_declared_length(length))
}

fn ensure(buf: &[u8], needed: usize, field: &'static str) -> std::result::Result<(), FrameError> {
    if buf.remaining() < needed {
        Err(FrameError::Truncated { field })
    } else {
        Ok(())
    }
}

fn read_u8(buf: &mut &[u8], field: &'static str) -> std::result::Result<u8, FrameError> {
    ensure(buf, 1, field)?;
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut &[u8], field: &'static str) -> std::result::Result<u16, FrameError> {
    ensure(buf, 2, field)?;
    Ok(buf.get_u16())
}

fn read_u32(buf: &mut &[u8], field: &'static str) -> std::result::Result<u32, FrameError> {
    ensure(buf, 4, field)?;
    Ok(buf.get_u32())
}

fn read_ipv4(buf: &mut &[u8], field: &'static str) -> std::result::Result<Ipv4Addr, FrameError> {
    read_u32(buf, field).map(Ipv4Addr::from)
}

/// The URL length cannot be derived from the header, so scan for the NUL.
fn read_url(buf: &mut &[u8]) -> std::result::Result<String, FrameError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(FrameError::UnterminatedUrl)?;
    let raw = &buf[..end];
    if !raw.is_ascii() {
        return Err(FrameError::NonAsciiUrl);
    }
    let url = String::from_utf8_lossy(raw).into_owned();
    buf.advance(end + 1);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{FLAG_SRC_RTT, HEADER_LEN};

    fn query_bytes(url: &str) -> Vec<u8> {
        let mut bytes = vec![1u8, 2];
        bytes.extend_from_slice(&((25 + url.len()) as u16).to_be_bytes());
        bytes.extend_from_slice(&7u32.to_be_bytes());
        bytes.extend_from_slice(&FLAG_SRC_RTT.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&[192, 168, 0, 1]);
        bytes.extend_from_slice(&[10, 0, 0, 2]);
        bytes.extend_from_slice(url.as_bytes());
        bytes.push(0);
        bytes
    }

    #[test]
    fn test_decode_query_fields() {
        let msg = WireCodec::new()
            .decode(&query_bytes("http://x/"))
            .expect("decode");
        assert_eq!(msg.opcode(), Opcode::Query);
        assert_eq!(msg.length(), 34);
        assert_eq!(msg.request_number(), 7);
        assert!(msg.requests_src_rtt());
        assert_eq!(msg.sender(), Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(msg.requester(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(msg.payload_url(), "http://x/");
        assert_eq!(msg.source(), None);
    }

    #[test]
    fn test_decode_ignores_padding() {
        let mut bytes = query_bytes("http://x/");
        bytes.extend_from_slice(&[0u8; 16]);
        let msg = WireCodec::new().decode(&bytes).expect("decode");
        assert_eq!(msg.payload_url(), "http://x/");
    }

    #[test]
    fn test_decode_truncated_header() {
        let bytes = query_bytes("http://x/");
        let err = WireCodec::new().decode(&bytes[..HEADER_LEN - 3]).unwrap_err();
        assert!(matches!(err, IcpError::Malformed(FrameError::Truncated { .. })));
    }

    #[test]
    fn test_decode_unterminated_url() {
        let mut bytes = query_bytes("http://x/");
        bytes.pop();
        let err = WireCodec::new().decode(&bytes).unwrap_err();
        assert!(matches!(err, IcpError::Malformed(FrameError::UnterminatedUrl)));
    }

    #[test]
    fn test_encode_rejects_nul_in_url() {
        let msg = Message::new(Opcode::Hit, 1, "http://x/\0y");
        let err = WireCodec::new().encode(&msg).unwrap_err();
        assert!(matches!(err, IcpError::Malformed(FrameError::EmbeddedNul)));
    }

    #[test]
    fn test_encode_length_matches_field() {
        let msg = Message::new(Opcode::HitObj, 3, "http://x/").with_payload_object(vec![9u8; 10]);
        let bytes = WireCodec::new().encode(&msg).expect("encode");
        assert_eq!(bytes.len(), msg.length() as usize);
        assert_eq!(&bytes[2..4], &msg.length().to_be_bytes());
    }

    #[test]
    fn test_encode_datagram_limit() {
        let msg = Message::new(Opcode::HitObj, 3, "u").with_payload_object(vec![0u8; 2000]);
        let err = WireCodec::new()
            .encode_datagram(&msg, MAX_DATAGRAM_SIZE)
            .unwrap_err();
        assert!(matches!(err, IcpError::PayloadTooLarge(_)));
    }
}
