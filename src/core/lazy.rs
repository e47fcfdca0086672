//! Lazy, allocation-free view over a received ICP datagram.
//!
//! [`LazyView`] keeps the receive buffer and parses each field the first
//! time it is asked for, memoizing the result. A caller that only looks at
//! [`LazyView::opcode`] and [`LazyView::payload_url`] never touches the
//! other fields.
//!
//! A query view can also be rewritten in place into a response with
//! [`LazyView::write_response`]: the opcode, options, option data and
//! sender are overwritten, the URL is shifted left over the requester
//! field, the vacated tail is zeroed and the length field is updated. Only
//! DENIED, ERR, HIT and MISS_NOFETCH can be produced this way; anything
//! else is reported as [`IcpError::Unsupported`].

use crate::core::codec::{Codec, WireCodec};
use crate::core::message::{
    wire_length, Message, Opcode, FLAG_HIT_OBJ, FLAG_SRC_RTT, HEADER_LEN, ICP_VERSION,
    PAYLOAD_LENGTH_LEN, REQUESTER_LEN,
};
use crate::error::{FrameError, IcpError, Result};
use bytes::{Bytes, BytesMut};
use std::cell::OnceCell;
use std::net::{Ipv4Addr, SocketAddr};

const OPCODE_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 1;
const LENGTH_OFFSET: usize = 2;
const REQUEST_NUMBER_OFFSET: usize = 4;
const OPTIONS_OFFSET: usize = 8;
const OPTION_DATA_OFFSET: usize = 12;
const SENDER_OFFSET: usize = 16;
const REQUESTER_OFFSET: usize = 20;

/// Memoized field values. Reset whenever the buffer is rewritten.
#[derive(Debug, Default)]
struct FieldCache {
    opcode: OnceCell<Opcode>,
    length: OnceCell<u16>,
    request_number: OnceCell<u32>,
    options: OnceCell<u32>,
    option_data: OnceCell<u32>,
    sender: OnceCell<Ipv4Addr>,
    /// Offset of the URL's NUL terminator.
    url_end: OnceCell<usize>,
}

fn memo<T: Copy>(cell: &OnceCell<T>, parse: impl FnOnce() -> Result<T>) -> Result<T> {
    if let Some(value) = cell.get() {
        return Ok(*value);
    }
    let value = parse()?;
    Ok(*cell.get_or_init(|| value))
}

/// On-demand view over an ICP datagram buffer.
#[derive(Debug)]
pub struct LazyView {
    buf: BytesMut,
    source: Option<SocketAddr>,
    cache: FieldCache,
}

impl LazyView {
    /// Wrap a datagram. Nothing is parsed yet.
    pub fn new(buf: impl Into<BytesMut>) -> Self {
        Self {
            buf: buf.into(),
            source: None,
            cache: FieldCache::default(),
        }
    }

    /// Record the UDP origin of the datagram.
    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn source(&self) -> Option<SocketAddr> {
        self.source
    }

    /// The whole backing buffer, including any padding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The backing buffer truncated to the declared message length.
    pub fn message_bytes(&self) -> Result<&[u8]> {
        let length = self.length()? as usize;
        Ok(&self.buf[..length.min(self.buf.len())])
    }

    /// Give back the backing buffer.
    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    fn read_u8(&self, offset: usize, field: &'static str) -> Result<u8> {
        self.buf
            .get(offset)
            .copied()
            .ok_or(IcpError::Malformed(FrameError::Truncated { field }))
    }

    fn read_u16(&self, offset: usize, field: &'static str) -> Result<u16> {
        let bytes = self
            .buf
            .get(offset..offset + 2)
            .ok_or(IcpError::Malformed(FrameError::Truncated { field }))?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&self, offset: usize, field: &'static str) -> Result<u32> {
        let bytes = self
            .buf
            .get(offset..offset + 4)
            .ok_or(IcpError::Malformed(FrameError::Truncated { field }))?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn opcode(&self) -> Result<Opcode> {
        memo(&self.cache.opcode, || {
            Ok(Opcode::try_from(self.read_u8(OPCODE_OFFSET, "opcode")?)?)
        })
    }

    pub fn version(&self) -> Result<u8> {
        self.read_u8(VERSION_OFFSET, "version")
    }

    pub fn length(&self) -> Result<u16> {
        memo(&self.cache.length, || self.read_u16(LENGTH_OFFSET, "length"))
    }

    pub fn request_number(&self) -> Result<u32> {
        memo(&self.cache.request_number, || {
            self.read_u32(REQUEST_NUMBER_OFFSET, "request number")
        })
    }

    pub fn options(&self) -> Result<u32> {
        memo(&self.cache.options, || self.read_u32(OPTIONS_OFFSET, "options"))
    }

    pub fn option_data(&self) -> Result<u32> {
        memo(&self.cache.option_data, || {
            self.read_u32(OPTION_DATA_OFFSET, "option data")
        })
    }

    pub fn sender(&self) -> Result<Ipv4Addr> {
        memo(&self.cache.sender, || {
            self.read_u32(SENDER_OFFSET, "sender").map(Ipv4Addr::from)
        })
    }

    pub fn is_query(&self) -> Result<bool> {
        Ok(self.opcode()? == Opcode::Query)
    }

    /// Requester address; `None` unless this is a query.
    pub fn requester(&self) -> Result<Option<Ipv4Addr>> {
        if !self.is_query()? {
            return Ok(None);
        }
        self.read_u32(REQUESTER_OFFSET, "requester")
            .map(|raw| Some(Ipv4Addr::from(raw)))
    }

    pub fn requests_src_rtt(&self) -> Result<bool> {
        Ok(self.is_query()? && self.options()? & FLAG_SRC_RTT != 0)
    }

    pub fn requests_hit_obj(&self) -> Result<bool> {
        Ok(self.is_query()? && self.options()? & FLAG_HIT_OBJ != 0)
    }

    fn url_start(&self) -> Result<usize> {
        Ok(if self.is_query()? {
            HEADER_LEN + REQUESTER_LEN
        } else {
            HEADER_LEN
        })
    }

    fn url_end(&self) -> Result<usize> {
        memo(&self.cache.url_end, || {
            let start = self.url_start()?;
            let tail = self.buf.get(start..).ok_or(IcpError::Malformed(
                FrameError::Truncated {
                    field: "payload URL",
                },
            ))?;
            let nul = tail
                .iter()
                .position(|&b| b == 0)
                .ok_or(IcpError::Malformed(FrameError::UnterminatedUrl))?;
            if !tail[..nul].is_ascii() {
                return Err(FrameError::NonAsciiUrl.into());
            }
            Ok(start + nul)
        })
    }

    pub fn payload_url(&self) -> Result<&str> {
        let start = self.url_start()?;
        let end = self.url_end()?;
        std::str::from_utf8(&self.buf[start..end])
            .map_err(|_| IcpError::Malformed(FrameError::NonAsciiUrl))
    }

    /// Self-reported payload object length; `None` unless HIT_OBJ.
    pub fn payload_object_length(&self) -> Result<Option<u16>> {
        if self.opcode()? != Opcode::HitObj {
            return Ok(None);
        }
        let offset = self.url_end()? + 1;
        self.read_u16(offset, "payload object length").map(Some)
    }

    /// Payload object bytes; `None` unless HIT_OBJ.
    ///
    /// The slice ends at the self-reported length or at the end of the
    /// buffer, whichever comes first, so it can be shorter than
    /// [`LazyView::payload_object_length`] on a short datagram.
    pub fn payload_object(&self) -> Result<Option<&[u8]>> {
        let Some(declared) = self.payload_object_length()? else {
            return Ok(None);
        };
        let start = self.url_end()? + 1 + PAYLOAD_LENGTH_LEN;
        let end = (start + declared as usize).min(self.buf.len());
        Ok(Some(&self.buf[start..end]))
    }

    /// Materialize every field into an owned [`Message`].
    pub fn to_message(&self) -> Result<Message> {
        let message = WireCodec::new().decode(&self.buf)?;
        Ok(match self.source {
            Some(source) => message.with_source(source),
            None => message,
        })
    }

    /// Rewrite this query, in place, into a response with `opcode`.
    ///
    /// Supported: DENIED, ERR, HIT, MISS_NOFETCH. Options, option data and
    /// the sender are zeroed; the request number and URL are kept.
    pub fn write_response(&mut self, opcode: Opcode) -> Result<()> {
        if !matches!(
            opcode,
            Opcode::Denied | Opcode::Err | Opcode::Hit | Opcode::MissNoFetch
        ) {
            return Err(IcpError::Unsupported(opcode));
        }
        let current = self.opcode()?;
        if current != Opcode::Query {
            return Err(IcpError::NotAQuery(current));
        }
        let url_start = self.url_start()?;
        let url_end = self.url_end()?;
        let new_length = wire_length(opcode, url_end - url_start, 0);
        let new_length =
            u16::try_from(new_length).map_err(|_| IcpError::PayloadTooLarge(new_length))?;

        let buf = &mut self.buf[..];
        buf[OPCODE_OFFSET] = opcode.as_u8();
        buf[VERSION_OFFSET] = ICP_VERSION;
        buf[LENGTH_OFFSET..LENGTH_OFFSET + 2].copy_from_slice(&new_length.to_be_bytes());
        buf[OPTIONS_OFFSET..SENDER_OFFSET + 4].fill(0);
        // URL and its NUL slide over the requester field.
        buf.copy_within(url_start..=url_end, REQUESTER_OFFSET);
        buf[url_end - REQUESTER_LEN + 1..=url_end].fill(0);

        self.cache = FieldCache::default();
        Ok(())
    }
}

/// [`Codec`] backed by [`LazyView`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LazyCodec;

impl LazyCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for LazyCodec {
    type Message = LazyView;

    /// Only the opcode is checked up front; everything else is parsed on
    /// access.
    fn decode_datagram(&self, datagram: BytesMut, source: Option<SocketAddr>) -> Result<LazyView> {
        let view = LazyView::new(datagram);
        view.opcode()?;
        Ok(match source {
            Some(source) => view.with_source(source),
            None => view,
        })
    }

    fn encode_message(&self, message: &LazyView) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(message.message_bytes()?))
    }

    fn respond(&self, mut query: LazyView, opcode: Opcode) -> Result<LazyView> {
        query.write_response(opcode)?;
        Ok(query)
    }
}
