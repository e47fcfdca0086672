//! ICP message value type.
//!
//! A [`Message`] is the logical content of one ICP v2 datagram. Fields that
//! only exist for some opcodes are modelled as `Option`s and are only ever
//! populated when the opcode calls for them:
//!
//! - the requester address exists only on `ICP_OP_QUERY`
//! - the payload object (and its self-reported length) exists only on
//!   `ICP_OP_HIT_OBJ`
//!
//! The `SRC_RTT` and `HIT_OBJ` option bits mean "requested" on a query and
//! "present" on a response; use the predicates rather than raw bit tests.

use crate::error::FrameError;
use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// ICP protocol version spoken by this crate.
pub const ICP_VERSION: u8 = 2;

/// Well-known ICP UDP port.
pub const ICP_PORT: u16 = 3130;

/// Maximum ICP datagram length in bytes.
pub const MAX_DATAGRAM_SIZE: usize = 1450;

/// Fixed header length (opcode through sender address).
pub const HEADER_LEN: usize = 20;

/// Length of the requester address carried by queries.
pub const REQUESTER_LEN: usize = 4;

/// Length of the payload object length field carried by HIT_OBJ.
pub const PAYLOAD_LENGTH_LEN: usize = 2;

/// Option flag: HIT_OBJ requested (query) / object attached (response).
pub const FLAG_HIT_OBJ: u32 = 0x8000_0000;

/// Option flag: source RTT requested (query) / RTT attached (response).
pub const FLAG_SRC_RTT: u32 = 0x4000_0000;

/// The all-zero address used in the sender field of locally built messages.
pub const ZERO_ADDRESS: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// ICP opcodes (RFC 2186 section 1.5, RFC 2187).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Query = 1,
    Hit = 2,
    Miss = 3,
    Err = 4,
    SourceEcho = 10,
    DiscoveryEcho = 11,
    MissNoFetch = 21,
    Denied = 22,
    HitObj = 23,
}

impl Opcode {
    /// Every valid opcode, in wire-value order.
    pub const ALL: [Opcode; 9] = [
        Opcode::Query,
        Opcode::Hit,
        Opcode::Miss,
        Opcode::Err,
        Opcode::SourceEcho,
        Opcode::DiscoveryEcho,
        Opcode::MissNoFetch,
        Opcode::Denied,
        Opcode::HitObj,
    ];

    /// Wire value of this opcode.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Conventional RFC name, e.g. `ICP_OP_MISS_NOFETCH`.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Query => "ICP_OP_QUERY",
            Opcode::Hit => "ICP_OP_HIT",
            Opcode::Miss => "ICP_OP_MISS",
            Opcode::Err => "ICP_OP_ERR",
            Opcode::SourceEcho => "ICP_OP_SECHO",
            Opcode::DiscoveryEcho => "ICP_OP_DECHO",
            Opcode::MissNoFetch => "ICP_OP_MISS_NOFETCH",
            Opcode::Denied => "ICP_OP_DENIED",
            Opcode::HitObj => "ICP_OP_HIT_OBJ",
        }
    }

    /// Whether a response with this opcode may carry a SRC_RTT value.
    pub fn may_carry_src_rtt(self) -> bool {
        matches!(
            self,
            Opcode::Hit | Opcode::Miss | Opcode::MissNoFetch | Opcode::HitObj
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::Query),
            2 => Ok(Opcode::Hit),
            3 => Ok(Opcode::Miss),
            4 => Ok(Opcode::Err),
            10 => Ok(Opcode::SourceEcho),
            11 => Ok(Opcode::DiscoveryEcho),
            21 => Ok(Opcode::MissNoFetch),
            22 => Ok(Opcode::Denied),
            23 => Ok(Opcode::HitObj),
            other => Err(FrameError::InvalidOpcode(other)),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of bytes `message` occupies on the wire.
///
/// `21 + len(url)` for the header and NUL-terminated URL, plus 4 for the
/// requester of a query, plus `2 + len(payload)` for a HIT_OBJ.
pub fn compute_length(message: &Message) -> usize {
    wire_length(
        message.opcode,
        message.payload_url.len(),
        message.payload_object.as_ref().map_or(0, Bytes::len),
    )
}

pub(crate) fn wire_length(opcode: Opcode, url_len: usize, payload_len: usize) -> usize {
    let mut length = HEADER_LEN + url_len + 1;
    match opcode {
        Opcode::Query => length += REQUESTER_LEN,
        Opcode::HitObj => length += PAYLOAD_LENGTH_LEN + payload_len,
        _ => {}
    }
    length
}

fn saturating_u16(value: usize) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// One ICP datagram's logical content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    opcode: Opcode,
    version: u8,
    length: u16,
    request_number: u32,
    options: u32,
    option_data: u32,
    sender: Ipv4Addr,
    requester: Option<Ipv4Addr>,
    payload_url: String,
    payload_object: Option<Bytes>,
    payload_object_length: Option<u16>,
    source: Option<SocketAddr>,
}

impl Message {
    /// Create a message with zeroed options, zero sender, and the length
    /// field computed from its contents.
    ///
    /// A query starts with requester `0.0.0.0`; a HIT_OBJ starts with an
    /// empty payload object.
    pub fn new(opcode: Opcode, request_number: u32, payload_url: impl Into<String>) -> Self {
        let mut message = Self {
            opcode,
            version: ICP_VERSION,
            length: 0,
            request_number,
            options: 0,
            option_data: 0,
            sender: ZERO_ADDRESS,
            requester: (opcode == Opcode::Query).then_some(ZERO_ADDRESS),
            payload_url: payload_url.into(),
            payload_object: (opcode == Opcode::HitObj).then(Bytes::new),
            payload_object_length: (opcode == Opcode::HitObj).then_some(0),
            source: None,
        };
        message.refresh_length();
        message
    }

    /// Set the option bits and option data.
    pub fn with_options(mut self, options: u32, option_data: u32) -> Self {
        self.options = options;
        self.option_data = option_data;
        self
    }

    /// Set the self-reported sender address.
    pub fn with_sender(mut self, sender: Ipv4Addr) -> Self {
        self.sender = sender;
        self
    }

    /// Set the requester address. Only queries carry one; on any other
    /// opcode this is a no-op.
    pub fn with_requester(mut self, requester: Ipv4Addr) -> Self {
        if self.is_query() {
            self.requester = Some(requester);
        }
        self
    }

    /// Attach a payload object. Only HIT_OBJ carries one; on any other
    /// opcode this is a no-op.
    pub fn with_payload_object(mut self, payload: impl Into<Bytes>) -> Self {
        if self.opcode == Opcode::HitObj {
            let payload = payload.into();
            self.payload_object_length = Some(saturating_u16(payload.len()));
            self.payload_object = Some(payload);
            self.refresh_length();
        }
        self
    }

    /// Record the UDP origin of a received datagram.
    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub(crate) fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Override the length field with the value read off the wire.
    pub(crate) fn with_declared_length(mut self, length: u16) -> Self {
        self.length = length;
        self
    }

    /// Override the payload object length with the value read off the wire.
    pub(crate) fn with_declared_payload_length(mut self, length: u16) -> Self {
        if self.opcode == Opcode::HitObj {
            self.payload_object_length = Some(length);
        }
        self
    }

    fn refresh_length(&mut self) {
        self.length = saturating_u16(compute_length(self));
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Declared on-wire length of the whole message.
    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn request_number(&self) -> u32 {
        self.request_number
    }

    pub fn options(&self) -> u32 {
        self.options
    }

    pub fn option_data(&self) -> u32 {
        self.option_data
    }

    /// Sender address as reported inside the payload. Not trustworthy; use
    /// [`Message::source`] for the real origin.
    pub fn sender(&self) -> Ipv4Addr {
        self.sender
    }

    /// Requester address; `Some` only on queries.
    pub fn requester(&self) -> Option<Ipv4Addr> {
        self.requester
    }

    pub fn payload_url(&self) -> &str {
        &self.payload_url
    }

    /// Payload object; `Some` only on HIT_OBJ.
    pub fn payload_object(&self) -> Option<&[u8]> {
        self.payload_object.as_deref()
    }

    /// Self-reported payload object length; `Some` only on HIT_OBJ.
    pub fn payload_object_length(&self) -> Option<u16> {
        self.payload_object_length
    }

    /// UDP origin of the datagram, if this message was received.
    pub fn source(&self) -> Option<SocketAddr> {
        self.source
    }

    pub fn source_address(&self) -> Option<IpAddr> {
        self.source.map(|s| s.ip())
    }

    pub fn source_port(&self) -> Option<u16> {
        self.source.map(|s| s.port())
    }

    #[inline]
    pub fn is_query(&self) -> bool {
        self.opcode == Opcode::Query
    }

    /// Query asks responders to include the source RTT.
    pub fn requests_src_rtt(&self) -> bool {
        self.is_query() && self.options & FLAG_SRC_RTT != 0
    }

    /// Query asks responders to attach the object to a hit.
    pub fn requests_hit_obj(&self) -> bool {
        self.is_query() && self.options & FLAG_HIT_OBJ != 0
    }

    /// Response carries a source RTT value.
    pub fn contains_src_rtt_response(&self) -> bool {
        self.opcode.may_carry_src_rtt() && self.options & FLAG_SRC_RTT != 0
    }

    /// Source RTT carried by a response, or 0 when absent.
    pub fn src_rtt_response(&self) -> u16 {
        if self.contains_src_rtt_response() {
            (self.option_data & 0x0000_ffff) as u16
        } else {
            0
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{};version={:#x};length={:#x};requestNumber={:#x};options={:#x};\
             requestsSrcRtt={};requestsHitObj={};containsSrcRttResponse={};\
             optionData={:#x};srcRttResponse={:#x};sender={}",
            self.opcode,
            self.version,
            self.length,
            self.request_number,
            self.options,
            self.requests_src_rtt(),
            self.requests_hit_obj(),
            self.contains_src_rtt_response(),
            self.option_data,
            self.src_rtt_response(),
            self.sender,
        )?;
        if let Some(requester) = self.requester {
            write!(f, ";requester={requester}")?;
        }
        write!(f, ";payloadUrl={}", self.payload_url)?;
        if let Some(payload) = &self.payload_object {
            f.write_str(";payloadObject=")?;
            for (i, byte) in payload.iter().enumerate() {
                if i > 0 && i % 8 == 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{byte:02x}")?;
            }
        }
        if let Some(source) = self.source {
            write!(f, ";source={source}")?;
        }
        f.write_str("]")
    }
}
