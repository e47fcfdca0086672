//! Response and query construction.
//!
//! [`ResponseBuilder`] derives a response from a query. Every entry point
//! checks its own preconditions and produces a fresh [`Message`]; the query
//! is never modified. Responses always carry:
//!
//! - the query's request number and URL
//! - version 2 and sender `0.0.0.0`
//! - no requester field, so their length is the query's minus 4
//!
//! [`QueryBuilder`] issues queries and owns the request number counter.

use crate::core::message::{Message, Opcode, FLAG_HIT_OBJ, FLAG_SRC_RTT, ZERO_ADDRESS};
use crate::error::{IcpError, Result};
use bytes::Bytes;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Stateless builder of ICP responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn new() -> Self {
        Self
    }

    fn require_query(query: &Message) -> Result<()> {
        if query.is_query() {
            Ok(())
        } else {
            Err(IcpError::NotAQuery(query.opcode()))
        }
    }

    fn require_src_rtt(query: &Message) -> Result<()> {
        Self::require_query(query)?;
        if query.requests_src_rtt() {
            Ok(())
        } else {
            Err(IcpError::SrcRttNotRequested)
        }
    }

    fn response(query: &Message, opcode: Opcode, options: u32, option_data: u32) -> Message {
        Message::new(opcode, query.request_number(), query.payload_url())
            .with_options(options, option_data)
            .with_sender(ZERO_ADDRESS)
    }

    /// ICP_OP_DENIED: the querier is not allowed to ask us.
    pub fn denied(&self, query: &Message) -> Result<Message> {
        Self::require_query(query)?;
        Ok(Self::response(query, Opcode::Denied, 0, 0))
    }

    /// ICP_OP_ERR: the query could not be processed.
    pub fn error(&self, query: &Message) -> Result<Message> {
        Self::require_query(query)?;
        Ok(Self::response(query, Opcode::Err, 0, 0))
    }

    pub fn hit(&self, query: &Message) -> Result<Message> {
        Self::require_query(query)?;
        Ok(Self::response(query, Opcode::Hit, 0, 0))
    }

    /// ICP_OP_HIT carrying the source RTT the query asked for.
    pub fn hit_with_src_rtt(&self, query: &Message, src_rtt: u16) -> Result<Message> {
        Self::require_src_rtt(query)?;
        Ok(Self::response(
            query,
            Opcode::Hit,
            FLAG_SRC_RTT,
            u32::from(src_rtt),
        ))
    }

    /// ICP_OP_HIT_OBJ: a hit with the object attached.
    ///
    /// Length is the query's, minus the requester, plus the 2-byte payload
    /// length field and the payload itself.
    pub fn hit_obj(&self, query: &Message, payload: Option<Bytes>) -> Result<Message> {
        let payload = payload.ok_or(IcpError::NilPayload)?;
        Self::require_query(query)?;
        Ok(Self::response(query, Opcode::HitObj, FLAG_HIT_OBJ, 0).with_payload_object(payload))
    }

    pub fn hit_obj_with_src_rtt(
        &self,
        query: &Message,
        src_rtt: u16,
        payload: Option<Bytes>,
    ) -> Result<Message> {
        let payload = payload.ok_or(IcpError::NilPayload)?;
        Self::require_src_rtt(query)?;
        Ok(Self::response(
            query,
            Opcode::HitObj,
            FLAG_HIT_OBJ | FLAG_SRC_RTT,
            u32::from(src_rtt),
        )
        .with_payload_object(payload))
    }

    pub fn miss(&self, query: &Message) -> Result<Message> {
        Self::require_query(query)?;
        Ok(Self::response(query, Opcode::Miss, 0, 0))
    }

    pub fn miss_with_src_rtt(&self, query: &Message, src_rtt: u16) -> Result<Message> {
        Self::require_src_rtt(query)?;
        Ok(Self::response(
            query,
            Opcode::Miss,
            FLAG_SRC_RTT,
            u32::from(src_rtt),
        ))
    }

    /// ICP_OP_MISS_NOFETCH: not cached here, and we will not fetch it.
    pub fn miss_no_fetch(&self, query: &Message) -> Result<Message> {
        Self::require_query(query)?;
        Ok(Self::response(query, Opcode::MissNoFetch, 0, 0))
    }

    pub fn miss_no_fetch_with_src_rtt(&self, query: &Message, src_rtt: u16) -> Result<Message> {
        Self::require_src_rtt(query)?;
        Ok(Self::response(
            query,
            Opcode::MissNoFetch,
            FLAG_SRC_RTT,
            u32::from(src_rtt),
        ))
    }

    /// Build the option-less response `opcode`.
    ///
    /// Covers DENIED, ERR, HIT, MISS and MISS_NOFETCH. Opcodes that need
    /// extra input (HIT_OBJ) or are not responses return
    /// [`IcpError::Unsupported`].
    pub fn respond(&self, query: &Message, opcode: Opcode) -> Result<Message> {
        match opcode {
            Opcode::Denied => self.denied(query),
            Opcode::Err => self.error(query),
            Opcode::Hit => self.hit(query),
            Opcode::Miss => self.miss(query),
            Opcode::MissNoFetch => self.miss_no_fetch(query),
            other => Err(IcpError::Unsupported(other)),
        }
    }
}

/// Issues queries with increasing request numbers.
#[derive(Debug)]
pub struct QueryBuilder {
    next_request_number: AtomicU32,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryBuilder {
    /// Request numbers start at 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        Self {
            next_request_number: AtomicU32::new(first),
        }
    }

    /// Start from a random request number so restarts do not reuse
    /// numbers peers may still have in flight.
    pub fn with_random_seed() -> Self {
        Self::starting_at(rand::random::<u32>())
    }

    /// Next request number. Wraps around at `u32::MAX`.
    pub fn next_request_number(&self) -> u32 {
        self.next_request_number.fetch_add(1, Ordering::Relaxed)
    }

    pub fn query(&self, requester: Ipv4Addr, url: &str) -> Message {
        self.query_with_options(requester, url, false, false)
    }

    pub fn query_with_options(
        &self,
        requester: Ipv4Addr,
        url: &str,
        request_src_rtt: bool,
        request_hit_obj: bool,
    ) -> Message {
        let mut options = 0;
        if request_src_rtt {
            options |= FLAG_SRC_RTT;
        }
        if request_hit_obj {
            options |= FLAG_HIT_OBJ;
        }
        Message::new(Opcode::Query, self.next_request_number(), url)
            .with_options(options, 0)
            .with_sender(ZERO_ADDRESS)
            .with_requester(requester)
    }
}
