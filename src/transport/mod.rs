//! # Transport
//!
//! UDP socket ownership and the receive loop.

pub mod udp;
