//! # Protocol Logic
//!
//! - **builder**: response construction from queries, and query issuing
//! - **dispatcher**: fan-out of received messages to registered handlers

pub mod builder;
pub mod dispatcher;
