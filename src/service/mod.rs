//! # Service Layer
//!
//! Glue between the ICP engine and its host: collaborator interfaces and
//! the coordinator that runs the responder.

pub mod collaborators;
pub mod coordinator;
