//! # vouch-core
//!
//! Activation engine for device-bound multi-factor authentication.
//!
//! This crate owns everything between the crypto primitives and the transport:
//! - Context-derived at-rest encryption of private keys and PUK hashes
//! - Activation lifecycle (init, key exchange, commit, block, remove, expiry)
//! - Online and offline signature verification with counter look-ahead
//! - Recovery codes, postcards and PUKs
//! - Engine-aware row locking and transactional rollback

#![warn(clippy::all)]

pub mod audit;
pub mod config;
pub mod converters;
pub mod encryption;
pub mod envelope;
pub mod errors;
pub mod locking;
pub mod messages;
pub mod signature;
pub mod traits;
pub mod transaction;
pub mod types;
mod service;

pub use audit::{MemoryAuditSink, SignatureAuditRecord, TracingAuditSink};
pub use config::ServiceConfig;
pub use errors::{ErrorKind, Result, ServiceError};
pub use messages::*;
pub use service::VouchService;
pub use traits::{ActivationEngine, AuditSink};
pub use types::*;

#[cfg(test)]
mod tests;
