//! # vouch-crypto
//!
//! Cryptographic primitives for the vouch activation engine.
//!
//! The crate covers everything the activation protocol needs below the domain layer:
//!
//! - the internal KDF used for at-rest record keys and HKDF for protocol keys
//! - AES-128-CBC with PKCS#7 padding
//! - P-256 key pairs, ECDH and ECDSA
//! - the ECIES request/response envelope
//! - multi-factor signatures with numeric and hash-based counters
//! - Argon2id hashing for recovery PUKs
//! - activation and recovery code generation
//!
//! ## Security Properties
//!
//! - Derived key material is zeroized on drop
//! - MACs and signature values are compared in constant time
//! - No unsafe code

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constants;
pub mod ecies;
pub mod errors;
pub mod hashing;
pub mod identifiers;
pub mod kdf;
pub mod keys;
pub mod signatures;
pub mod symmetric;
pub mod utils;

pub use constants::*;
pub use ecies::*;
pub use errors::{CryptoError, Result};
pub use hashing::*;
pub use identifiers::*;
pub use kdf::*;
pub use keys::*;
pub use signatures::*;
pub use symmetric::*;
pub use utils::*;
