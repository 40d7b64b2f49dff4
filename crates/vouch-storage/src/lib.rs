//! # vouch-storage
//!
//! Storage abstraction layer for vouch.
//!
//! This crate provides the [`Storage`] interface used by the activation engine together with
//! two engines: RocksDB for persistent deployments and an in-memory map for tests and
//! ephemeral runs. Besides key-value access the interface exposes the engine identity, row
//! locks and transactions that hold those locks until commit or rollback.

#![warn(clippy::all)]

pub mod column_families;
pub mod errors;
pub mod locks;
pub mod memory;
pub mod rocksdb_impl;
pub mod traits;

pub use column_families::*;
pub use errors::{Result, StorageError};
pub use locks::{RowLock, RowLocks};
pub use memory::MemoryStorage;
pub use rocksdb_impl::RocksDbStorage;
pub use traits::{Batch, BatchExt, Storage, Transaction};
