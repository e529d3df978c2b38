//! State storage for Converge.
//!
//! This crate provides a trait-based store for applied-item records with an
//! in-memory and a JSON-file implementation.

#![warn(missing_docs)]

pub mod json_storage;
pub mod lock;
pub mod memory;
pub mod trait_;

pub use json_storage::JsonStateStore;
pub use lock::{KeyGuard, KeyedLocks};
pub use memory::MemoryStateStore;
pub use trait_::{Result, StateStore, StorageError};
