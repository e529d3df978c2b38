//! Resource handlers for Converge.
//!
//! A handler owns one resource category and knows how to read and apply
//! items of that category. Handlers are registered in a [`HandlerRegistry`]
//! whose registration order is the order the engine invokes them in.

#![warn(missing_docs)]

pub mod r#trait;
pub mod convergence;
pub mod registry;

mod document;
pub mod file;
pub mod kv;
pub mod share;

pub use convergence::{plan_change, Plan};
pub use file::FileHandler;
pub use kv::KeyValueHandler;
pub use r#trait::{ApplyResult, ExecutionMode, HandlerError, ResourceHandler, ResourceState};
pub use registry::{HandlerRegistry, Registration, RegistryError};
pub use share::{ShareHandler, ShareSpec};
