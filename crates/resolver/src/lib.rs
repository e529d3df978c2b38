//! Policy bundle resolution for Converge.
//!
//! Loads bundles from a [`BundleSource`], checks them, and turns them into
//! the list of winning items for one target.

#![warn(missing_docs)]

pub mod resolver;
pub mod source;

pub use resolver::{
    resolve, validate_bundles, Resolution, ResolutionWarning, ResolvedItem, ResolverError,
};
pub use source::{BundleSource, DirectoryBundleSource, LoadError, StaticBundleSource};
