//! LeakWatch Core Library
//!
//! This crate provides the pure building blocks of the LeakWatch session monitor.
//! Nothing here performs I/O or holds state: every function is a deterministic
//! transform over string slices, so it can be shared by the engine, the CLI and
//! benchmarks alike.
//!
//! # Architecture
//!
//! A monitored browsing session replays archived pages from one or more
//! boundary prefixes. Any resource fetched from outside those prefixes is a
//! leak. The engine decides that with [`classify`], and looks up rules for a
//! resource by its SURT key produced by [`to_surt_exact`] or [`to_surt_prefix`].
//!
//! # Modules
//!
//! - `url`: Fast URL slicing and boundary classification
//! - `replay`: Replay-wrapper URL parsing (`<prefix><timestamp>/<original>`)
//! - `surt`: SURT canonicalization for rule lookup
//! - `types`: Shared type definitions

pub mod replay;
pub mod surt;
pub mod types;
pub mod url;

// Re-export commonly used types
pub use replay::ReplayUrl;
pub use surt::{to_surt_exact, to_surt_prefix};
pub use types::{Boundary, ResourceType, SessionId};
pub use url::{classify, BoundaryPrefixes, UrlError};
