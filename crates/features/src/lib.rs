//! Leak-proof feature materialization for the tickalign system.
//!
//! This crate handles:
//! - The closed allow-list of fields a materialized row may carry
//! - Regulation-clock discretization of the snapshot stream
//! - Replace-whole-scope writes of feature rows per event

pub mod allowlist;
pub mod materializer;

pub use allowlist::{validate_row, ALLOWED_FIELDS, LEAK_DENY_PATTERNS};
pub use materializer::{EventFailure, FeatureMaterializer, MaterializeReport, MaterializeScope};
