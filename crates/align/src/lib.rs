//! Snapshot-to-candle alignment for the tickalign system.
//!
//! This crate handles:
//! - Bounded-tolerance best-match selection per snapshot
//! - Optional carry-forward with the true gap recorded
//! - Combining per-instrument matches into one row per snapshot

pub mod engine;

pub use engine::AlignmentEngine;
