//! Candle aggregation for the tickalign system.
//!
//! This crate handles:
//! - Bucket assignment of raw trade ticks
//! - Price normalization onto the yes-cents scale
//! - Merge with persisted candle state
//! - Duplicate and malformed tick accounting

pub mod aggregator;

pub use aggregator::{AggregationOutput, AggregationStats, CandleAggregator, RejectReason, RejectedTick};
