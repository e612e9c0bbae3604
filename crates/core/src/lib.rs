//! Core types and configuration for the tickalign system.
//!
//! This crate provides shared types used across all other crates:
//! - Market data types (ticks, candles, watermarks, snapshots)
//! - Alignment and feature row types
//! - Configuration structures
//! - Common error types

pub mod cancel;
pub mod config;
pub mod error;
pub mod types;

pub use cancel::CancelToken;
pub use config::{AlignmentConfig, CandleConfig, Config, MaterializeConfig, RefreshConfig};
pub use error::{Error, Result};
pub use types::*;
