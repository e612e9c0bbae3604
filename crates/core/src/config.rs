//! Configuration structures for the tickalign system.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for the precompute and alignment pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Candle aggregation configuration.
    pub candle: CandleConfig,
    /// Incremental refresh configuration.
    pub refresh: RefreshConfig,
    /// Snapshot-to-candle alignment configuration.
    pub alignment: AlignmentConfig,
    /// Feature materialization configuration.
    pub materialize: MaterializeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            candle: CandleConfig::default(),
            refresh: RefreshConfig::default(),
            alignment: AlignmentConfig::default(),
            materialize: MaterializeConfig::default(),
        }
    }
}

impl Config {
    /// Validate cross-field constraints before running anything.
    pub fn validate(&self) -> Result<()> {
        if self.candle.bucket_width_ms <= 0 {
            return Err(Error::config("bucket_width_ms must be positive"));
        }
        if self.alignment.backward_tolerance_ms < 0 || self.alignment.forward_tolerance_ms < 0 {
            return Err(Error::config("alignment tolerances must be non-negative"));
        }
        if self.materialize.clock_bucket_s <= 0 {
            return Err(Error::config("clock_bucket_s must be positive"));
        }
        if self.refresh.read_timeout_ms == 0 {
            return Err(Error::config("read_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Candle aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleConfig {
    /// Default bucket width in milliseconds.
    pub bucket_width_ms: i64,
}

impl Default for CandleConfig {
    fn default() -> Self {
        Self {
            bucket_width_ms: 60_000,
        }
    }
}

/// Incremental refresh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Number of parallel workers (0 = available parallelism).
    pub workers: usize,
    /// Bounded timeout for durable-store reads (ms).
    pub read_timeout_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            read_timeout_ms: 5_000,
        }
    }
}

/// Snapshot-to-candle alignment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// How far before the snapshot a candle bucket may start (ms).
    pub backward_tolerance_ms: i64,
    /// How far after the snapshot a candle bucket may start (ms).
    pub forward_tolerance_ms: i64,
    /// When nothing is within tolerance, fall back to the most recent
    /// candle strictly before the snapshot, recording the true gap.
    pub carry_forward: bool,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            backward_tolerance_ms: 60_000,
            forward_tolerance_ms: 60_000,
            carry_forward: false,
        }
    }
}

/// Feature materialization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializeConfig {
    /// Width of the regulation-clock buckets used to pick one snapshot per
    /// discretized time step (seconds).
    pub clock_bucket_s: i64,
}

impl Default for MaterializeConfig {
    fn default() -> Self {
        Self { clock_bucket_s: 60 }
    }
}
