//! Incremental, watermark-gated candle refresh for the tickalign system.
//!
//! This crate provides:
//! - The pure refresh planner: `(old watermark, new ticks) ->
//!   (new watermark, candle deltas)`
//! - The refresh orchestrator: scope resolution, a fixed-size worker pool,
//!   per-instrument writer serialization, cooperative cancellation

pub mod orchestrator;
pub mod plan;

pub use orchestrator::{InstrumentFailure, RefreshOrchestrator, RefreshReport, RefreshScope};
pub use plan::{plan_refresh, RefreshDelta};
