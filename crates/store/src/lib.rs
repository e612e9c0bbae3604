//! Durable storage for the tickalign system.
//!
//! This crate provides the SQLite-backed store holding:
//! - Externally owned inputs: trade ticks, probability snapshots, the
//!   instrument-to-event mapping (read-only to the core, with append
//!   helpers for ingestion collaborators and tests)
//! - Core-owned outputs: candles, watermarks, materialized feature rows

pub mod sqlite;

pub use sqlite::SqliteStore;
