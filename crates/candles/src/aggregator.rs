//! Candle building from raw trade ticks.
//!
//! Seeded with persisted candle state so merge-with-existing and
//! fresh-bucket construction share one code path.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tickalign_core::{
    ts_to_bucket, Candle, PriceCents, Side, TickKey, TimestampMs, TradeTick,
};
use tracing::{debug, warn};

/// Why a tick was rejected by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Neither the yes nor the no price field was present.
    MissingPrice,
    /// Quantity was zero or negative.
    NonPositiveQuantity,
}

/// A tick the aggregator skipped, kept for accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedTick {
    pub event_time: TimestampMs,
    pub event_id: i64,
    pub reason: RejectReason,
}

/// Counters describing one aggregation batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationStats {
    /// Ticks incorporated into candles.
    pub ticks_applied: u64,
    /// Ticks skipped as duplicate deliveries.
    pub duplicates_skipped: u64,
    /// Ticks skipped as malformed.
    pub rejected: Vec<RejectedTick>,
}

impl AggregationStats {
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }
}

/// Finished batch: touched candles plus accounting.
#[derive(Debug, Clone)]
pub struct AggregationOutput {
    /// One candle per touched bucket, ordered by `bucket_start`.
    pub candles: Vec<Candle>,
    pub stats: AggregationStats,
}

/// A candle being built or merged.
#[derive(Debug, Clone)]
struct WorkingCandle {
    open: PriceCents,
    high: PriceCents,
    low: PriceCents,
    close: PriceCents,
    vw_numerator: f64,
    volume: f64,
    first: TickKey,
    last: TickKey,
    /// Last key already durably aggregated, when seeded from the store.
    /// Ticks at or below it are duplicate deliveries.
    persisted_through: Option<TickKey>,
    /// Whether this batch changed the candle.
    touched: bool,
}

impl WorkingCandle {
    fn from_tick(price: PriceCents, quantity: f64, key: TickKey) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
            vw_numerator: price as f64 * quantity,
            volume: quantity,
            first: key,
            last: key,
            persisted_through: None,
            touched: true,
        }
    }

    fn from_candle(candle: &Candle) -> Self {
        Self {
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            vw_numerator: candle.vw_mean * candle.volume,
            volume: candle.volume,
            first: candle.first_key(),
            last: candle.last_key(),
            persisted_through: Some(candle.last_key()),
            touched: false,
        }
    }

    fn apply(&mut self, price: PriceCents, quantity: f64, key: TickKey) {
        if key < self.first {
            self.open = price;
            self.first = key;
        }
        if key > self.last {
            self.close = price;
            self.last = key;
        }
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.vw_numerator += price as f64 * quantity;
        self.volume += quantity;
        self.touched = true;
    }

    fn to_candle(
        &self,
        instrument_id: &str,
        side: Side,
        bucket_width_ms: i64,
        bucket_start: TimestampMs,
    ) -> Candle {
        Candle {
            instrument_id: instrument_id.to_string(),
            side,
            bucket_width_ms,
            bucket_start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            vw_mean: if self.volume > 0.0 {
                self.vw_numerator / self.volume
            } else {
                0.0
            },
            volume: self.volume,
            first_event_time: self.first.event_time,
            first_event_id: self.first.event_id,
            last_event_time: self.last.event_time,
            last_event_id: self.last.event_id,
        }
    }
}

/// Aggregates trade ticks for one `(instrument, side)` into candles at a
/// fixed bucket width.
///
/// Deterministic under replay: open/close derive from the smallest/largest
/// `(event_time, event_id)` in the bucket, and duplicate deliveries of the
/// same `event_id` are skipped.
pub struct CandleAggregator {
    instrument_id: String,
    side: Side,
    bucket_width_ms: i64,
    working: BTreeMap<TimestampMs, WorkingCandle>,
    seen_event_ids: HashSet<i64>,
    stats: AggregationStats,
}

impl CandleAggregator {
    /// Create an aggregator for one instrument/side and bucket width.
    pub fn new(instrument_id: impl Into<String>, side: Side, bucket_width_ms: i64) -> Self {
        debug_assert!(bucket_width_ms > 0);
        Self {
            instrument_id: instrument_id.into(),
            side,
            bucket_width_ms,
            working: BTreeMap::new(),
            seen_event_ids: HashSet::new(),
            stats: AggregationStats::default(),
        }
    }

    /// Seed a persisted candle so new ticks merge into it instead of
    /// restarting the bucket. Seeded buckets are only emitted if touched.
    pub fn seed(&mut self, candle: &Candle) {
        debug_assert_eq!(candle.instrument_id, self.instrument_id);
        debug_assert_eq!(candle.side, self.side);
        debug_assert_eq!(candle.bucket_width_ms, self.bucket_width_ms);
        self.working
            .insert(candle.bucket_start, WorkingCandle::from_candle(candle));
    }

    /// Seed multiple persisted candles.
    pub fn seed_all<'a>(&mut self, candles: impl IntoIterator<Item = &'a Candle>) {
        for candle in candles {
            self.seed(candle);
        }
    }

    /// Apply one tick. Malformed ticks are counted and skipped, never fatal.
    pub fn add_tick(&mut self, tick: &TradeTick) {
        let key = tick.key();

        if tick.quantity <= 0.0 {
            warn!(
                instrument_id = %self.instrument_id,
                event_id = tick.event_id,
                quantity = tick.quantity,
                "rejecting tick with non-positive quantity"
            );
            self.stats.rejected.push(RejectedTick {
                event_time: tick.event_time,
                event_id: tick.event_id,
                reason: RejectReason::NonPositiveQuantity,
            });
            return;
        }

        let price = match tick.normalized_price() {
            Some(p) => p,
            None => {
                warn!(
                    instrument_id = %self.instrument_id,
                    event_id = tick.event_id,
                    "rejecting tick with neither price field"
                );
                self.stats.rejected.push(RejectedTick {
                    event_time: tick.event_time,
                    event_id: tick.event_id,
                    reason: RejectReason::MissingPrice,
                });
                return;
            }
        };

        if !self.seen_event_ids.insert(tick.event_id) {
            debug!(
                instrument_id = %self.instrument_id,
                event_id = tick.event_id,
                "skipping duplicate tick delivery"
            );
            self.stats.duplicates_skipped += 1;
            return;
        }

        let bucket_start = ts_to_bucket(tick.event_time, self.bucket_width_ms);
        match self.working.get_mut(&bucket_start) {
            Some(wc) => {
                // A tick at or below the persisted high key was already
                // durably aggregated in an earlier pass.
                if wc.persisted_through.is_some_and(|through| key <= through) {
                    debug!(
                        instrument_id = %self.instrument_id,
                        event_id = tick.event_id,
                        "skipping tick already incorporated in persisted candle"
                    );
                    self.stats.duplicates_skipped += 1;
                    return;
                }
                wc.apply(price, tick.quantity, key);
            }
            None => {
                self.working
                    .insert(bucket_start, WorkingCandle::from_tick(price, tick.quantity, key));
            }
        }
        self.stats.ticks_applied += 1;
    }

    /// Apply a batch of ticks. An empty batch is a no-op.
    pub fn add_ticks(&mut self, ticks: &[TradeTick]) {
        for tick in ticks {
            self.add_tick(tick);
        }
    }

    /// Running batch statistics.
    pub fn stats(&self) -> &AggregationStats {
        &self.stats
    }

    /// Finish the batch, emitting one candle per touched bucket.
    pub fn finish(self) -> AggregationOutput {
        let candles = self
            .working
            .iter()
            .filter(|(_, wc)| wc.touched)
            .map(|(&bucket_start, wc)| {
                wc.to_candle(&self.instrument_id, self.side, self.bucket_width_ms, bucket_start)
            })
            .collect();
        AggregationOutput {
            candles,
            stats: self.stats,
        }
    }
}
