//! Pure refresh planning.
//!
//! The core of incremental refresh is a pure transform: given the last
//! committed watermark, the ticks newer than it, and the persisted candles
//! for the touched window, produce the candle deltas and the new
//! watermark. Persistence owns durability; nothing here touches the store.

use tickalign_candles::{AggregationStats, CandleAggregator};
use tickalign_core::{Candle, InstrumentRef, TradeTick, Watermark};

/// Output of one planning pass.
#[derive(Debug, Clone)]
pub struct RefreshDelta {
    /// Candles to merge-write, ordered by `bucket_start`.
    pub candles: Vec<Candle>,
    /// Watermark to commit atomically with the candles. `None` when no
    /// tick was newer than the old watermark (nothing to commit).
    pub new_watermark: Option<Watermark>,
    /// Aggregation accounting for the batch.
    pub stats: AggregationStats,
}

/// Plan an incremental refresh for one instrument.
///
/// Ticks at or below the old watermark are duplicate deliveries and are
/// skipped, which makes the transform idempotent. The new watermark is the
/// largest processed tick key; malformed ticks advance it too, otherwise
/// they would be reselected forever.
pub fn plan_refresh(
    instrument: &InstrumentRef,
    bucket_width_ms: i64,
    watermark: Option<&Watermark>,
    ticks: &[TradeTick],
    seeded: &[Candle],
) -> RefreshDelta {
    let floor = watermark.map(|w| w.key());

    let mut aggregator =
        CandleAggregator::new(&instrument.instrument_id, instrument.side, bucket_width_ms);
    aggregator.seed_all(seeded);

    let mut stale = 0u64;
    let mut high_key = None;
    for tick in ticks {
        let key = tick.key();
        if floor.is_some_and(|f| key <= f) {
            stale += 1;
            continue;
        }
        if high_key.map_or(true, |k| key > k) {
            high_key = Some(key);
        }
        aggregator.add_tick(tick);
    }

    let mut out = aggregator.finish();
    out.stats.duplicates_skipped += stale;

    let new_watermark = high_key.map(|key| Watermark {
        instrument_id: instrument.instrument_id.clone(),
        last_seen_event_time: key.event_time,
        last_seen_event_id: key.event_id,
    });

    RefreshDelta {
        candles: out.candles,
        new_watermark,
        stats: out.stats,
    }
}
