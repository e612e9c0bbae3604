//! Core data types for the tickalign system.

use chrono::{LocalResult, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp in milliseconds since Unix epoch (UTC).
pub type TimestampMs = i64;

/// Price in integer cents of implied probability (yes scale, 0..=100).
pub type PriceCents = i64;

/// Floor a timestamp to its bucket boundary.
///
/// Computed on absolute time, timezone-independent. `div_euclid` keeps the
/// floor semantics for pre-epoch timestamps.
#[inline]
pub fn ts_to_bucket(ts_ms: TimestampMs, bucket_width_ms: i64) -> TimestampMs {
    ts_ms.div_euclid(bucket_width_ms) * bucket_width_ms
}

/// Render a millisecond timestamp as UTC for logs and reports.
pub fn format_ts(ts_ms: TimestampMs) -> String {
    match Utc.timestamp_millis_opt(ts_ms) {
        LocalResult::Single(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        _ => format!("{}ms", ts_ms),
    }
}

/// Side of a prediction-market contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    /// Stable string form used in storage keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    /// Parse the storage string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yes" => Some(Side::Yes),
            "no" => Some(Side::No),
            _ => None,
        }
    }
}

/// Total order over ticks: `(event_time, event_id)` lexicographic.
///
/// Watermarks advance by this key, and open/close selection within a bucket
/// is defined by it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TickKey {
    pub event_time: TimestampMs,
    pub event_id: i64,
}

impl TickKey {
    /// Sentinel ordering before every real tick.
    pub const ORIGIN: TickKey = TickKey {
        event_time: i64::MIN,
        event_id: i64::MIN,
    };
}

/// A single trade print from the venue. Immutable, externally owned.
///
/// `event_id` is the venue trade sequence id; it is unrelated to the sports
/// event id carried on probability snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeTick {
    pub instrument_id: String,
    /// Yes-side price in cents, when the print carried one.
    pub yes_price: Option<PriceCents>,
    /// No-side price in cents, when the print carried one.
    pub no_price: Option<PriceCents>,
    /// Traded quantity (contracts).
    pub quantity: f64,
    pub event_time: TimestampMs,
    pub event_id: i64,
}

impl TradeTick {
    /// Ordering key for watermarks and open/close selection.
    #[inline]
    pub fn key(&self) -> TickKey {
        TickKey {
            event_time: self.event_time,
            event_id: self.event_id,
        }
    }

    /// Price normalized onto the yes-cents scale.
    ///
    /// A no-side price `p` maps to `100 - p`. Returns `None` when the print
    /// carried neither price field.
    #[inline]
    pub fn normalized_price(&self) -> Option<PriceCents> {
        match (self.yes_price, self.no_price) {
            (Some(p), _) => Some(p),
            (None, Some(p)) => Some(100 - p),
            (None, None) => None,
        }
    }
}

/// An OHLCV candle for one `(instrument, side, bucket_width, bucket_start)`.
///
/// Derived state, mutated only by merge-write. Prices are on the yes-cents
/// scale. `first_*`/`last_*` record the tick keys that defined open and
/// close so merges stay deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument_id: String,
    pub side: Side,
    pub bucket_width_ms: i64,
    pub bucket_start: TimestampMs,
    pub open: PriceCents,
    pub high: PriceCents,
    pub low: PriceCents,
    pub close: PriceCents,
    /// Quantity-weighted mean price.
    pub vw_mean: f64,
    /// Sum of traded quantities.
    pub volume: f64,
    pub first_event_time: TimestampMs,
    pub first_event_id: i64,
    pub last_event_time: TimestampMs,
    pub last_event_id: i64,
}

impl Candle {
    /// Key of the tick that set the open.
    #[inline]
    pub fn first_key(&self) -> TickKey {
        TickKey {
            event_time: self.first_event_time,
            event_id: self.first_event_id,
        }
    }

    /// Key of the tick that set the close.
    #[inline]
    pub fn last_key(&self) -> TickKey {
        TickKey {
            event_time: self.last_event_time,
            event_id: self.last_event_id,
        }
    }
}

/// Highest tick key durably incorporated into candles for an instrument.
///
/// Monotone by `TickKey`; mutated only by the refresh orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub instrument_id: String,
    pub last_seen_event_time: TimestampMs,
    pub last_seen_event_id: i64,
}

impl Watermark {
    /// Beginning-of-time sentinel: every real tick is newer.
    pub fn origin(instrument_id: impl Into<String>) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            last_seen_event_time: TickKey::ORIGIN.event_time,
            last_seen_event_id: TickKey::ORIGIN.event_id,
        }
    }

    #[inline]
    pub fn key(&self) -> TickKey {
        TickKey {
            event_time: self.last_seen_event_time,
            event_id: self.last_seen_event_id,
        }
    }

    /// Whether a tick with this key is strictly newer than the watermark.
    #[inline]
    pub fn accepts(&self, key: TickKey) -> bool {
        key > self.key()
    }
}

/// Which team holds possession, when the feed reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Possession {
    Home,
    Away,
}

/// Possession as the explicit three-way category emitted downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PossessionCategory {
    Home,
    Away,
    Unknown,
}

impl From<Option<Possession>> for PossessionCategory {
    fn from(p: Option<Possession>) -> Self {
        match p {
            Some(Possession::Home) => PossessionCategory::Home,
            Some(Possession::Away) => PossessionCategory::Away,
            None => PossessionCategory::Unknown,
        }
    }
}

impl PossessionCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            PossessionCategory::Home => "home",
            PossessionCategory::Away => "away",
            PossessionCategory::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "home" => Some(PossessionCategory::Home),
            "away" => Some(PossessionCategory::Away),
            "unknown" => Some(PossessionCategory::Unknown),
            _ => None,
        }
    }
}

/// A probability estimate from the live sports feed. Immutable, externally
/// owned, keyed by `(event_id, snapshot_time, seq_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbabilitySnapshot {
    /// Sports event id (opaque string, not the tick sequence id).
    pub event_id: String,
    pub snapshot_time: TimestampMs,
    /// Feed sequence id; tie-breaker for discretized snapshot selection.
    pub seq_id: i64,
    pub probability: f64,
    pub period: u8,
    /// Game clock remaining in regulation, in seconds. Never total elapsed
    /// time: that would leak overtime length.
    pub clock_remaining_regulation_s: i64,
    pub score_differential: i32,
    pub possession: Option<Possession>,
}

impl ProbabilitySnapshot {
    /// Whether the probability field is usable at all.
    pub fn is_well_formed(&self) -> bool {
        self.probability.is_finite() && (0.0..=1.0).contains(&self.probability)
    }
}

/// A `(instrument, side)` pair relevant to a sports event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentRef {
    pub instrument_id: String,
    pub side: Side,
}

/// Per-snapshot, per-instrument alignment outcome.
///
/// A tagged result, never a silent drop: unmatched and rejected rows stay
/// visible to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CandleMatch {
    /// Best candle within the tolerance window.
    Matched { candle: Candle, gap_ms: i64 },
    /// Carry-forward from the most recent candle strictly before the
    /// snapshot; the true (out-of-tolerance) gap is recorded.
    CarriedForward { candle: Candle, gap_ms: i64 },
    /// No candidate; the gap is unbounded.
    Unmatched,
    /// The snapshot could not be aligned at all (malformed input).
    Rejected { reason: String },
}

impl CandleMatch {
    pub fn candle(&self) -> Option<&Candle> {
        match self {
            CandleMatch::Matched { candle, .. } | CandleMatch::CarriedForward { candle, .. } => {
                Some(candle)
            }
            _ => None,
        }
    }

    /// The recorded gap; `None` when unmatched or rejected.
    pub fn gap_ms(&self) -> Option<i64> {
        match self {
            CandleMatch::Matched { gap_ms, .. } | CandleMatch::CarriedForward { gap_ms, .. } => {
                Some(*gap_ms)
            }
            _ => None,
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, CandleMatch::Matched { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, CandleMatch::Rejected { .. })
    }
}

/// Alignment outcome for one instrument of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentAlignment {
    pub instrument_id: String,
    pub side: Side,
    pub outcome: CandleMatch,
}

/// One snapshot combined with the alignment outcome of every instrument of
/// its event. Ephemeral, recomputed per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignedRow {
    pub snapshot: ProbabilitySnapshot,
    pub alignments: Vec<InstrumentAlignment>,
}

impl AlignedRow {
    pub fn event_id(&self) -> &str {
        &self.snapshot.event_id
    }

    pub fn snapshot_time(&self) -> TimestampMs {
        self.snapshot.snapshot_time
    }

    /// First alignment for the given side, if the event maps one.
    pub fn for_side(&self, side: Side) -> Option<&InstrumentAlignment> {
        self.alignments.iter().find(|a| a.side == side)
    }
}

/// Canonical materialized output row, one per `(event, snapshot)`.
///
/// The field set is closed: `tickalign-features` validates every row
/// against its allow-list before it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub event_id: String,
    pub snapshot_time: TimestampMs,
    pub period: u8,
    pub clock_remaining_regulation_s: i64,
    pub score_differential: i32,
    pub possession: PossessionCategory,
    pub probability: f64,
    /// Matched yes-side candle close (yes cents); null when unmatched.
    pub yes_price: Option<PriceCents>,
    pub yes_gap_ms: Option<i64>,
    /// Matched no-side candle close (yes cents); null when unmatched.
    pub no_price: Option<PriceCents>,
    pub no_gap_ms: Option<i64>,
}
