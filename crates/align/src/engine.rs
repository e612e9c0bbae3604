//! Bounded-tolerance alignment of probability snapshots to candles.
//!
//! A two-pointer merge over the two pre-sorted sequences: linear in
//! snapshot count plus candle count, never quadratic.

use tickalign_core::{
    AlignedRow, AlignmentConfig, Candle, CandleMatch, InstrumentAlignment, InstrumentRef,
    ProbabilitySnapshot,
};
use tracing::debug;

/// Finds the best-matching candle (or none) for each snapshot.
pub struct AlignmentEngine {
    backward_tolerance_ms: i64,
    forward_tolerance_ms: i64,
    carry_forward: bool,
}

impl AlignmentEngine {
    /// Create an engine from alignment configuration.
    pub fn new(config: &AlignmentConfig) -> Self {
        Self {
            backward_tolerance_ms: config.backward_tolerance_ms,
            forward_tolerance_ms: config.forward_tolerance_ms,
            carry_forward: config.carry_forward,
        }
    }

    /// Align a time-ordered snapshot stream to a time-ordered candle
    /// sequence for one instrument.
    ///
    /// The best candidate minimizes `|bucket_start - snapshot_time|`
    /// within `[t - backward_tolerance, t + forward_tolerance]`;
    /// equidistant candidates resolve to the earlier bucket. Without a
    /// candidate the row is `Unmatched` — or, with carry-forward enabled,
    /// the most recent candle strictly before the snapshot with the true
    /// gap recorded.
    pub fn align(&self, snapshots: &[ProbabilitySnapshot], candles: &[Candle]) -> Vec<CandleMatch> {
        debug_assert!(snapshots.windows(2).all(|w| w[0].snapshot_time <= w[1].snapshot_time));
        debug_assert!(candles.windows(2).all(|w| w[0].bucket_start < w[1].bucket_start));

        let mut out = Vec::with_capacity(snapshots.len());
        // Cursor over the last candle with bucket_start <= snapshot_time.
        let mut idx = 0usize;

        for snap in snapshots {
            if !snap.is_well_formed() {
                out.push(CandleMatch::Rejected {
                    reason: format!("probability {} outside [0, 1]", snap.probability),
                });
                continue;
            }

            let t = snap.snapshot_time;
            while idx + 1 < candles.len() && candles[idx + 1].bucket_start <= t {
                idx += 1;
            }
            let before = candles.get(idx).filter(|c| c.bucket_start <= t);
            let after = candles.get(if before.is_some() { idx + 1 } else { idx });

            let backward = before.and_then(|c| {
                let gap = t - c.bucket_start;
                (gap <= self.backward_tolerance_ms).then_some((c, gap))
            });
            let forward = after.and_then(|c| {
                let gap = c.bucket_start - t;
                (gap <= self.forward_tolerance_ms).then_some((c, gap))
            });

            let outcome = match (backward, forward) {
                // Ties resolve to the earlier bucket.
                (Some((c, gap_b)), Some((_, gap_f))) if gap_b <= gap_f => CandleMatch::Matched {
                    candle: c.clone(),
                    gap_ms: gap_b,
                },
                (_, Some((c, gap))) => CandleMatch::Matched {
                    candle: c.clone(),
                    gap_ms: gap,
                },
                (Some((c, gap)), None) => CandleMatch::Matched {
                    candle: c.clone(),
                    gap_ms: gap,
                },
                (None, None) => match before {
                    Some(c) if self.carry_forward && c.bucket_start < t => {
                        CandleMatch::CarriedForward {
                            candle: c.clone(),
                            gap_ms: t - c.bucket_start,
                        }
                    }
                    _ => CandleMatch::Unmatched,
                },
            };
            out.push(outcome);
        }
        out
    }

    /// Align every instrument of an event independently, then combine the
    /// outcomes into one row per snapshot.
    pub fn align_event(
        &self,
        snapshots: &[ProbabilitySnapshot],
        instruments: &[(InstrumentRef, Vec<Candle>)],
    ) -> Vec<AlignedRow> {
        let per_instrument: Vec<(&InstrumentRef, Vec<CandleMatch>)> = instruments
            .iter()
            .map(|(target, candles)| (target, self.align(snapshots, candles)))
            .collect();

        let rows: Vec<AlignedRow> = snapshots
            .iter()
            .enumerate()
            .map(|(i, snap)| AlignedRow {
                snapshot: snap.clone(),
                alignments: per_instrument
                    .iter()
                    .map(|(target, matches)| InstrumentAlignment {
                        instrument_id: target.instrument_id.clone(),
                        side: target.side,
                        outcome: matches[i].clone(),
                    })
                    .collect(),
            })
            .collect();

        let matched = rows
            .iter()
            .flat_map(|r| &r.alignments)
            .filter(|a| a.outcome.is_matched())
            .count();
        debug!(
            snapshots = snapshots.len(),
            instruments = instruments.len(),
            matched,
            "aligned event"
        );
        rows
    }
}
