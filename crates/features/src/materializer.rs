//! Feature materialization.
//!
//! Resolves a scope to sports events, aligns each event's snapshot stream
//! to its instruments' candles, discretizes the stream on the regulation
//! clock, validates every row against the allow-list, and replace-writes
//! the event's rows. Events run in parallel; rows within one event are
//! built sequentially in snapshot order.

use crossbeam_channel::unbounded;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use tickalign_align::AlignmentEngine;
use tickalign_core::{
    AlignedRow, CancelToken, Candle, Config, Error, FeatureRow, InstrumentRef, Result, Side,
};
use tickalign_store::SqliteStore;
use tracing::{debug, info, warn};

use crate::allowlist::validate_row;

/// Which sports events a materialization run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeScope {
    /// Every event with stored snapshots.
    All,
    /// An explicit event subset.
    Events(Vec<String>),
}

/// A per-event failure, isolated from the rest of the run.
#[derive(Debug, Clone, Serialize)]
pub struct EventFailure {
    pub event_id: String,
    pub error: String,
    pub retryable: bool,
}

/// Summary of one materialization invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaterializeReport {
    /// Events whose materialization ran to completion.
    pub events_processed: usize,
    /// Events with no snapshots (nothing to write).
    pub events_skipped: usize,
    /// Events not started because of cancellation.
    pub events_not_started: usize,
    /// Feature rows written across all events.
    pub rows_written: usize,
    /// Snapshots dropped for malformed input (counted, non-fatal).
    pub snapshots_rejected: usize,
    /// Snapshots collapsed away by clock discretization.
    pub snapshots_collapsed: usize,
    /// Per-event failures; the rest of the run is unaffected.
    pub failures: Vec<EventFailure>,
    /// Whether the run was cancelled before finishing every event.
    pub cancelled: bool,
}

impl MaterializeReport {
    /// Whether every in-scope event completed without failure.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

enum EventOutcome {
    Processed {
        rows_written: usize,
        snapshots_rejected: usize,
        snapshots_collapsed: usize,
    },
    Skipped,
    NotStarted,
    Failed {
        event_id: String,
        error: Error,
    },
}

/// Builds the canonical per-event feature rows from snapshots and candles.
pub struct FeatureMaterializer {
    store: Arc<SqliteStore>,
    config: Config,
    engine: AlignmentEngine,
}

impl FeatureMaterializer {
    /// Create a materializer over the given store.
    pub fn new(store: Arc<SqliteStore>, config: Config) -> Result<Self> {
        config.validate()?;
        let engine = AlignmentEngine::new(&config.alignment);
        Ok(Self {
            store,
            config,
            engine,
        })
    }

    /// Materialize every event in scope against candles at the configured
    /// bucket width.
    ///
    /// Events run in parallel on a fixed-size pool. A leaked field is an
    /// `InvariantViolation` and aborts the whole run; every other failure
    /// is collected per event.
    pub fn materialize(
        &self,
        scope: &MaterializeScope,
        cancel: &CancelToken,
    ) -> Result<MaterializeReport> {
        let bucket_width_ms = self.config.candle.bucket_width_ms;
        let events = self.resolve_scope(scope)?;
        if events.is_empty() {
            debug!("materialize scope resolved to no events");
            return Ok(MaterializeReport::default());
        }

        let workers = self.worker_count(events.len());
        info!(events = events.len(), workers, bucket_width_ms, "starting materialization");

        let (task_tx, task_rx) = unbounded::<String>();
        for event_id in events {
            // Receiver outlives this loop; send cannot fail.
            let _ = task_tx.send(event_id);
        }
        drop(task_tx);

        let (out_tx, out_rx) = unbounded::<EventOutcome>();
        thread::scope(|s| {
            for _ in 0..workers {
                let task_rx = task_rx.clone();
                let out_tx = out_tx.clone();
                s.spawn(move || {
                    while let Ok(event_id) = task_rx.recv() {
                        if cancel.is_cancelled() {
                            let _ = out_tx.send(EventOutcome::NotStarted);
                            continue;
                        }
                        let outcome = match self.materialize_event(&event_id, bucket_width_ms) {
                            Ok(outcome) => outcome,
                            Err(error) => {
                                if error.is_fatal() {
                                    cancel.cancel();
                                }
                                EventOutcome::Failed { event_id, error }
                            }
                        };
                        let _ = out_tx.send(outcome);
                    }
                });
            }
        });
        drop(out_tx);

        let mut report = MaterializeReport::default();
        let mut fatal: Option<Error> = None;
        for outcome in out_rx.iter() {
            match outcome {
                EventOutcome::Processed {
                    rows_written,
                    snapshots_rejected,
                    snapshots_collapsed,
                } => {
                    report.events_processed += 1;
                    report.rows_written += rows_written;
                    report.snapshots_rejected += snapshots_rejected;
                    report.snapshots_collapsed += snapshots_collapsed;
                }
                EventOutcome::Skipped => {
                    report.events_processed += 1;
                    report.events_skipped += 1;
                }
                EventOutcome::NotStarted => {
                    report.events_not_started += 1;
                }
                EventOutcome::Failed { event_id, error } => {
                    if error.is_fatal() && fatal.is_none() {
                        fatal = Some(error);
                    } else {
                        warn!(event_id = %event_id, error = %error, "event materialization failed");
                        report.failures.push(EventFailure {
                            event_id,
                            retryable: error.is_retryable(),
                            error: error.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(error) = fatal {
            return Err(error);
        }
        report.cancelled = cancel.is_cancelled();
        info!(
            events_processed = report.events_processed,
            rows_written = report.rows_written,
            failed = report.failures.len(),
            cancelled = report.cancelled,
            "materialization finished"
        );
        Ok(report)
    }

    fn worker_count(&self, events: usize) -> usize {
        let configured = if self.config.refresh.workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.config.refresh.workers
        };
        configured.clamp(1, events.max(1))
    }

    fn resolve_scope(&self, scope: &MaterializeScope) -> Result<Vec<String>> {
        match scope {
            MaterializeScope::All => self.store.all_event_ids(),
            MaterializeScope::Events(ids) => {
                let mut ids = ids.clone();
                ids.sort();
                ids.dedup();
                Ok(ids)
            }
        }
    }

    fn materialize_event(&self, event_id: &str, bucket_width_ms: i64) -> Result<EventOutcome> {
        let snapshots = self.store.snapshots_for_event(event_id)?;
        if snapshots.is_empty() {
            debug!(event_id = %event_id, "no snapshots stored");
            return Ok(EventOutcome::Skipped);
        }

        let instruments = self.store.instruments_for_event(event_id)?;
        let last_time = snapshots.last().map(|s| s.snapshot_time).unwrap_or(0);
        let horizon = last_time.saturating_add(self.config.alignment.forward_tolerance_ms);

        let mut with_candles: Vec<(InstrumentRef, Vec<Candle>)> =
            Vec::with_capacity(instruments.len());
        for target in instruments {
            // Carry-forward may reach arbitrarily far back, so the range is
            // open at the start.
            let candles = self.store.candles_in_range(
                &target.instrument_id,
                target.side,
                bucket_width_ms,
                i64::MIN,
                horizon,
            )?;
            with_candles.push((target, candles));
        }

        let aligned = self.engine.align_event(&snapshots, &with_candles);
        // Judged on the snapshot itself, not on alignment outcomes: an
        // event with no mapped instruments has empty alignments, and its
        // malformed snapshots still must never reach the feature table.
        let rejected = aligned
            .iter()
            .filter(|row| !row.snapshot.is_well_formed())
            .count();

        let selected = self.discretize(&aligned);
        let collapsed = aligned.len() - rejected - selected.len();

        let mut rows = Vec::with_capacity(selected.len());
        for aligned_row in selected {
            let row = build_row(aligned_row);
            validate_row(&row)?;
            rows.push(row);
        }

        let written = self.store.replace_feature_rows(event_id, &rows)?;
        info!(
            event_id = %event_id,
            rows_written = written,
            rejected,
            collapsed,
            "materialized event"
        );
        Ok(EventOutcome::Processed {
            rows_written: written,
            snapshots_rejected: rejected,
            snapshots_collapsed: collapsed,
        })
    }

    /// Keep one snapshot per `(period, clock bucket)`: the one closest to
    /// the bucket's target clock, ties resolved by the larger feed
    /// sequence id. Malformed snapshots never participate.
    fn discretize<'a>(&self, aligned: &'a [AlignedRow]) -> Vec<&'a AlignedRow> {
        let width = self.config.materialize.clock_bucket_s;
        let mut best: BTreeMap<(u8, i64), &AlignedRow> = BTreeMap::new();

        for row in aligned {
            if !row.snapshot.is_well_formed() {
                continue;
            }
            let clock = row.snapshot.clock_remaining_regulation_s;
            let target = nearest_multiple(clock, width);
            let key = (row.snapshot.period, target);
            match best.get(&key) {
                Some(current) => {
                    let gap = (clock - target).abs();
                    let current_gap =
                        (current.snapshot.clock_remaining_regulation_s - target).abs();
                    if gap < current_gap
                        || (gap == current_gap && row.snapshot.seq_id > current.snapshot.seq_id)
                    {
                        best.insert(key, row);
                    }
                }
                None => {
                    best.insert(key, row);
                }
            }
        }

        let mut selected: Vec<&AlignedRow> = best.into_values().collect();
        selected.sort_by_key(|r| (r.snapshot.snapshot_time, r.snapshot.seq_id));
        selected
    }
}

/// Round a clock reading to the nearest bucket target (half rounds up).
#[inline]
fn nearest_multiple(clock: i64, width: i64) -> i64 {
    (clock + width / 2).div_euclid(width) * width
}

fn build_row(aligned: &AlignedRow) -> FeatureRow {
    let snap = &aligned.snapshot;
    let yes = aligned.for_side(Side::Yes).map(|a| &a.outcome);
    let no = aligned.for_side(Side::No).map(|a| &a.outcome);
    FeatureRow {
        event_id: snap.event_id.clone(),
        snapshot_time: snap.snapshot_time,
        period: snap.period,
        clock_remaining_regulation_s: snap.clock_remaining_regulation_s,
        score_differential: snap.score_differential,
        possession: snap.possession.into(),
        probability: snap.probability,
        yes_price: yes.and_then(|m| m.candle()).map(|c| c.close),
        yes_gap_ms: yes.and_then(|m| m.gap_ms()),
        no_price: no.and_then(|m| m.candle()).map(|c| c.close),
        no_gap_ms: no.and_then(|m| m.gap_ms()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickalign_core::{Possession, ProbabilitySnapshot, Watermark};

    const T0: i64 = 1_704_067_200_000;

    fn make_candle(instrument_id: &str, side: Side, bucket_start: i64, close: i64) -> Candle {
        Candle {
            instrument_id: instrument_id.to_string(),
            side,
            bucket_width_ms: 60_000,
            bucket_start,
            open: close,
            high: close,
            low: close,
            close,
            vw_mean: close as f64,
            volume: 1.0,
            first_event_time: bucket_start,
            first_event_id: 1,
            last_event_time: bucket_start,
            last_event_id: 1,
        }
    }

    fn make_snapshot(event_id: &str, snapshot_time: i64, seq_id: i64, clock: i64) -> ProbabilitySnapshot {
        ProbabilitySnapshot {
            event_id: event_id.to_string(),
            snapshot_time,
            seq_id,
            probability: 0.55,
            period: 1,
            clock_remaining_regulation_s: clock,
            score_differential: 2,
            possession: Some(Possession::Home),
        }
    }

    fn commit_candles(store: &SqliteStore, instrument_id: &str, candles: &[Candle]) {
        let last = candles.last().unwrap();
        let wm = Watermark {
            instrument_id: instrument_id.to_string(),
            last_seen_event_time: last.last_event_time,
            last_seen_event_id: last.last_event_id,
        };
        store.commit_refresh(None, &wm, candles).unwrap();
    }

    fn materializer(store: Arc<SqliteStore>) -> FeatureMaterializer {
        let mut config = Config::default();
        config.refresh.workers = 2;
        FeatureMaterializer::new(store, config).unwrap()
    }

    fn seeded_store() -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.map_instrument("game-1", "mkt-yes", Side::Yes).unwrap();
        store.map_instrument("game-1", "mkt-no", Side::No).unwrap();
        commit_candles(&store, "mkt-yes", &[make_candle("mkt-yes", Side::Yes, T0, 58)]);
        commit_candles(&store, "mkt-no", &[make_candle("mkt-no", Side::No, T0 + 60_000, 44)]);
        store
    }

    #[test]
    fn test_materialize_event_end_to_end() {
        let store = seeded_store();
        store
            .append_snapshots(&[make_snapshot("game-1", T0 + 30_000, 1, 1_800)])
            .unwrap();

        let report = materializer(store.clone())
            .materialize(&MaterializeScope::All, &CancelToken::new())
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(report.rows_written, 1);

        let rows = store.feature_rows_for_event("game-1").unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.yes_price, Some(58));
        assert_eq!(row.yes_gap_ms, Some(30_000));
        assert_eq!(row.no_price, Some(44));
        assert_eq!(row.no_gap_ms, Some(30_000));
        assert_eq!(row.possession, tickalign_core::PossessionCategory::Home);
    }

    #[test]
    fn test_unmatched_side_stays_null() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.map_instrument("game-1", "mkt-yes", Side::Yes).unwrap();
        store.map_instrument("game-1", "mkt-no", Side::No).unwrap();
        // Only the yes side has a candle near the snapshot.
        commit_candles(&store, "mkt-yes", &[make_candle("mkt-yes", Side::Yes, T0, 58)]);
        store
            .append_snapshots(&[make_snapshot("game-1", T0 + 30_000, 1, 1_800)])
            .unwrap();

        materializer(store.clone())
            .materialize(&MaterializeScope::All, &CancelToken::new())
            .unwrap();

        let rows = store.feature_rows_for_event("game-1").unwrap();
        assert_eq!(rows[0].yes_price, Some(58));
        assert_eq!(rows[0].no_price, None);
        assert_eq!(rows[0].no_gap_ms, None);
    }

    #[test]
    fn test_clock_discretization_keeps_closest() {
        let store = seeded_store();
        // Three snapshots in the same 60s clock bucket around target 1740.
        store
            .append_snapshots(&[
                make_snapshot("game-1", T0 + 10_000, 1, 1_765),
                make_snapshot("game-1", T0 + 20_000, 2, 1_742),
                make_snapshot("game-1", T0 + 30_000, 3, 1_712),
            ])
            .unwrap();

        let report = materializer(store.clone())
            .materialize(&MaterializeScope::All, &CancelToken::new())
            .unwrap();
        assert_eq!(report.rows_written, 1);
        assert_eq!(report.snapshots_collapsed, 2);

        let rows = store.feature_rows_for_event("game-1").unwrap();
        assert_eq!(rows[0].clock_remaining_regulation_s, 1_742);
    }

    #[test]
    fn test_discretization_tie_prefers_larger_seq_id() {
        let store = seeded_store();
        // Both are 18s from the 1740 target.
        store
            .append_snapshots(&[
                make_snapshot("game-1", T0 + 10_000, 1, 1_758),
                make_snapshot("game-1", T0 + 20_000, 2, 1_722),
            ])
            .unwrap();

        materializer(store.clone())
            .materialize(&MaterializeScope::All, &CancelToken::new())
            .unwrap();

        let rows = store.feature_rows_for_event("game-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].clock_remaining_regulation_s, 1_722);
    }

    #[test]
    fn test_malformed_snapshot_counted_not_written() {
        let store = seeded_store();
        let mut bad = make_snapshot("game-1", T0 + 30_000, 1, 1_800);
        bad.probability = 1.4;
        store.append_snapshots(&[bad]).unwrap();

        let report = materializer(store.clone())
            .materialize(&MaterializeScope::All, &CancelToken::new())
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(report.snapshots_rejected, 1);
        assert_eq!(report.rows_written, 0);
        assert!(store.feature_rows_for_event("game-1").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_snapshot_without_mapping_not_written() {
        // No instrument mapping at all: alignments are empty, and the
        // malformed snapshot still must not reach the feature table.
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut bad = make_snapshot("game-1", T0 + 30_000, 1, 1_800);
        bad.probability = 1.4;
        store.append_snapshots(&[bad]).unwrap();

        let report = materializer(store.clone())
            .materialize(&MaterializeScope::All, &CancelToken::new())
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(report.snapshots_rejected, 1);
        assert_eq!(report.rows_written, 0);
        assert!(store.feature_rows_for_event("game-1").unwrap().is_empty());
    }

    #[test]
    fn test_rerun_replaces_rows() {
        let store = seeded_store();
        store
            .append_snapshots(&[make_snapshot("game-1", T0 + 30_000, 1, 1_800)])
            .unwrap();

        let mat = materializer(store.clone());
        mat.materialize(&MaterializeScope::All, &CancelToken::new())
            .unwrap();
        let first = store.feature_rows_for_event("game-1").unwrap();

        mat.materialize(&MaterializeScope::All, &CancelToken::new())
            .unwrap();
        let second = store.feature_rows_for_event("game-1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_overtime_presence_leaves_regulation_rows_unchanged() {
        // Two events with identical regulation snapshots; one also ran into
        // overtime. The regulation rows must be byte-identical apart from
        // the event id.
        let regulation = |event_id: &str| {
            vec![
                make_snapshot(event_id, T0 + 30_000, 1, 1_800),
                make_snapshot(event_id, T0 + 90_000, 2, 1_740),
            ]
        };

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        for event_id in ["game-reg", "game-ot"] {
            let yes = format!("{event_id}-yes");
            store.map_instrument(event_id, &yes, Side::Yes).unwrap();
            commit_candles(
                &store,
                &yes,
                &[
                    make_candle(&yes, Side::Yes, T0, 58),
                    make_candle(&yes, Side::Yes, T0 + 60_000, 61),
                ],
            );
            store.append_snapshots(&regulation(event_id)).unwrap();
        }
        let mut overtime = make_snapshot("game-ot", T0 + 4_000_000, 9, 0);
        overtime.period = 5;
        store.append_snapshots(&[overtime]).unwrap();

        materializer(store.clone())
            .materialize(&MaterializeScope::All, &CancelToken::new())
            .unwrap();

        let reg_rows = store.feature_rows_for_event("game-reg").unwrap();
        let mut ot_rows = store.feature_rows_for_event("game-ot").unwrap();
        let ot_regulation: Vec<_> = ot_rows
            .drain(..)
            .filter(|r| r.period < 5)
            .map(|mut r| {
                r.event_id = "game-reg".to_string();
                r
            })
            .collect();
        assert_eq!(reg_rows, ot_regulation);
    }

    #[test]
    fn test_scope_restriction() {
        let store = seeded_store();
        store.map_instrument("game-2", "mkt-2", Side::Yes).unwrap();
        store
            .append_snapshots(&[
                make_snapshot("game-1", T0 + 30_000, 1, 1_800),
                make_snapshot("game-2", T0 + 30_000, 2, 1_800),
            ])
            .unwrap();

        let report = materializer(store.clone())
            .materialize(
                &MaterializeScope::Events(vec!["game-1".to_string()]),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(report.events_processed, 1);
        assert!(store.feature_rows_for_event("game-2").unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_run_starts_nothing() {
        let store = seeded_store();
        store
            .append_snapshots(&[make_snapshot("game-1", T0 + 30_000, 1, 1_800)])
            .unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let report = materializer(store.clone())
            .materialize(&MaterializeScope::All, &cancel)
            .unwrap();

        assert_eq!(report.events_not_started, 1);
        assert!(report.cancelled);
        assert!(store.feature_rows_for_event("game-1").unwrap().is_empty());
    }
}
