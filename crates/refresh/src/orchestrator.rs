//! Refresh orchestration.
//!
//! Resolves a scope to instruments, fans the per-instrument work out over
//! a fixed-size worker pool, and keeps the watermark contract: candles and
//! watermark commit together, same-instrument refreshes serialize, and one
//! instrument's failure never aborts unrelated instruments.

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use tickalign_candles::AggregationStats;
use tickalign_core::{
    format_ts, ts_to_bucket, CancelToken, Config, Error, InstrumentRef, Result,
};
use tickalign_store::SqliteStore;
use tracing::{debug, info, warn};

use crate::plan::plan_refresh;

/// Which instruments a refresh run covers.
///
/// Scope restriction never touches watermarks outside the scope, which is
/// what makes targeted backfills safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    /// Every instrument known to the store.
    All,
    /// An explicit instrument subset.
    Instruments(Vec<String>),
    /// Every instrument mapped to the given sports events.
    Events(Vec<String>),
}

/// A per-instrument failure, isolated from the rest of the run.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentFailure {
    pub instrument_id: String,
    pub error: String,
    pub retryable: bool,
}

/// Summary of one refresh invocation, for the operational surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    /// Instruments whose refresh ran to completion (including no-op skips).
    pub instruments_processed: usize,
    /// Instruments with no ticks newer than their watermark.
    pub instruments_skipped: usize,
    /// Instruments not started because of cancellation.
    pub instruments_not_started: usize,
    /// Candles merge-written across all instruments.
    pub candles_written: usize,
    /// Malformed ticks skipped (counted, non-fatal).
    pub ticks_rejected: usize,
    /// Duplicate tick deliveries skipped.
    pub duplicates_skipped: u64,
    /// Per-instrument failures; the rest of the run is unaffected.
    pub failures: Vec<InstrumentFailure>,
    /// Whether the run was cancelled before finishing every instrument.
    pub cancelled: bool,
}

impl RefreshReport {
    /// Whether every in-scope instrument completed without failure.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

enum InstrumentOutcome {
    Processed {
        candles_written: usize,
        stats: AggregationStats,
    },
    Skipped,
    NotStarted,
    Failed {
        instrument_id: String,
        error: Error,
    },
}

/// Pulls ticks newer than each watermark, aggregates them, merge-writes
/// candles, and advances the watermark — atomically per instrument.
pub struct RefreshOrchestrator {
    store: Arc<SqliteStore>,
    config: Config,
    /// In-process writer locks: the same instrument must be single-writer.
    writer_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RefreshOrchestrator {
    /// Create an orchestrator over the given store.
    pub fn new(store: Arc<SqliteStore>, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            writer_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Refresh every instrument in scope at the given bucket width.
    ///
    /// Instruments run in parallel on a fixed-size pool; failures are
    /// collected per instrument. Only an `InvariantViolation` aborts the
    /// whole run.
    pub fn refresh(
        &self,
        scope: &RefreshScope,
        bucket_width_ms: i64,
        cancel: &CancelToken,
    ) -> Result<RefreshReport> {
        if bucket_width_ms <= 0 {
            return Err(Error::config("bucket_width_ms must be positive"));
        }

        let (targets, unmapped) = self.resolve_scope(scope)?;

        let mut report = RefreshReport::default();
        for instrument_id in unmapped {
            // Filing candles under a guessed side would put them at the
            // wrong key once the mapping lands; a later mapping makes the
            // same call succeed, so this is retryable.
            warn!(instrument_id = %instrument_id, "scoped instrument has no side mapping");
            report.failures.push(InstrumentFailure {
                instrument_id,
                error: "instrument has no side mapping".to_string(),
                retryable: true,
            });
        }
        if targets.is_empty() {
            debug!("refresh scope resolved to no instruments");
            return Ok(report);
        }

        let workers = self.worker_count(targets.len());
        info!(
            instruments = targets.len(),
            workers, bucket_width_ms, "starting refresh"
        );

        let (task_tx, task_rx) = unbounded::<InstrumentRef>();
        for target in targets {
            // Receiver outlives this loop; send cannot fail.
            let _ = task_tx.send(target);
        }
        drop(task_tx);

        let (out_tx, out_rx) = unbounded::<InstrumentOutcome>();
        thread::scope(|s| {
            for _ in 0..workers {
                let task_rx = task_rx.clone();
                let out_tx = out_tx.clone();
                s.spawn(move || {
                    while let Ok(target) = task_rx.recv() {
                        if cancel.is_cancelled() {
                            let _ = out_tx.send(InstrumentOutcome::NotStarted);
                            continue;
                        }
                        let outcome = self.refresh_instrument(&target, bucket_width_ms);
                        if let InstrumentOutcome::Failed { ref error, .. } = outcome {
                            if error.is_fatal() {
                                cancel.cancel();
                            }
                        }
                        let _ = out_tx.send(outcome);
                    }
                });
            }
        });
        drop(out_tx);

        let mut fatal: Option<Error> = None;
        for outcome in out_rx.iter() {
            match outcome {
                InstrumentOutcome::Processed {
                    candles_written,
                    stats,
                } => {
                    report.instruments_processed += 1;
                    report.candles_written += candles_written;
                    report.ticks_rejected += stats.rejected_count();
                    report.duplicates_skipped += stats.duplicates_skipped;
                }
                InstrumentOutcome::Skipped => {
                    report.instruments_processed += 1;
                    report.instruments_skipped += 1;
                }
                InstrumentOutcome::NotStarted => {
                    report.instruments_not_started += 1;
                }
                InstrumentOutcome::Failed {
                    instrument_id,
                    error,
                } => {
                    if error.is_fatal() && fatal.is_none() {
                        fatal = Some(error);
                    } else {
                        warn!(instrument_id = %instrument_id, error = %error, "instrument refresh failed");
                        report.failures.push(InstrumentFailure {
                            instrument_id,
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
            instruments_processed = report.instruments_processed,
            candles_written = report.candles_written,
            failed = report.failures.len(),
            cancelled = report.cancelled,
            "refresh finished"
        );
        Ok(report)
    }

    fn worker_count(&self, targets: usize) -> usize {
        let configured = if self.config.refresh.workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.config.refresh.workers
        };
        configured.clamp(1, targets.max(1))
    }

    /// Resolve a scope to `(targets, unmapped instrument ids)`.
    ///
    /// An explicitly scoped instrument without a side mapping is never
    /// defaulted; it comes back in the second list and is reported as a
    /// retryable failure.
    fn resolve_scope(&self, scope: &RefreshScope) -> Result<(Vec<InstrumentRef>, Vec<String>)> {
        match scope {
            RefreshScope::All => Ok((self.store.all_instrument_refs()?, Vec::new())),
            RefreshScope::Instruments(ids) => {
                let mut targets = Vec::new();
                let mut unmapped = Vec::new();
                for id in ids {
                    match self.store.side_for_instrument(id)? {
                        Some(side) => targets.push(InstrumentRef {
                            instrument_id: id.clone(),
                            side,
                        }),
                        None => unmapped.push(id.clone()),
                    }
                }
                Ok((targets, unmapped))
            }
            RefreshScope::Events(event_ids) => {
                let mut seen = HashMap::new();
                for event_id in event_ids {
                    for target in self.store.instruments_for_event(event_id)? {
                        seen.entry(target.instrument_id.clone()).or_insert(target);
                    }
                }
                let mut targets: Vec<InstrumentRef> = seen.into_values().collect();
                targets.sort_by(|a, b| a.instrument_id.cmp(&b.instrument_id));
                Ok((targets, Vec::new()))
            }
        }
    }

    fn writer_lock(&self, instrument_id: &str) -> Arc<Mutex<()>> {
        self.writer_locks
            .lock()
            .entry(instrument_id.to_string())
            .or_default()
            .clone()
    }

    fn refresh_instrument(
        &self,
        target: &InstrumentRef,
        bucket_width_ms: i64,
    ) -> InstrumentOutcome {
        let lock = self.writer_lock(&target.instrument_id);
        let _guard = match lock.try_lock() {
            Some(guard) => guard,
            // A concurrent refresh holds this instrument; retryable.
            None => {
                return InstrumentOutcome::Failed {
                    instrument_id: target.instrument_id.clone(),
                    error: Error::watermark_conflict(&target.instrument_id),
                }
            }
        };

        match self.try_refresh(target, bucket_width_ms) {
            Ok(Some((candles_written, stats))) => InstrumentOutcome::Processed {
                candles_written,
                stats,
            },
            Ok(None) => InstrumentOutcome::Skipped,
            Err(error) => InstrumentOutcome::Failed {
                instrument_id: target.instrument_id.clone(),
                error,
            },
        }
    }

    fn try_refresh(
        &self,
        target: &InstrumentRef,
        bucket_width_ms: i64,
    ) -> Result<Option<(usize, AggregationStats)>> {
        let watermark = self.store.watermark(&target.instrument_id)?;
        let after = watermark
            .as_ref()
            .map(|w| w.key())
            .unwrap_or(tickalign_core::TickKey::ORIGIN);
        let ticks = self.store.ticks_after(&target.instrument_id, after)?;
        if ticks.is_empty() {
            debug!(instrument_id = %target.instrument_id, "no ticks past watermark");
            return Ok(None);
        }

        // Seed every persisted candle the batch could touch.
        let min_bucket = ticks
            .iter()
            .map(|t| ts_to_bucket(t.event_time, bucket_width_ms))
            .min()
            .expect("batch is non-empty");
        let max_bucket = ticks
            .iter()
            .map(|t| ts_to_bucket(t.event_time, bucket_width_ms))
            .max()
            .expect("batch is non-empty");
        let seeded = self.store.candles_in_range(
            &target.instrument_id,
            target.side,
            bucket_width_ms,
            min_bucket,
            max_bucket,
        )?;

        let delta = plan_refresh(target, bucket_width_ms, watermark.as_ref(), &ticks, &seeded);
        let new_watermark = match delta.new_watermark {
            Some(wm) => wm,
            // Everything in the batch was a duplicate delivery.
            None => return Ok(None),
        };

        let written = self
            .store
            .commit_refresh(watermark.as_ref(), &new_watermark, &delta.candles)?;
        info!(
            instrument_id = %target.instrument_id,
            candles_written = written,
            ticks = ticks.len(),
            rejected = delta.stats.rejected_count(),
            window_start = %format_ts(min_bucket),
            "refreshed instrument"
        );
        Ok(Some((written, delta.stats)))
    }
}
