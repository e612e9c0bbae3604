//! SQLite-backed durable store.
//!
//! Candle merge-writes and watermark advancement commit in a single
//! transaction; the watermark update is optimistic so a concurrent writer
//! on the same instrument surfaces as `WatermarkConflict` instead of a
//! lost update. Reads run under a bounded busy timeout and surface
//! `UpstreamUnavailable` rather than hang.

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;
use std::time::Duration;
use tickalign_core::{
    Candle, Config, Error, FeatureRow, InstrumentRef, Possession, PossessionCategory,
    ProbabilitySnapshot, Result, Side, TickKey, TimestampMs, TradeTick, Watermark,
};
use tracing::{debug, info};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

-- Externally owned: raw trade ticks, append-only.
CREATE TABLE IF NOT EXISTS ticks (
    instrument_id TEXT NOT NULL,
    event_time INTEGER NOT NULL,
    event_id INTEGER NOT NULL,
    yes_price INTEGER,
    no_price INTEGER,
    quantity REAL NOT NULL,
    PRIMARY KEY (instrument_id, event_time, event_id)
) WITHOUT ROWID;

-- Externally owned: probability snapshots, append-only.
CREATE TABLE IF NOT EXISTS snapshots (
    event_id TEXT NOT NULL,
    snapshot_time INTEGER NOT NULL,
    seq_id INTEGER NOT NULL,
    probability REAL NOT NULL,
    period INTEGER NOT NULL,
    clock_remaining_regulation_s INTEGER NOT NULL,
    score_differential INTEGER NOT NULL,
    possession TEXT,
    PRIMARY KEY (event_id, snapshot_time, seq_id)
) WITHOUT ROWID;

-- Externally owned: which instruments trade on which sports event.
CREATE TABLE IF NOT EXISTS instrument_events (
    event_id TEXT NOT NULL,
    instrument_id TEXT NOT NULL,
    side TEXT NOT NULL,
    PRIMARY KEY (event_id, instrument_id)
) WITHOUT ROWID;

-- Core-owned: derived candles, mutated only by merge-write.
CREATE TABLE IF NOT EXISTS candles (
    instrument_id TEXT NOT NULL,
    side TEXT NOT NULL,
    bucket_width_ms INTEGER NOT NULL,
    bucket_start INTEGER NOT NULL,
    open INTEGER NOT NULL,
    high INTEGER NOT NULL,
    low INTEGER NOT NULL,
    close INTEGER NOT NULL,
    vw_mean REAL NOT NULL,
    volume REAL NOT NULL,
    first_event_time INTEGER NOT NULL,
    first_event_id INTEGER NOT NULL,
    last_event_time INTEGER NOT NULL,
    last_event_id INTEGER NOT NULL,
    PRIMARY KEY (instrument_id, side, bucket_width_ms, bucket_start)
) WITHOUT ROWID;

-- Core-owned: one watermark per instrument.
CREATE TABLE IF NOT EXISTS watermarks (
    instrument_id TEXT PRIMARY KEY,
    last_seen_event_time INTEGER NOT NULL,
    last_seen_event_id INTEGER NOT NULL
) WITHOUT ROWID;

-- Core-owned: canonical materialized feature table.
CREATE TABLE IF NOT EXISTS feature_rows (
    event_id TEXT NOT NULL,
    snapshot_time INTEGER NOT NULL,
    period INTEGER NOT NULL,
    clock_remaining_regulation_s INTEGER NOT NULL,
    score_differential INTEGER NOT NULL,
    possession TEXT NOT NULL,
    probability REAL NOT NULL,
    yes_price INTEGER,
    yes_gap_ms INTEGER,
    no_price INTEGER,
    no_gap_ms INTEGER,
    PRIMARY KEY (event_id, snapshot_time)
) WITHOUT ROWID;
"#;

const CANDLE_COLUMNS: &str = "instrument_id, side, bucket_width_ms, bucket_start, \
     open, high, low, close, vw_mean, volume, \
     first_event_time, first_event_id, last_event_time, last_event_id";

const UPSERT_CANDLE: &str = "INSERT INTO candles (instrument_id, side, bucket_width_ms, bucket_start, \
     open, high, low, close, vw_mean, volume, \
     first_event_time, first_event_id, last_event_time, last_event_id) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
     ON CONFLICT(instrument_id, side, bucket_width_ms, bucket_start) DO UPDATE SET \
     open = excluded.open, high = excluded.high, low = excluded.low, \
     close = excluded.close, vw_mean = excluded.vw_mean, volume = excluded.volume, \
     first_event_time = excluded.first_event_time, first_event_id = excluded.first_event_id, \
     last_event_time = excluded.last_event_time, last_event_id = excluded.last_event_id";

/// Map a SQLite error into the core taxonomy: busy/locked means the read
/// or write hit the bounded timeout and is retryable.
fn map_sql_err(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            Error::upstream(format!("store access timed out: {e}"))
        }
        _ => Error::storage(e.to_string()),
    }
}

fn parse_side(idx: usize, s: String) -> rusqlite::Result<Side> {
    Side::parse(&s).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(idx, format!("side '{s}'"), rusqlite::types::Type::Text)
    })
}

fn candle_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candle> {
    Ok(Candle {
        instrument_id: row.get(0)?,
        side: parse_side(1, row.get(1)?)?,
        bucket_width_ms: row.get(2)?,
        bucket_start: row.get(3)?,
        open: row.get(4)?,
        high: row.get(5)?,
        low: row.get(6)?,
        close: row.get(7)?,
        vw_mean: row.get(8)?,
        volume: row.get(9)?,
        first_event_time: row.get(10)?,
        first_event_id: row.get(11)?,
        last_event_time: row.get(12)?,
        last_event_id: row.get(13)?,
    })
}

/// SQLite-backed implementation of the tick/snapshot sources, the candle
/// and watermark stores, and the materialized feature table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path, read_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(map_sql_err)?;
        info!(path = %path.display(), "opened tickalign store");
        Self::init(conn, read_timeout)
    }

    /// Open or create a store using the configured bounded read timeout.
    pub fn open_with(path: &Path, config: &Config) -> Result<Self> {
        config.validate()?;
        Self::open(path, Duration::from_millis(config.refresh.read_timeout_ms))
    }

    /// Open an in-memory store (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_sql_err)?;
        Self::init(conn, Duration::from_secs(5))
    }

    fn init(conn: Connection, read_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(read_timeout).map_err(map_sql_err)?;
        conn.execute_batch(SCHEMA).map_err(map_sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- externally owned tables (seed helpers; core never writes these) ----

    /// Append trade ticks. Duplicate keys are ignored (append-only source).
    pub fn append_ticks(&self, ticks: &[TradeTick]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_sql_err)?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO ticks \
                     (instrument_id, event_time, event_id, yes_price, no_price, quantity) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(map_sql_err)?;
            for tick in ticks {
                inserted += stmt
                    .execute(params![
                        tick.instrument_id,
                        tick.event_time,
                        tick.event_id,
                        tick.yes_price,
                        tick.no_price,
                        tick.quantity,
                    ])
                    .map_err(map_sql_err)?;
            }
        }
        tx.commit().map_err(map_sql_err)?;
        Ok(inserted)
    }

    /// Append probability snapshots. Duplicate keys are ignored.
    pub fn append_snapshots(&self, snapshots: &[ProbabilitySnapshot]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_sql_err)?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO snapshots \
                     (event_id, snapshot_time, seq_id, probability, period, \
                      clock_remaining_regulation_s, score_differential, possession) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(map_sql_err)?;
            for snap in snapshots {
                inserted += stmt
                    .execute(params![
                        snap.event_id,
                        snap.snapshot_time,
                        snap.seq_id,
                        snap.probability,
                        snap.period,
                        snap.clock_remaining_regulation_s,
                        snap.score_differential,
                        snap.possession.map(|p| match p {
                            Possession::Home => "home",
                            Possession::Away => "away",
                        }),
                    ])
                    .map_err(map_sql_err)?;
            }
        }
        tx.commit().map_err(map_sql_err)?;
        Ok(inserted)
    }

    /// Record that an instrument trades on a sports event.
    pub fn map_instrument(&self, event_id: &str, instrument_id: &str, side: Side) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO instrument_events (event_id, instrument_id, side) \
                 VALUES (?1, ?2, ?3)",
                params![event_id, instrument_id, side.as_str()],
            )
            .map_err(map_sql_err)?;
        Ok(())
    }

    // ---- core reads ----

    /// Ticks for an instrument strictly newer than the given key, ordered
    /// by `(event_time, event_id)`.
    pub fn ticks_after(&self, instrument_id: &str, after: TickKey) -> Result<Vec<TradeTick>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT instrument_id, yes_price, no_price, quantity, event_time, event_id \
                 FROM ticks \
                 WHERE instrument_id = ?1 \
                   AND (event_time > ?2 OR (event_time = ?2 AND event_id > ?3)) \
                 ORDER BY event_time, event_id",
            )
            .map_err(map_sql_err)?;
        let rows = stmt
            .query_map(
                params![instrument_id, after.event_time, after.event_id],
                |row| {
                    Ok(TradeTick {
                        instrument_id: row.get(0)?,
                        yes_price: row.get(1)?,
                        no_price: row.get(2)?,
                        quantity: row.get(3)?,
                        event_time: row.get(4)?,
                        event_id: row.get(5)?,
                    })
                },
            )
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sql_err)?;
        Ok(rows)
    }

    /// The instrument's watermark, if a refresh has ever committed one.
    pub fn watermark(&self, instrument_id: &str) -> Result<Option<Watermark>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT last_seen_event_time, last_seen_event_id \
                 FROM watermarks WHERE instrument_id = ?1",
            )
            .map_err(map_sql_err)?;
        let wm = stmt
            .query_row(params![instrument_id], |row| {
                Ok(Watermark {
                    instrument_id: instrument_id.to_string(),
                    last_seen_event_time: row.get(0)?,
                    last_seen_event_id: row.get(1)?,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(map_sql_err(other)),
            })?;
        Ok(wm)
    }

    /// Candles with `bucket_start` in `[start, end]`, ordered by bucket.
    pub fn candles_in_range(
        &self,
        instrument_id: &str,
        side: Side,
        bucket_width_ms: i64,
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<Vec<Candle>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {CANDLE_COLUMNS} FROM candles \
             WHERE instrument_id = ?1 AND side = ?2 AND bucket_width_ms = ?3 \
               AND bucket_start BETWEEN ?4 AND ?5 \
             ORDER BY bucket_start"
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(map_sql_err)?;
        let rows = stmt
            .query_map(
                params![instrument_id, side.as_str(), bucket_width_ms, start, end],
                candle_from_row,
            )
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sql_err)?;
        Ok(rows)
    }

    /// Snapshots for a sports event, ordered by `(snapshot_time, seq_id)`.
    pub fn snapshots_for_event(&self, event_id: &str) -> Result<Vec<ProbabilitySnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT event_id, snapshot_time, seq_id, probability, period, \
                        clock_remaining_regulation_s, score_differential, possession \
                 FROM snapshots WHERE event_id = ?1 \
                 ORDER BY snapshot_time, seq_id",
            )
            .map_err(map_sql_err)?;
        let rows = stmt
            .query_map(params![event_id], |row| {
                let possession: Option<String> = row.get(7)?;
                Ok(ProbabilitySnapshot {
                    event_id: row.get(0)?,
                    snapshot_time: row.get(1)?,
                    seq_id: row.get(2)?,
                    probability: row.get(3)?,
                    period: row.get(4)?,
                    clock_remaining_regulation_s: row.get(5)?,
                    score_differential: row.get(6)?,
                    possession: match possession.as_deref() {
                        Some("home") => Some(Possession::Home),
                        Some("away") => Some(Possession::Away),
                        _ => None,
                    },
                })
            })
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sql_err)?;
        Ok(rows)
    }

    /// The `(instrument, side)` pairs mapped to a sports event.
    pub fn instruments_for_event(&self, event_id: &str) -> Result<Vec<InstrumentRef>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT instrument_id, side FROM instrument_events \
                 WHERE event_id = ?1 ORDER BY instrument_id",
            )
            .map_err(map_sql_err)?;
        let rows = stmt
            .query_map(params![event_id], |row| {
                Ok(InstrumentRef {
                    instrument_id: row.get(0)?,
                    side: parse_side(1, row.get(1)?)?,
                })
            })
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sql_err)?;
        Ok(rows)
    }

    /// The side an instrument is mapped to, if known.
    pub fn side_for_instrument(&self, instrument_id: &str) -> Result<Option<Side>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT side FROM instrument_events WHERE instrument_id = ?1 LIMIT 1",
            )
            .map_err(map_sql_err)?;
        let side = stmt
            .query_row(params![instrument_id], |row| parse_side(0, row.get(0)?))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(map_sql_err(other)),
            })?;
        Ok(side)
    }

    /// Every instrument known to the store: mapped instruments plus any
    /// that only appear in the tick source.
    pub fn all_instrument_refs(&self) -> Result<Vec<InstrumentRef>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT instrument_id, MIN(side) FROM instrument_events GROUP BY instrument_id \
                 UNION \
                 SELECT DISTINCT instrument_id, 'yes' FROM ticks \
                 WHERE instrument_id NOT IN (SELECT instrument_id FROM instrument_events) \
                 ORDER BY instrument_id",
            )
            .map_err(map_sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(InstrumentRef {
                    instrument_id: row.get(0)?,
                    side: parse_side(1, row.get(1)?)?,
                })
            })
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sql_err)?;
        Ok(rows)
    }

    /// Every sports event with at least one snapshot.
    pub fn all_event_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT DISTINCT event_id FROM snapshots ORDER BY event_id")
            .map_err(map_sql_err)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sql_err)?;
        Ok(rows)
    }

    // ---- atomic core writes ----

    /// Merge-write candles and advance the watermark in one transaction.
    ///
    /// `expected` is the watermark read at planning time. The update is
    /// guarded on it: a concurrent advance surfaces as `WatermarkConflict`
    /// and nothing is committed. A watermark that would regress is an
    /// `InvariantViolation`.
    pub fn commit_refresh(
        &self,
        expected: Option<&Watermark>,
        new_watermark: &Watermark,
        candles: &[Candle],
    ) -> Result<usize> {
        if let Some(old) = expected {
            if new_watermark.key() <= old.key() {
                return Err(Error::invariant(format!(
                    "watermark for instrument {} would regress",
                    new_watermark.instrument_id
                )));
            }
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_sql_err)?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_CANDLE).map_err(map_sql_err)?;
            for c in candles {
                stmt.execute(params![
                    c.instrument_id,
                    c.side.as_str(),
                    c.bucket_width_ms,
                    c.bucket_start,
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    c.vw_mean,
                    c.volume,
                    c.first_event_time,
                    c.first_event_id,
                    c.last_event_time,
                    c.last_event_id,
                ])
                .map_err(map_sql_err)?;
            }
        }

        let changed = match expected {
            Some(old) => tx
                .execute(
                    "UPDATE watermarks \
                     SET last_seen_event_time = ?1, last_seen_event_id = ?2 \
                     WHERE instrument_id = ?3 \
                       AND last_seen_event_time = ?4 AND last_seen_event_id = ?5",
                    params![
                        new_watermark.last_seen_event_time,
                        new_watermark.last_seen_event_id,
                        new_watermark.instrument_id,
                        old.last_seen_event_time,
                        old.last_seen_event_id,
                    ],
                )
                .map_err(map_sql_err)?,
            None => tx
                .execute(
                    "INSERT INTO watermarks \
                     (instrument_id, last_seen_event_time, last_seen_event_id) \
                     VALUES (?1, ?2, ?3) \
                     ON CONFLICT(instrument_id) DO NOTHING",
                    params![
                        new_watermark.instrument_id,
                        new_watermark.last_seen_event_time,
                        new_watermark.last_seen_event_id,
                    ],
                )
                .map_err(map_sql_err)?,
        };

        if changed != 1 {
            // Dropping the transaction rolls the candle writes back.
            return Err(Error::watermark_conflict(&new_watermark.instrument_id));
        }

        tx.commit().map_err(map_sql_err)?;
        debug!(
            instrument_id = %new_watermark.instrument_id,
            candles = candles.len(),
            last_seen_event_time = new_watermark.last_seen_event_time,
            last_seen_event_id = new_watermark.last_seen_event_id,
            "committed refresh"
        );
        Ok(candles.len())
    }

    /// Replace the full materialized output for one event.
    pub fn replace_feature_rows(&self, event_id: &str, rows: &[FeatureRow]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_sql_err)?;
        tx.execute("DELETE FROM feature_rows WHERE event_id = ?1", params![event_id])
            .map_err(map_sql_err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO feature_rows \
                     (event_id, snapshot_time, period, clock_remaining_regulation_s, \
                      score_differential, possession, probability, \
                      yes_price, yes_gap_ms, no_price, no_gap_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .map_err(map_sql_err)?;
            for row in rows {
                stmt.execute(params![
                    row.event_id,
                    row.snapshot_time,
                    row.period,
                    row.clock_remaining_regulation_s,
                    row.score_differential,
                    row.possession.as_str(),
                    row.probability,
                    row.yes_price,
                    row.yes_gap_ms,
                    row.no_price,
                    row.no_gap_ms,
                ])
                .map_err(map_sql_err)?;
            }
        }
        tx.commit().map_err(map_sql_err)?;
        Ok(rows.len())
    }

    /// Materialized rows for an event, ordered by snapshot time.
    pub fn feature_rows_for_event(&self, event_id: &str) -> Result<Vec<FeatureRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT event_id, snapshot_time, period, clock_remaining_regulation_s, \
                        score_differential, possession, probability, \
                        yes_price, yes_gap_ms, no_price, no_gap_ms \
                 FROM feature_rows WHERE event_id = ?1 ORDER BY snapshot_time",
            )
            .map_err(map_sql_err)?;
        let rows = stmt
            .query_map(params![event_id], |row| {
                let possession: String = row.get(5)?;
                Ok(FeatureRow {
                    event_id: row.get(0)?,
                    snapshot_time: row.get(1)?,
                    period: row.get(2)?,
                    clock_remaining_regulation_s: row.get(3)?,
                    score_differential: row.get(4)?,
                    possession: PossessionCategory::parse(&possession).ok_or_else(|| {
                        rusqlite::Error::InvalidColumnType(
                            5,
                            format!("possession '{possession}'"),
                            rusqlite::types::Type::Text,
                        )
                    })?,
                    probability: row.get(6)?,
                    yes_price: row.get(7)?,
                    yes_gap_ms: row.get(8)?,
                    no_price: row.get(9)?,
                    no_gap_ms: row.get(10)?,
                })
            })
            .map_err(map_sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sql_err)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tick(
        instrument_id: &str,
        event_time: TimestampMs,
        event_id: i64,
        yes: Option<i64>,
        quantity: f64,
    ) -> TradeTick {
        TradeTick {
            instrument_id: instrument_id.to_string(),
            yes_price: yes,
            no_price: None,
            quantity,
            event_time,
            event_id,
        }
    }

    fn make_candle(instrument_id: &str, bucket_start: TimestampMs, close: i64) -> Candle {
        Candle {
            instrument_id: instrument_id.to_string(),
            side: Side::Yes,
            bucket_width_ms: 60_000,
            bucket_start,
            open: 50,
            high: close.max(50),
            low: close.min(50),
            close,
            vw_mean: close as f64,
            volume: 2.0,
            first_event_time: bucket_start,
            first_event_id: 1,
            last_event_time: bucket_start + 1_000,
            last_event_id: 2,
        }
    }

    #[test]
    fn test_ticks_after_filters_and_orders() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .append_ticks(&[
                make_tick("mkt-1", 100, 2, Some(55), 1.0),
                make_tick("mkt-1", 100, 1, Some(54), 1.0),
                make_tick("mkt-1", 200, 3, Some(56), 1.0),
                make_tick("mkt-2", 150, 4, Some(40), 1.0),
            ])
            .unwrap();

        let all = store.ticks_after("mkt-1", TickKey::ORIGIN).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event_id, 1);
        assert_eq!(all[1].event_id, 2);

        // Strictly greater than (100, 1): the equal-time tick 2 qualifies.
        let after = store
            .ticks_after("mkt-1", TickKey { event_time: 100, event_id: 1 })
            .unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].event_id, 2);
    }

    #[test]
    fn test_append_ticks_is_append_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tick = make_tick("mkt-1", 100, 1, Some(55), 1.0);
        assert_eq!(store.append_ticks(&[tick.clone()]).unwrap(), 1);
        assert_eq!(store.append_ticks(&[tick]).unwrap(), 0);
    }

    #[test]
    fn test_commit_refresh_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let candle = make_candle("mkt-1", 60_000, 58);
        let wm = Watermark {
            instrument_id: "mkt-1".to_string(),
            last_seen_event_time: 61_000,
            last_seen_event_id: 2,
        };

        let written = store.commit_refresh(None, &wm, &[candle.clone()]).unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.watermark("mkt-1").unwrap(), Some(wm.clone()));

        let stored = store
            .candles_in_range("mkt-1", Side::Yes, 60_000, i64::MIN, i64::MAX)
            .unwrap();
        assert_eq!(stored, vec![candle]);
    }

    #[test]
    fn test_commit_refresh_detects_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        let wm1 = Watermark {
            instrument_id: "mkt-1".to_string(),
            last_seen_event_time: 100,
            last_seen_event_id: 1,
        };
        store.commit_refresh(None, &wm1, &[]).unwrap();

        // A second initializing writer loses.
        let err = store.commit_refresh(None, &wm1, &[]).unwrap_err();
        assert!(matches!(err, Error::WatermarkConflict { .. }));

        // An update guarded on a stale watermark loses, and its candles
        // are rolled back.
        let stale = Watermark {
            instrument_id: "mkt-1".to_string(),
            last_seen_event_time: 50,
            last_seen_event_id: 0,
        };
        let wm2 = Watermark {
            instrument_id: "mkt-1".to_string(),
            last_seen_event_time: 200,
            last_seen_event_id: 2,
        };
        let err = store
            .commit_refresh(Some(&stale), &wm2, &[make_candle("mkt-1", 0, 55)])
            .unwrap_err();
        assert!(matches!(err, Error::WatermarkConflict { .. }));
        assert!(store
            .candles_in_range("mkt-1", Side::Yes, 60_000, i64::MIN, i64::MAX)
            .unwrap()
            .is_empty());
        assert_eq!(store.watermark("mkt-1").unwrap(), Some(wm1));
    }

    #[test]
    fn test_commit_refresh_rejects_regression() {
        let store = SqliteStore::open_in_memory().unwrap();
        let wm = Watermark {
            instrument_id: "mkt-1".to_string(),
            last_seen_event_time: 100,
            last_seen_event_id: 5,
        };
        store.commit_refresh(None, &wm, &[]).unwrap();

        let regressed = Watermark {
            instrument_id: "mkt-1".to_string(),
            last_seen_event_time: 100,
            last_seen_event_id: 4,
        };
        let err = store.commit_refresh(Some(&wm), &regressed, &[]).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_candle_upsert_merges() {
        let store = SqliteStore::open_in_memory().unwrap();
        let wm1 = Watermark {
            instrument_id: "mkt-1".to_string(),
            last_seen_event_time: 61_000,
            last_seen_event_id: 2,
        };
        store
            .commit_refresh(None, &wm1, &[make_candle("mkt-1", 60_000, 58)])
            .unwrap();

        let mut updated = make_candle("mkt-1", 60_000, 61);
        updated.last_event_time = 62_000;
        updated.last_event_id = 3;
        let wm2 = Watermark {
            instrument_id: "mkt-1".to_string(),
            last_seen_event_time: 62_000,
            last_seen_event_id: 3,
        };
        store.commit_refresh(Some(&wm1), &wm2, &[updated.clone()]).unwrap();

        let stored = store
            .candles_in_range("mkt-1", Side::Yes, 60_000, i64::MIN, i64::MAX)
            .unwrap();
        assert_eq!(stored, vec![updated]);
    }

    #[test]
    fn test_snapshot_roundtrip_with_null_possession() {
        let store = SqliteStore::open_in_memory().unwrap();
        let snaps = vec![
            ProbabilitySnapshot {
                event_id: "game-1".to_string(),
                snapshot_time: 1_000,
                seq_id: 1,
                probability: 0.61,
                period: 1,
                clock_remaining_regulation_s: 2_000,
                score_differential: 3,
                possession: Some(Possession::Home),
            },
            ProbabilitySnapshot {
                event_id: "game-1".to_string(),
                snapshot_time: 2_000,
                seq_id: 2,
                probability: 0.55,
                period: 1,
                clock_remaining_regulation_s: 1_940,
                score_differential: 0,
                possession: None,
            },
        ];
        store.append_snapshots(&snaps).unwrap();

        let stored = store.snapshots_for_event("game-1").unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].possession, Some(Possession::Home));
        assert_eq!(stored[1].possession, None);
        assert_eq!(store.all_event_ids().unwrap(), vec!["game-1".to_string()]);
    }

    #[test]
    fn test_instrument_mapping_and_scope_helpers() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.map_instrument("game-1", "mkt-yes", Side::Yes).unwrap();
        store.map_instrument("game-1", "mkt-no", Side::No).unwrap();
        store
            .append_ticks(&[make_tick("mkt-unmapped", 100, 1, Some(50), 1.0)])
            .unwrap();

        let mapped = store.instruments_for_event("game-1").unwrap();
        assert_eq!(mapped.len(), 2);
        assert_eq!(store.side_for_instrument("mkt-no").unwrap(), Some(Side::No));
        assert_eq!(store.side_for_instrument("mkt-unmapped").unwrap(), None);

        let all = store.all_instrument_refs().unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.instrument_id.as_str()).collect();
        assert_eq!(ids, vec!["mkt-no", "mkt-unmapped", "mkt-yes"]);
        // Unmapped instruments default to the yes side.
        assert_eq!(all[1].side, Side::Yes);
    }

    #[test]
    fn test_replace_feature_rows_replaces_scope() {
        let store = SqliteStore::open_in_memory().unwrap();
        let row = |t: i64, p: f64| FeatureRow {
            event_id: "game-1".to_string(),
            snapshot_time: t,
            period: 2,
            clock_remaining_regulation_s: 900,
            score_differential: -2,
            possession: PossessionCategory::Unknown,
            probability: p,
            yes_price: Some(55),
            yes_gap_ms: Some(1_500),
            no_price: None,
            no_gap_ms: None,
        };

        store.replace_feature_rows("game-1", &[row(1_000, 0.5), row(2_000, 0.6)]).unwrap();
        assert_eq!(store.feature_rows_for_event("game-1").unwrap().len(), 2);

        // A re-run fully replaces the previous output for the scope.
        store.replace_feature_rows("game-1", &[row(3_000, 0.7)]).unwrap();
        let rows = store.feature_rows_for_event("game-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].snapshot_time, 3_000);
        assert_eq!(rows[0].possession, PossessionCategory::Unknown);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickalign.db");
        let wm = Watermark {
            instrument_id: "mkt-1".to_string(),
            last_seen_event_time: 100,
            last_seen_event_id: 1,
        };
        {
            let store = SqliteStore::open(&path, Duration::from_secs(1)).unwrap();
            store.commit_refresh(None, &wm, &[make_candle("mkt-1", 60_000, 58)]).unwrap();
        }
        // Reopening through the configured timeout sees the same data.
        let store = SqliteStore::open_with(&path, &Config::default()).unwrap();
        assert_eq!(store.watermark("mkt-1").unwrap(), Some(wm));
        assert_eq!(
            store
                .candles_in_range("mkt-1", Side::Yes, 60_000, i64::MIN, i64::MAX)
                .unwrap()
                .len(),
            1
        );
    }
}
