//! The closed field set for materialized rows.
//!
//! Every row is validated against this list before it is written. The
//! check runs on the serialized form, so any field added to the row type
//! later is caught at materialization time, not at review time.

use serde_json::Value;
use tickalign_core::{Error, FeatureRow, Result};

/// Every field a materialized row may carry. Closed set.
pub const ALLOWED_FIELDS: &[&str] = &[
    "event_id",
    "snapshot_time",
    "period",
    "clock_remaining_regulation_s",
    "score_differential",
    "possession",
    "probability",
    "yes_price",
    "yes_gap_ms",
    "no_price",
    "no_gap_ms",
];

/// Substrings that mark a field as settlement or elapsed-time leakage.
/// Checked before the allow-list so a leaking field is named as such even
/// if someone also adds it to `ALLOWED_FIELDS`.
pub const LEAK_DENY_PATTERNS: &[&str] = &[
    "outcome",
    "final",
    "winner",
    "settle",
    "label",
    "overtime",
    "total_elapsed",
];

/// Validate one row against the allow-list.
///
/// Violations are invariant violations: they abort the whole run rather
/// than being counted, because a single leaked field poisons the dataset.
pub fn validate_row(row: &FeatureRow) -> Result<()> {
    if row.clock_remaining_regulation_s < 0 {
        return Err(Error::invariant(format!(
            "negative regulation clock {} for event {}",
            row.clock_remaining_regulation_s, row.event_id
        )));
    }

    let value = serde_json::to_value(row)?;
    let Value::Object(fields) = value else {
        return Err(Error::invariant("feature row did not serialize to an object"));
    };

    for key in fields.keys() {
        if let Some(pattern) = LEAK_DENY_PATTERNS.iter().find(|p| key.contains(*p)) {
            return Err(Error::invariant(format!(
                "field '{key}' matches leak pattern '{pattern}'"
            )));
        }
        if !ALLOWED_FIELDS.contains(&key.as_str()) {
            return Err(Error::invariant(format!(
                "field '{key}' is not in the allowed field set"
            )));
        }
    }
    Ok(())
}
