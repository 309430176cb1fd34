//! Regeneration policy for the pattern detector.
//!
//! State lives in `schema_meta` under `scheduler.*` keys and is only written
//! by a successful analysis, inside the same transaction as the patterns.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::db::migrations::{get_meta, set_meta};
use crate::error::Result;
use crate::memory::types::{format_ts, parse_ts, EntryId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Re-cluster the whole corpus.
    Full,
    /// Fit new entries to existing pattern centroids and re-score.
    Incremental,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerState {
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_entry_count: usize,
    /// Highest entry id seen by the last run; newer ids are "new entries".
    pub last_run_max_entry_id: EntryId,
}

const KEY_LAST_RUN_AT: &str = "scheduler.last_run_at";
const KEY_ENTRY_COUNT: &str = "scheduler.last_run_entry_count";
const KEY_MAX_ENTRY_ID: &str = "scheduler.last_run_max_entry_id";

pub fn load_state(conn: &Connection) -> Result<SchedulerState> {
    Ok(SchedulerState {
        last_run_at: get_meta(conn, KEY_LAST_RUN_AT)?.and_then(|v| parse_ts(&v)),
        last_run_entry_count: get_meta(conn, KEY_ENTRY_COUNT)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        last_run_max_entry_id: get_meta(conn, KEY_MAX_ENTRY_ID)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    })
}

pub fn save_state(conn: &Connection, state: &SchedulerState) -> Result<()> {
    if let Some(ts) = state.last_run_at {
        set_meta(conn, KEY_LAST_RUN_AT, &format_ts(ts))?;
    }
    set_meta(conn, KEY_ENTRY_COUNT, &state.last_run_entry_count.to_string())?;
    set_meta(conn, KEY_MAX_ENTRY_ID, &state.last_run_max_entry_id.to_string())?;
    Ok(())
}

/// Decide whether a scheduled run is due, and in which mode.
///
/// `new_entries` counts entries with an id above the last run's highest id,
/// so deletions elsewhere in the corpus cannot hide them. The corpus gate
/// (minimum entry count) is checked by the caller.
pub fn decide(
    config: &SchedulerConfig,
    state: &SchedulerState,
    entry_count: usize,
    new_entries: usize,
    has_patterns: bool,
    now: DateTime<Utc>,
) -> Option<AnalysisMode> {
    let Some(last_run_at) = state.last_run_at else {
        return Some(AnalysisMode::Full);
    };

    if entry_count.saturating_sub(new_entries) < state.last_run_entry_count {
        // Entries seen by the last run were deleted; memberships need a clean rebuild.
        return Some(AnalysisMode::Full);
    }

    if new_entries >= config.entry_delta.max(1) {
        return Some(if has_patterns {
            AnalysisMode::Incremental
        } else {
            AnalysisMode::Full
        });
    }

    if now - last_run_at >= Duration::days(config.interval_days) {
        return Some(AnalysisMode::Full);
    }

    None
}
