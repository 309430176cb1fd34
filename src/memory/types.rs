//! Core type definitions.
//!
//! Defines [`Granularity`] (what unit of text a vector represents), [`Entry`]
//! (the journal entry as read from the host store), [`EmbeddingRecord`],
//! [`Pattern`] and [`PatternType`], plus the timestamp helpers every table uses.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Primary key of an entry in the host journal's `entries` table.
pub type EntryId = i64;

/// The unit of text a vector represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// The raw entry text. Drives coarse search and clustering.
    FullText,
    /// Structured summary (or enhanced text). Re-ranking signal only.
    Summary,
    /// One record per qualifying sentence of the raw text.
    Sentence,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Self::FullText, Self::Summary, Self::Sentence];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullText => "full_text",
            Self::Summary => "summary",
            Self::Sentence => "sentence",
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_text" => Ok(Self::FullText),
            "summary" => Ok(Self::Summary),
            "sentence" => Ok(Self::Sentence),
            _ => Err(format!("unknown granularity: {s}")),
        }
    }
}

/// A journal entry, matching the host's `entries` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub created_at: DateTime<Utc>,
    pub raw_text: String,
    pub enhanced_text: Option<String>,
    pub structured_summary: Option<String>,
    /// Mood tags produced by the host's mood analyser, if any.
    pub mood_tags: Vec<String>,
}

impl Entry {
    /// Text embedded at the `summary` granularity: the structured summary,
    /// falling back to the enhanced rewrite.
    pub fn summary_text(&self) -> Option<&str> {
        [&self.structured_summary, &self.enhanced_text]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }
}

/// A stored vector for one (entry, granularity, sequence) slot.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub entry_id: EntryId,
    pub granularity: Granularity,
    /// Sentence index for `sentence` granularity, 0 otherwise.
    pub seq: u32,
    /// Source sentence (sentence granularity only).
    pub sentence: Option<String>,
    pub vector: Vec<f32>,
    /// Timestamp of the owning entry, copied so the temporal filter stays in one table.
    pub entry_created_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// The four kinds of recurring theme the detector reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Mood,
    Topic,
    Temporal,
    Behavior,
}

impl PatternType {
    pub const ALL: [PatternType; 4] = [Self::Mood, Self::Topic, Self::Temporal, Self::Behavior];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mood => "mood",
            Self::Topic => "topic",
            Self::Temporal => "temporal",
            Self::Behavior => "behavior",
        }
    }
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PatternType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mood" => Ok(Self::Mood),
            "topic" => Ok(Self::Topic),
            "temporal" => Ok(Self::Temporal),
            "behavior" => Ok(Self::Behavior),
            _ => Err(format!("unknown pattern type: {s}")),
        }
    }
}

/// A discovered recurring theme, matching the `patterns` table plus its members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// UUID v7 primary key.
    pub id: String,
    #[serde(rename = "type")]
    pub pattern_type: PatternType,
    pub description: String,
    /// Always equal to `entry_ids.len()`.
    pub frequency: usize,
    /// Confidence in `[0.0, 1.0]`; below the visibility threshold the pattern is hidden.
    pub confidence: f64,
    /// Earliest member entry timestamp.
    pub first_seen: DateTime<Utc>,
    /// Latest member entry timestamp.
    pub last_seen: DateTime<Utc>,
    pub entry_ids: Vec<EntryId>,
    pub keywords: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pattern {
    pub fn is_visible(&self, visibility_threshold: f64) -> bool {
        self.confidence >= visibility_threshold
    }
}

/// Inclusive time window used by the temporal filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    /// Whole calendar days from `first` through `last`, both inclusive.
    pub fn days(first: NaiveDate, last: NaiveDate) -> Self {
        let start = Utc.from_utc_datetime(&first.and_time(chrono::NaiveTime::MIN));
        let end = Utc.from_utc_datetime(&last.and_hms_opt(23, 59, 59).unwrap_or_default());
        Self::new(start, end)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}

/// One retrieval hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntry {
    pub entry_id: EntryId,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// Format a timestamp the way every table stores it (RFC 3339, UTC, seconds).
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp. Accepts RFC 3339 and the offset-less ISO forms
/// the host application writes, which are read as UTC.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| Utc.from_utc_datetime(&d.and_time(chrono::NaiveTime::MIN)))
}

/// Conversion for `row.get` closures: unparseable timestamps surface as a
/// rusqlite conversion error instead of a panic.
pub(crate) fn ts_from_sql(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp: {raw}").into(),
        )
    })
}
