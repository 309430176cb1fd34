//! Pattern detection over `full_text` vectors.
//!
//! A run has three steps so the database lock is only held at the edges:
//! [`PatternDetector::snapshot`] reads entries, vectors and stored patterns;
//! [`PatternDetector::plan`] clusters and scores without touching the
//! database; [`PatternDetector::apply`] writes patterns, memberships, the
//! audit log and the scheduler state in one transaction. A run that fails or
//! is cancelled before `apply` leaves every stored pattern as it was.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PatternConfig;
use crate::error::{EngineError, Result};
use crate::memory::cluster::{mean_pairwise_similarity, Clusterer, ThresholdAgglomeration};
use crate::memory::entries::{count_entries, fetch_all_entries};
use crate::memory::keywords::{has_habit_language, has_mood_language, top_keywords};
use crate::memory::scheduler::{load_state, save_state, AnalysisMode, SchedulerState};
use crate::memory::store::{write_audit_log, VectorStore};
use crate::memory::types::{format_ts, ts_from_sql, Entry, EntryId, Granularity, Pattern, PatternType};
use crate::memory::{centroid, cosine_similarity};

/// Share of members that must agree on a weekday or time of day for a
/// cluster to count as temporal.
const TEMPORAL_SHARE: f64 = 0.7;
/// A weekday or time of day this common across the whole snapshot is a
/// writing habit, not a signal.
const TEMPORAL_BASELINE_MAX: f64 = 0.5;
const BEHAVIOR_SHARE: f64 = 0.5;

// ── Outcomes ──

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternAvailability {
    pub unlocked: bool,
    pub entry_count: usize,
    pub entries_needed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    /// Patterns produced by this run (created plus updated).
    pub patterns_found: usize,
    pub created: usize,
    pub updated: usize,
    /// Stored patterns below the visibility threshold after the run.
    pub hidden: usize,
    pub mode: AnalysisMode,
    pub entries_analyzed: usize,
    pub by_type: BTreeMap<PatternType, usize>,
}

/// Result of a requested analysis. Only genuine failures are errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Completed(AnalysisReport),
    InsufficientCorpus {
        entry_count: usize,
        entries_needed: usize,
    },
    Unavailable {
        reason: String,
    },
}

impl AnalysisOutcome {
    pub fn patterns_found(&self) -> usize {
        match self {
            Self::Completed(report) => report.patterns_found,
            _ => 0,
        }
    }
}

// ── Snapshot and plan ──

/// One entry as seen by the detector.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub id: EntryId,
    pub created_at: DateTime<Utc>,
    pub text: String,
    pub mood_tags: Vec<String>,
    pub mood_indicative: bool,
    pub vector: Vec<f32>,
}

impl SnapshotEntry {
    pub fn new(entry: Entry, vector: Vec<f32>) -> Self {
        let mood_indicative = !entry.mood_tags.is_empty() || has_mood_language(&entry.raw_text);
        Self {
            id: entry.id,
            created_at: entry.created_at,
            text: entry.raw_text,
            mood_tags: entry.mood_tags,
            mood_indicative,
            vector,
        }
    }
}

/// Everything a run reads from the database.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Entries holding a current `full_text` vector, oldest first.
    pub entries: Vec<SnapshotEntry>,
    pub existing: Vec<Pattern>,
    pub state: SchedulerState,
    /// All entries in the store, with or without vectors.
    pub entry_count: usize,
    /// Highest entry id in the store, with or without a vector.
    pub max_entry_id: EntryId,
}

impl Snapshot {
    fn index(&self) -> HashMap<EntryId, usize> {
        self.entries.iter().enumerate().map(|(i, e)| (e.id, i)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    /// An existing pattern no cluster of this run reproduced.
    Rescored,
}

#[derive(Debug, Clone)]
pub struct PatternChange {
    pub kind: ChangeKind,
    pub pattern: Pattern,
    pub previous_confidence: Option<f64>,
}

/// The full result of a run, computed off to the side.
#[derive(Debug, Clone)]
pub struct AnalysisPlan {
    pub changes: Vec<PatternChange>,
    pub report: AnalysisReport,
    pub state: SchedulerState,
}

struct Draft {
    pattern_type: PatternType,
    /// Indices into `Snapshot::entries`.
    members: Vec<usize>,
    cohesion: f32,
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    Ok(())
}

fn jaccard(a: &[EntryId], b: &[EntryId]) -> f64 {
    let a: HashSet<_> = a.iter().collect();
    let b: HashSet<_> = b.iter().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

// ── Time signals ──

/// Drop `pattern` below every visibility threshold. Members are kept so a
/// direct lookup still resolves.
fn hide(pattern: &Pattern, now: DateTime<Utc>) -> Pattern {
    let mut hidden = pattern.clone();
    hidden.confidence = 0.0;
    hidden.updated_at = now;
    hidden
}

fn weekday_plural(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Mondays",
        Weekday::Tue => "Tuesdays",
        Weekday::Wed => "Wednesdays",
        Weekday::Thu => "Thursdays",
        Weekday::Fri => "Fridays",
        Weekday::Sat => "Saturdays",
        Weekday::Sun => "Sundays",
    }
}

fn time_bucket(ts: DateTime<Utc>) -> &'static str {
    match ts.hour() {
        5..=11 => "mornings",
        12..=16 => "afternoons",
        17..=21 => "evenings",
        _ => "nights",
    }
}

/// Most common value and its share of `labels`. Ties go to the value seen first.
fn dominant<'a>(labels: impl IntoIterator<Item = &'a str>) -> Option<(&'a str, f64)> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    let mut total = 0usize;
    for label in labels {
        total += 1;
        match counts.iter_mut().find(|(l, _)| *l == label) {
            Some((_, n)) => *n += 1,
            None => counts.push((label, 1)),
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for (label, n) in counts {
        if best.map_or(true, |(_, b)| n > b) {
            best = Some((label, n));
        }
    }
    best.map(|(label, n)| (label, n as f64 / total as f64))
}

fn share_of<'a>(labels: impl IntoIterator<Item = &'a str>, target: &str) -> f64 {
    let mut total = 0usize;
    let mut hits = 0usize;
    for label in labels {
        total += 1;
        if label == target {
            hits += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    hits as f64 / total as f64
}

/// The weekday or time of day most members share, when it is both dominant
/// in the cluster and uncommon in the snapshot.
fn shared_time(snapshot: &Snapshot, members: &[usize]) -> Option<&'static str> {
    let member_entries = || members.iter().map(|&i| &snapshot.entries[i]);
    let extractors: [fn(&SnapshotEntry) -> &'static str; 2] = [
        |e| weekday_plural(e.created_at.weekday()),
        |e| time_bucket(e.created_at),
    ];
    for label_of in extractors {
        let Some((label, share)) = dominant(member_entries().map(label_of)) else {
            continue;
        };
        if share < TEMPORAL_SHARE {
            continue;
        }
        let baseline = share_of(snapshot.entries.iter().map(label_of), label);
        if baseline < TEMPORAL_BASELINE_MAX {
            return Some(label);
        }
    }
    None
}

fn classify(snapshot: &Snapshot, members: &[usize]) -> PatternType {
    if shared_time(snapshot, members).is_some() {
        return PatternType::Temporal;
    }
    let habitual = members
        .iter()
        .filter(|&&i| has_habit_language(&snapshot.entries[i].text))
        .count();
    if habitual as f64 / members.len().max(1) as f64 >= BEHAVIOR_SHARE {
        return PatternType::Behavior;
    }
    PatternType::Topic
}

fn describe(
    pattern_type: PatternType,
    keywords: &[String],
    time: Option<&str>,
    frequency: usize,
) -> String {
    let subject = match keywords {
        [] => "a recurring theme".to_string(),
        [one] => one.clone(),
        [first, second, ..] => format!("{first} and {second}"),
    };
    match pattern_type {
        PatternType::Mood => format!("Recurring feelings around {subject} across {frequency} entries"),
        PatternType::Topic => format!("Keeps coming back to {subject} ({frequency} entries)"),
        PatternType::Temporal => match time {
            Some(time) => format!("Writes about {subject} mostly on {time}"),
            None => format!("Writes about {subject} at regular times"),
        },
        PatternType::Behavior => format!("Recurring habit around {subject} ({frequency} entries)"),
    }
}

// ── Detector ──

pub struct PatternDetector {
    config: PatternConfig,
    clusterer: Box<dyn Clusterer>,
}

impl PatternDetector {
    pub fn new(config: PatternConfig) -> Self {
        Self::with_clusterer(config, Box::new(ThresholdAgglomeration))
    }

    pub fn with_clusterer(config: PatternConfig, clusterer: Box<dyn Clusterer>) -> Self {
        Self { config, clusterer }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    pub fn availability(&self, entry_count: usize) -> PatternAvailability {
        let entries_needed = self.config.min_entries.saturating_sub(entry_count);
        PatternAvailability {
            unlocked: entries_needed == 0,
            entry_count,
            entries_needed,
        }
    }

    fn threshold(&self, pattern_type: PatternType) -> f32 {
        match pattern_type {
            PatternType::Mood => self.config.mood_threshold,
            _ => self.config.topic_threshold,
        }
    }

    fn confidence(&self, cohesion: f32, size: usize) -> f64 {
        let saturation = self.config.size_saturation.max(1) as f64;
        let size_factor = (size as f64 / saturation).min(1.0);
        let confidence = f64::from(cohesion.clamp(0.0, 1.0)) * (1.0 - 0.5 * (1.0 - size_factor));
        confidence.clamp(0.0, 1.0)
    }

    fn keywords(&self, snapshot: &Snapshot, pattern_type: PatternType, members: &[usize]) -> Vec<String> {
        let max = self.config.max_keywords;
        let mut keywords: Vec<String> = Vec::new();

        if pattern_type == PatternType::Mood {
            let mut tag_counts: BTreeMap<&str, usize> = BTreeMap::new();
            for &i in members {
                for tag in &snapshot.entries[i].mood_tags {
                    *tag_counts.entry(tag.as_str()).or_default() += 1;
                }
            }
            let mut tags: Vec<(&str, usize)> = tag_counts.into_iter().filter(|(_, n)| *n >= 2).collect();
            tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
            keywords.extend(tags.into_iter().take(2).map(|(t, _)| t.to_string()));
        }

        let texts: Vec<&str> = members.iter().map(|&i| snapshot.entries[i].text.as_str()).collect();
        for kw in top_keywords(&texts, max) {
            if keywords.len() >= max {
                break;
            }
            if !keywords.contains(&kw) {
                keywords.push(kw);
            }
        }
        keywords.truncate(max);
        keywords
    }

    fn build_pattern(
        &self,
        snapshot: &Snapshot,
        draft: &Draft,
        existing: Option<&Pattern>,
        now: DateTime<Utc>,
    ) -> Pattern {
        let members: Vec<&SnapshotEntry> = draft.members.iter().map(|&i| &snapshot.entries[i]).collect();
        let mut entry_ids: Vec<EntryId> = members.iter().map(|e| e.id).collect();
        entry_ids.sort_unstable();
        entry_ids.dedup();

        let first_seen = members.iter().map(|e| e.created_at).min().unwrap_or(now);
        let last_seen = members.iter().map(|e| e.created_at).max().unwrap_or(now);
        let keywords = self.keywords(snapshot, draft.pattern_type, &draft.members);
        let time = shared_time(snapshot, &draft.members);
        let frequency = entry_ids.len();

        Pattern {
            id: existing.map_or_else(|| Uuid::now_v7().to_string(), |p| p.id.clone()),
            pattern_type: draft.pattern_type,
            description: describe(draft.pattern_type, &keywords, time, frequency),
            frequency,
            confidence: self.confidence(draft.cohesion, frequency),
            first_seen,
            last_seen,
            entry_ids,
            keywords,
            created_at: existing.map_or(now, |p| p.created_at),
            updated_at: now,
        }
    }

    /// Re-score `pattern` on its members still present in the snapshot plus
    /// `additions`. With too few members left it is hidden but keeps its
    /// member list.
    fn rescore(
        &self,
        snapshot: &Snapshot,
        index: &HashMap<EntryId, usize>,
        pattern: &Pattern,
        additions: &[usize],
        now: DateTime<Utc>,
    ) -> (Pattern, bool) {
        let mut members: Vec<usize> = pattern
            .entry_ids
            .iter()
            .filter_map(|id| index.get(id).copied())
            .chain(additions.iter().copied())
            .collect();
        members.sort_unstable();
        members.dedup();

        if members.len() < self.config.min_cluster_size {
            return (hide(pattern, now), false);
        }

        let vectors: Vec<&[f32]> = members.iter().map(|&i| snapshot.entries[i].vector.as_slice()).collect();
        let draft = Draft {
            pattern_type: pattern.pattern_type,
            cohesion: mean_pairwise_similarity(&vectors),
            members,
        };
        (self.build_pattern(snapshot, &draft, Some(pattern), now), true)
    }

    /// Whether at least `overlap_threshold` of the pattern's surviving
    /// members sit in clusters of the current run.
    fn absorbed(
        &self,
        index: &HashMap<EntryId, usize>,
        pattern: &Pattern,
        clustered: &HashSet<EntryId>,
    ) -> bool {
        let surviving: Vec<EntryId> = pattern
            .entry_ids
            .iter()
            .copied()
            .filter(|id| index.contains_key(id))
            .collect();
        if surviving.is_empty() {
            return false;
        }
        let inside = surviving.iter().filter(|id| clustered.contains(id)).count();
        inside as f64 / surviving.len() as f64 >= self.config.overlap_threshold
    }

    /// Read the corpus: entries with a current `full_text` vector of `dim`,
    /// stored patterns and the scheduler state.
    pub fn snapshot(&self, conn: &Connection, store: &VectorStore, dim: usize) -> Result<Snapshot> {
        let mut vectors: HashMap<EntryId, Vec<f32>> = HashMap::new();
        for record in store.scan(conn, Granularity::FullText, dim, None) {
            let record = record?;
            vectors.entry(record.entry_id).or_insert(record.vector);
        }

        let all = fetch_all_entries(conn)?;
        let entry_count = all.len();
        let max_entry_id = all.iter().map(|e| e.id).max().unwrap_or(0);
        let entries: Vec<SnapshotEntry> = all
            .into_iter()
            .filter_map(|e| vectors.remove(&e.id).map(|v| SnapshotEntry::new(e, v)))
            .collect();
        if entries.len() < entry_count {
            debug!(
                without_vectors = entry_count - entries.len(),
                "entries skipped by pattern snapshot"
            );
        }

        Ok(Snapshot {
            entries,
            existing: load_patterns(conn)?,
            state: load_state(conn)?,
            entry_count,
            max_entry_id,
        })
    }

    /// Compute a run without touching the database.
    pub fn plan(
        &self,
        snapshot: &Snapshot,
        requested: AnalysisMode,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<AnalysisPlan> {
        check_cancelled(cancel)?;
        if requested == AnalysisMode::Incremental && !snapshot.existing.is_empty() {
            if let Some(plan) = self.plan_incremental(snapshot, now, cancel)? {
                return Ok(plan);
            }
            info!("too many new entries fit no pattern, running a full analysis");
        }
        self.plan_full(snapshot, now, cancel)
    }

    fn plan_full(
        &self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<AnalysisPlan> {
        let min_size = self.config.min_cluster_size;
        let mut drafts: Vec<Draft> = Vec::new();

        let mood_idx: Vec<usize> = (0..snapshot.entries.len())
            .filter(|&i| snapshot.entries[i].mood_indicative)
            .collect();
        let mood_vectors: Vec<Vec<f32>> = mood_idx.iter().map(|&i| snapshot.entries[i].vector.clone()).collect();
        let mut claimed: HashSet<usize> = HashSet::new();
        for c in self.clusterer.cluster(&mood_vectors, self.config.mood_threshold) {
            if c.len() < min_size {
                continue;
            }
            let members: Vec<usize> = c.members.iter().map(|&k| mood_idx[k]).collect();
            claimed.extend(members.iter().copied());
            drafts.push(Draft {
                pattern_type: PatternType::Mood,
                members,
                cohesion: c.cohesion,
            });
        }
        check_cancelled(cancel)?;

        let rest_idx: Vec<usize> = (0..snapshot.entries.len()).filter(|i| !claimed.contains(i)).collect();
        let rest_vectors: Vec<Vec<f32>> = rest_idx.iter().map(|&i| snapshot.entries[i].vector.clone()).collect();
        for c in self.clusterer.cluster(&rest_vectors, self.config.topic_threshold) {
            if c.len() < min_size {
                continue;
            }
            let members: Vec<usize> = c.members.iter().map(|&k| rest_idx[k]).collect();
            drafts.push(Draft {
                pattern_type: classify(snapshot, &members),
                members,
                cohesion: c.cohesion,
            });
        }
        check_cancelled(cancel)?;

        let index = snapshot.index();
        let mut matched: HashSet<usize> = HashSet::new();
        let mut changes = Vec::new();
        for draft in &drafts {
            let mut ids: Vec<EntryId> = draft.members.iter().map(|&i| snapshot.entries[i].id).collect();
            ids.sort_unstable();
            let best = snapshot
                .existing
                .iter()
                .enumerate()
                .filter(|(k, _)| !matched.contains(k))
                .map(|(k, p)| (k, jaccard(&ids, &p.entry_ids)))
                .filter(|(_, overlap)| *overlap >= self.config.overlap_threshold)
                .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)));

            let change = match best {
                Some((k, _)) => {
                    matched.insert(k);
                    let existing = &snapshot.existing[k];
                    PatternChange {
                        kind: ChangeKind::Updated,
                        pattern: self.build_pattern(snapshot, draft, Some(existing), now),
                        previous_confidence: Some(existing.confidence),
                    }
                }
                None => PatternChange {
                    kind: ChangeKind::Created,
                    pattern: self.build_pattern(snapshot, draft, None, now),
                    previous_confidence: None,
                },
            };
            changes.push(change);
        }

        // Entries this run placed in a cluster. An unmatched pattern living
        // mostly on them has been absorbed and must not stay listed.
        let clustered: HashSet<EntryId> = drafts
            .iter()
            .flat_map(|d| d.members.iter().map(|&i| snapshot.entries[i].id))
            .collect();
        for (k, existing) in snapshot.existing.iter().enumerate() {
            if matched.contains(&k) {
                continue;
            }
            let pattern = if self.absorbed(&index, existing, &clustered) {
                debug!(pattern = %existing.id, "pattern absorbed by a new cluster, hiding");
                hide(existing, now)
            } else {
                self.rescore(snapshot, &index, existing, &[], now).0
            };
            changes.push(PatternChange {
                kind: ChangeKind::Rescored,
                pattern,
                previous_confidence: Some(existing.confidence),
            });
        }

        Ok(self.finish_plan(snapshot, AnalysisMode::Full, changes, now))
    }

    /// `None` when too many new entries fit no pattern.
    fn plan_incremental(
        &self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<AnalysisPlan>> {
        let index = snapshot.index();
        let since = snapshot.state.last_run_max_entry_id;
        let new_idx: Vec<usize> = (0..snapshot.entries.len())
            .filter(|&i| snapshot.entries[i].id > since)
            .collect();

        let centroids: Vec<Option<Vec<f32>>> = snapshot
            .existing
            .iter()
            .map(|p| {
                centroid(
                    p.entry_ids
                        .iter()
                        .filter_map(|id| index.get(id))
                        .map(|&i| snapshot.entries[i].vector.as_slice()),
                )
            })
            .collect();

        let mut additions: Vec<Vec<usize>> = vec![Vec::new(); snapshot.existing.len()];
        let mut unfit = 0usize;
        for &i in &new_idx {
            check_cancelled(cancel)?;
            let entry = &snapshot.entries[i];
            let best = snapshot
                .existing
                .iter()
                .enumerate()
                .filter_map(|(k, p)| {
                    let c = centroids[k].as_ref()?;
                    if p.pattern_type == PatternType::Mood && !entry.mood_indicative {
                        return None;
                    }
                    let similarity = cosine_similarity(&entry.vector, c);
                    (similarity >= self.threshold(p.pattern_type)).then_some((k, similarity))
                })
                .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)));
            match best {
                Some((k, _)) => additions[k].push(i),
                None => unfit += 1,
            }
        }

        if !new_idx.is_empty()
            && unfit >= self.config.min_cluster_size
            && unfit as f64 / new_idx.len() as f64 > self.config.max_unfit_ratio
        {
            debug!(unfit, new = new_idx.len(), "incremental analysis rejected");
            return Ok(None);
        }

        let changes = snapshot
            .existing
            .iter()
            .zip(&additions)
            .map(|(existing, added)| {
                let (pattern, alive) = self.rescore(snapshot, &index, existing, added, now);
                PatternChange {
                    kind: if alive { ChangeKind::Updated } else { ChangeKind::Rescored },
                    pattern,
                    previous_confidence: Some(existing.confidence),
                }
            })
            .collect();

        Ok(Some(self.finish_plan(snapshot, AnalysisMode::Incremental, changes, now)))
    }

    fn finish_plan(
        &self,
        snapshot: &Snapshot,
        mode: AnalysisMode,
        changes: Vec<PatternChange>,
        now: DateTime<Utc>,
    ) -> AnalysisPlan {
        let created = changes.iter().filter(|c| c.kind == ChangeKind::Created).count();
        let updated = changes.iter().filter(|c| c.kind == ChangeKind::Updated).count();
        let hidden = changes
            .iter()
            .filter(|c| !c.pattern.is_visible(self.config.visibility_threshold))
            .count();
        let mut by_type = BTreeMap::new();
        for change in changes.iter().filter(|c| c.kind != ChangeKind::Rescored) {
            *by_type.entry(change.pattern.pattern_type).or_insert(0) += 1;
        }

        AnalysisPlan {
            report: AnalysisReport {
                patterns_found: created + updated,
                created,
                updated,
                hidden,
                mode,
                entries_analyzed: snapshot.entries.len(),
                by_type,
            },
            state: SchedulerState {
                last_run_at: Some(now),
                last_run_entry_count: snapshot.entry_count,
                last_run_max_entry_id: snapshot.max_entry_id.max(snapshot.state.last_run_max_entry_id),
            },
            changes,
        }
    }

    /// Persist a plan in one transaction.
    pub fn apply(&self, conn: &mut Connection, plan: &AnalysisPlan) -> Result<AnalysisReport> {
        let visibility = self.config.visibility_threshold;
        let tx = conn.transaction()?;
        for change in &plan.changes {
            let pattern = &change.pattern;
            upsert_pattern(&tx, pattern)?;

            let was_visible = change.previous_confidence.map_or(true, |c| c >= visibility);
            let operation = match change.kind {
                ChangeKind::Created => "pattern_create",
                _ if was_visible && !pattern.is_visible(visibility) => "pattern_hide",
                _ => "pattern_update",
            };
            write_audit_log(
                &tx,
                operation,
                &pattern.id,
                Some(&json!({
                    "type": pattern.pattern_type,
                    "frequency": pattern.frequency,
                    "confidence": pattern.confidence,
                })),
            )?;
        }

        let report = &plan.report;
        write_audit_log(
            &tx,
            "analyze",
            report.mode.as_str(),
            Some(&json!({
                "patterns_found": report.patterns_found,
                "created": report.created,
                "updated": report.updated,
                "hidden": report.hidden,
                "entries_analyzed": report.entries_analyzed,
            })),
        )?;
        save_state(&tx, &plan.state)?;
        tx.commit()?;

        info!(
            mode = %report.mode,
            patterns_found = report.patterns_found,
            created = report.created,
            updated = report.updated,
            hidden = report.hidden,
            "pattern analysis complete"
        );
        Ok(report.clone())
    }

    /// Gate, snapshot, plan and apply while holding `conn` throughout.
    pub fn run(
        &self,
        conn: &mut Connection,
        store: &VectorStore,
        dim: usize,
        mode: AnalysisMode,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutcome> {
        let availability = self.availability(count_entries(conn)?);
        if !availability.unlocked {
            return Ok(AnalysisOutcome::InsufficientCorpus {
                entry_count: availability.entry_count,
                entries_needed: availability.entries_needed,
            });
        }
        let snapshot = self.snapshot(conn, store, dim)?;
        let plan = self.plan(&snapshot, mode, now, cancel)?;
        Ok(AnalysisOutcome::Completed(self.apply(conn, &plan)?))
    }
}

// ── Pattern storage ──

const PATTERN_COLUMNS: &str =
    "id, pattern_type, description, frequency, confidence, first_seen, last_seen, keywords, created_at, updated_at";

fn pattern_from_row(row: &rusqlite::Row) -> rusqlite::Result<Pattern> {
    let raw_type: String = row.get(1)?;
    let pattern_type = raw_type.parse::<PatternType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;
    let raw_keywords: String = row.get(7)?;
    let keywords: Vec<String> = serde_json::from_str(&raw_keywords).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let frequency: i64 = row.get(3)?;
    Ok(Pattern {
        id: row.get(0)?,
        pattern_type,
        description: row.get(2)?,
        frequency: frequency as usize,
        confidence: row.get(4)?,
        first_seen: ts_from_sql(5, row.get(5)?)?,
        last_seen: ts_from_sql(6, row.get(6)?)?,
        entry_ids: Vec::new(),
        keywords,
        created_at: ts_from_sql(8, row.get(8)?)?,
        updated_at: ts_from_sql(9, row.get(9)?)?,
    })
}

fn load_members(conn: &Connection, pattern_id: &str) -> Result<Vec<EntryId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT entry_id FROM pattern_members WHERE pattern_id = ?1 ORDER BY entry_id",
    )?;
    let ids = stmt
        .query_map([pattern_id], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<EntryId>>>()?;
    Ok(ids)
}

fn query_patterns(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Pattern>> {
    let mut stmt = conn.prepare(sql)?;
    let mut patterns = stmt
        .query_map(params, pattern_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for p in &mut patterns {
        p.entry_ids = load_members(conn, &p.id)?;
    }
    Ok(patterns)
}

fn upsert_pattern(conn: &Connection, pattern: &Pattern) -> Result<()> {
    let keywords = serde_json::to_string(&pattern.keywords).map_err(anyhow::Error::from)?;
    conn.execute(
        &format!(
            "INSERT INTO patterns ({PATTERN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 pattern_type = excluded.pattern_type,
                 description = excluded.description,
                 frequency = excluded.frequency,
                 confidence = excluded.confidence,
                 first_seen = excluded.first_seen,
                 last_seen = excluded.last_seen,
                 keywords = excluded.keywords,
                 updated_at = excluded.updated_at"
        ),
        params![
            pattern.id,
            pattern.pattern_type.as_str(),
            pattern.description,
            pattern.entry_ids.len() as i64,
            pattern.confidence,
            format_ts(pattern.first_seen),
            format_ts(pattern.last_seen),
            keywords,
            format_ts(pattern.created_at),
            format_ts(pattern.updated_at),
        ],
    )?;
    conn.execute("DELETE FROM pattern_members WHERE pattern_id = ?1", [&pattern.id])?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO pattern_members (pattern_id, entry_id) VALUES (?1, ?2)",
    )?;
    for id in &pattern.entry_ids {
        stmt.execute(params![pattern.id, id])?;
    }
    Ok(())
}

/// Direct lookup, hidden patterns included.
pub fn get_pattern(conn: &Connection, id: &str) -> Result<Option<Pattern>> {
    let pattern = conn
        .query_row(
            &format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE id = ?1"),
            [id],
            pattern_from_row,
        )
        .optional()?;
    match pattern {
        Some(mut p) => {
            p.entry_ids = load_members(conn, &p.id)?;
            Ok(Some(p))
        }
        None => Ok(None),
    }
}

/// Every stored pattern, oldest first.
pub fn load_patterns(conn: &Connection) -> Result<Vec<Pattern>> {
    query_patterns(
        conn,
        &format!("SELECT {PATTERN_COLUMNS} FROM patterns ORDER BY created_at, id"),
        params![],
    )
}

/// Patterns at or above `min_confidence`, most confident first.
pub fn list_patterns(conn: &Connection, min_confidence: f64) -> Result<Vec<Pattern>> {
    query_patterns(
        conn,
        &format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns WHERE confidence >= ?1
             ORDER BY confidence DESC, last_seen DESC, id"
        ),
        [min_confidence],
    )
}

/// Patterns whose keywords include `keyword`, case-insensitively.
pub fn patterns_with_keyword(conn: &Connection, keyword: &str) -> Result<Vec<Pattern>> {
    query_patterns(
        conn,
        &format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns p
             WHERE EXISTS (SELECT 1 FROM json_each(p.keywords) k WHERE lower(k.value) = lower(?1))
             ORDER BY confidence DESC, id"
        ),
        [keyword.trim()],
    )
}

/// Member entries that still exist, newest first.
pub fn pattern_entry_ids(conn: &Connection, pattern_id: &str) -> Result<Vec<EntryId>> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM patterns WHERE id = ?1", [pattern_id], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(EngineError::PatternNotFound(pattern_id.to_string()));
    }
    let mut stmt = conn.prepare(
        "SELECT e.id FROM pattern_members m JOIN entries e ON e.id = m.entry_id
         WHERE m.pattern_id = ?1 ORDER BY e.timestamp DESC, e.id DESC",
    )?;
    let ids = stmt
        .query_map([pattern_id], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<EntryId>>>()?;
    Ok(ids)
}

pub fn count_patterns(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM patterns", [], |r| r.get(0))?;
    Ok(n as usize)
}
