//! Staged retrieval.
//!
//! 1. Temporal filter: an explicit range, or a date phrase found in the query.
//! 2. Coarse search: cosine similarity of the query against every candidate's
//!    `full_text` vector, computed by sqlite-vec over the stored blobs. The
//!    best `coarse_top_n` at or above the similarity floor survive.
//! 3. Re-rank: candidates with a `summary` vector blend both similarities,
//!    `summary_weight` on the summary side.
//! 4. Fine match: the top `fine_top_k` get a bonus from their best single
//!    sentence.
//!
//! A recency bonus decaying with entry age is added last. Ties go to the
//! newer entry, then the higher id. Finished rankings are cached by query
//! fingerprint; a cache hit skips every stage.
//!
//! When the encoder is unavailable the pipeline answers from the FTS5 index
//! instead. Those answers are never cached.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config::RetrievalConfig;
use crate::embedding::Encoder;
use crate::error::{EngineError, Result};
use crate::memory::cache::{query_fingerprint, Fingerprint, SimilarityCache};
use crate::memory::store::{encode_vector, VectorEncoding, VectorStore};
use crate::memory::types::{format_ts, ts_from_sql, DateRange, EntryId, Granularity, RankedEntry};
use crate::memory::{checked_similarity, embedding_to_bytes, entries, temporal};

/// Where a result list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Semantic,
    Cache,
    /// Keyword fallback while the encoder is unavailable.
    Lexical,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResponse {
    pub results: Vec<RankedEntry>,
    pub source: ResultSource,
    /// The temporal filter that was applied, if any.
    pub date_range: Option<DateRange>,
}

/// A normalized query ready to run.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub text: String,
    pub range: Option<DateRange>,
    pub limit: usize,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone)]
struct Candidate {
    entry_id: EntryId,
    created_at: DateTime<Utc>,
    score: f64,
}

pub struct RetrievalPipeline {
    config: RetrievalConfig,
    encoder: Arc<Encoder>,
    cache: Arc<SimilarityCache>,
    store: VectorStore,
}

impl RetrievalPipeline {
    pub fn new(
        config: RetrievalConfig,
        encoder: Arc<Encoder>,
        cache: Arc<SimilarityCache>,
        store: VectorStore,
    ) -> Self {
        Self {
            config,
            encoder,
            cache,
            store,
        }
    }

    /// Resolve the temporal filter, result limit and cache key.
    pub fn plan(
        &self,
        query: &str,
        range: Option<DateRange>,
        limit: Option<usize>,
        today: NaiveDate,
    ) -> QueryPlan {
        let text = query.trim().to_string();
        let range = range.or_else(|| temporal::extract_date_range(&text, today));
        let limit = limit.unwrap_or(self.config.max_results).max(1);
        let fingerprint = query_fingerprint(&text, range.as_ref(), limit);
        QueryPlan {
            text,
            range,
            limit,
            fingerprint,
        }
    }

    pub fn cached(&self, plan: &QueryPlan) -> Option<RetrievalResponse> {
        let results = self.cache.get_results(&plan.fingerprint)?;
        tracing::debug!(query = %plan.text, hits = results.len(), "retrieval cache hit");
        Some(RetrievalResponse {
            results,
            source: ResultSource::Cache,
            date_range: plan.range,
        })
    }

    /// Embed the query. `Ok(None)` means the encoder is unavailable and the
    /// caller should take the lexical path.
    pub fn embed_query(&self, plan: &QueryPlan) -> Result<Option<Vec<f32>>> {
        match self.encoder.embed_query(&plan.text) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_model_unavailable() => {
                tracing::warn!(error = %e, "encoder unavailable, falling back to lexical search");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Run the stages that need the database: semantic ranking when a
    /// query vector is available, lexical fallback otherwise.
    pub fn finish(
        &self,
        conn: &Connection,
        plan: &QueryPlan,
        query_vector: Option<&[f32]>,
        now: DateTime<Utc>,
    ) -> Result<RetrievalResponse> {
        let (results, source) = match query_vector {
            Some(q) => {
                let results = self.rank(conn, plan, q, now)?;
                self.cache.put_results(plan.fingerprint, results.clone());
                (results, ResultSource::Semantic)
            }
            None => (self.lexical(conn, plan, now)?, ResultSource::Lexical),
        };
        Ok(RetrievalResponse {
            results,
            source,
            date_range: plan.range,
        })
    }

    /// Full pipeline on one connection.
    pub fn retrieve(
        &self,
        conn: &Connection,
        query: &str,
        range: Option<DateRange>,
        limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<RetrievalResponse> {
        let plan = self.plan(query, range, limit, now.date_naive());
        if plan.text.is_empty() {
            return Ok(RetrievalResponse {
                results: vec![],
                source: ResultSource::Semantic,
                date_range: plan.range,
            });
        }
        if let Some(hit) = self.cached(&plan) {
            return Ok(hit);
        }
        let q = self.embed_query(&plan)?;
        self.finish(conn, &plan, q.as_deref(), now)
    }

    // ── Stages ──

    fn rank(
        &self,
        conn: &Connection,
        plan: &QueryPlan,
        query: &[f32],
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedEntry>> {
        let mut candidates = self.coarse(conn, plan, query)?;
        tracing::debug!(query = %plan.text, candidates = candidates.len(), "coarse stage");
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let dim = query.len();
        let w = self.config.summary_weight.clamp(0.0, 1.0);
        for c in candidates.iter_mut() {
            if let Some(best) = self.best_similarity(conn, c.entry_id, Granularity::Summary, query, dim)? {
                c.score = (1.0 - w) * c.score + w * best;
            }
        }
        sort_candidates(&mut candidates);

        let k = self.config.fine_top_k.min(candidates.len());
        for c in candidates.iter_mut().take(k) {
            if let Some(best) = self.best_similarity(conn, c.entry_id, Granularity::Sentence, query, dim)? {
                c.score += self.config.sentence_bonus_weight * best.max(0.0);
            }
        }

        for c in candidates.iter_mut() {
            c.score += self.recency_bonus(c.created_at, now);
        }
        sort_candidates(&mut candidates);
        candidates.truncate(plan.limit);

        Ok(candidates
            .into_iter()
            .map(|c| RankedEntry {
                entry_id: c.entry_id,
                score: c.score,
                created_at: c.created_at,
            })
            .collect())
    }

    /// Brute-force cosine similarity over `full_text` vectors inside SQLite.
    fn coarse(&self, conn: &Connection, plan: &QueryPlan, query: &[f32]) -> Result<Vec<Candidate>> {
        let (start, end) = match &plan.range {
            Some(r) => (format_ts(r.start), format_ts(r.end)),
            None => (String::new(), "9999".to_string()),
        };
        let (q_int8, _) = encode_vector(query, VectorEncoding::Int8);

        let mut stmt = conn.prepare_cached(
            "SELECT entry_id, entry_created_at, distance FROM (
                 SELECT m.entry_id, m.entry_created_at,
                        CASE m.encoding
                            WHEN 'f32' THEN vec_distance_cosine(m.vector, ?1)
                            ELSE vec_distance_cosine(vec_int8(m.vector), vec_int8(?2))
                        END AS distance
                 FROM embeddings m
                 WHERE m.granularity = 'full_text' AND m.dim = ?3
                   AND m.entry_created_at >= ?4 AND m.entry_created_at <= ?5
                   AND EXISTS (SELECT 1 FROM entries e WHERE e.id = m.entry_id)
             )
             WHERE distance IS NOT NULL AND distance <= ?6
             ORDER BY distance ASC, entry_created_at DESC, entry_id DESC
             LIMIT ?7",
        )?;

        let max_distance = 1.0 - self.config.similarity_floor;
        let rows = stmt
            .query_map(
                params![
                    embedding_to_bytes(query),
                    q_int8,
                    query.len() as i64,
                    start,
                    end,
                    max_distance,
                    self.config.coarse_top_n as i64,
                ],
                |row| {
                    Ok(Candidate {
                        entry_id: row.get(0)?,
                        created_at: ts_from_sql(1, row.get(1)?)?,
                        score: 1.0 - row.get::<_, f64>(2)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Best similarity between the query and the entry's vectors at
    /// `granularity`. Stale records are treated as absent.
    fn best_similarity(
        &self,
        conn: &Connection,
        entry_id: EntryId,
        granularity: Granularity,
        query: &[f32],
        dim: usize,
    ) -> Result<Option<f64>> {
        let Some(records) = self.store.get(conn, entry_id, granularity, dim)? else {
            return Ok(None);
        };
        let mut best: Option<f64> = None;
        for r in &records {
            match checked_similarity(query, &r.vector) {
                Ok(sim) => best = Some(best.map_or(sim as f64, |b: f64| b.max(sim as f64))),
                Err(EngineError::DimensionMismatch { expected, found }) => {
                    tracing::warn!(entry_id, expected, found, "skipping stale vector");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(best)
    }

    fn recency_bonus(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_days = ((now - created_at).num_seconds().max(0) as f64) / 86_400.0;
        let half_life = self.config.recency_half_life_days.max(f64::EPSILON);
        self.config.recency_weight * (-age_days / half_life).exp2()
    }

    /// BM25 search over entry text, normalized into (0, 1), plus recency.
    fn lexical(&self, conn: &Connection, plan: &QueryPlan, now: DateTime<Utc>) -> Result<Vec<RankedEntry>> {
        let hits = entries::lexical_search(conn, &plan.text, plan.range.as_ref(), plan.limit)?;
        let mut candidates: Vec<Candidate> = hits
            .into_iter()
            .map(|(entry_id, rank, created_at)| {
                let relevance = (-rank).max(0.0);
                Candidate {
                    entry_id,
                    created_at,
                    score: relevance / (1.0 + relevance) + self.recency_bonus(created_at, now),
                }
            })
            .collect();
        sort_candidates(&mut candidates);
        Ok(candidates
            .into_iter()
            .map(|c| RankedEntry {
                entry_id: c.entry_id,
                score: c.score,
                created_at: c.created_at,
            })
            .collect())
    }
}

fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| b.entry_id.cmp(&a.entry_id))
    });
}
