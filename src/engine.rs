//! The engine facade.
//!
//! [`MemoryEngine`] owns the database handle, the encoder and every component
//! built on them, and exposes the journal-facing API as async methods.
//! Database work runs on the blocking pool under the connection mutex.
//! Embedding and clustering run on the blocking pool without it, so a long
//! analysis never stalls retrieval.
//!
//! [`MemoryEngine::start`] spawns two background tasks: the ingestion worker
//! that drains the entry hooks, and the scheduler loop that backfills missing
//! vectors and triggers pattern analysis. Both stop on
//! [`MemoryEngine::shutdown`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EchoConfig;
use crate::db::{self, migrations, HealthReport};
use crate::embedding::Encoder;
use crate::error::{EngineError, Result};
use crate::memory::cache::SimilarityCache;
use crate::memory::entries::{
    count_entries, count_entries_after, entries_matching_keyword, existing_entries,
};
use crate::memory::ingest::{affected_granularities, BackfillReport, Ingestor};
use crate::memory::patterns::{
    count_patterns, get_pattern, list_patterns, pattern_entry_ids, patterns_with_keyword,
    AnalysisOutcome, PatternAvailability, PatternDetector,
};
use crate::memory::retrieval::{RetrievalPipeline, RetrievalResponse, ResultSource};
use crate::memory::scheduler::{decide, load_state, AnalysisMode};
use crate::memory::stats::{engine_stats, StatsReport};
use crate::memory::store::VectorStore;
use crate::memory::types::{DateRange, EntryId, Granularity, Pattern};

struct IngestJob {
    entry_id: EntryId,
    granularities: Vec<Granularity>,
}

struct Shared {
    db: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
    config: EchoConfig,
    encoder: Arc<Encoder>,
    cache: Arc<SimilarityCache>,
    store: VectorStore,
    retrieval: RetrievalPipeline,
    ingestor: Ingestor,
    detector: PatternDetector,
    /// Serialises analysis runs.
    analysis: tokio::sync::Mutex<()>,
    queue: Mutex<Option<mpsc::UnboundedSender<IngestJob>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

// Guards here protect plain bookkeeping; a poisoned one is still usable.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("blocking task failed: {e}"))?
}

impl MemoryEngine {
    /// Open the configured database and build the engine. The embedding
    /// model is not loaded until first use.
    pub fn open(config: EchoConfig) -> anyhow::Result<Self> {
        let db_path = config.resolved_db_path();
        let conn = db::open_database(&db_path)?;
        tracing::info!(db = %db_path.display(), "database ready");

        if let Ok(Some(stored_model)) = migrations::get_embedding_model(&conn) {
            if stored_model != config.embedding.model {
                tracing::warn!(
                    stored = %stored_model,
                    configured = %config.embedding.model,
                    "embedding model changed, vectors are regenerated by the next backfill"
                );
            }
        }

        let encoder = Arc::new(Encoder::new(&config.embedding));
        Ok(Self::build(conn, Some(db_path), encoder, config))
    }

    /// Build an engine over an already initialised connection.
    pub fn with_connection(conn: Connection, encoder: Arc<Encoder>, config: EchoConfig) -> Self {
        Self::build(conn, None, encoder, config)
    }

    fn build(
        conn: Connection,
        db_path: Option<PathBuf>,
        encoder: Arc<Encoder>,
        config: EchoConfig,
    ) -> Self {
        let cache = Arc::new(SimilarityCache::new(&config.cache));
        let store = VectorStore::new(config.storage.vector_encoding).with_cache(Arc::clone(&cache));
        let retrieval = RetrievalPipeline::new(
            config.retrieval.clone(),
            Arc::clone(&encoder),
            Arc::clone(&cache),
            store.clone(),
        );
        let ingestor = Ingestor::new(
            Arc::clone(&encoder),
            store.clone(),
            Arc::clone(&cache),
            config.retrieval.min_sentence_words,
        );
        let detector = PatternDetector::new(config.patterns.clone());

        Self {
            shared: Arc::new(Shared {
                db: Arc::new(Mutex::new(conn)),
                db_path,
                config,
                encoder,
                cache,
                store,
                retrieval,
                ingestor,
                detector,
                analysis: tokio::sync::Mutex::new(()),
                queue: Mutex::new(None),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &EchoConfig {
        &self.shared.config
    }

    pub fn encoder(&self) -> &Arc<Encoder> {
        &self.shared.encoder
    }

    pub fn cache(&self) -> &Arc<SimilarityCache> {
        &self.shared.cache
    }

    /// The shared connection. Hold the lock briefly.
    pub fn database(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.shared.db)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.shared.db_path.as_deref()
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Shared, &mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        blocking(move || {
            let mut conn = shared
                .db
                .lock()
                .map_err(|e| anyhow!("db lock poisoned: {e}"))?;
            f(&*shared, &mut *conn)
        })
        .await
    }

    // ── Retrieval ──

    /// Rank entries against `query`. An empty corpus or a query nothing
    /// matches yields an empty list. With the encoder unavailable the answer
    /// comes from the lexical index.
    pub async fn retrieve(
        &self,
        query: &str,
        range: Option<DateRange>,
        limit: Option<usize>,
    ) -> Result<RetrievalResponse> {
        let now = Utc::now();
        let plan = self.shared.retrieval.plan(query, range, limit, now.date_naive());
        if plan.text.is_empty() {
            return Ok(RetrievalResponse {
                results: vec![],
                source: ResultSource::Semantic,
                date_range: plan.range,
            });
        }
        if let Some(hit) = self.shared.retrieval.cached(&plan) {
            return Ok(hit);
        }

        let shared = Arc::clone(&self.shared);
        let (plan, query_vector) = blocking(move || {
            let v = shared.retrieval.embed_query(&plan)?;
            Ok((plan, v))
        })
        .await?;

        let response = self
            .with_db(move |s, conn| s.retrieval.finish(conn, &plan, query_vector.as_deref(), now))
            .await?;
        debug!(hits = response.results.len(), source = ?response.source, "retrieve");
        Ok(response)
    }

    // ── Patterns ──

    pub async fn check_pattern_availability(&self) -> Result<PatternAvailability> {
        self.with_db(|s, conn| Ok(s.detector.availability(count_entries(conn)?)))
            .await
    }

    /// Visible patterns, most confident first.
    pub async fn list_patterns(&self) -> Result<Vec<Pattern>> {
        self.with_db(|s, conn| list_patterns(conn, s.detector.config().visibility_threshold))
            .await
    }

    /// Direct lookup; hidden patterns included.
    pub async fn get_pattern(&self, pattern_id: &str) -> Result<Option<Pattern>> {
        let id = pattern_id.to_string();
        self.with_db(move |_, conn| get_pattern(conn, &id)).await
    }

    /// Member entries of a pattern, newest first.
    pub async fn get_entries_for_pattern(&self, pattern_id: &str) -> Result<Vec<EntryId>> {
        let id = pattern_id.to_string();
        self.with_db(move |_, conn| pattern_entry_ids(conn, &id)).await
    }

    /// Members of visible patterns tagged with `keyword`, newest first. When
    /// no such pattern exists the lexical index answers instead.
    pub async fn get_entries_for_keyword(&self, keyword: &str) -> Result<Vec<EntryId>> {
        let keyword = keyword.trim().to_string();
        if keyword.is_empty() {
            return Ok(vec![]);
        }
        self.with_db(move |s, conn| {
            let visibility = s.detector.config().visibility_threshold;
            let members: BTreeSet<EntryId> = patterns_with_keyword(conn, &keyword)?
                .into_iter()
                .filter(|p| p.is_visible(visibility))
                .flat_map(|p| p.entry_ids)
                .collect();
            if members.is_empty() {
                debug!(keyword = %keyword, "no pattern keyword match, using lexical index");
                return entries_matching_keyword(conn, &keyword, s.config.retrieval.coarse_top_n);
            }

            let ids: Vec<EntryId> = members.into_iter().collect();
            let mut found = existing_entries(conn, &ids)?;
            found.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
            Ok(found.into_iter().map(|(id, _)| id).collect())
        })
        .await
    }

    /// Manual trigger: a full analysis, subject to the corpus gate.
    pub async fn request_pattern_analysis(&self) -> Result<AnalysisOutcome> {
        self.analyze(AnalysisMode::Full).await
    }

    /// Run one analysis. Embeds whatever is missing first; the clustering
    /// itself runs off the database lock and lands in one transaction.
    pub async fn analyze(&self, mode: AnalysisMode) -> Result<AnalysisOutcome> {
        let _running = self.shared.analysis.lock().await;

        let availability = self.check_pattern_availability().await?;
        if !availability.unlocked {
            info!(
                entry_count = availability.entry_count,
                entries_needed = availability.entries_needed,
                "pattern analysis locked"
            );
            return Ok(AnalysisOutcome::InsufficientCorpus {
                entry_count: availability.entry_count,
                entries_needed: availability.entries_needed,
            });
        }

        let backfilled = match self.load_encoder().await {
            Ok(()) => self.backfill().await,
            Err(e) => Err(e),
        };
        match backfilled {
            Ok(_) => {}
            Err(e) if e.is_model_unavailable() => {
                warn!(error = %e, "pattern analysis unavailable");
                return Ok(AnalysisOutcome::Unavailable {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }

        let dim = self.shared.encoder.dimensions();
        let snapshot = self
            .with_db(move |s, conn| s.detector.snapshot(conn, &s.store, dim))
            .await?;
        debug!(entries = snapshot.entries.len(), existing = snapshot.existing.len(), mode = %mode, "pattern snapshot");

        let shared = Arc::clone(&self.shared);
        let plan = blocking(move || {
            shared
                .detector
                .plan(&snapshot, mode, Utc::now(), &shared.cancel)
        })
        .await?;

        if self.shared.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let report = self.with_db(move |s, conn| s.detector.apply(conn, &plan)).await?;
        Ok(AnalysisOutcome::Completed(report))
    }

    // ── Ingestion ──

    /// Hook: a new entry was saved. Embedding happens in the background
    /// once [`start`](Self::start) has run, inline otherwise.
    pub async fn on_entry_created(&self, entry_id: EntryId) -> Result<()> {
        self.enqueue(entry_id, Granularity::ALL.to_vec()).await
    }

    /// Hook: one text variant of an entry was (re)generated.
    pub async fn on_entry_text_updated(&self, entry_id: EntryId, granularity: Granularity) -> Result<()> {
        self.enqueue(entry_id, affected_granularities(granularity).to_vec())
            .await
    }

    /// Hook: an entry was deleted. Returns the number of vectors dropped.
    pub async fn on_entry_deleted(&self, entry_id: EntryId) -> Result<usize> {
        let removed = self
            .with_db(move |s, conn| s.ingestor.remove(conn, entry_id))
            .await?;
        debug!(entry_id, removed, "entry removed from memory");
        Ok(removed)
    }

    async fn enqueue(&self, entry_id: EntryId, granularities: Vec<Granularity>) -> Result<()> {
        let job = IngestJob {
            entry_id,
            granularities,
        };
        let inline = {
            let queue = lock(&self.shared.queue);
            match queue.as_ref() {
                Some(tx) => tx.send(job).err().map(|e| e.0),
                None => Some(job),
            }
        };
        let Some(job) = inline else {
            debug!(entry_id, "ingest job queued");
            return Ok(());
        };

        match self.ingest_entry(job.entry_id, &job.granularities).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_model_unavailable() => {
                warn!(entry_id, error = %e, "entry indexed without vectors, backfill will embed it");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Index and embed one entry now. Returns the number of vectors written.
    pub async fn ingest_entry(&self, entry_id: EntryId, granularities: &[Granularity]) -> Result<usize> {
        let entry = self
            .with_db(move |s, conn| s.ingestor.prepare(conn, entry_id))
            .await?;

        let shared = Arc::clone(&self.shared);
        let granularities = granularities.to_vec();
        let (entry, slots) = blocking(move || {
            let slots = shared.ingestor.embed(&entry, &granularities)?;
            Ok((entry, slots))
        })
        .await?;

        self.with_db(move |s, conn| s.ingestor.write(conn, &entry, &slots))
            .await
    }

    /// Sync the lexical index, then embed every entry that lacks a current
    /// `full_text` vector or holds stale ones. A failing entry is skipped and
    /// retried on the next pass; an unavailable model ends the pass with
    /// [`EngineError::ModelUnavailable`].
    pub async fn backfill(&self) -> Result<BackfillReport> {
        let (indexed, pruned) = self.with_db(|s, conn| s.ingestor.sync_index(conn)).await?;
        let mut report = BackfillReport {
            indexed,
            pruned,
            ..Default::default()
        };

        let pending = self.with_db(|s, conn| s.ingestor.pending(conn)).await?;
        if !pending.is_empty() {
            self.load_encoder().await?;
        }
        for id in pending {
            if self.shared.cancel.is_cancelled() {
                debug!("backfill cancelled");
                break;
            }
            match self.ingest_entry(id, &Granularity::ALL).await {
                Ok(_) => report.embedded += 1,
                Err(e) if e.is_model_unavailable() => return Err(e),
                Err(EngineError::EntryNotFound(_)) => debug!(entry_id = id, "entry deleted during backfill"),
                Err(e) => {
                    warn!(entry_id = id, error = %e, "embedding failed, will retry");
                    report.failed += 1;
                }
            }
        }

        if report != BackfillReport::default() {
            info!(
                indexed = report.indexed,
                embedded = report.embedded,
                failed = report.failed,
                pruned = report.pruned,
                "backfill pass complete"
            );
        }
        Ok(report)
    }

    /// Load the model and record which one the stored vectors come from.
    async fn load_encoder(&self) -> Result<()> {
        let encoder = Arc::clone(&self.shared.encoder);
        let model = blocking(move || encoder.model_id()).await?;
        let dim = self.shared.encoder.dimensions();
        self.with_db(move |_, conn| {
            if migrations::get_embedding_model(conn)?.as_deref() != Some(model.as_str())
                || migrations::get_embedding_dim(conn)? != Some(dim)
            {
                migrations::set_embedding_model(conn, &model, dim)?;
                info!(model = %model, dim, "recorded embedding model");
            }
            Ok(())
        })
        .await
    }

    // ── Background tasks ──

    /// Spawn the ingestion worker and, when enabled, the scheduler loop.
    /// Calling it twice is a no-op. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut queue = lock(&self.shared.queue);
        if queue.is_some() || self.shared.cancel.is_cancelled() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *queue = Some(tx);
        drop(queue);

        let mut tasks = lock(&self.shared.tasks);
        tasks.push(tokio::spawn(ingest_worker(self.clone(), rx)));
        if self.shared.config.scheduler.enabled {
            tasks.push(tokio::spawn(scheduler_loop(self.clone())));
        }
        info!(scheduler = self.shared.config.scheduler.enabled, "memory engine started");
    }

    /// One scheduler pass: backfill, then run an analysis if the policy says
    /// one is due. Returns the outcome of that analysis, if any.
    pub async fn scheduler_tick(&self) -> Result<Option<AnalysisOutcome>> {
        match self.backfill().await {
            Ok(_) => {}
            Err(e) if e.is_model_unavailable() => {
                debug!(error = %e, "scheduler idle while the model is unavailable");
                return Ok(None);
            }
            Err(e) => warn!(error = %e, "backfill pass failed"),
        }

        let now = Utc::now();
        let due = self
            .with_db(move |s, conn| {
                let entry_count = count_entries(conn)?;
                if !s.detector.availability(entry_count).unlocked {
                    return Ok(None);
                }
                let state = load_state(conn)?;
                let new_entries = count_entries_after(conn, state.last_run_max_entry_id)?;
                let has_patterns = count_patterns(conn)? > 0;
                Ok(decide(
                    &s.config.scheduler,
                    &state,
                    entry_count,
                    new_entries,
                    has_patterns,
                    now,
                ))
            })
            .await?;

        match due {
            Some(mode) => {
                info!(mode = %mode, "scheduled pattern analysis");
                self.analyze(mode).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Stop background tasks, cancel a running analysis and unload the model.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        lock(&self.shared.queue).take();
        let tasks = std::mem::take(&mut *lock(&self.shared.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        self.shared.encoder.shutdown();
        info!("memory engine stopped");
    }

    // ── Introspection ──

    pub async fn stats(&self) -> Result<StatsReport> {
        let dim = self.shared.encoder.dimensions();
        let mut report = self
            .with_db(move |s, conn| {
                let visibility = s.detector.config().visibility_threshold;
                Ok(engine_stats(conn, dim, visibility, s.db_path.as_deref())?)
            })
            .await?;
        report.cache = Some(self.shared.cache.stats());
        Ok(report)
    }

    pub async fn health(&self) -> Result<HealthReport> {
        self.with_db(|_, conn| Ok(db::check_database_health(conn)?))
            .await
    }
}

async fn ingest_worker(engine: MemoryEngine, mut rx: mpsc::UnboundedReceiver<IngestJob>) {
    let cancel = engine.shared.cancel.clone();
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        match engine.ingest_entry(job.entry_id, &job.granularities).await {
            Ok(written) => debug!(entry_id = job.entry_id, written, "entry embedded"),
            Err(e) if e.is_model_unavailable() => {
                warn!(entry_id = job.entry_id, error = %e, "entry indexed without vectors, backfill will embed it")
            }
            Err(e) => warn!(entry_id = job.entry_id, error = %e, "ingest failed, backfill will retry"),
        }
    }
    debug!("ingest worker stopped");
}

async fn scheduler_loop(engine: MemoryEngine) {
    let cancel = engine.shared.cancel.clone();
    let period = Duration::from_secs(engine.shared.config.scheduler.poll_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        match engine.scheduler_tick().await {
            Ok(Some(outcome)) => debug!(patterns_found = outcome.patterns_found(), "scheduled analysis finished"),
            Ok(None) => {}
            Err(EngineError::Cancelled) => break,
            Err(e) => warn!(error = %e, "scheduled analysis failed, will retry at the next trigger"),
        }
    }
    debug!("scheduler stopped");
}
