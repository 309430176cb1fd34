//! Ingestion: entry text → stored vectors and lexical index rows.
//!
//! Work for one entry is split so the encoder never runs under the database
//! lock: [`Ingestor::prepare`] reads the entry and refreshes its index row,
//! [`Ingestor::embed`] only talks to the encoder, [`Ingestor::write`] stores
//! the vectors. [`Ingestor::ingest`] chains the three.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::embedding::Encoder;
use crate::error::{EngineError, Result};
use crate::memory::cache::{fingerprint, CachedVectors, Fingerprint, SimilarityCache};
use crate::memory::entries::{
    entries_missing_from_index, entries_missing_full_text, fetch_entry, index_entry_text,
    orphaned_index_rows, unindex_entry,
};
use crate::memory::store::{write_audit_log, VectorInput, VectorStore};
use crate::memory::types::{Entry, EntryId, Granularity};

/// Sentences of `text` with at least `min_words` words, terminators kept.
pub fn split_sentences(text: &str, min_words: usize) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c == '\n' {
            push_sentence(&mut sentences, &mut current, min_words);
            continue;
        }
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            push_sentence(&mut sentences, &mut current, min_words);
        }
    }
    push_sentence(&mut sentences, &mut current, min_words);
    sentences
}

fn push_sentence(out: &mut Vec<String>, current: &mut String, min_words: usize) {
    let sentence = current.trim();
    if !sentence.is_empty() && sentence.split_whitespace().count() >= min_words {
        out.push(sentence.to_string());
    }
    current.clear();
}

/// Slots derived from a text variant. Sentences come from the raw text, so a
/// raw-text update refreshes both.
pub fn affected_granularities(updated: Granularity) -> &'static [Granularity] {
    match updated {
        Granularity::FullText | Granularity::Sentence => &[Granularity::FullText, Granularity::Sentence],
        Granularity::Summary => &[Granularity::Summary],
    }
}

/// Vectors computed for one (entry, granularity) slot, ready to store.
#[derive(Debug, Clone)]
pub struct EmbeddedSlot {
    pub granularity: Granularity,
    pub inputs: Vec<VectorInput>,
    pub text_fingerprint: Fingerprint,
    /// Served from the vector cache instead of the encoder.
    pub reused: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    /// Entries added to the lexical index.
    pub indexed: usize,
    /// Entries whose vectors were (re)generated.
    pub embedded: usize,
    /// Entries that failed and will be retried on the next pass.
    pub failed: usize,
    /// Entries whose leftover vectors or index rows were removed.
    pub pruned: usize,
}

pub struct Ingestor {
    encoder: Arc<Encoder>,
    store: VectorStore,
    cache: Arc<SimilarityCache>,
    min_sentence_words: usize,
}

impl Ingestor {
    pub fn new(
        encoder: Arc<Encoder>,
        store: VectorStore,
        cache: Arc<SimilarityCache>,
        min_sentence_words: usize,
    ) -> Self {
        Self {
            encoder,
            store,
            cache,
            min_sentence_words,
        }
    }

    pub fn encoder(&self) -> &Arc<Encoder> {
        &self.encoder
    }

    /// Texts embedded for `granularity`; empty when the entry has none.
    pub fn texts(&self, entry: &Entry, granularity: Granularity) -> Vec<String> {
        match granularity {
            Granularity::FullText => {
                let raw = entry.raw_text.trim();
                if raw.is_empty() {
                    vec![]
                } else {
                    vec![raw.to_string()]
                }
            }
            Granularity::Summary => entry.summary_text().map(str::to_string).into_iter().collect(),
            Granularity::Sentence => split_sentences(&entry.raw_text, self.min_sentence_words),
        }
    }

    /// Read the entry and refresh its lexical index row.
    pub fn prepare(&self, conn: &Connection, entry_id: EntryId) -> Result<Entry> {
        let entry = fetch_entry(conn, entry_id)?.ok_or(EngineError::EntryNotFound(entry_id))?;
        index_entry_text(conn, &entry)?;
        Ok(entry)
    }

    /// Compute vectors for `granularities`. Slots whose text is unchanged
    /// since the last embedding are served from the vector cache.
    pub fn embed(&self, entry: &Entry, granularities: &[Granularity]) -> Result<Vec<EmbeddedSlot>> {
        let mut slots = Vec::with_capacity(granularities.len());
        let mut pending: Vec<(Granularity, Vec<String>, Fingerprint)> = Vec::new();

        for &granularity in granularities {
            let texts = self.texts(entry, granularity);
            let text_fingerprint = fingerprint(&texts);
            if texts.is_empty() {
                slots.push(EmbeddedSlot {
                    granularity,
                    inputs: vec![],
                    text_fingerprint,
                    reused: false,
                });
                continue;
            }
            let cached = self
                .cache
                .get_vectors(entry.id, granularity, &text_fingerprint)
                .filter(|vs| {
                    vs.len() == texts.len() && vs.iter().all(|v| v.len() == self.encoder.dimensions())
                });
            match cached {
                Some(vectors) => slots.push(EmbeddedSlot {
                    granularity,
                    inputs: to_inputs(granularity, texts, vectors),
                    text_fingerprint,
                    reused: true,
                }),
                None => pending.push((granularity, texts, text_fingerprint)),
            }
        }

        if !pending.is_empty() {
            let batch: Vec<&str> = pending
                .iter()
                .flat_map(|(_, texts, _)| texts.iter().map(String::as_str))
                .collect();
            let mut vectors = self.encoder.embed_batch(&batch)?.into_iter();
            for (granularity, texts, text_fingerprint) in pending {
                let slot_vectors: Vec<Vec<f32>> = vectors.by_ref().take(texts.len()).collect();
                slots.push(EmbeddedSlot {
                    granularity,
                    inputs: to_inputs(granularity, texts, slot_vectors),
                    text_fingerprint,
                    reused: false,
                });
            }
        }
        Ok(slots)
    }

    /// Store computed slots. Skips entries deleted while they were being
    /// embedded. Returns the number of vectors written.
    pub fn write(&self, conn: &mut Connection, entry: &Entry, slots: &[EmbeddedSlot]) -> Result<usize> {
        if fetch_entry(conn, entry.id)?.is_none() {
            debug!(entry_id = entry.id, "entry deleted before its vectors were stored");
            return Ok(0);
        }

        let mut written = 0;
        for slot in slots {
            written += self
                .store
                .put(conn, entry.id, slot.granularity, entry.created_at, &slot.inputs)?;
            if !slot.inputs.is_empty() {
                self.cache.put_vectors(
                    entry.id,
                    slot.granularity,
                    CachedVectors {
                        text_fingerprint: slot.text_fingerprint,
                        vectors: slot.inputs.iter().map(|i| i.vector.clone()).collect(),
                    },
                );
            }
        }

        let granularities: Vec<&str> = slots.iter().map(|s| s.granularity.as_str()).collect();
        write_audit_log(
            conn,
            "embed",
            &entry.id.to_string(),
            Some(&json!({
                "granularities": granularities,
                "vectors": written,
                "reused": slots.iter().filter(|s| s.reused).count(),
            })),
        )?;
        Ok(written)
    }

    /// Prepare, embed and write while holding `conn`.
    pub fn ingest(
        &self,
        conn: &mut Connection,
        entry_id: EntryId,
        granularities: &[Granularity],
    ) -> Result<usize> {
        let entry = self.prepare(conn, entry_id)?;
        let slots = self.embed(&entry, granularities)?;
        self.write(conn, &entry, &slots)
    }

    /// Drop an entry's vectors and index row. Returns the vectors removed.
    pub fn remove(&self, conn: &Connection, entry_id: EntryId) -> Result<usize> {
        let removed = self.store.delete(conn, entry_id)?;
        unindex_entry(conn, entry_id)?;
        write_audit_log(
            conn,
            "delete",
            &entry_id.to_string(),
            Some(&json!({ "vectors": removed })),
        )?;
        Ok(removed)
    }

    /// Entries lacking a current `full_text` vector or holding stale ones.
    pub fn pending(&self, conn: &Connection) -> Result<Vec<EntryId>> {
        let dim = self.encoder.dimensions();
        let mut ids: BTreeSet<EntryId> = entries_missing_full_text(conn, dim)?.into_iter().collect();
        ids.extend(self.store.stale_entries(conn, dim)?);
        Ok(ids.into_iter().collect())
    }

    /// Index unindexed entries and drop leftovers of deleted ones. Needs no
    /// encoder. Returns (indexed, pruned).
    pub fn sync_index(&self, conn: &Connection) -> Result<(usize, usize)> {
        let mut indexed = 0;
        for id in entries_missing_from_index(conn)? {
            if let Some(entry) = fetch_entry(conn, id)? {
                index_entry_text(conn, &entry)?;
                indexed += 1;
            }
        }

        let mut orphans: BTreeSet<EntryId> = self.store.orphaned_entries(conn)?.into_iter().collect();
        orphans.extend(orphaned_index_rows(conn)?);
        for &id in &orphans {
            self.store.delete(conn, id)?;
            unindex_entry(conn, id)?;
        }
        Ok((indexed, orphans.len()))
    }

    /// Bring every entry up to date. A failing entry is logged and skipped;
    /// an unavailable model stops the pass.
    pub fn backfill(&self, conn: &mut Connection, cancel: &CancellationToken) -> Result<BackfillReport> {
        self.backfill_with_progress(conn, cancel, |_, _| {})
    }

    /// [`backfill`](Self::backfill), calling `progress(done, total)` after
    /// every pending entry.
    pub fn backfill_with_progress<F>(
        &self,
        conn: &mut Connection,
        cancel: &CancellationToken,
        mut progress: F,
    ) -> Result<BackfillReport>
    where
        F: FnMut(usize, usize),
    {
        let (indexed, pruned) = self.sync_index(conn)?;
        let mut report = BackfillReport {
            indexed,
            pruned,
            ..Default::default()
        };

        let pending = self.pending(conn)?;
        let total = pending.len();
        for (done, id) in pending.into_iter().enumerate() {
            if cancel.is_cancelled() {
                debug!("backfill cancelled");
                break;
            }
            match self.ingest(conn, id, &Granularity::ALL) {
                Ok(_) => report.embedded += 1,
                Err(e) if e.is_model_unavailable() => return Err(e),
                Err(e) => {
                    warn!(entry_id = id, error = %e, "embedding failed, will retry");
                    report.failed += 1;
                }
            }
            progress(done + 1, total);
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
}

fn to_inputs(granularity: Granularity, texts: Vec<String>, vectors: Vec<Vec<f32>>) -> Vec<VectorInput> {
    texts
        .into_iter()
        .zip(vectors)
        .map(|(text, vector)| match granularity {
            Granularity::Sentence => VectorInput::sentence(text, vector),
            _ => VectorInput::new(vector),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::CacheConfig;
    use crate::embedding::hashed::HashedEmbeddingProvider;
    use crate::embedding::EmbeddingProvider;
    use crate::memory::cosine_similarity;
    use crate::memory::entries::{insert_entry, NewEntry};
    use crate::memory::store::VectorEncoding;

    const DIM: usize = 128;

    /// Hashed provider that counts embedded texts.
    struct Counting {
        inner: HashedEmbeddingProvider,
        texts: AtomicUsize,
    }

    impl EmbeddingProvider for Counting {
        fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.texts.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text)
        }

        fn dimensions(&self) -> usize {
            DIM
        }

        fn model_id(&self) -> String {
            "counting".into()
        }
    }

    struct Fixture {
        conn: Connection,
        ingestor: Ingestor,
        provider: Arc<Counting>,
        store: VectorStore,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(Counting {
            inner: HashedEmbeddingProvider::new(DIM),
            texts: AtomicUsize::new(0),
        });
        let encoder = Arc::new(Encoder::from_provider(provider.clone()));
        let cache = Arc::new(SimilarityCache::new(&CacheConfig::default()));
        let store = VectorStore::new(VectorEncoding::F32).with_cache(cache.clone());
        Fixture {
            conn: crate::db::open_memory_database().unwrap(),
            ingestor: Ingestor::new(encoder, store.clone(), cache, 5),
            provider,
            store,
        }
    }

    fn add(conn: &Connection, raw: &str, summary: Option<&str>) -> EntryId {
        insert_entry(
            conn,
            &NewEntry {
                raw_text: raw.into(),
                structured_summary: summary.map(str::to_string),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn sentences_need_enough_words() {
        let text = "I went to the park today. It was sunny!\nMy dog chased a squirrel around the big oak tree?";
        assert_eq!(
            split_sentences(text, 5),
            vec![
                "I went to the park today.".to_string(),
                "My dog chased a squirrel around the big oak tree?".to_string(),
            ]
        );
        assert_eq!(split_sentences("no terminator but plenty of words here", 5).len(), 1);
        assert!(split_sentences("", 5).is_empty());
    }

    #[test]
    fn raw_text_updates_refresh_sentences() {
        assert_eq!(
            affected_granularities(Granularity::FullText),
            &[Granularity::FullText, Granularity::Sentence]
        );
        assert_eq!(affected_granularities(Granularity::Summary), &[Granularity::Summary]);
    }

    #[test]
    fn ingest_writes_every_granularity_and_the_index() {
        let mut fx = fixture();
        let id = add(
            &fx.conn,
            "Walked the dog along the river this morning. The water was high after the rain.",
            Some("Morning dog walk by the river"),
        );
        let written = fx.ingestor.ingest(&mut fx.conn, id, &Granularity::ALL).unwrap();
        assert_eq!(written, 1 + 1 + 2);

        let full = fx.store.get(&fx.conn, id, Granularity::FullText, DIM).unwrap().unwrap();
        assert_eq!(full.len(), 1);
        let sentences = fx.store.get(&fx.conn, id, Granularity::Sentence, DIM).unwrap().unwrap();
        assert_eq!(sentences[1].sentence.as_deref(), Some("The water was high after the rain."));
        assert_eq!(count(&fx.conn, "SELECT COUNT(*) FROM entry_fts WHERE entry_fts MATCH 'river'"), 1);
        assert_eq!(count(&fx.conn, "SELECT COUNT(*) FROM memory_log WHERE operation = 'embed'"), 1);
    }

    #[test]
    fn entry_without_summary_has_empty_summary_slot() {
        let mut fx = fixture();
        let id = add(&fx.conn, "Short note", None);
        fx.ingestor.ingest(&mut fx.conn, id, &Granularity::ALL).unwrap();
        assert!(fx.store.get(&fx.conn, id, Granularity::Summary, DIM).unwrap().is_none());
        assert!(fx.store.get(&fx.conn, id, Granularity::Sentence, DIM).unwrap().is_none());
        assert!(fx.store.has_full_text(&fx.conn, id, DIM).unwrap());
    }

    #[test]
    fn reembedding_identical_text_reuses_cached_vectors() {
        let mut fx = fixture();
        let id = add(&fx.conn, "Coffee with Sam at the corner cafe, long talk about work.", None);
        fx.ingestor.ingest(&mut fx.conn, id, &Granularity::ALL).unwrap();
        let calls = fx.provider.texts.load(Ordering::SeqCst);
        let before = fx.store.get(&fx.conn, id, Granularity::FullText, DIM).unwrap().unwrap();

        fx.ingestor.ingest(&mut fx.conn, id, &Granularity::ALL).unwrap();
        assert_eq!(fx.provider.texts.load(Ordering::SeqCst), calls);
        let after = fx.store.get(&fx.conn, id, Granularity::FullText, DIM).unwrap().unwrap();
        assert!((cosine_similarity(&before[0].vector, &after[0].vector) - 1.0).abs() < 1e-6);

        fx.conn
            .execute("UPDATE entries SET raw_text = 'Completely different words now' WHERE id = ?1", [id])
            .unwrap();
        fx.ingestor.ingest(&mut fx.conn, id, &[Granularity::FullText]).unwrap();
        assert_eq!(fx.provider.texts.load(Ordering::SeqCst), calls + 1);
    }

    #[test]
    fn missing_entry_is_reported() {
        let mut fx = fixture();
        let err = fx.ingestor.ingest(&mut fx.conn, 42, &Granularity::ALL).unwrap_err();
        assert!(matches!(err, EngineError::EntryNotFound(42)));
    }

    #[test]
    fn unavailable_model_still_indexes_text() {
        let encoder = Arc::new(Encoder::with_loader(DIM, || Err(anyhow::anyhow!("no model"))));
        let cache = Arc::new(SimilarityCache::new(&CacheConfig::default()));
        let store = VectorStore::new(VectorEncoding::F32);
        let ingestor = Ingestor::new(encoder, store, cache, 5);
        let mut conn = crate::db::open_memory_database().unwrap();
        let id = add(&conn, "Dentist appointment went fine", None);

        let err = ingestor.ingest(&mut conn, id, &Granularity::ALL).unwrap_err();
        assert!(err.is_model_unavailable());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM entry_fts WHERE entry_fts MATCH 'dentist'"), 1);

        let err = ingestor.backfill(&mut conn, &CancellationToken::new()).unwrap_err();
        assert!(err.is_model_unavailable());
    }

    #[test]
    fn backfill_embeds_missing_and_stale_entries() {
        let mut fx = fixture();
        let a = add(&fx.conn, "Never embedded entry about gardening", None);
        let b = add(&fx.conn, "Entry embedded with an older model", None);
        fx.conn
            .execute(
                "INSERT INTO embeddings (entry_id, granularity, seq, encoding, dim, vector, entry_created_at, created_at)
                 VALUES (?1, 'full_text', 0, 'f32', 1, x'0000803f', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                [b],
            )
            .unwrap();
        assert_eq!(fx.ingestor.pending(&fx.conn).unwrap(), vec![a, b]);

        let report = fx.ingestor.backfill(&mut fx.conn, &CancellationToken::new()).unwrap();
        assert_eq!(report.embedded, 2);
        assert_eq!(report.indexed, 2);
        assert_eq!(report.failed, 0);
        assert!(fx.ingestor.pending(&fx.conn).unwrap().is_empty());
        assert_eq!(count(&fx.conn, "SELECT COUNT(*) FROM embeddings WHERE dim = 1"), 0);

        // second pass has nothing to do
        let again = fx.ingestor.backfill(&mut fx.conn, &CancellationToken::new()).unwrap();
        assert_eq!(again, BackfillReport::default());
    }

    #[test]
    fn remove_and_prune_clear_leftovers() {
        let mut fx = fixture();
        let a = add(&fx.conn, "Entry that will be deleted by the host", None);
        let b = add(&fx.conn, "Entry that will be removed through the hook", None);
        fx.ingestor.ingest(&mut fx.conn, a, &Granularity::ALL).unwrap();
        fx.ingestor.ingest(&mut fx.conn, b, &Granularity::ALL).unwrap();

        fx.conn.execute("DELETE FROM entries WHERE id = ?1", [b]).unwrap();
        // full text plus one sentence
        assert_eq!(fx.ingestor.remove(&fx.conn, b).unwrap(), 2);

        fx.conn.execute("DELETE FROM entries WHERE id = ?1", [a]).unwrap();
        let (indexed, pruned) = fx.ingestor.sync_index(&fx.conn).unwrap();
        assert_eq!((indexed, pruned), (0, 1));
        assert_eq!(count(&fx.conn, "SELECT COUNT(*) FROM embeddings"), 0);
        assert_eq!(count(&fx.conn, "SELECT COUNT(*) FROM entry_fts"), 0);
    }
}
