//! CLI `backfill` command: index and embed every entry that lacks current vectors.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::EchoConfig;
use crate::db;
use crate::embedding::Encoder;
use crate::memory::cache::SimilarityCache;
use crate::memory::ingest::Ingestor;
use crate::memory::store::VectorStore;

/// Embed missing and stale entries with the configured model. Ctrl-C stops
/// after the current entry; the rest is picked up by the next run.
pub async fn backfill(config: &EchoConfig) -> Result<()> {
    let db_path = config.resolved_db_path();
    let mut conn = db::open_database(&db_path).context("failed to open database")?;

    let encoder = Arc::new(Encoder::new(&config.embedding));
    let cache = Arc::new(SimilarityCache::new(&config.cache));
    let store = VectorStore::new(config.storage.vector_encoding).with_cache(Arc::clone(&cache));
    let ingestor = Ingestor::new(
        Arc::clone(&encoder),
        store,
        cache,
        config.retrieval.min_sentence_words,
    );

    let pending = ingestor.pending(&conn)?.len();
    if pending == 0 {
        println!("All entries have current vectors.");
    } else {
        println!(
            "Embedding {pending} entries with model '{}'...",
            config.embedding.model
        );
    }

    let pb = ProgressBar::new(pending as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {pos}/{len} ({eta})")?
            .progress_chars("##-"),
    );

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let bar = pb.clone();
    let result = tokio::task::spawn_blocking(move || {
        let report = ingestor.backfill_with_progress(&mut conn, &cancel, |done, total| {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
        })?;
        if encoder.is_loaded() {
            let model = encoder.model_id()?;
            db::migrations::set_embedding_model(&conn, &model, encoder.dimensions())?;
        }
        Ok::<_, crate::error::EngineError>(report)
    })
    .await?;
    pb.finish_and_clear();

    let report = match result {
        Ok(report) => report,
        Err(e) if e.is_model_unavailable() => anyhow::bail!(
            "{e}\nRun `echo-memory model download`, or set embedding.provider = \"hashed\"."
        ),
        Err(e) => return Err(e.into()),
    };

    println!("Lexical index:   {} added, {} leftovers pruned", report.indexed, report.pruned);
    println!("Embedded:        {}", report.embedded);
    if report.failed > 0 {
        println!("Failed:          {} (retried on the next run)", report.failed);
    }
    Ok(())
}
