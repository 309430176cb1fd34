use anyhow::Result;
use chrono::Utc;

use crate::config::EchoConfig;
use crate::engine::MemoryEngine;
use crate::memory::entries::fetch_entry;
use crate::memory::retrieval::ResultSource;
use crate::memory::temporal::resolve_date_filter;

const PREVIEW_CHARS: usize = 120;

/// Run a retrieval query from the terminal.
pub async fn search(
    config: &EchoConfig,
    query: &str,
    when: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let engine = MemoryEngine::open(config.clone())?;
    let range = when.map(|w| resolve_date_filter(w, Utc::now().date_naive()));

    let response = engine.retrieve(query, range, limit).await?;

    if response.results.is_empty() {
        println!("No matching entries found.");
        return Ok(());
    }

    if response.source == ResultSource::Lexical {
        println!("(embedding model unavailable, showing keyword matches)");
    }
    if let Some(range) = response.date_range {
        println!(
            "Between {} and {}",
            range.start.format("%Y-%m-%d"),
            range.end.format("%Y-%m-%d")
        );
    }
    println!("Found {} entr(ies)\n", response.results.len());

    let db = engine.database();
    let conn = db
        .lock()
        .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
    for (i, hit) in response.results.iter().enumerate() {
        let text = fetch_entry(&conn, hit.entry_id)?
            .map(|e| e.raw_text)
            .unwrap_or_default();
        let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
        if text.chars().count() > PREVIEW_CHARS {
            preview.push_str("...");
        }

        println!(
            "  {}. #{} {} (score: {:.4})",
            i + 1,
            hit.entry_id,
            hit.created_at.format("%Y-%m-%d %H:%M"),
            hit.score,
        );
        println!("     {}", preview.replace('\n', " "));
        println!();
    }

    Ok(())
}
