//! CLI `patterns` and `analyze` commands.

use anyhow::Result;

use crate::config::EchoConfig;
use crate::engine::MemoryEngine;
use crate::memory::patterns::AnalysisOutcome;

/// List visible patterns, or say how far the corpus is from unlocking them.
pub async fn patterns(config: &EchoConfig) -> Result<()> {
    let engine = MemoryEngine::open(config.clone())?;

    let availability = engine.check_pattern_availability().await?;
    if !availability.unlocked {
        println!(
            "Pattern insights unlock at {} entries ({} more needed).",
            config.patterns.min_entries, availability.entries_needed
        );
        return Ok(());
    }

    let patterns = engine.list_patterns().await?;
    if patterns.is_empty() {
        println!("No patterns yet. Run `echo-memory analyze` to look for some.");
        return Ok(());
    }

    for p in &patterns {
        println!(
            "[{}] {} (confidence: {:.2}, entries: {})",
            p.pattern_type, p.description, p.confidence, p.frequency
        );
        println!("  id:        {}", p.id);
        println!(
            "  seen:      {} to {}",
            p.first_seen.format("%Y-%m-%d"),
            p.last_seen.format("%Y-%m-%d")
        );
        if !p.keywords.is_empty() {
            println!("  keywords:  {}", p.keywords.join(", "));
        }
        println!();
    }
    Ok(())
}

/// Run a full pattern analysis now.
pub async fn analyze(config: &EchoConfig) -> Result<()> {
    let engine = MemoryEngine::open(config.clone())?;

    match engine.request_pattern_analysis().await? {
        AnalysisOutcome::Completed(report) => {
            println!("Analysis complete ({} mode)", report.mode);
            println!("  Entries analyzed:  {}", report.entries_analyzed);
            println!("  Patterns found:    {}", report.patterns_found);
            println!("  Created:           {}", report.created);
            println!("  Updated:           {}", report.updated);
            println!("  Hidden:            {}", report.hidden);
            for (t, n) in &report.by_type {
                println!("  {:<18} {}", format!("{t}:"), n);
            }
        }
        AnalysisOutcome::InsufficientCorpus {
            entry_count,
            entries_needed,
        } => {
            println!("Not enough entries yet: {entry_count} written, {entries_needed} more needed.");
        }
        AnalysisOutcome::Unavailable { reason } => {
            println!("Pattern analysis is unavailable right now: {reason}");
            println!("Run `echo-memory model download` and try again.");
        }
    }

    engine.shutdown().await;
    Ok(())
}
