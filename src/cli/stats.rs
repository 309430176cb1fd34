use anyhow::Result;

use crate::config::EchoConfig;

/// Display engine statistics in the terminal.
pub fn stats(config: &EchoConfig, json: bool) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = crate::db::open_database(&db_path)?;

    let report = crate::memory::stats::engine_stats(
        &conn,
        config.embedding.dimensions,
        config.patterns.visibility_threshold,
        Some(&db_path),
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Memory Statistics");
    println!("{}", "=".repeat(40));
    println!("  Entries:             {}", report.entries);
    println!("  Indexed:             {}", report.indexed_entries);
    println!("  Embedded:            {}", report.embedded_entries);
    println!("  Stale vectors:       {}", report.stale_vectors);
    println!("  Orphaned vectors:    {}", report.orphaned_vectors);
    println!();

    println!("Vectors by granularity:");
    for (g, count) in &report.embeddings {
        println!("  {:<12} {}", g, count);
    }
    println!();

    println!("Patterns:              {} ({} visible)", report.patterns, report.visible_patterns);
    for (t, count) in &report.patterns_by_type {
        println!("  {:<12} {}", t, count);
    }
    match report.scheduler.last_run_at {
        Some(ts) => println!(
            "Last analysis:         {} ({} entries)",
            ts.format("%Y-%m-%d %H:%M"),
            report.scheduler.last_run_entry_count
        ),
        None => println!("Last analysis:         never"),
    }
    println!();

    println!("Database size:         {} bytes", report.db_size_bytes);
    if let Some(ref oldest) = report.oldest_entry {
        println!("Oldest entry:          {oldest}");
    }
    if let Some(ref newest) = report.newest_entry {
        println!("Newest entry:          {newest}");
    }

    Ok(())
}
