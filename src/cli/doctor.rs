//! CLI `doctor` command: run database diagnostics and print a health report.

use anyhow::{Context, Result};

use crate::config::EchoConfig;
use crate::db;
use crate::memory::store::VectorStore;

/// Run database diagnostics and print a health report.
pub fn doctor(config: &EchoConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Point storage.db_path (or ECHO_DB) at the journal database.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path)
        .map(|m| m.len())
        .unwrap_or(0);

    let conn = db::open_database(&db_path)
        .context("failed to open database (may be corrupt)")?;

    let report = db::check_database_health(&conn)
        .context("failed to run health check")?;

    let store = VectorStore::new(config.storage.vector_encoding);
    let stale = store.stale_entries(&conn, config.embedding.dimensions)?.len();
    let orphaned = store.orphaned_entries(&conn)?.len();

    println!("Echo Memory Health Report");
    println!("=========================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("sqlite-vec:        v{}", report.sqlite_vec_version);
    println!();
    println!("Embedding model:");
    println!("  Stored:          {}", report.embedding_model.as_deref().unwrap_or("(not set)"));
    println!("  Configured:      {} ({})", config.embedding.model, config.embedding.provider);
    if let Some(dim) = report.embedding_dim {
        println!("  Dimensions:      {dim} stored, {} configured", config.embedding.dimensions);
    }
    let model_dir = crate::config::expand_tilde(&config.embedding.cache_dir);
    if config.embedding.provider == "local" && !model_dir.join("model.onnx").exists() {
        println!("  WARNING: model files missing. Run `echo-memory model download`.");
    }
    if let Some(ref stored) = report.embedding_model {
        if stored != &config.embedding.model {
            println!("  WARNING: model mismatch! Run `echo-memory backfill` to update vectors.");
        } else {
            println!("  Status:          OK (match)");
        }
    }
    println!();
    println!("Row counts:");
    println!("  Entries:         {}", report.entry_count);
    println!("  Embeddings:      {}", report.embedding_count);
    println!("  Patterns:        {}", report.pattern_count);
    println!("  Audit log:       {}", report.log_count);
    println!();
    println!("Vector store:");
    println!("  Stale entries:   {stale}");
    println!("  Orphaned:        {orphaned}");
    if stale + orphaned > 0 {
        println!("  Run `echo-memory backfill` to regenerate and prune.");
    }
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
    }

    if !report.integrity_ok {
        println!();
        println!("Recovery steps:");
        println!("  1. Restore the journal database from a backup.");
        println!("  2. Vectors and patterns are derived data; after restoring run:");
        println!("     echo-memory backfill && echo-memory analyze");
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_byte_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
