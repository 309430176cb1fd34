#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use echo_memory::config::EchoConfig;
use echo_memory::db;
use echo_memory::embedding::hashed::HashedEmbeddingProvider;
use echo_memory::embedding::Encoder;
use echo_memory::memory::entries::{insert_entry, NewEntry};
use echo_memory::memory::types::EntryId;
use echo_memory::MemoryEngine;
use rusqlite::Connection;

pub const TEST_DIM: usize = 256;

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    db::open_memory_database().unwrap()
}

/// Deterministic encoder that needs no model files.
pub fn hashed_encoder() -> Arc<Encoder> {
    Arc::new(Encoder::from_provider(Arc::new(HashedEmbeddingProvider::new(TEST_DIM))))
}

/// Encoder whose model never loads.
pub fn missing_model_encoder() -> Arc<Encoder> {
    Arc::new(Encoder::with_loader(TEST_DIM, || {
        anyhow::bail!("model.onnx not found in test cache")
    }))
}

pub fn test_config() -> EchoConfig {
    let mut config = EchoConfig::default();
    config.embedding.provider = "hashed".into();
    config.embedding.dimensions = TEST_DIM;
    config.scheduler.enabled = false;
    config
}

pub fn engine(conn: Connection, encoder: Arc<Encoder>) -> MemoryEngine {
    MemoryEngine::with_connection(conn, encoder, test_config())
}

/// A fixed Monday morning well in the past.
pub fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 8, 30, 0).unwrap() + Duration::days(n)
}

/// Insert an entry the way the host entry store does.
pub fn add_entry(conn: &Connection, text: &str, created_at: DateTime<Utc>) -> EntryId {
    insert_entry(
        conn,
        &NewEntry {
            raw_text: text.into(),
            created_at: Some(created_at),
            ..Default::default()
        },
    )
    .unwrap()
}

/// Entry with a structured summary, for the re-rank stage.
pub fn add_entry_with_summary(
    conn: &Connection,
    text: &str,
    summary: &str,
    created_at: DateTime<Utc>,
) -> EntryId {
    insert_entry(
        conn,
        &NewEntry {
            raw_text: text.into(),
            structured_summary: Some(summary.into()),
            created_at: Some(created_at),
            ..Default::default()
        },
    )
    .unwrap()
}

/// Text whose every token is private to `n`; no two fillers share vocabulary.
pub fn filler_text(n: usize) -> String {
    ["errand", "ledger", "parcel", "window", "garden", "kettle"]
        .iter()
        .map(|w| format!("{w}{n}x"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Insert `count` mutually unrelated entries starting at `day(offset)`.
pub fn add_fillers(conn: &Connection, count: usize, offset: i64) -> Vec<EntryId> {
    (0..count)
        .map(|i| add_entry(conn, &filler_text(i), day(offset + i as i64) + Duration::hours(i as i64 % 9)))
        .collect()
}
