mod helpers;

use echo_memory::config::EchoConfig;
use echo_memory::memory::types::Granularity;
use echo_memory::{EngineError, MemoryEngine};
use helpers::{add_entry, add_entry_with_summary, day, engine, hashed_encoder, missing_model_encoder, test_db};
use tempfile::TempDir;

fn vector_count(engine: &MemoryEngine, entry_id: i64, granularity: Granularity) -> i64 {
    let db = engine.database();
    let conn = db.lock().unwrap();
    conn.query_row(
        "SELECT COUNT(*) FROM embeddings WHERE entry_id = ?1 AND granularity = ?2",
        rusqlite::params![entry_id, granularity.as_str()],
        |r| r.get(0),
    )
    .unwrap()
}

#[tokio::test]
async fn created_entry_gets_every_granularity() {
    let conn = test_db();
    let id = add_entry_with_summary(
        &conn,
        "Long day. Then a quiet dinner with my sister downtown.",
        "office day, dinner with sister",
        day(0),
    );
    let engine = engine(conn, hashed_encoder());

    engine.on_entry_created(id).await.unwrap();

    assert_eq!(vector_count(&engine, id, Granularity::FullText), 1);
    assert_eq!(vector_count(&engine, id, Granularity::Summary), 1);
    // "Long day." is under the five-word minimum
    assert_eq!(vector_count(&engine, id, Granularity::Sentence), 1);
}

#[tokio::test]
async fn entry_without_summary_has_no_summary_vector() {
    let conn = test_db();
    let id = add_entry(&conn, "Walked to the market and bought fresh figs", day(0));
    let engine = engine(conn, hashed_encoder());

    engine.on_entry_created(id).await.unwrap();
    assert_eq!(vector_count(&engine, id, Granularity::FullText), 1);
    assert_eq!(vector_count(&engine, id, Granularity::Summary), 0);
}

#[tokio::test]
async fn summary_update_embeds_new_summary() {
    let conn = test_db();
    let id = add_entry(&conn, "Walked to the market and bought fresh figs", day(0));
    let engine = engine(conn, hashed_encoder());
    engine.on_entry_created(id).await.unwrap();

    {
        let db = engine.database();
        let conn = db.lock().unwrap();
        conn.execute(
            "UPDATE entries SET structured_summary = 'market trip, figs' WHERE id = ?1",
            [id],
        )
        .unwrap();
    }
    engine
        .on_entry_text_updated(id, Granularity::Summary)
        .await
        .unwrap();

    assert_eq!(vector_count(&engine, id, Granularity::Summary), 1);
    assert_eq!(vector_count(&engine, id, Granularity::FullText), 1);
}

#[tokio::test]
async fn text_edit_replaces_vectors() {
    let conn = test_db();
    let id = add_entry(&conn, "Walked to the market and bought fresh figs", day(0));
    let engine = engine(conn, hashed_encoder());
    engine.on_entry_created(id).await.unwrap();

    {
        let db = engine.database();
        let conn = db.lock().unwrap();
        conn.execute(
            "UPDATE entries SET raw_text = 'Rainy afternoon reading an old detective novel' WHERE id = ?1",
            [id],
        )
        .unwrap();
    }
    engine
        .on_entry_text_updated(id, Granularity::FullText)
        .await
        .unwrap();

    assert_eq!(vector_count(&engine, id, Granularity::FullText), 1);
    let response = engine.retrieve("detective novel", None, None).await.unwrap();
    assert_eq!(response.results.first().map(|r| r.entry_id), Some(id));
    let response = engine.retrieve("market figs", None, None).await.unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn deleted_entry_leaves_no_trace() {
    let conn = test_db();
    let id = add_entry(&conn, "Walked to the market and bought fresh figs", day(0));
    let engine = engine(conn, hashed_encoder());
    engine.on_entry_created(id).await.unwrap();

    {
        let db = engine.database();
        let conn = db.lock().unwrap();
        conn.execute("DELETE FROM entries WHERE id = ?1", [id]).unwrap();
    }
    let removed = engine.on_entry_deleted(id).await.unwrap();
    assert!(removed >= 1);

    for g in Granularity::ALL {
        assert_eq!(vector_count(&engine, id, g), 0);
    }
    assert!(engine.retrieve("market figs", None, None).await.unwrap().results.is_empty());
    assert_eq!(engine.on_entry_deleted(id).await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_entry_is_reported() {
    let engine = engine(test_db(), hashed_encoder());
    let err = engine
        .ingest_entry(404, &Granularity::ALL)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EntryNotFound(404)));
}

#[tokio::test]
async fn missing_model_defers_to_backfill() {
    let conn = test_db();
    let id = add_entry(&conn, "Walked to the market and bought fresh figs", day(0));
    let engine = engine(conn, missing_model_encoder());

    engine.on_entry_created(id).await.unwrap();
    assert_eq!(vector_count(&engine, id, Granularity::FullText), 0);

    let err = engine.backfill().await.unwrap_err();
    assert!(err.is_model_unavailable());
}

#[tokio::test]
async fn backfill_embeds_entries_written_behind_the_engine() {
    let conn = test_db();
    let ids: Vec<i64> = (0..4)
        .map(|i| add_entry(&conn, &format!("Morning pages number {i} about the garden"), day(i)))
        .collect();
    let engine = engine(conn, hashed_encoder());

    let report = engine.backfill().await.unwrap();
    assert_eq!(report.embedded, 4);
    assert_eq!(report.indexed, 4);
    assert_eq!(report.failed, 0);
    for id in &ids {
        assert_eq!(vector_count(&engine, *id, Granularity::FullText), 1);
    }

    let again = engine.backfill().await.unwrap();
    assert_eq!(again.embedded, 0);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.entries, 4);
    assert_eq!(stats.embedded_entries, 4);
    assert_eq!(stats.stale_vectors, 0);
    assert_eq!(stats.embedding_model.as_deref(), Some("hashed-256"));
}

#[tokio::test]
async fn background_worker_drains_hooks() {
    let conn = test_db();
    let id = add_entry(&conn, "Walked to the market and bought fresh figs", day(0));
    let engine = engine(conn, hashed_encoder());
    engine.start();

    engine.on_entry_created(id).await.unwrap();
    let mut embedded = false;
    for _ in 0..200 {
        if vector_count(&engine, id, Granularity::FullText) == 1 {
            embedded = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    engine.shutdown().await;
    assert!(embedded, "worker never embedded the entry");
}

fn file_config(dir: &TempDir, dimensions: usize) -> EchoConfig {
    let mut config = helpers::test_config();
    config.storage.db_path = dir.path().join("echo.db").to_string_lossy().into_owned();
    config.embedding.dimensions = dimensions;
    config
}

#[tokio::test]
async fn model_change_reembeds_stale_vectors() {
    let dir = TempDir::new().unwrap();

    let first = MemoryEngine::open(file_config(&dir, 64)).unwrap();
    let id = {
        let db = first.database();
        let conn = db.lock().unwrap();
        add_entry(&conn, "Walked to the market and bought fresh figs", day(0))
    };
    first.on_entry_created(id).await.unwrap();
    first.shutdown().await;
    drop(first);

    let second = MemoryEngine::open(file_config(&dir, 128)).unwrap();
    let stats = second.stats().await.unwrap();
    assert!(stats.stale_vectors >= 1);
    assert_eq!(stats.embedded_entries, 0);
    assert!(stats.db_size_bytes > 0);

    let report = second.backfill().await.unwrap();
    assert_eq!(report.embedded, 1);

    let stats = second.stats().await.unwrap();
    assert_eq!(stats.stale_vectors, 0);
    assert_eq!(stats.embedded_entries, 1);
    assert_eq!(stats.embedding_model.as_deref(), Some("hashed-128"));
    assert_eq!(stats.embedding_dim, Some(128));
}
