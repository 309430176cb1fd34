mod helpers;

use echo_memory::db;
use echo_memory::db::migrations::{
    get_embedding_dim, get_embedding_model, get_schema_version, run_migrations, set_embedding_model,
    CURRENT_SCHEMA_VERSION, DEFAULT_EMBEDDING_MODEL,
};

#[test]
fn fresh_db_migrates_to_current_version() {
    let conn = helpers::test_db();
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
}

#[test]
fn migration_records_default_model() {
    let conn = helpers::test_db();
    assert_eq!(
        get_embedding_model(&conn).unwrap(),
        Some(DEFAULT_EMBEDDING_MODEL.to_string())
    );
    assert_eq!(get_embedding_dim(&conn).unwrap(), Some(384));
}

#[test]
fn migrations_are_idempotent() {
    let conn = helpers::test_db();
    set_embedding_model(&conn, "hashed-256", 256).unwrap();

    run_migrations(&conn).unwrap();
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    // a recorded model survives a re-run
    assert_eq!(get_embedding_model(&conn).unwrap(), Some("hashed-256".to_string()));
}

#[test]
fn manual_v1_db_upgrades_correctly() {
    db::load_sqlite_vec();
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    db::schema::init_schema(&conn).unwrap();

    assert_eq!(get_schema_version(&conn).unwrap(), 1);
    assert!(get_embedding_model(&conn).unwrap().is_none());

    run_migrations(&conn).unwrap();

    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    assert!(get_embedding_model(&conn).unwrap().is_some());
}
