mod helpers;

use chrono::Duration;
use helpers::{add_entry, add_fillers, day, engine, hashed_encoder, missing_model_encoder, test_db};
use echo_memory::EngineError;
use echo_memory::memory::patterns::{load_patterns, AnalysisOutcome};
use echo_memory::memory::scheduler::AnalysisMode;
use echo_memory::memory::types::EntryId;

/// Five entries that differ only in stopwords and punctuation, spread over
/// different weekdays and hours.
fn add_interview_entries(conn: &rusqlite::Connection) -> Vec<EntryId> {
    let texts = [
        "Nervous about the job interview at the bakery, rehearsing answers.",
        "So nervous about my job interview at the bakery. Rehearsing answers!",
        "Still nervous about the job interview at the bakery; rehearsing answers again",
        "nervous, job interview, bakery, rehearsing answers",
        "I am nervous about that job interview at the bakery and rehearsing answers",
    ];
    texts
        .iter()
        .enumerate()
        .map(|(i, t)| add_entry(conn, t, day(3 * i as i64 + 1) + Duration::hours(2 * i as i64)))
        .collect()
}

#[tokio::test]
async fn recurring_interview_worry_becomes_one_pattern() {
    let conn = test_db();
    let mut interview = add_interview_entries(&conn);
    add_fillers(&conn, 30, 40);
    let engine = engine(conn, hashed_encoder());

    let outcome = engine.request_pattern_analysis().await.unwrap();
    let report = match outcome {
        AnalysisOutcome::Completed(report) => report,
        other => panic!("expected a completed analysis, got {other:?}"),
    };
    assert!(report.patterns_found >= 1);
    assert_eq!(report.entries_analyzed, 35);

    let visible = engine.list_patterns().await.unwrap();
    let mut members = visible
        .iter()
        .find(|p| p.entry_ids.contains(&interview[0]))
        .expect("interview pattern listed")
        .entry_ids
        .clone();
    members.sort_unstable();
    interview.sort_unstable();
    assert_eq!(members, interview);

    // no filler takes part in any pattern
    let db = engine.database();
    let conn = db.lock().unwrap();
    for pattern in load_patterns(&conn).unwrap() {
        assert!(pattern.entry_ids.iter().all(|id| interview.contains(id)));
    }
}

#[tokio::test]
async fn pattern_carries_frequency_and_keywords() {
    let conn = test_db();
    let interview = add_interview_entries(&conn);
    add_fillers(&conn, 30, 40);
    let engine = engine(conn, hashed_encoder());
    engine.request_pattern_analysis().await.unwrap();

    let patterns = engine.list_patterns().await.unwrap();
    let pattern = patterns
        .iter()
        .find(|p| p.entry_ids.contains(&interview[0]))
        .unwrap();
    assert_eq!(pattern.frequency, pattern.entry_ids.len());
    assert!(pattern.confidence >= engine.config().patterns.visibility_threshold);
    assert!(pattern.confidence <= 1.0);
    assert!(pattern.first_seen <= pattern.last_seen);
    assert!(pattern.keywords.iter().any(|k| k == "interview" || k == "bakery"));
    assert!(!pattern.description.is_empty());
}

#[tokio::test]
async fn analysis_is_locked_below_thirty_entries() {
    let conn = test_db();
    add_interview_entries(&conn);
    add_fillers(&conn, 10, 40);
    let engine = engine(conn, hashed_encoder());

    let availability = engine.check_pattern_availability().await.unwrap();
    assert!(!availability.unlocked);
    assert_eq!(availability.entry_count, 15);
    assert_eq!(availability.entries_needed, 15);

    let outcome = engine.request_pattern_analysis().await.unwrap();
    assert_eq!(
        outcome,
        AnalysisOutcome::InsufficientCorpus {
            entry_count: 15,
            entries_needed: 15,
        }
    );
    assert!(engine.list_patterns().await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_corpus_needs_thirty_entries() {
    let engine = engine(test_db(), hashed_encoder());
    let availability = engine.check_pattern_availability().await.unwrap();
    assert!(!availability.unlocked);
    assert_eq!(availability.entry_count, 0);
    assert_eq!(availability.entries_needed, 30);
}

#[tokio::test]
async fn analysis_without_model_is_unavailable() {
    let conn = test_db();
    add_interview_entries(&conn);
    add_fillers(&conn, 30, 40);
    let engine = engine(conn, missing_model_encoder());

    let outcome = engine.request_pattern_analysis().await.unwrap();
    assert!(matches!(outcome, AnalysisOutcome::Unavailable { .. }));
    assert_eq!(outcome.patterns_found(), 0);
    assert!(engine.list_patterns().await.unwrap().is_empty());
}

#[tokio::test]
async fn same_corpus_same_patterns() {
    let mut runs = Vec::new();
    for _ in 0..2 {
        let conn = test_db();
        add_interview_entries(&conn);
        add_fillers(&conn, 30, 40);
        let engine = engine(conn, hashed_encoder());
        engine.request_pattern_analysis().await.unwrap();

        let mut summary: Vec<_> = engine
            .list_patterns()
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.pattern_type, p.entry_ids, p.keywords, p.description))
            .collect();
        summary.sort_by(|a, b| a.1.cmp(&b.1));
        runs.push(summary);
    }
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn rerun_updates_the_existing_pattern() {
    let conn = test_db();
    let interview = add_interview_entries(&conn);
    add_fillers(&conn, 30, 40);
    let engine = engine(conn, hashed_encoder());

    engine.analyze(AnalysisMode::Full).await.unwrap();
    let first = engine.list_patterns().await.unwrap();

    let report = match engine.analyze(AnalysisMode::Full).await.unwrap() {
        AnalysisOutcome::Completed(report) => report,
        other => panic!("second run did not complete: {other:?}"),
    };
    assert_eq!(report.created, 0);
    assert_eq!(report.updated, first.len());

    let second = engine.list_patterns().await.unwrap();
    let id_of = |ps: &[echo_memory::memory::types::Pattern]| {
        ps.iter()
            .find(|p| p.entry_ids.contains(&interview[0]))
            .map(|p| p.id.clone())
    };
    assert_eq!(id_of(&first), id_of(&second));
}

#[tokio::test]
async fn hidden_pattern_is_not_listed_but_resolvable() {
    let conn = test_db();
    let interview = add_interview_entries(&conn);
    add_fillers(&conn, 30, 40);
    let engine = engine(conn, hashed_encoder());
    engine.request_pattern_analysis().await.unwrap();

    let pattern = engine
        .list_patterns()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.entry_ids.contains(&interview[0]))
        .unwrap();

    {
        let db = engine.database();
        let conn = db.lock().unwrap();
        conn.execute(
            "UPDATE patterns SET confidence = 0.2 WHERE id = ?1",
            [&pattern.id],
        )
        .unwrap();
    }

    let listed = engine.list_patterns().await.unwrap();
    assert!(listed.iter().all(|p| p.id != pattern.id));

    let hidden = engine.get_pattern(&pattern.id).await.unwrap().unwrap();
    assert!(!hidden.is_visible(engine.config().patterns.visibility_threshold));
    assert_eq!(
        engine.get_entries_for_pattern(&pattern.id).await.unwrap().len(),
        interview.len()
    );
}

#[tokio::test]
async fn pattern_entries_are_newest_first() {
    let conn = test_db();
    let interview = add_interview_entries(&conn);
    add_fillers(&conn, 30, 40);
    let engine = engine(conn, hashed_encoder());
    engine.request_pattern_analysis().await.unwrap();

    let pattern = engine
        .list_patterns()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.entry_ids.contains(&interview[0]))
        .unwrap();
    let ids = engine.get_entries_for_pattern(&pattern.id).await.unwrap();
    let mut expected = interview.clone();
    expected.reverse();
    assert_eq!(ids, expected);

    assert!(matches!(
        engine.get_entries_for_pattern("no-such-pattern").await,
        Err(EngineError::PatternNotFound(_))
    ));
    assert!(engine.get_pattern("no-such-pattern").await.unwrap().is_none());
}

#[tokio::test]
async fn keyword_lookup_uses_patterns_then_text() {
    let conn = test_db();
    let interview = add_interview_entries(&conn);
    let fillers = add_fillers(&conn, 30, 40);
    let engine = engine(conn, hashed_encoder());
    engine.request_pattern_analysis().await.unwrap();

    let pattern = engine
        .list_patterns()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.entry_ids.contains(&interview[0]))
        .unwrap();
    let keyword = pattern.keywords[0].clone();
    let mut ids = engine.get_entries_for_keyword(&keyword).await.unwrap();
    ids.sort_unstable();
    assert_eq!(ids, interview);

    // not a pattern keyword: answered by the text index
    let ids = engine.get_entries_for_keyword("kettle7x").await.unwrap();
    assert_eq!(ids, vec![fillers[7]]);

    assert!(engine.get_entries_for_keyword("   ").await.unwrap().is_empty());
}
