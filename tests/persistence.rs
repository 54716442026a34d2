//! On-disk persistence across store handles

use coalesce::{EntityStore, OpenStore, Record, SimilarityEdge, SqliteStore};
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// === Scenario: documents and edges survive a reopen ===

#[test]
fn reopened_store_sees_prior_state() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("er.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        store
            .insert_many(
                "people",
                &[
                    Record::from_value("r1", json!({"name": "John Smith"})),
                    Record::from_value("r2", json!({"name": "Jon Smith"})),
                ],
            )
            .unwrap();
        store
            .upsert_edge(
                "similarTo",
                &SimilarityEdge::new("r1", "r2", 0.9, true, "test"),
                false,
            )
            .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.count("people").unwrap(), 2);
    assert_eq!(store.count_edges("similarTo").unwrap(), 1);
    let key = SimilarityEdge::pair_key("r1", "r2");
    let edge = store.get_edge("similarTo", &key).unwrap().unwrap();
    assert!((edge.similarity_score - 0.9).abs() < 1e-9);

    // Merge semantics keep working against the reopened handle.
    store
        .upsert_edge(
            "similarTo",
            &SimilarityEdge::new("r1", "r2", 0.7, false, "test"),
            false,
        )
        .unwrap();
    let edge = store.get_edge("similarTo", &key).unwrap().unwrap();
    assert!((edge.similarity_score - 0.8).abs() < 1e-9);
    assert!(edge.is_match, "OR-merge keeps the earlier match verdict");
    assert_eq!(edge.update_count, 2);
}
