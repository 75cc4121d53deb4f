//! Export/import round trip: an overwrite import of an active-set export
//! into a fresh database reproduces ids, content, and lineage pointers.

mod helpers;

use helpers::{bare_engine, test_engine};
use open_mem::memory::store::ListOptions;
use open_mem::memory::types::{ObservationPatch, ObservationType};
use open_mem::ImportStrategy;

#[tokio::test]
async fn overwrite_round_trip_preserves_active_set() {
    let (source, _dir_a) = test_engine();

    engine_seed(&source).await;
    let exported = source.export(None, None).unwrap();
    assert_eq!(exported.observations.len(), 3);

    let (target, _dir_b) = bare_engine();
    let report = target.import(&exported, ImportStrategy::Overwrite).unwrap();
    assert_eq!(report.observations, 3);
    assert_eq!(report.skipped, 0);

    let source_active = source.list_observations(&ListOptions::default()).unwrap();
    let target_active = target.list_observations(&ListOptions::default()).unwrap();
    assert_eq!(source_active.len(), target_active.len());

    for (a, b) in source_active.iter().zip(&target_active) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.title, b.title);
        assert_eq!(a.narrative, b.narrative);
        assert_eq!(a.revision_of, b.revision_of);
        assert_eq!(a.superseded_by, b.superseded_by);
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(a.token_count, b.token_count);
    }

    // Imported rows are searchable in the target database.
    let results = target
        .search(open_mem::memory::search::SearchRequest::new("flaky", ""))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn merge_import_skips_existing_ids() {
    let (engine, _dir) = test_engine();
    engine_seed(&engine).await;

    let exported = engine.export(None, None).unwrap();
    let report = engine.import(&exported, ImportStrategy::Merge).unwrap();
    assert_eq!(report.observations, 0);
    assert_eq!(report.skipped, 3);

    // No duplicates appeared.
    assert_eq!(
        engine.list_observations(&ListOptions::default()).unwrap().len(),
        3
    );
}

#[tokio::test]
async fn export_filters_by_type_and_limit() {
    let (engine, _dir) = test_engine();
    engine_seed(&engine).await;

    let decisions = engine
        .export(Some(ObservationType::Decision), None)
        .unwrap();
    assert_eq!(decisions.observations.len(), 1);
    assert_eq!(decisions.observations[0].title, "Keep rusqlite");

    let limited = engine.export(None, Some(2)).unwrap();
    assert_eq!(limited.observations.len(), 2);
}

#[tokio::test]
async fn export_contains_active_rows_only() {
    let (engine, _dir) = test_engine();
    engine_seed(&engine).await;

    let listed = engine.list_observations(&ListOptions::default()).unwrap();
    let revised = engine
        .update_observation(
            &listed[0].id,
            &ObservationPatch {
                narrative: Some("revised narrative".into()),
                ..ObservationPatch::default()
            },
        )
        .unwrap();
    engine.delete_observation(&listed[1].id).unwrap();

    let exported = engine.export(None, None).unwrap();
    let ids: Vec<&str> = exported
        .observations
        .iter()
        .map(|o| o.id.as_str())
        .collect();
    assert!(ids.contains(&revised.id.as_str()));
    assert!(!ids.contains(&listed[0].id.as_str()));
    assert!(!ids.contains(&listed[1].id.as_str()));
}

async fn engine_seed(engine: &open_mem::MemoryEngine) {
    use open_mem::memory::types::ObservationDraft;

    let drafts = [
        ("Keep rusqlite", ObservationType::Decision, "decided to keep the parser on rusqlite"),
        ("Parser rewrite", ObservationType::Refactor, "rewrote the parser module"),
        ("Found flaky test", ObservationType::Discovery, "the queue test is timing sensitive"),
    ];
    for (i, (title, observation_type, narrative)) in drafts.iter().enumerate() {
        engine
            .create_observation(
                "seed-session",
                &ObservationDraft {
                    observation_type: Some(*observation_type),
                    title: (*title).into(),
                    narrative: (*narrative).into(),
                    discovery_tokens: 80,
                    ..ObservationDraft::default()
                },
            )
            .unwrap();
        // Stable created_at ordering for the assertions above.
        if i < drafts.len() - 1 {
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        }
    }
}
