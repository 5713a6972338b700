mod common;

use atlas_db::engine::{Clock, EngineError, RelationSpec, SearchRequest};
use common::*;
use tempfile::tempdir;

#[test]
fn as_of_search_sees_past_state() {
    let dir = tempdir().unwrap();
    let (atlas, clock) = open(dir.path());
    let corpus = low_rank_corpus(100, 12, 41);
    atlas.bootstrap_namespace(NS, &corpus, 3).unwrap();

    let a = atlas.ingest_atom(b"a", "text", TENANT).unwrap().atom_id;
    let b = atlas.ingest_atom(b"b", "text", TENANT).unwrap().atom_id;
    atlas.attach_embedding(a, NS, &corpus[0]).unwrap();
    atlas.attach_embedding(b, NS, &corpus[1]).unwrap();
    let t1 = clock.now();

    atlas.attach_embedding(a, NS, &corpus[50]).unwrap();
    let t2 = clock.now();

    atlas.release(b).unwrap();
    atlas.collect().unwrap();
    let t3 = clock.now();

    let past = atlas
        .search(&SearchRequest::new(NS, corpus[0].clone(), 2, TENANT).as_of(t1))
        .unwrap();
    assert!(past.historical);
    assert_eq!(past.hits.len(), 2);
    assert_eq!(past.hits[0].atom_id, a);
    assert!((past.hits[0].score - 1.0).abs() < 1e-6);

    let middle = atlas
        .search(&SearchRequest::new(NS, corpus[50].clone(), 2, TENANT).as_of(t2))
        .unwrap();
    assert_eq!(middle.hits[0].atom_id, a);
    assert_eq!(middle.hits.len(), 2);

    let after = atlas
        .search(&SearchRequest::new(NS, corpus[1].clone(), 2, TENANT).as_of(t3))
        .unwrap();
    assert_eq!(after.hits.len(), 1);
    assert_eq!(after.hits[0].atom_id, a);

    // The current state has moved on from the first vector.
    let now = atlas
        .search(&SearchRequest::new(NS, corpus[0].clone(), 1, TENANT))
        .unwrap();
    assert!(now.hits[0].score < 1.0);

    let v1 = atlas.embedding_as_of(a, NS, t1).unwrap().unwrap();
    assert_eq!(&*v1.vector, corpus[0].as_slice());
    let v2 = atlas.embedding(a, NS).unwrap().unwrap();
    assert_eq!(&*v2.vector, corpus[50].as_slice());
    assert!(atlas.embedding_as_of(b, NS, t3).unwrap().is_none());

    assert_eq!(atlas.atom_as_of(b, t1).unwrap().ref_count, 1);
    assert!(!atlas.atom_as_of(b, t3).map_or(false, |v| v.is_present()));
}

#[test]
fn purge_drops_closed_history_only() {
    let dir = tempdir().unwrap();
    let (atlas, clock) = open(dir.path());
    let corpus = low_rank_corpus(30, 8, 3);
    atlas.bootstrap_namespace(NS, &corpus, 3).unwrap();

    let a = atlas.ingest_atom(b"a", "text", TENANT).unwrap().atom_id;
    let b = atlas.ingest_atom(b"b", "text", TENANT).unwrap().atom_id;
    atlas.attach_embedding(a, NS, &corpus[0]).unwrap();
    let rel = atlas.relate(RelationSpec::new(a, b, "sees")).unwrap();
    let t1 = clock.now();
    atlas.attach_embedding(a, NS, &corpus[1]).unwrap();
    atlas.unrelate(rel.id).unwrap();
    let horizon = clock.now();

    let report = atlas.purge_history(horizon);
    assert_eq!(report.horizon, horizon);
    assert_eq!(report.embedding_intervals, 1);
    assert_eq!(report.relation_intervals, 1);

    assert!(atlas.embedding_as_of(a, NS, t1).unwrap().is_none());
    assert!(atlas.relations_as_of(a, t1).is_empty());
    assert!(atlas.embedding(a, NS).unwrap().is_some());
    assert!(atlas.atom(a).is_some());

    // Without a retention window nothing expires.
    assert!(atlas.purge_expired().is_none());
}

#[test]
fn migration_reprojects_and_keeps_history() {
    let dir = tempdir().unwrap();
    let (atlas, clock) = open(dir.path());
    let corpus = low_rank_corpus(600, 16, 77);
    atlas.bootstrap_namespace(NS, &corpus[..100], 3).unwrap();
    let atoms = load(&atlas, &corpus, TENANT);
    let before = clock.now();

    let report = atlas.migrate_namespace(NS, &corpus[300..]).unwrap();
    assert_eq!(report.from_version, 1);
    assert_eq!(report.to_version, 2);
    assert_eq!(report.reprojected, 600);
    assert!(!report.resumed);

    let ns = atlas.namespace(NS).unwrap();
    assert_eq!(ns.landmark_version(), 2);
    assert_eq!(ns.index().len(), 600);
    assert_eq!(atlas.embedding(atoms[10], NS).unwrap().unwrap().landmark_version, 2);
    assert_eq!(
        atlas
            .embedding_as_of(atoms[10], NS, before)
            .unwrap()
            .unwrap()
            .landmark_version,
        1
    );

    let resp = atlas
        .search(&SearchRequest::new(NS, corpus[123].clone(), 1, TENANT))
        .unwrap();
    assert_eq!(resp.hits[0].atom_id, atoms[123]);
    assert_eq!(resp.landmark_version, 2);

    let past = atlas
        .search(&SearchRequest::new(NS, corpus[123].clone(), 1, TENANT).as_of(before))
        .unwrap();
    assert_eq!(past.hits[0].atom_id, atoms[123]);
    assert_eq!(past.landmark_version, 1);
}

#[test]
fn background_jobs_report_through_handles() {
    let dir = tempdir().unwrap();
    let (atlas, _) = open(dir.path());
    let corpus = low_rank_corpus(300, 16, 13);
    atlas.bootstrap_namespace(NS, &corpus, 3).unwrap();
    let atoms = load(&atlas, &corpus, TENANT);

    let rebuild = atlas.spawn_rebuild(NS).unwrap().wait().unwrap();
    assert_eq!(rebuild.entries, 300);
    let stats = atlas.stats();
    assert_eq!(stats.namespaces[0].pending_overlay, 0);
    assert_eq!(stats.namespaces[0].index_entries, 300);

    // Nothing pending, so reorganize has no work.
    assert!(atlas.reorganize(NS).unwrap().skipped);

    for atom in &atoms[..10] {
        atlas.release(*atom).unwrap();
    }
    let collect = atlas.spawn_collect().unwrap().wait().unwrap();
    assert_eq!(collect.collected, 10);

    let migration = atlas
        .spawn_migration(NS, corpus[100..].to_vec())
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(migration.reprojected, 290);
    atlas.verify_index(NS).unwrap();

    let handle = atlas.spawn_rebuild(NS).unwrap();
    handle.cancel();
    match handle.wait() {
        Ok(report) => assert_eq!(report.entries, 290),
        Err(err) => assert!(matches!(err, EngineError::Cancelled(_))),
    }
    let report = atlas.rebuild_index(NS).unwrap();
    assert_eq!(report.entries, 290);
}
