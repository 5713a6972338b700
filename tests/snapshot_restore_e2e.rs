mod common;

use std::sync::Arc;

use atlas_db::engine::{restore_snapshot_with_clock, Atlas, Clock, Fault, ManualClock, RelationSpec, SearchRequest};
use atlas_db::ContentHash;
use common::*;
use tempfile::tempdir;

fn restore(source_clock: &ManualClock, snapshot_dir: &std::path::Path, data_dir: &std::path::Path) -> Arc<Atlas> {
    let clock = Arc::new(ManualClock::new(source_clock.peek() + 10));
    restore_snapshot_with_clock(test_config(data_dir), snapshot_dir, clock).unwrap()
}

#[test]
fn current_snapshot_round_trips_engine_state() {
    let dir = tempdir().unwrap();
    let (atlas, clock) = open(dir.path());
    let corpus = low_rank_corpus(200, 16, 55);
    atlas.bootstrap_namespace(NS, &corpus, 3).unwrap();
    let atoms = load(&atlas, &corpus, TENANT);
    let rel = atlas
        .relate(RelationSpec::new(atoms[0], atoms[1], "links").weight(0.25))
        .unwrap();
    atlas.release(atoms[2]).unwrap();
    let extra = atlas.ingest_atom(b"unembedded", "text", TENANT).unwrap().atom_id;

    let snap = atlas.snapshot(None).unwrap();
    assert_eq!(snap.atoms, 201);
    assert_eq!(snap.embeddings, 200);
    assert_eq!(snap.relations, 1);
    assert!(snap.snapshot_dir.join("manifest.json").exists());
    assert!(snap.snapshot_dir.join("trees/1.tree").exists());

    let target = tempdir().unwrap();
    let restored = restore(&clock, &snap.snapshot_dir, target.path());

    let stats = restored.stats();
    assert_eq!(stats.atoms, 201);
    assert_eq!(stats.relations, 1);
    assert_eq!(stats.namespaces[0].index_entries, 200);
    assert_eq!(stats.namespaces[0].landmark_version, 1);
    assert!(restored.drain_faults().is_empty());

    for i in [0usize, 17, 99, 150] {
        let req = SearchRequest::new(NS, corpus[i].clone(), 5, TENANT);
        assert_eq!(
            restored.search(&req).unwrap().hits,
            atlas.search(&req).unwrap().hits
        );
    }
    assert_eq!(restored.atom(atoms[2]).unwrap().ref_count, 0);
    assert_eq!(
        restored.lookup(TENANT, &ContentHash::of(b"unembedded")),
        Some(extra)
    );
    assert_eq!(restored.relations_from(atoms[0])[0].id, rel.id);

    // Ids continue past the snapshot.
    let fresh = restored.ingest_atom(b"after restore", "text", TENANT).unwrap();
    assert!(fresh.atom_id > extra);

    // The zero-count atom is still collectable after restore.
    assert_eq!(restored.collect().unwrap().collected, 1);
}

#[test]
fn historical_snapshot_restores_past_state() {
    let dir = tempdir().unwrap();
    let (atlas, clock) = open(dir.path());
    let corpus = low_rank_corpus(120, 12, 8);
    atlas.bootstrap_namespace(NS, &corpus, 3).unwrap();
    let first = load(&atlas, &corpus[..60], TENANT);
    let moved = first[0];
    let at = clock.now();

    atlas.attach_embedding(moved, NS, &corpus[119]).unwrap();
    for (i, v) in corpus[60..100].iter().enumerate() {
        let atom = atlas
            .ingest_atom(format!("late-{i}").as_bytes(), "text", TENANT)
            .unwrap()
            .atom_id;
        atlas.attach_embedding(atom, NS, v).unwrap();
    }

    let snap = atlas.snapshot(Some(at)).unwrap();
    assert_eq!(snap.as_of, at);
    assert_eq!(snap.atoms, 60);
    assert_eq!(snap.embeddings, 60);
    assert!(!snap.snapshot_dir.join("trees").exists());

    let target = tempdir().unwrap();
    let restored = restore(&clock, &snap.snapshot_dir, target.path());
    assert_eq!(restored.stats().atoms, 60);
    assert_eq!(restored.stats().namespaces[0].index_entries, 60);
    let resp = restored
        .search(&SearchRequest::new(NS, corpus[0].clone(), 1, TENANT))
        .unwrap();
    assert_eq!(resp.hits[0].atom_id, moved);
    assert!((resp.hits[0].score - 1.0).abs() < 1e-6);

    assert!(atlas.snapshot(Some(clock.peek() + 1_000_000)).is_err());
}

#[test]
fn damaged_tree_file_falls_back_to_rebuild() {
    let dir = tempdir().unwrap();
    let (atlas, clock) = open(dir.path());
    let corpus = low_rank_corpus(150, 12, 19);
    atlas.bootstrap_namespace(NS, &corpus, 3).unwrap();
    let atoms = load(&atlas, &corpus, TENANT);
    let snap = atlas.snapshot(None).unwrap();

    std::fs::write(snap.snapshot_dir.join("trees/1.tree"), b"not a tree").unwrap();

    let target = tempdir().unwrap();
    let restored = restore(&clock, &snap.snapshot_dir, target.path());
    let faults = restored.drain_faults();
    assert_eq!(faults.len(), 1);
    assert!(matches!(&faults[0], Fault::SnapshotFileRejected { file, .. } if file == "trees/1.tree"));

    assert_eq!(restored.stats().namespaces[0].index_entries, 150);
    restored.verify_index(NS).unwrap();
    let resp = restored
        .search(&SearchRequest::new(NS, corpus[42].clone(), 1, TENANT))
        .unwrap();
    assert_eq!(resp.hits[0].atom_id, atoms[42]);
}

#[test]
fn damaged_data_file_is_rejected() {
    let dir = tempdir().unwrap();
    let (atlas, clock) = open(dir.path());
    let corpus = low_rank_corpus(30, 8, 23);
    atlas.bootstrap_namespace(NS, &corpus, 3).unwrap();
    load(&atlas, &corpus, TENANT);
    let snap = atlas.snapshot(None).unwrap();

    std::fs::write(snap.snapshot_dir.join("atoms.json"), b"[]").unwrap();

    let target = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(clock.peek() + 10));
    let err = restore_snapshot_with_clock(test_config(target.path()), &snap.snapshot_dir, clock)
        .unwrap_err();
    assert!(format!("{err:#}").contains("atoms.json"), "{err:#}");
}
