//! Point-in-time snapshots
//!
//! A snapshot directory holds the logical state of the engine at one
//! timestamp:
//!
//! ```text
//! snap_<ts>_<hex>/
//! ├── manifest.json        ids, per-file SHA-256, landmark version table
//! ├── atoms.json
//! ├── relations.json
//! ├── landmarks.json       every landmark version active at or before ts
//! ├── embeddings/<ns>.aemb binary records (memory-mapped on restore)
//! └── trees/<ns>.tree      packed index, current-state snapshots only
//! ```
//!
//! Data files must match their checksums or the restore fails. A damaged tree
//! is only a fault: the index is rebuilt from the restored records.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use atlas_core::{
    project, AtomId, EmbeddingRow, EmbeddingStore, EmbeddingWriter, LandmarkSet,
    LandmarkSetRecord, NamespaceId, SpatialTree,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::atlas::Atlas;
use super::atoms::AtomSnapshot;
use super::clock::{Clock, SystemClock, Timestamp};
use super::config::EngineConfig;
use super::embeddings::{EmbeddingId, EmbeddingVersion, Namespace};
use super::faults::Fault;
use super::relations::AtomRelation;

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFileEntry {
    pub file: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotNamespaceEntry {
    pub namespace: NamespaceId,
    pub dim: usize,
    pub axes: usize,
    pub landmark_version: u32,
    pub rows: u32,
    pub embeddings: SnapshotFileEntry,
    pub tree: Option<SnapshotFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_id: String,
    pub format_version: u32,
    pub as_of: Timestamp,
    pub current_state: bool,
    pub next_atom_id: u64,
    pub next_relation_id: u64,
    pub next_embedding_id: u64,
    pub atoms: SnapshotFileEntry,
    pub relations: SnapshotFileEntry,
    pub landmarks: SnapshotFileEntry,
    pub namespaces: Vec<SnapshotNamespaceEntry>,
}

#[derive(Debug, Clone)]
pub struct SnapshotResult {
    pub snapshot_id: String,
    pub snapshot_dir: PathBuf,
    pub as_of: Timestamp,
    pub atoms: usize,
    pub embeddings: usize,
    pub relations: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct AtomEntry {
    atom: AtomSnapshot,
    valid_from: Timestamp,
}

#[derive(Debug, Serialize, Deserialize)]
struct RelationEntry {
    relation: AtomRelation,
    valid_from: Timestamp,
}

#[derive(Debug, Serialize, Deserialize)]
struct LandmarkEntry {
    active_from: Timestamp,
    record: LandmarkSetRecord,
}

/// Writes the state as of `as_of` (or now) under the snapshots directory.
pub fn create_snapshot(atlas: &Atlas, as_of: Option<Timestamp>) -> Result<SnapshotResult> {
    let current_state = as_of.is_none();
    let ts = as_of.unwrap_or_else(|| atlas.clock.now());
    if ts > atlas.clock.now() {
        return Err(anyhow!("snapshot timestamp {} is in the future", ts));
    }

    let snapshot_id = make_snapshot_id(ts);
    let snapshot_dir = atlas.config.snapshots_dir.join(&snapshot_id);
    std::fs::create_dir_all(snapshot_dir.join("embeddings"))?;
    if current_state {
        std::fs::create_dir_all(snapshot_dir.join("trees"))?;
    }

    let atoms: Vec<AtomEntry> = atlas
        .atoms
        .snapshot_as_of(ts)
        .into_iter()
        .map(|(atom, interval)| AtomEntry {
            atom,
            valid_from: interval.valid_from,
        })
        .collect();
    let atoms_file = write_json(&snapshot_dir, "atoms.json", &atoms)?;

    let relations: Vec<RelationEntry> = atlas
        .relations
        .all_as_of(ts)
        .into_iter()
        .map(|(_, interval)| RelationEntry {
            relation: interval.value,
            valid_from: interval.valid_from,
        })
        .collect();
    let relations_file = write_json(&snapshot_dir, "relations.json", &relations)?;

    let mut landmarks = Vec::new();
    let mut namespaces = Vec::new();
    let mut embeddings = 0usize;
    for ns in atlas.registry.all() {
        let Some(active) = ns.landmarks_as_of(ts) else {
            continue;
        };
        landmarks.extend(
            ns.landmark_versions()
                .into_iter()
                .filter(|(from, _)| *from <= ts)
                .map(|(active_from, set)| LandmarkEntry {
                    active_from,
                    record: set.to_record(),
                }),
        );
        let entry = write_namespace(&snapshot_dir, &ns, &active, ts, current_state)
            .with_context(|| format!("writing {} to snapshot {}", ns.id(), snapshot_id))?;
        embeddings += entry.rows as usize;
        namespaces.push(entry);
    }
    let landmarks_file = write_json(&snapshot_dir, "landmarks.json", &landmarks)?;

    let manifest = SnapshotManifest {
        snapshot_id: snapshot_id.clone(),
        format_version: SNAPSHOT_FORMAT_VERSION,
        as_of: ts,
        current_state,
        next_atom_id: atlas.atoms.next_id(),
        next_relation_id: atlas.relations.next_id(),
        next_embedding_id: atlas.registry.next_embedding_id(),
        atoms: atoms_file,
        relations: relations_file,
        landmarks: landmarks_file,
        namespaces,
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?.as_bytes())?;
    sync_file(&manifest_path)?;
    sync_dir(&snapshot_dir)?;

    tracing::info!(
        "snapshot {} at {}: {} atoms, {} embeddings, {} relations",
        snapshot_id,
        ts,
        atoms.len(),
        embeddings,
        relations.len()
    );
    Ok(SnapshotResult {
        snapshot_id,
        snapshot_dir,
        as_of: ts,
        atoms: atoms.len(),
        embeddings,
        relations: relations.len(),
    })
}

fn write_namespace(
    snapshot_dir: &Path,
    ns: &Namespace,
    active: &LandmarkSet,
    ts: Timestamp,
    current_state: bool,
) -> Result<SnapshotNamespaceEntry> {
    let name = format!("embeddings/{}.aemb", ns.id().0);
    let path = snapshot_dir.join(&name);
    let mut writer =
        EmbeddingWriter::new(&path, ns.dim(), ns.axes(), ns.id().0, active.version())?;
    for (atom, interval) in ns.records_as_of(ts) {
        let rec = &interval.value;
        // Records written before a migration cutover carry the old projection.
        let (coord, key) = if rec.landmark_version == active.version() {
            (rec.coord, rec.key)
        } else {
            let coord = project(&rec.vector, active)?;
            (coord, atlas_core::hilbert::hilbert_key(&coord, active.frame()))
        };
        writer.write_row(&EmbeddingRow {
            atom,
            tenant: rec.tenant,
            valid_from: interval.valid_from,
            valid_to: None,
            key,
            coord,
            vector: &rec.vector,
        })?;
    }
    let rows = writer.finish()?;
    let embeddings = file_entry(snapshot_dir, &name)?;

    let tree = if current_state && ns.landmark_version() == active.version() {
        let plan = ns.index().prepare_rebuild()?;
        let name = format!("trees/{}.tree", ns.id().0);
        plan.tree.save(snapshot_dir.join(&name))?;
        Some(file_entry(snapshot_dir, &name)?)
    } else {
        None
    };

    Ok(SnapshotNamespaceEntry {
        namespace: ns.id(),
        dim: ns.dim(),
        axes: ns.axes(),
        landmark_version: active.version(),
        rows,
        embeddings,
        tree,
    })
}

/// Opens an engine over the state stored in `snapshot_dir`.
pub fn restore_snapshot(config: EngineConfig, snapshot_dir: &Path) -> Result<Arc<Atlas>> {
    restore_snapshot_with_clock(config, snapshot_dir, Arc::new(SystemClock::new()))
}

pub fn restore_snapshot_with_clock(
    config: EngineConfig,
    snapshot_dir: &Path,
    clock: Arc<dyn Clock>,
) -> Result<Arc<Atlas>> {
    let manifest_path = snapshot_dir.join("manifest.json");
    let manifest: SnapshotManifest = serde_json::from_slice(
        &std::fs::read(&manifest_path)
            .with_context(|| format!("reading snapshot manifest {:?}", manifest_path))?,
    )
    .with_context(|| format!("parsing snapshot manifest {:?}", manifest_path))?;
    if manifest.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(anyhow!(
            "unsupported snapshot format version {}",
            manifest.format_version
        ));
    }
    for entry in [&manifest.atoms, &manifest.relations, &manifest.landmarks]
        .into_iter()
        .chain(manifest.namespaces.iter().map(|ns| &ns.embeddings))
    {
        verify_file(snapshot_dir, entry)?;
    }

    let atlas = Atlas::with_clock(config, clock)?;

    let atoms: Vec<AtomEntry> = read_json(snapshot_dir, &manifest.atoms)?;
    for entry in atoms {
        atlas.atoms.restore(entry.atom, entry.valid_from);
    }
    atlas.atoms.advance_next_id(manifest.next_atom_id);

    let landmarks: Vec<LandmarkEntry> = read_json(snapshot_dir, &manifest.landmarks)?;
    let mut versions: BTreeMap<NamespaceId, Vec<(Timestamp, LandmarkSet)>> = BTreeMap::new();
    for entry in landmarks {
        let ns = entry.record.namespace;
        let set = LandmarkSet::from_record(entry.record)
            .with_context(|| format!("restoring landmark set for {}", ns))?;
        versions.entry(ns).or_default().push((entry.active_from, set));
    }
    atlas.registry.advance_embedding_ids(manifest.next_embedding_id);

    for ns_entry in &manifest.namespaces {
        let mut ns_versions = versions.remove(&ns_entry.namespace).ok_or_else(|| {
            anyhow!("snapshot has no landmark set for {}", ns_entry.namespace)
        })?;
        ns_versions.sort_by_key(|(from, _)| *from);
        let ns = atlas.registry.restore(ns_versions)?;
        if ns.landmark_version() != ns_entry.landmark_version {
            return Err(anyhow!(
                "{} embeddings were written with landmark v{}, latest restored is v{}",
                ns.id(),
                ns_entry.landmark_version,
                ns.landmark_version()
            ));
        }
        restore_namespace(&atlas, snapshot_dir, &ns, ns_entry)
            .with_context(|| format!("restoring {}", ns_entry.namespace))?;
    }

    let relations: Vec<RelationEntry> = read_json(snapshot_dir, &manifest.relations)?;
    for entry in relations {
        atlas.relations.restore(entry.relation, entry.valid_from);
    }
    atlas.relations.advance_next_id(manifest.next_relation_id);

    tracing::info!(
        "restored snapshot {} ({} atoms, {} namespaces)",
        manifest.snapshot_id,
        atlas.atoms.len(),
        manifest.namespaces.len()
    );
    Ok(atlas)
}

fn restore_namespace(
    atlas: &Atlas,
    snapshot_dir: &Path,
    ns: &Namespace,
    entry: &SnapshotNamespaceEntry,
) -> Result<()> {
    let store = EmbeddingStore::open(snapshot_dir.join(&entry.embeddings.file))?;
    if store.dim() != ns.dim() || store.axes() != ns.axes() {
        return Err(anyhow!(
            "embedding file shape {}x{} does not match namespace {}x{}",
            store.dim(),
            store.axes(),
            ns.dim(),
            ns.axes()
        ));
    }
    let mut restored: BTreeSet<AtomId> = BTreeSet::new();
    let mut ids = atlas.registry.next_embedding_id();
    for row in store.iter() {
        let row = row?;
        if atlas.atoms.get(row.atom).is_none() {
            tracing::warn!("skipping embedding of {}: atom not in snapshot", row.atom);
            continue;
        }
        ns.restore_record(
            row.atom,
            row.valid_from,
            EmbeddingVersion {
                embedding_id: EmbeddingId(ids),
                tenant: row.tenant,
                landmark_version: store.header.landmark_version,
                coord: row.coord,
                key: row.key,
                vector: Arc::from(row.vector),
            },
        );
        ids += 1;
        restored.insert(row.atom);
    }
    atlas.registry.advance_embedding_ids(ids);

    let index = ns.index();
    if let Some(tree) = entry
        .tree
        .as_ref()
        .and_then(|tree| load_tree(atlas, snapshot_dir, ns, tree))
    {
        let same_atoms = tree.len() == restored.len()
            && tree.entries().iter().all(|e| restored.contains(&e.atom));
        if same_atoms {
            index.install_tree(tree)?;
            return Ok(());
        }
        tracing::warn!(
            "persisted {} tree holds a different atom set; rebuilding",
            ns.id()
        );
    }

    for (atom, rec) in ns.current_records() {
        index.insert(atom, rec.tenant, rec.coord)?;
    }
    index.rebuild()?;
    Ok(())
}

/// Loads and verifies a persisted tree, reporting a fault instead of failing.
fn load_tree(
    atlas: &Atlas,
    snapshot_dir: &Path,
    ns: &Namespace,
    entry: &SnapshotFileEntry,
) -> Option<SpatialTree> {
    if let Err(err) = verify_file(snapshot_dir, entry) {
        atlas.faults.report(Fault::SnapshotFileRejected {
            file: entry.file.clone(),
            detail: format!("{err:#}"),
            at: atlas.clock.now(),
        });
        return None;
    }
    let tree = match SpatialTree::load(snapshot_dir.join(&entry.file)) {
        Ok(tree) => tree,
        Err(err) => {
            atlas.faults.report(Fault::SnapshotFileRejected {
                file: entry.file.clone(),
                detail: err.to_string(),
                at: atlas.clock.now(),
            });
            return None;
        }
    };
    if let Err(err) = tree.verify() {
        atlas.faults.report(Fault::IndexCorruption {
            namespace: ns.id(),
            detail: format!("persisted tree {}: {}", entry.file, err),
            at: atlas.clock.now(),
        });
        return None;
    }
    if tree.axes() != ns.axes() {
        return None;
    }
    Some(tree)
}

fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<SnapshotFileEntry> {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_vec_pretty(value)?)
        .with_context(|| format!("writing {:?}", path))?;
    sync_file(&path)?;
    file_entry(dir, name)
}

fn read_json<T: for<'de> Deserialize<'de>>(dir: &Path, entry: &SnapshotFileEntry) -> Result<T> {
    let path = dir.join(&entry.file);
    serde_json::from_slice(&std::fs::read(&path)?).with_context(|| format!("parsing {:?}", path))
}

fn file_entry(dir: &Path, name: &str) -> Result<SnapshotFileEntry> {
    let path = dir.join(name);
    Ok(SnapshotFileEntry {
        file: name.to_string(),
        size_bytes: std::fs::metadata(&path)?.len(),
        sha256: sha256_file(&path)?,
    })
}

fn verify_file(dir: &Path, entry: &SnapshotFileEntry) -> Result<()> {
    let path = dir.join(&entry.file);
    if !path.exists() {
        return Err(anyhow!("snapshot file missing: {:?}", path));
    }
    let actual = sha256_file(&path)?;
    if actual != entry.sha256 {
        return Err(anyhow!(
            "checksum mismatch for {:?}: expected {}, got {}",
            path,
            entry.sha256,
            actual
        ));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_string(&hasher.finalize()))
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn sync_file(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

fn sync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()?;
    }
    Ok(())
}

fn make_snapshot_id(ts: Timestamp) -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("snap_{}_{}", ts, hex_string(&bytes))
}
