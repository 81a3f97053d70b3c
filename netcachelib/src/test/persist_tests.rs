use std::fs;
use crate::cache::CacheStore;
use crate::config::Mode;
use crate::error::Error;
use crate::persist::{
    load_nearest_color_table, load_snapshot, save_snapshot, snapshot_path, write_atomic, CacheSnapshot, NEAREST_COLOR_FILE,
};
use crate::simulator::{NetworkSimulator, Phase, PersistenceStatus};
use crate::test::fixtures::{options, tree_network};

fn warmed_with_snapshots(kind: &str, mode: Mode, dir: &std::path::Path) -> NetworkSimulator {
    let mut opts = options(mode);
    opts.snapshot_dir = Some(dir.to_path_buf());
    opts.colors = Some(vec![1, 2]);
    let mut simulator = NetworkSimulator::new(&tree_network(kind), opts).unwrap();
    let capacities = simulator.topology().default_capacities();
    simulator.reconfig(&capacities, 3).unwrap();
    simulator
}

#[test]
fn warm_up_writes_a_snapshot_that_reads_back_equal() {
    let dir = tempfile::tempdir().unwrap();
    let simulator = warmed_with_snapshots("LFU", Mode::NoColor, dir.path());
    let path = snapshot_path(dir.path(), 3);
    assert!(path.ends_with("cache-snapshot-3.json"));
    assert!(path.exists());
    let loaded = load_snapshot(dir.path(), 3).unwrap();
    assert_eq!(loaded, simulator.snapshot());
    assert_eq!(loaded.caches.len(), 4);
    assert!(loaded.caches.values().any(|c| c.size() > 0));
}

#[test]
fn no_temporary_file_is_left_behind() {
    let dir = tempfile::tempdir().unwrap();
    warmed_with_snapshots("LRU", Mode::NoColor, dir.path());
    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["cache-snapshot-3.json".to_string()]);
}

#[test]
fn restored_snapshot_serves_the_same_hits() {
    let dir = tempfile::tempdir().unwrap();
    let original = warmed_with_snapshots("FIFO", Mode::NoColor, dir.path());
    let mut restored = NetworkSimulator::new(&tree_network("FIFO"), options(Mode::NoColor)).unwrap();
    restored.restore(load_snapshot(dir.path(), 3).unwrap()).unwrap();
    assert_eq!(restored.phase(), Phase::Ready);
    assert_eq!(restored.snapshot(), original.snapshot());
}

#[test]
fn restore_rejects_foreign_snapshots() {
    let mut simulator = NetworkSimulator::new(&tree_network("LRU"), options(Mode::NoColor)).unwrap();
    let mut snapshot = CacheSnapshot::default();
    assert!(matches!(simulator.restore(snapshot.clone()), Err(Error::Configuration(_))));
    let lru = crate::cache::GenericCache::new(crate::config::CacheTypeConfig::LeastRecentlyUsed, 4, None).unwrap();
    snapshot.caches.insert("agg".to_string(), lru);
    assert!(matches!(simulator.restore(snapshot), Err(Error::Configuration(_))));
    assert_eq!(simulator.phase(), Phase::Built);
}

#[test]
fn hybrid_snapshot_keeps_colors() {
    let dir = tempfile::tempdir().unwrap();
    let simulator = warmed_with_snapshots("Hybrid", Mode::Colored("hybrid".to_string()), dir.path());
    let table = load_nearest_color_table(dir.path()).unwrap();
    assert_eq!(Some(&table), simulator.nearest_color_table());
    assert!(dir.path().join(NEAREST_COLOR_FILE).exists());
    // The colored modes skip shortest-path warm-up, so no cache snapshot is written
    assert!(!snapshot_path(dir.path(), 3).exists());

    let path = dir.path().join("hybrid.json");
    write_atomic(&path, &simulator.snapshot()).unwrap();
    let reloaded: CacheSnapshot = crate::persist::read(&path).unwrap();
    let colors: Vec<_> = reloaded.caches.values().map(|c| c.as_hybrid().unwrap().color()).collect();
    assert!(colors.iter().all(Option::is_some));
    assert_eq!(reloaded, simulator.snapshot());
}

#[test]
fn unwritable_directory_degrades_to_a_failed_status() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist");
    let mut opts = options(Mode::NoColor);
    opts.snapshot_dir = Some(missing.clone());
    let mut simulator = NetworkSimulator::new(&tree_network("LRU"), opts).unwrap();
    let capacities = simulator.topology().default_capacities();
    let report = simulator.reconfig(&capacities, 0).unwrap();
    assert!(matches!(report.persistence, PersistenceStatus::Failed(_)));
    assert_eq!(simulator.phase(), Phase::Ready);
    assert!(report.requests > 0);
    assert!(!missing.exists());
}

#[test]
fn persistence_errors_name_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");
    match save_snapshot(&missing, &CacheSnapshot::default()) {
        Err(Error::Persistence { path, .. }) => assert_eq!(path, snapshot_path(&missing, 0)),
        other => panic!("expected a persistence error, got {other:?}"),
    }
    assert!(matches!(load_snapshot(dir.path(), 7), Err(Error::Persistence { .. })));
    fs::write(snapshot_path(dir.path(), 8), "{ not json").unwrap();
    assert!(matches!(load_snapshot(dir.path(), 8), Err(Error::Persistence { .. })));
}
