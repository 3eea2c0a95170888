//! Unit tests for shard catalog listing and partitioning
//!
//! Tests file filtering, deterministic ordering, and rank partitions.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use vortex_loader::data::catalog::partition_indices;
use vortex_loader::data::{Partition, ShardCatalog};
use vortex_loader::LoaderError;

fn touch(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"").unwrap();
    path
}

#[test]
fn test_lists_only_visible_regular_shard_files() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "b.pb");
    touch(dir.path(), "a.pb");
    touch(dir.path(), ".hidden.pb");
    touch(dir.path(), "notes.txt");
    touch(dir.path(), "pb");
    fs::create_dir(dir.path().join("nested.pb")).unwrap();

    let catalog = ShardCatalog::from_dir(dir.path(), "pb", Partition::single()).unwrap();
    let names: Vec<String> = catalog
        .iter()
        .map(|e| e.path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();

    assert_eq!(names, vec!["a.pb", "b.pb"]);
    assert_eq!(catalog.get(0).unwrap().index, 0);
    assert_eq!(catalog.get(1).unwrap().path, dir.path().join("b.pb"));
}

#[cfg(unix)]
#[test]
fn test_symlinks_follow_target_type() {
    let dir = tempfile::tempdir().unwrap();
    let target = touch(dir.path(), "real.pb");
    std::os::unix::fs::symlink(&target, dir.path().join("link.pb")).unwrap();
    std::os::unix::fs::symlink(dir.path().join("missing.pb"), dir.path().join("dangling.pb"))
        .unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    std::os::unix::fs::symlink(dir.path().join("sub"), dir.path().join("dirlink.pb")).unwrap();

    let catalog = ShardCatalog::from_dir(dir.path(), "pb", Partition::single()).unwrap();
    assert_eq!(
        catalog.paths(),
        vec![dir.path().join("link.pb"), dir.path().join("real.pb")]
    );
}

#[test]
fn test_custom_extension() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "a.pb");
    touch(dir.path(), "a.shard");

    let catalog = ShardCatalog::from_dir(dir.path(), "shard", Partition::single()).unwrap();
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog.paths(), vec![dir.path().join("a.shard")]);
}

#[test]
fn test_empty_directory_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "readme.md");

    let err = ShardCatalog::from_dir(dir.path(), "pb", Partition::single()).unwrap_err();
    assert!(matches!(err, LoaderError::InvalidArgument { .. }));
}

#[test]
fn test_missing_directory_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err =
        ShardCatalog::from_dir(&dir.path().join("nope"), "pb", Partition::single()).unwrap_err();
    assert!(matches!(err, LoaderError::Io { .. }));
}

#[test]
fn test_rank_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..4 {
        touch(dir.path(), &format!("shard_{:03}.pb", i));
    }

    let err = ShardCatalog::from_dir(dir.path(), "pb", Partition::new(4, 4)).unwrap_err();
    assert!(matches!(err, LoaderError::InvalidArgument { .. }));
}

#[test]
fn test_partition_round_robin() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..10 {
        touch(dir.path(), &format!("shard_{:03}.pb", i));
    }

    let rank1 = ShardCatalog::from_dir(dir.path(), "pb", Partition::new(1, 3)).unwrap();
    let names: Vec<String> = rank1
        .iter()
        .map(|e| e.path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["shard_001.pb", "shard_004.pb", "shard_007.pb"]);
    // catalog indices are local to the rank
    assert_eq!(rank1.get(2).unwrap().index, 2);
}

#[test]
fn test_partitions_cover_catalog_exactly_once() {
    let paths: Vec<PathBuf> = (0..23)
        .map(|i| PathBuf::from(format!("/data/s{:02}.pb", i)))
        .collect();

    for world_size in 1..=8 {
        let mut seen = Vec::new();
        for world_rank in 0..world_size {
            let partition = Partition::new(world_rank, world_size);
            match ShardCatalog::from_paths(paths.clone(), partition) {
                Ok(catalog) => seen.extend(catalog.paths()),
                // only possible when a rank owns nothing
                Err(_) => assert!(partition_indices(paths.len(), partition).unwrap().is_empty()),
            }
        }

        assert_eq!(seen.len(), paths.len(), "world_size {}", world_size);
        let unique: BTreeSet<_> = seen.into_iter().collect();
        let expected: BTreeSet<_> = paths.iter().cloned().collect();
        assert_eq!(unique, expected, "world_size {}", world_size);
    }
}

#[test]
fn test_order_independent_of_input_order() {
    let mut paths: Vec<PathBuf> = (0..12)
        .map(|i| PathBuf::from(format!("/data/s{:02}.pb", i)))
        .collect();
    let a = ShardCatalog::from_paths(paths.clone(), Partition::new(2, 4)).unwrap();
    paths.reverse();
    let b = ShardCatalog::from_paths(paths, Partition::new(2, 4)).unwrap();

    assert_eq!(a.paths(), b.paths());
}
