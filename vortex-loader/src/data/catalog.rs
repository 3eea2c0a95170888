//! Shard catalog
//!
//! Enumerates the shard files of a directory in a fixed order and keeps the
//! ones assigned to this worker. The order is a plain byte-wise sort of the
//! full path, so every worker looking at the same directory sees the same
//! list and the round-robin partition below is disjoint and complete.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LoaderError, Result};

/// Default shard file extension
pub const DEFAULT_SHARD_EXTENSION: &str = "pb";

/// This worker's position in the data-parallel group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub world_rank: usize,
    pub world_size: usize,
}

impl Partition {
    pub fn new(world_rank: usize, world_size: usize) -> Self {
        Self {
            world_rank,
            world_size,
        }
    }

    /// Single worker owning the whole corpus
    pub fn single() -> Self {
        Self::new(0, 1)
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self::single()
    }
}

/// One shard file and its position in catalog order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardEntry {
    pub index: usize,
    pub path: PathBuf,
}

/// Fixed, ordered list of the shard files this worker iterates
#[derive(Debug, Clone)]
pub struct ShardCatalog {
    entries: Vec<ShardEntry>,
}

/// Positions of `len` sorted items owned by `world_rank`
///
/// Round-robin: item `i` belongs to rank `i % world_size`.
pub fn partition_indices(len: usize, partition: Partition) -> Result<Vec<usize>> {
    let Partition {
        world_rank,
        world_size,
    } = partition;

    if world_size == 0 {
        return Err(LoaderError::invalid("world_size must be >= 1"));
    }
    if world_rank >= world_size {
        return Err(LoaderError::invalid(format!(
            "world_rank must be 0~{}, got {}",
            world_size - 1,
            world_rank
        )));
    }

    Ok((0..len).filter(|i| i % world_size == world_rank).collect())
}

impl ShardCatalog {
    /// List `dir` and keep this worker's share of the shard files
    pub fn from_dir(dir: &Path, extension: &str, partition: Partition) -> Result<Self> {
        let paths = list_shard_files(dir, extension)?;
        debug!(
            "Found {} shard files with extension '{}' in {:?}",
            paths.len(),
            extension,
            dir
        );
        Self::from_paths(paths, partition)
    }

    /// Sort and partition an explicit list of shard paths
    pub fn from_paths(mut paths: Vec<PathBuf>, partition: Partition) -> Result<Self> {
        paths.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));

        let owned = partition_indices(paths.len(), partition)?;
        let entries: Vec<ShardEntry> = owned
            .into_iter()
            .enumerate()
            .map(|(index, pos)| ShardEntry {
                index,
                path: paths[pos].clone(),
            })
            .collect();

        if entries.is_empty() {
            return Err(LoaderError::invalid(format!(
                "no shard files assigned to rank {} of {} ({} files total)",
                partition.world_rank,
                partition.world_size,
                paths.len()
            )));
        }

        debug!(
            "Rank {}/{} owns {} of {} shards",
            partition.world_rank,
            partition.world_size,
            entries.len(),
            paths.len()
        );

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false for a constructed catalog
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ShardEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardEntry> {
        self.entries.iter()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }
}

/// Regular, non-hidden files of `dir` with the given extension (unsorted)
fn list_shard_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let listing = std::fs::read_dir(dir).map_err(|e| LoaderError::io(dir, e))?;

    for entry in listing {
        let entry = entry.map_err(|e| LoaderError::io(dir, e))?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != extension) {
            continue;
        }

        // follows symlinks; dangling links and non-regular targets are skipped
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => debug!("Skipping unreadable entry {:?}: {}", path, e),
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_indices() {
        assert_eq!(partition_indices(5, Partition::new(1, 2)).unwrap(), vec![1, 3]);
        assert_eq!(partition_indices(5, Partition::single()).unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(partition_indices(5, Partition::new(2, 2)).is_err());
        assert!(partition_indices(5, Partition::new(0, 0)).is_err());
    }

    #[test]
    fn test_from_paths_sorts_then_partitions() {
        let paths = vec![
            PathBuf::from("/d/c.pb"),
            PathBuf::from("/d/a.pb"),
            PathBuf::from("/d/b.pb"),
        ];
        let catalog = ShardCatalog::from_paths(paths, Partition::new(0, 2)).unwrap();
        assert_eq!(catalog.paths(), vec![PathBuf::from("/d/a.pb"), PathBuf::from("/d/c.pb")]);
        assert_eq!(catalog.get(1).unwrap().index, 1);
    }

    #[test]
    fn test_empty_share_is_rejected() {
        let paths = vec![PathBuf::from("/d/a.pb")];
        let err = ShardCatalog::from_paths(paths, Partition::new(1, 2)).unwrap_err();
        assert!(matches!(err, LoaderError::InvalidArgument { .. }));
    }
}
