//! Vortex Loader - sharded training-data loading
//!
//! This crate feeds a training loop from a directory of shard files:
//! - Deterministic shard ordering and data-parallel partitioning
//! - Decoding of length-prefixed tensor records
//! - A bounded prefetch window filled and drained on background runtimes

pub mod data;
pub mod error;
pub mod metrics;
pub mod runtime;

pub use data::{DataLoader, DataLoaderConfig, DataSet, TrainingDataSource};
pub use error::{LoaderError, Result};
pub use runtime::LoaderRuntime;

/// Default prefetch window (shards kept decoded at and ahead of the cursor)
pub const DEFAULT_PREFETCH_WINDOW: usize = 2;
