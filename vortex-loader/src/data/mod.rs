//! Data loading pipeline
//!
//! Shard catalog, shard decoding and the prefetching shard window.

pub mod catalog;
pub mod dataset;
pub mod loader;
pub mod ring_buffer;
pub mod shard;
pub mod tensor;

pub use catalog::{Partition, ShardCatalog, ShardEntry};
pub use dataset::{DataSet, RandomDataSet, Sample};
pub use loader::{DataLoader, DataLoaderConfig, SingleDataLoader, TrainingDataSource};
pub use ring_buffer::{Generation, ShardRingBuffer};
pub use shard::{encode_sample, encode_shard, write_shard, FeatureIndex, SampleDecoder, ShardWriter};
pub use tensor::{DataType, TensorRecord};
