//! Prefetching shard loader
//!
//! Keeps a window of `W` decoded shards resident around the training
//! cursor. Every advance schedules one background task that decodes the
//! shard entering the window, publishes it, and only then evicts the shard
//! that left. Reads and decodes run concurrently, but tasks publish and
//! evict in scheduling order, so the window never drops below `W` resident
//! shards once primed and peaks at `W + 1`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::catalog::{Partition, ShardCatalog, DEFAULT_SHARD_EXTENSION};
use super::dataset::DataSet;
use super::ring_buffer::{Generation, ShardRingBuffer};
use super::shard::{read_shard, FeatureIndex, SampleDecoder};
use crate::error::{LoaderError, Result};
use crate::metrics::standard;
use crate::runtime::{LoaderRuntime, ShutdownSignal};
use crate::DEFAULT_PREFETCH_WINDOW;

/// Configuration for the data loader
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataLoaderConfig {
    /// External feature name (as written in shard files) → model input name
    pub input_name_map: BTreeMap<String, String>,
    /// Directory holding the shard files
    pub data_dir: PathBuf,
    /// Shard file extension, without the dot
    pub extension: String,
    /// Prefetch window `W`: shards kept decoded at and ahead of the cursor
    pub max_num_files_preload: usize,
    /// This worker's rank in the data-parallel group
    pub world_rank: usize,
    /// Size of the data-parallel group
    pub world_size: usize,
    /// Extra attempts for shards that fail with an I/O error (0 = none)
    pub load_retries: u32,
    /// Base delay for retry backoff, doubled per attempt
    pub retry_backoff_ms: u64,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            input_name_map: BTreeMap::new(),
            data_dir: PathBuf::new(),
            extension: DEFAULT_SHARD_EXTENSION.to_string(),
            max_num_files_preload: DEFAULT_PREFETCH_WINDOW,
            world_rank: 0,
            world_size: 1,
            load_retries: 0,
            retry_backoff_ms: 100,
        }
    }
}

impl DataLoaderConfig {
    /// Config for `data_dir` with the given feature mapping
    pub fn new(data_dir: impl Into<PathBuf>, input_name_map: BTreeMap<String, String>) -> Self {
        Self {
            input_name_map,
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.world_rank, self.world_size)
    }
}

/// Interface the training loop consumes data through
pub trait TrainingDataSource: Send {
    /// Start loading ahead of the first request
    fn initial_preload(&mut self) -> Result<()>;

    /// Shard at the cursor
    fn current_data_set(&self) -> Result<Arc<DataSet>>;

    /// Advance the cursor and return the new current shard
    fn move_to_next_data_set(&mut self) -> Result<Arc<DataSet>>;

    fn num_shards(&self) -> usize;

    /// Model input names, in feature slot order
    fn input_tensor_names(&self) -> &[String];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoaderState {
    Uninitialized,
    Steady,
}

/// State shared with background load tasks
struct LoadContext {
    catalog: ShardCatalog,
    decoder: SampleDecoder,
    buffer: ShardRingBuffer,
    compute: Handle,
    shutdown: ShutdownSignal,
    /// Set from scheduling until the task's `set`
    in_flight: Vec<AtomicBool>,
    overlapping_loads: AtomicU64,
    load_retries: u32,
    retry_backoff: Duration,
}

impl LoadContext {
    /// Read and decode shard `index`, retrying I/O failures
    async fn load_with_retry(&self, index: usize) -> Result<DataSet> {
        let mut attempt = 0;
        loop {
            match self.load(index).await {
                Ok(data_set) => return Ok(data_set),
                Err(e) if e.is_retryable() && attempt < self.load_retries => {
                    let delay = self.retry_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        "Attempt {}/{} failed for shard {}: {}",
                        attempt,
                        self.load_retries + 1,
                        index,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load(&self, index: usize) -> Result<DataSet> {
        let entry = self.catalog.get(index).ok_or(LoaderError::ShardIndexOutOfRange {
            index,
            num_shards: self.catalog.len(),
        })?;

        let start = Instant::now();
        let bytes = read_shard(&entry.path).await?;
        let num_bytes = bytes.len();
        standard::BYTES_READ.inc_by(num_bytes as u64);

        let decoder = self.decoder.clone();
        let data_set = self
            .compute
            .spawn(async move { decoder.decode(bytes) })
            .await
            .map_err(|e| LoaderError::Internal {
                message: format!("decode task for shard {} failed: {}", index, e),
            })??;

        standard::SHARD_LOAD_DURATION.observe_duration(start.elapsed());
        standard::SAMPLES_DECODED.inc_by(data_set.num_samples() as u64);
        debug!(
            "Loaded shard {} from {:?} ({} bytes, {} samples)",
            index,
            entry.path,
            num_bytes,
            data_set.num_samples()
        );
        Ok(data_set)
    }
}

/// Ordering link between consecutive load tasks
struct PublishTurn {
    /// Resolves when the previously scheduled task has published
    previous: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
}

/// Background task: load `index`, publish it, then evict `evict`
async fn load_and_evict(
    ctx: Arc<LoadContext>,
    index: usize,
    generation: Generation,
    evict: Option<(usize, Generation)>,
    turn: PublishTurn,
) {
    let result = tokio::select! {
        _ = ctx.shutdown.wait() => {
            debug!("Shutdown before shard {} finished loading", index);
            return;
        }
        result = ctx.load_with_retry(index) => result,
    };

    let data = match result {
        Ok(data_set) => {
            standard::SHARDS_LOADED.inc();
            Some(Arc::new(data_set))
        }
        Err(e) => {
            standard::SHARD_LOAD_FAILURES.inc();
            warn!("Fail to load shard {}, serving it empty: {}", index, e);
            None
        }
    };

    // a predecessor that bailed out on shutdown drops its sender, which also resolves this
    if let Some(previous) = turn.previous {
        let _ = previous.await;
    }

    ctx.in_flight[index].store(false, Ordering::Release);
    ctx.buffer.set(index, generation, data);

    if let Some((evict_index, evict_generation)) = evict {
        if ctx.buffer.remove(evict_index, evict_generation) {
            standard::SHARDS_EVICTED.inc();
            debug!("Evicted shard {}", evict_index);
        }
    }

    standard::RESIDENT_SHARDS.set(ctx.buffer.resident_count() as i64);
    let _ = turn.done.send(());
}

/// Sharded, prefetching data loader
///
/// Single consumer: the training thread owns the loader and is the only
/// caller. All file I/O and decoding happens on the [`LoaderRuntime`],
/// which the loader borrows, so the runtime cannot be shut down while a
/// loader can still schedule work on it:
///
/// ```compile_fail
/// use vortex_loader::runtime::RuntimeConfig;
/// use vortex_loader::{DataLoader, DataLoaderConfig, LoaderRuntime};
///
/// let runtime = LoaderRuntime::new(RuntimeConfig::default()).unwrap();
/// let mut loader = DataLoader::new(&runtime, DataLoaderConfig::default()).unwrap();
/// runtime.shutdown();
/// let _ = loader.advance_and_get_current();
/// ```
pub struct DataLoader<'rt> {
    ctx: Arc<LoadContext>,
    runtime: &'rt LoaderRuntime,
    state: LoaderState,
    active_index: usize,
    /// Effective window, `min(W, num_shards)`
    window: usize,
    next_generation: Generation,
    /// Generation of the most recent load scheduled per shard
    generations: Vec<Generation>,
    tasks: Vec<JoinHandle<()>>,
    /// Publish signal of the most recently scheduled task
    last_published: Option<oneshot::Receiver<()>>,
    epoch: u64,
}

impl<'rt> DataLoader<'rt> {
    /// Build the catalog for `config.data_dir` and prepare the window
    ///
    /// Configuration errors (bad rank/size, empty catalog, zero window)
    /// are returned here; nothing is loaded until priming.
    pub fn new(runtime: &'rt LoaderRuntime, config: DataLoaderConfig) -> Result<Self> {
        let catalog =
            ShardCatalog::from_dir(&config.data_dir, &config.extension, config.partition())?;
        Self::with_catalog(runtime, catalog, config)
    }

    /// Use an already built catalog; `data_dir`, `extension` and the
    /// partition fields of `config` are ignored
    pub fn with_catalog(
        runtime: &'rt LoaderRuntime,
        catalog: ShardCatalog,
        config: DataLoaderConfig,
    ) -> Result<Self> {
        if config.max_num_files_preload == 0 {
            return Err(LoaderError::invalid("max_num_files_preload must be >= 1"));
        }
        if config.input_name_map.is_empty() {
            return Err(LoaderError::invalid("input_name_map must not be empty"));
        }

        let num_shards = catalog.len();
        let window = config.max_num_files_preload.min(num_shards);
        if window < config.max_num_files_preload {
            info!(
                "Prefetch window {} exceeds {} shards, keeping the whole catalog resident",
                config.max_num_files_preload, num_shards
            );
        }

        let index = Arc::new(FeatureIndex::new(&config.input_name_map));
        let ctx = LoadContext {
            buffer: ShardRingBuffer::new(num_shards, index.tensor_names()),
            decoder: SampleDecoder::new(index),
            catalog,
            compute: runtime.compute_handle(),
            shutdown: ShutdownSignal::new(),
            in_flight: (0..num_shards).map(|_| AtomicBool::new(false)).collect(),
            overlapping_loads: AtomicU64::new(0),
            load_retries: config.load_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        };

        info!(
            "DataLoader ready: {} shards, window {}, rank {}/{}",
            num_shards, window, config.world_rank, config.world_size
        );

        Ok(Self {
            ctx: Arc::new(ctx),
            runtime,
            state: LoaderState::Uninitialized,
            active_index: 0,
            window,
            next_generation: 0,
            generations: vec![0; num_shards],
            tasks: Vec::new(),
            last_published: None,
            epoch: 0,
        })
    }

    /// Schedule loads for the first `min(W, num_shards)` shards
    ///
    /// Returns immediately; the first read may still block until its
    /// shard lands.
    pub fn initial_preload_async(&mut self) -> Result<()> {
        if self.state != LoaderState::Uninitialized {
            return Err(LoaderError::invalid("initial preload already issued"));
        }
        for index in 0..self.window {
            self.schedule_load(index, None);
        }
        self.state = LoaderState::Steady;
        Ok(())
    }

    /// Hand out the shard at the cursor, then advance
    ///
    /// The returned handle stays valid even though the shard is scheduled
    /// for eviction by this call.
    pub fn advance_and_get_current(&mut self) -> Result<Arc<DataSet>> {
        self.ensure_primed()?;
        let current = self.current_data_set()?;
        self.advance();
        Ok(current)
    }

    /// Advance, then return the shard at the new cursor position
    pub fn move_to_next_data_set(&mut self) -> Result<Arc<DataSet>> {
        self.ensure_primed()?;
        self.advance();
        self.current_data_set()
    }

    /// Block until the shard at the cursor is available
    pub fn current_data_set(&self) -> Result<Arc<DataSet>> {
        if self.state == LoaderState::Uninitialized {
            return Err(LoaderError::invalid("current_data_set called before initial preload"));
        }
        let _wait = standard::CONSUMER_WAIT_DURATION.start_timer();
        self.ctx.buffer.get(self.active_index)
    }

    fn ensure_primed(&mut self) -> Result<()> {
        if self.state == LoaderState::Uninitialized {
            self.initial_preload_async()?;
        }
        Ok(())
    }

    fn advance(&mut self) {
        let num_shards = self.num_shards();
        let index_to_evict = self.active_index;
        self.active_index = (self.active_index + 1) % num_shards;
        if self.active_index == 0 {
            self.epoch += 1;
            standard::CURRENT_EPOCH.set(self.epoch as i64);
            debug!("Starting pass {} over {} shards", self.epoch, num_shards);
        }

        let index_to_load = (self.active_index + self.window - 1) % num_shards;
        // whole catalog resident: the reload replaces the evicted shard in place
        let evict = (index_to_evict != index_to_load)
            .then(|| (index_to_evict, self.generations[index_to_evict]));
        self.schedule_load(index_to_load, evict);
    }

    fn schedule_load(&mut self, index: usize, evict: Option<(usize, Generation)>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.generations[index] = generation;

        if self.ctx.in_flight[index].swap(true, Ordering::AcqRel) {
            self.ctx.overlapping_loads.fetch_add(1, Ordering::Relaxed);
            warn!("Shard {} scheduled while a previous load is in flight", index);
        }

        let (done, published) = oneshot::channel();
        let turn = PublishTurn {
            previous: self.last_published.replace(published),
            done,
        };

        self.tasks.retain(|task| !task.is_finished());
        let task = self
            .runtime
            .spawn_io(load_and_evict(self.ctx.clone(), index, generation, evict, turn));
        self.tasks.push(task);

        debug!(
            "Scheduled load of shard {} (generation {}), evicting {:?}",
            index,
            generation,
            evict.map(|(i, _)| i)
        );
    }

    pub fn num_shards(&self) -> usize {
        self.ctx.catalog.len()
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    /// Effective prefetch window
    pub fn window(&self) -> usize {
        self.window
    }

    /// Completed passes over the catalog
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn catalog(&self) -> &ShardCatalog {
        &self.ctx.catalog
    }

    pub fn input_tensor_names(&self) -> &[String] {
        self.ctx.decoder.feature_index().names()
    }

    /// Shards currently held by the window (including failed markers)
    pub fn resident_count(&self) -> usize {
        self.ctx.buffer.resident_count()
    }

    /// Whether shard `index` is currently held by the window
    pub fn is_resident(&self, index: usize) -> bool {
        self.ctx.buffer.is_populated(index)
    }

    /// Times a shard was scheduled while its previous load was still running
    pub fn overlapping_loads(&self) -> u64 {
        self.ctx.overlapping_loads.load(Ordering::Relaxed)
    }

    /// Background tasks not yet finished
    pub fn pending_tasks(&self) -> usize {
        self.tasks.iter().filter(|task| !task.is_finished()).count()
    }

    /// Wait for every scheduled load and eviction to finish
    ///
    /// Must not be called from inside an async context.
    pub fn wait_idle(&mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        self.runtime.block_on_io(async move {
            for task in tasks {
                let _ = task.await;
            }
        });
    }

    /// Signal observed by this loader's background tasks
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.ctx.shutdown.clone()
    }

    /// Stop background work and wait for outstanding tasks
    ///
    /// In-flight reads are abandoned; the buffer is released only after
    /// every task has returned. Returns how many tasks were still running
    /// when shutdown began.
    pub fn shutdown(mut self) -> usize {
        let pending = self.pending_tasks();
        self.ctx.shutdown.shutdown();
        self.wait_idle();
        debug!(
            "DataLoader shutdown complete after {} passes, drained {} tasks",
            self.epoch, pending
        );
        pending
    }
}

impl Drop for DataLoader<'_> {
    fn drop(&mut self) {
        self.ctx.shutdown.shutdown();
    }
}

impl TrainingDataSource for DataLoader<'_> {
    fn initial_preload(&mut self) -> Result<()> {
        self.initial_preload_async()
    }

    fn current_data_set(&self) -> Result<Arc<DataSet>> {
        DataLoader::current_data_set(self)
    }

    fn move_to_next_data_set(&mut self) -> Result<Arc<DataSet>> {
        DataLoader::move_to_next_data_set(self)
    }

    fn num_shards(&self) -> usize {
        DataLoader::num_shards(self)
    }

    fn input_tensor_names(&self) -> &[String] {
        DataLoader::input_tensor_names(self)
    }
}

/// Serves one in-memory data set forever
///
/// Used for evaluation sets and tests that do not need shard files.
pub struct SingleDataLoader {
    data_set: Arc<DataSet>,
}

impl SingleDataLoader {
    pub fn new(data_set: Arc<DataSet>) -> Self {
        Self { data_set }
    }
}

impl TrainingDataSource for SingleDataLoader {
    fn initial_preload(&mut self) -> Result<()> {
        Ok(())
    }

    fn current_data_set(&self) -> Result<Arc<DataSet>> {
        Ok(self.data_set.clone())
    }

    fn move_to_next_data_set(&mut self) -> Result<Arc<DataSet>> {
        Ok(self.data_set.clone())
    }

    fn num_shards(&self) -> usize {
        1
    }

    fn input_tensor_names(&self) -> &[String] {
        self.data_set.tensor_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::RandomDataSet;
    use crate::data::tensor::DataType;

    #[test]
    fn test_single_loader_serves_same_set() {
        let names = vec!["X".to_string(), "labels".to_string()];
        let data_set = RandomDataSet::new(1)
            .generate(
                1,
                &names,
                &[vec![1, 784], vec![1, 10]],
                &[DataType::Float, DataType::Float],
            )
            .unwrap();

        let mut loader = SingleDataLoader::new(Arc::new(data_set));
        loader.initial_preload().unwrap();
        let a = loader.current_data_set().unwrap();
        let b = loader.move_to_next_data_set().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loader.num_shards(), 1);
        assert_eq!(loader.input_tensor_names(), names.as_slice());
    }

    #[test]
    fn test_config_defaults() {
        let config: DataLoaderConfig =
            serde_json::from_str(r#"{"data_dir": "/data", "input_name_map": {"f": "x"}}"#).unwrap();
        assert_eq!(config.max_num_files_preload, DEFAULT_PREFETCH_WINDOW);
        assert_eq!(config.extension, "pb");
        assert_eq!(config.partition(), Partition::single());
    }
}
