//! Shard scan binary
//!
//! Walks a shard directory through the prefetching loader and reports what
//! each shard decodes to. Useful for validating a corpus before a run.
//!
//! Configuration comes from `VORTEX_LOADER_CONFIG` (a JSON
//! `DataLoaderConfig`) or from individual environment variables.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{error, info, warn};
use vortex_loader::metrics::gather_loader_metrics;
use vortex_loader::runtime::RuntimeConfig;
use vortex_loader::{DataLoader, DataLoaderConfig, LoaderRuntime};

fn env_usize(name: &str, default: usize) -> Result<usize, Box<dyn std::error::Error>> {
    match std::env::var(name) {
        Ok(value) => Ok(value.parse().map_err(|e| format!("{}: {}", name, e))?),
        Err(_) => Ok(default),
    }
}

/// Parse `ext=internal,ext2=internal2`; a bare name maps to itself
fn parse_inputs(spec: &str) -> BTreeMap<String, String> {
    spec.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((external, internal)) => {
                (external.trim().to_string(), internal.trim().to_string())
            }
            None => (item.to_string(), item.to_string()),
        })
        .collect()
}

fn load_config() -> Result<DataLoaderConfig, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("VORTEX_LOADER_CONFIG") {
        let raw = std::fs::read_to_string(&path)?;
        return Ok(serde_json::from_str(&raw)?);
    }

    let data_dir = std::env::var("VORTEX_DATA_DIR").map_err(|_| "VORTEX_DATA_DIR is not set")?;
    let inputs = std::env::var("VORTEX_INPUTS").map_err(|_| "VORTEX_INPUTS is not set")?;

    let window = env_usize("VORTEX_PREFETCH", vortex_loader::DEFAULT_PREFETCH_WINDOW)?;

    Ok(DataLoaderConfig {
        max_num_files_preload: window,
        world_rank: env_usize("VORTEX_WORLD_RANK", 0)?,
        world_size: env_usize("VORTEX_WORLD_SIZE", 1)?,
        ..DataLoaderConfig::new(data_dir, parse_inputs(&inputs))
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = load_config()?;
    let passes = env_usize("VORTEX_PASSES", 1)?;

    info!("Scanning {:?} with inputs {:?}", config.data_dir, config.input_name_map);

    let runtime = LoaderRuntime::new(RuntimeConfig::default())?;
    let mut loader = match DataLoader::new(&runtime, config) {
        Ok(loader) => loader,
        Err(e) => {
            error!("Failed to set up loader: {}", e);
            return Err(e.into());
        }
    };

    loader.initial_preload_async()?;

    let start = Instant::now();
    let mut total_samples = 0usize;
    for _ in 0..passes * loader.num_shards() {
        let index = loader.active_index();
        let data_set = loader.advance_and_get_current()?;
        let path = loader
            .catalog()
            .get(index)
            .map(|entry| entry.path.display().to_string())
            .unwrap_or_default();

        if data_set.is_empty() {
            warn!("Shard {} ({}) has no samples", index, path);
        } else {
            info!("Shard {} ({}): {} samples", index, path, data_set.num_samples());
        }
        total_samples += data_set.num_samples();
    }

    info!(
        "Scanned {} samples in {} passes over {} shards in {:?}",
        total_samples,
        passes,
        loader.num_shards(),
        start.elapsed()
    );

    loader.shutdown();
    runtime.shutdown();

    print!("{}", gather_loader_metrics());
    Ok(())
}
