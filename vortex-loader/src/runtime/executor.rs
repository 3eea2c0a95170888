//! Tokio runtime executor configuration
//!
//! Separates file reads from decoding so a slow disk never starves the
//! decode pool, and neither ever runs on the training thread.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::error::{LoaderError, Result};

/// Configuration for the loader runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of threads for file I/O
    pub io_threads: usize,
    /// Number of threads for decoding
    pub compute_threads: usize,
    /// Grace period for in-flight tasks on shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            io_threads: (cpus / 2).clamp(1, 4),
            compute_threads: (cpus / 2).max(1),
            shutdown_timeout_secs: 30,
        }
    }
}

/// Dual-runtime executor for background shard loading
pub struct LoaderRuntime {
    io_runtime: Runtime,
    compute_runtime: Runtime,
    config: RuntimeConfig,
}

impl LoaderRuntime {
    /// Create a new runtime with the given configuration
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        if config.io_threads == 0 || config.compute_threads == 0 {
            return Err(LoaderError::invalid("runtime thread counts must be >= 1"));
        }

        let io_runtime = Builder::new_multi_thread()
            .worker_threads(config.io_threads)
            .thread_name("vortex-loader-io")
            .enable_all()
            .build()
            .map_err(|e| LoaderError::Internal {
                message: format!("Failed to create I/O runtime: {}", e),
            })?;

        let compute_runtime = Builder::new_multi_thread()
            .worker_threads(config.compute_threads)
            .thread_name("vortex-loader-decode")
            .enable_all()
            .build()
            .map_err(|e| LoaderError::Internal {
                message: format!("Failed to create compute runtime: {}", e),
            })?;

        Ok(Self {
            io_runtime,
            compute_runtime,
            config,
        })
    }

    /// Spawn an I/O-bound task
    pub fn spawn_io<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.io_runtime.spawn(future)
    }

    /// Run a future on the I/O runtime, blocking until complete
    ///
    /// Must not be called from inside an async context.
    pub fn block_on_io<F: Future>(&self, future: F) -> F::Output {
        self.io_runtime.block_on(future)
    }

    /// Handle for spawning decode work from inside I/O tasks
    pub fn compute_handle(&self) -> Handle {
        self.compute_runtime.handle().clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Shut down both runtimes
    pub fn shutdown(self) {
        self.compute_runtime.shutdown_background();
        self.io_runtime
            .shutdown_timeout(Duration::from_secs(self.config.shutdown_timeout_secs));
    }
}
