//! Background runtime for shard loading
//!
//! Dual Tokio runtimes: one for file I/O, one for decoding.

pub mod executor;
pub mod shutdown;

pub use executor::{LoaderRuntime, RuntimeConfig};
pub use shutdown::ShutdownSignal;
