//! Shard ring buffer
//!
//! Index-addressed storage for decoded shards. Every shard index has its own
//! lock and condition variable, so a consumer waiting on one shard never
//! contends with loads or evictions of another.
//!
//! Each `set` carries the generation of the load that produced it. `remove`
//! only evicts the generation it was issued for: an eviction that runs late
//! never wipes a newer load of the same index.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::dataset::DataSet;
use crate::error::{LoaderError, Result};

/// Monotonic load sequence number
pub type Generation = u64;

#[derive(Debug)]
enum SlotState {
    Empty,
    Ready(Arc<DataSet>),
    Failed,
}

#[derive(Debug)]
struct SlotInner {
    state: SlotState,
    generation: Generation,
}

#[derive(Debug)]
struct Slot {
    inner: Mutex<SlotInner>,
    ready: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: SlotState::Empty,
                generation: 0,
            }),
            ready: Condvar::new(),
        }
    }
}

/// Concurrent index → decoded shard map with blocking reads
#[derive(Debug)]
pub struct ShardRingBuffer {
    slots: Vec<Slot>,
    /// Served in place of a shard whose load failed
    failed_sentinel: Arc<DataSet>,
    resident: AtomicUsize,
}

impl ShardRingBuffer {
    /// One slot per shard index; `tensor_names` shapes the failure sentinel
    pub fn new(num_shards: usize, tensor_names: Arc<[String]>) -> Self {
        Self {
            slots: (0..num_shards).map(|_| Slot::new()).collect(),
            failed_sentinel: Arc::new(DataSet::new(tensor_names)),
            resident: AtomicUsize::new(0),
        }
    }

    fn slot(&self, index: usize) -> Result<&Slot> {
        self.slots.get(index).ok_or(LoaderError::ShardIndexOutOfRange {
            index,
            num_shards: self.slots.len(),
        })
    }

    /// Store a load result; `None` marks the load as failed
    ///
    /// Returns false if the slot already holds a newer generation.
    pub fn set(&self, index: usize, generation: Generation, data: Option<Arc<DataSet>>) -> bool {
        let slot = match self.slot(index) {
            Ok(slot) => slot,
            Err(e) => {
                warn!("Dropping load result: {}", e);
                return false;
            }
        };

        let mut inner = slot.inner.lock();
        if generation < inner.generation {
            debug!(
                "Ignoring stale load of shard {} (generation {} < {})",
                index, generation, inner.generation
            );
            return false;
        }

        if matches!(inner.state, SlotState::Empty) {
            self.resident.fetch_add(1, Ordering::AcqRel);
        }
        inner.state = match data {
            Some(data) => SlotState::Ready(data),
            None => SlotState::Failed,
        };
        inner.generation = generation;
        drop(inner);

        slot.ready.notify_all();
        true
    }

    /// Block until shard `index` is populated and return a handle to it
    ///
    /// A failed load yields an empty data set.
    pub fn get(&self, index: usize) -> Result<Arc<DataSet>> {
        let slot = self.slot(index)?;
        let mut inner = slot.inner.lock();
        loop {
            if let Some(data) = self.populated(&inner.state) {
                return Ok(data);
            }
            slot.ready.wait(&mut inner);
        }
    }

    /// Like [`get`](Self::get) but gives up after `timeout`
    pub fn get_timeout(&self, index: usize, timeout: Duration) -> Result<Option<Arc<DataSet>>> {
        let slot = self.slot(index)?;
        let deadline = Instant::now() + timeout;
        let mut inner = slot.inner.lock();
        loop {
            if let Some(data) = self.populated(&inner.state) {
                return Ok(Some(data));
            }
            if slot.ready.wait_until(&mut inner, deadline).timed_out() {
                return Ok(self.populated(&inner.state));
            }
        }
    }

    fn populated(&self, state: &SlotState) -> Option<Arc<DataSet>> {
        match state {
            SlotState::Empty => None,
            SlotState::Ready(data) => Some(data.clone()),
            SlotState::Failed => Some(self.failed_sentinel.clone()),
        }
    }

    /// Drop the buffer's reference to shard `index` if it still holds `generation`
    ///
    /// Handles previously returned by `get` stay valid. Returns true if the
    /// slot was cleared.
    pub fn remove(&self, index: usize, generation: Generation) -> bool {
        let slot = match self.slot(index) {
            Ok(slot) => slot,
            Err(e) => {
                warn!("Ignoring eviction: {}", e);
                return false;
            }
        };

        let mut inner = slot.inner.lock();
        if inner.generation > generation || matches!(inner.state, SlotState::Empty) {
            return false;
        }
        let released = std::mem::replace(&mut inner.state, SlotState::Empty);
        self.resident.fetch_sub(1, Ordering::AcqRel);
        drop(inner);

        // freeing a large shard can take a while; keep it out of the lock
        drop(released);
        true
    }

    /// Whether shard `index` currently holds a result
    pub fn is_populated(&self, index: usize) -> bool {
        self.slot(index)
            .map(|slot| !matches!(slot.inner.lock().state, SlotState::Empty))
            .unwrap_or(false)
    }

    /// Number of populated slots
    pub fn resident_count(&self) -> usize {
        self.resident.load(Ordering::Acquire)
    }

    /// Number of addressable shard indices
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
