//! Reusable audio buffer pool.
//!
//! Capture delivers a steady stream of fixed-size sample chunks; allocating
//! a fresh `Vec` per chunk churns the allocator at audio rate. The pool
//! hands out recycled fixed-capacity buffers instead: acquire pops the
//! most-recently-returned buffer (LIFO, warmest cache lines), release wipes
//! and restacks it, and a time-gated cleanup pass drops buffers that have
//! sat idle past a maximum age.
//!
//! Thread-safety: the pool is NOT internally synchronized. Wrap in
//! `Arc<Mutex<>>` if shared across tasks, or use the process-wide
//! [`init_shared_pool`] singleton.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use uuid::Uuid;

/// Pool tunables.
///
/// The resize thresholds are heuristics, not guarantees; hosts with unusual
/// capture cadences should adjust them rather than the pool logic.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on buffers retained by the pool
    pub max_buffers: usize,
    /// Sample capacity of each buffer (e.g. 1600 = 100ms at 16kHz mono)
    pub buffer_capacity: usize,
    /// Buffers idle longer than this are dropped during cleanup
    pub max_idle_age: Duration,
    /// Minimum spacing between cleanup passes
    pub cleanup_interval: Duration,
    /// `resize_to_fit` grows while the hit rate is above this
    pub grow_hit_rate: f64,
    /// `resize_to_fit` shrinks once the hit rate falls below this
    pub shrink_hit_rate: f64,
    /// Memory ceiling (MB) above which `resize_to_fit` refuses to grow
    pub memory_high_water_mb: f64,
    /// Buffers added per grow step
    pub grow_step: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_buffers: 16,
            buffer_capacity: 1600,
            max_idle_age: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(5),
            grow_hit_rate: 0.9,
            shrink_hit_rate: 0.5,
            memory_high_water_mb: 8.0,
            grow_step: 4,
        }
    }
}

/// A recycled fixed-capacity sample buffer.
///
/// A buffer is either available (in the pool, payload empty) or checked out
/// (owned by exactly one caller); ownership of the value enforces that a
/// checked-out buffer has a single holder.
#[derive(Debug)]
pub struct PooledBuffer {
    id: Uuid,
    pub samples: Vec<i16>,
    recycled_at: Instant,
}

impl PooledBuffer {
    /// Allocate a buffer with the given sample capacity.
    ///
    /// Returns `None` when the allocator cannot satisfy the request; the
    /// caller treats that as a dropped frame, not a fatal error.
    fn with_capacity(capacity: usize) -> Option<Self> {
        let mut samples = Vec::new();
        if samples.try_reserve_exact(capacity).is_err() {
            log::warn!("pool: buffer allocation of {} samples failed", capacity);
            return None;
        }
        Some(Self {
            id: Uuid::new_v4(),
            samples,
            recycled_at: Instant::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    /// Free sample slots remaining before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.samples.capacity().saturating_sub(self.samples.len())
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    fn recycle(&mut self) {
        self.samples.clear();
        self.recycled_at = Instant::now();
    }

    fn is_stale(&self, max_age: Duration) -> bool {
        self.recycled_at.elapsed() > max_age
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub total_buffers: usize,
    pub available: usize,
    pub checked_out: usize,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses); 0 before any traffic
    pub hit_rate: f64,
    pub current_memory_mb: f64,
    pub peak_memory_mb: f64,
}

/// LIFO pool of recycled audio buffers.
pub struct AudioBufferPool {
    /// Available buffers; most recently returned at the back
    available: Vec<PooledBuffer>,
    checked_out: usize,
    hits: u64,
    misses: u64,
    last_cleanup: Instant,
    peak_bytes: usize,
    config: PoolConfig,
}

impl AudioBufferPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            available: Vec::with_capacity(config.max_buffers),
            checked_out: 0,
            hits: 0,
            misses: 0,
            last_cleanup: Instant::now(),
            peak_bytes: 0,
            config,
        }
    }

    /// Pre-populate up to `count` buffers, bounded by `max_buffers`.
    ///
    /// Returns the number actually added.
    pub fn prewarm(&mut self, count: usize) -> usize {
        let room = self
            .config
            .max_buffers
            .saturating_sub(self.available.len() + self.checked_out);
        let mut added = 0;
        for _ in 0..count.min(room) {
            match PooledBuffer::with_capacity(self.config.buffer_capacity) {
                Some(buf) => {
                    self.available.push(buf);
                    added += 1;
                }
                None => break,
            }
        }
        self.track_peak();
        added
    }

    /// Take a buffer from the pool, or allocate one on a miss.
    ///
    /// Runs a time-gated cleanup pass first. Returns `None` only when
    /// allocation fails; the caller should drop the frame or retry.
    pub fn acquire(&mut self) -> Option<PooledBuffer> {
        self.maybe_cleanup();

        // LIFO: the most recently returned buffer is warmest. Stale
        // stragglers that the gated cleanup has not reached yet are
        // discarded on the way.
        while let Some(buf) = self.available.pop() {
            if buf.is_stale(self.config.max_idle_age) {
                continue;
            }
            self.hits += 1;
            self.checked_out += 1;
            return Some(buf);
        }

        self.misses += 1;
        let buf = PooledBuffer::with_capacity(self.config.buffer_capacity)?;
        self.checked_out += 1;
        self.track_peak();
        Some(buf)
    }

    /// Return a buffer to the pool.
    ///
    /// The payload is cleared and the recycle stamp refreshed. The buffer
    /// is retained only while the available list is below `max_buffers`;
    /// past that it is dropped so the pool never grows without bound.
    pub fn release(&mut self, mut buffer: PooledBuffer) {
        self.checked_out = self.checked_out.saturating_sub(1);
        if self.available.len() < self.config.max_buffers {
            buffer.recycle();
            self.available.push(buffer);
        } else {
            log::debug!("pool: at capacity, dropping buffer {}", buffer.id());
        }
    }

    /// Snapshot of pool counters.
    pub fn statistics(&self) -> PoolStats {
        let total = self.available.len() + self.checked_out;
        let lookups = self.hits + self.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        };
        PoolStats {
            total_buffers: total,
            available: self.available.len(),
            checked_out: self.checked_out,
            hits: self.hits,
            misses: self.misses,
            hit_rate,
            current_memory_mb: bytes_to_mb(total * self.bytes_per_buffer()),
            peak_memory_mb: bytes_to_mb(self.peak_bytes),
        }
    }

    /// Heuristic control loop: grow toward `max_buffers` while the pool is
    /// running hot and cheap, shrink when recycling stops paying for the
    /// memory. Advisory only; callers invoke it on their own cadence.
    pub fn resize_to_fit(&mut self) {
        let stats = self.statistics();
        let grow = stats.hit_rate > self.config.grow_hit_rate
            && stats.current_memory_mb < self.config.memory_high_water_mb
            && stats.total_buffers < self.config.max_buffers;
        let shrink = stats.hit_rate < self.config.shrink_hit_rate
            || stats.current_memory_mb >= self.config.memory_high_water_mb;

        if grow {
            let added = self.prewarm(self.config.grow_step);
            log::debug!(
                "pool: grew by {} buffers (hit rate {:.2})",
                added,
                stats.hit_rate
            );
        } else if shrink && !self.available.is_empty() {
            // Drop the stalest half; the front of the list has been idle
            // longest.
            let drop_count = (self.available.len() + 1) / 2;
            self.available.drain(..drop_count);
            log::debug!(
                "pool: shrank by {} buffers (hit rate {:.2}, {:.2} MB)",
                drop_count,
                stats.hit_rate,
                stats.current_memory_mb
            );
        }
    }

    fn maybe_cleanup(&mut self) {
        if self.last_cleanup.elapsed() < self.config.cleanup_interval {
            return;
        }
        self.last_cleanup = Instant::now();
        let max_age = self.config.max_idle_age;
        let before = self.available.len();
        self.available.retain(|buf| !buf.is_stale(max_age));
        let evicted = before - self.available.len();
        if evicted > 0 {
            log::debug!("pool: evicted {} stale buffers", evicted);
        }
    }

    fn bytes_per_buffer(&self) -> usize {
        self.config.buffer_capacity * std::mem::size_of::<i16>()
    }

    fn track_peak(&mut self) {
        let current = (self.available.len() + self.checked_out) * self.bytes_per_buffer();
        if current > self.peak_bytes {
            self.peak_bytes = current;
        }
    }
}

fn bytes_to_mb(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

// ============================================================================
// Process-wide shared pool
// ============================================================================

static SHARED_POOL: Lazy<Mutex<Option<Arc<Mutex<AudioBufferPool>>>>> =
    Lazy::new(|| Mutex::new(None));

/// Create (or replace) the process-wide shared pool.
///
/// The shared pool is an explicit convenience, not ambient state: nothing
/// uses it until a host calls this, and [`reset_shared_pool`] tears it down.
pub fn init_shared_pool(config: PoolConfig) -> Arc<Mutex<AudioBufferPool>> {
    let pool = Arc::new(Mutex::new(AudioBufferPool::new(config)));
    *SHARED_POOL.lock().unwrap() = Some(pool.clone());
    pool
}

/// Handle to the shared pool, if one has been initialized.
pub fn shared_pool() -> Option<Arc<Mutex<AudioBufferPool>>> {
    SHARED_POOL.lock().unwrap().clone()
}

/// Drop the registry's reference to the shared pool.
///
/// Outstanding `Arc` handles keep their pool alive; new callers see `None`.
pub fn reset_shared_pool() {
    *SHARED_POOL.lock().unwrap() = None;
}
