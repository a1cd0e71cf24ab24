//! Shared spool policy: the memory-pressure probe and the buffer pool that
//! [`crate::spool::SpooledBuffer`] promotion consults. Both are per-client
//! instances (no process-wide singleton), per the redesign note in §9.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Buffers at or below this capacity are returned to the pool on promotion
/// to disk; larger ones are simply dropped (§4.A).
const POOL_INITIAL_CAPACITY: usize = 64 * 1024;
const PROBE_CACHE_TTL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SpoolPolicy {
    pub max_in_memory: u64,
    pub max_ram_fraction: f64,
    pub full_on_disk: bool,
    pub temp_dir: PathBuf,
}

impl Default for SpoolPolicy {
    fn default() -> Self {
        Self {
            max_in_memory: 1024 * 1024,
            max_ram_fraction: 0.5,
            full_on_disk: false,
            temp_dir: std::env::temp_dir(),
        }
    }
}

/// Process-wide-per-client cache of the memory-pressure probe and a pool of
/// reusable buffers for spooled-to-memory record bodies.
pub struct SpoolPool {
    policy: SpoolPolicy,
    probe_cache: Mutex<Option<(Instant, bool)>>,
    free_buffers: Mutex<Vec<Vec<u8>>>,
}

impl SpoolPool {
    pub fn new(policy: SpoolPolicy) -> Self {
        Self {
            policy,
            probe_cache: Mutex::new(None),
            free_buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> &SpoolPolicy {
        &self.policy
    }

    /// Take a pooled buffer if one is available, else a fresh empty `Vec`.
    pub fn take_buffer(&self) -> Vec<u8> {
        self.free_buffers.lock().pop().unwrap_or_default()
    }

    /// Return a buffer to the pool, but only if its capacity is within the
    /// initial pool-buffer size; larger buffers are simply dropped.
    pub fn return_buffer(&self, mut buf: Vec<u8>) {
        if buf.capacity() <= POOL_INITIAL_CAPACITY {
            buf.clear();
            self.free_buffers.lock().push(buf);
        }
    }

    /// True if cached system memory pressure is at or above
    /// `max_ram_fraction`. Probed at most every 500 ms; on probe failure
    /// (non-Linux, unreadable `/proc/meminfo`) this degrades to "not high".
    pub fn memory_pressure_high(&self) -> bool {
        let now = Instant::now();
        {
            let cache = self.probe_cache.lock();
            if let Some((at, high)) = *cache {
                if now.duration_since(at) < PROBE_CACHE_TTL {
                    return high;
                }
            }
        }
        let high = probe_memory_fraction()
            .map(|fraction| fraction >= self.policy.max_ram_fraction)
            .unwrap_or(false);
        *self.probe_cache.lock() = Some((now, high));
        high
    }

    pub fn should_promote(&self, current_len: u64, write_len: u64) -> bool {
        self.policy.full_on_disk
            || current_len + write_len > self.policy.max_in_memory
            || self.memory_pressure_high()
    }
}

#[cfg(target_os = "linux")]
fn probe_memory_fraction() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    let mut free = None;
    let mut buffers = None;
    let mut cached = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else { continue };
        let Some(value) = parts.next().and_then(|v| v.parse::<u64>().ok()) else {
            continue;
        };
        match key.trim_end_matches(':') {
            "MemTotal" => total = Some(value),
            "MemAvailable" => available = Some(value),
            "MemFree" => free = Some(value),
            "Buffers" => buffers = Some(value),
            "Cached" => cached = Some(value),
            _ => {}
        }
    }

    let total = total?;
    if total == 0 {
        return None;
    }
    let available = available.or_else(|| Some(free? + buffers.unwrap_or(0) + cached.unwrap_or(0)))?;
    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64)
}

#[cfg(not(target_os = "linux"))]
fn probe_memory_fraction() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_pool_returns_only_small_buffers() {
        let pool = SpoolPool::new(SpoolPolicy::default());
        let small = Vec::with_capacity(1024);
        let large = Vec::with_capacity(10 * 1024 * 1024);
        pool.return_buffer(small);
        pool.return_buffer(large);
        // Only the small buffer should have been retained.
        let first = pool.take_buffer();
        assert!(first.capacity() <= POOL_INITIAL_CAPACITY);
        let second = pool.take_buffer();
        assert_eq!(second.capacity(), 0);
    }

    #[test]
    fn should_promote_on_full_on_disk() {
        let mut policy = SpoolPolicy::default();
        policy.full_on_disk = true;
        let pool = SpoolPool::new(policy);
        assert!(pool.should_promote(0, 1));
    }

    #[test]
    fn should_promote_on_exceeding_max_in_memory() {
        let mut policy = SpoolPolicy::default();
        policy.max_in_memory = 10;
        policy.max_ram_fraction = 2.0; // disable the pressure path for this test
        let pool = SpoolPool::new(policy);
        assert!(!pool.should_promote(0, 5));
        assert!(pool.should_promote(8, 5));
    }
}
