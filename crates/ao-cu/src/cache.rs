//! Bounded, TTL-aware cache of process memory.
//!
//! Entries hold gzip-compressed memory plus the evaluation it belongs
//! to. The cache is shared across evaluator tasks; mutations serialize
//! under the internal lock. Expired entries are still served (marked
//! stale, which the evaluator treats as a refresh signal) and any access
//! renews the TTL. Size pressure evicts in approximate LRU order and
//! hands the evicted entry to the eviction hook so the owner can publish
//! a checkpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ao_core::Evaluation;
use tracing::debug;

use crate::compress::{gunzip, gzip};
use crate::error::CuResult;

/// An entry as handed to the eviction hook: compressed memory plus the
/// evaluation that produced it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub evaluation: Evaluation,
    pub memory_gz: Vec<u8>,
}

/// A cache read: uncompressed memory plus staleness.
#[derive(Debug, Clone)]
pub struct CachedMemory {
    pub evaluation: Evaluation,
    pub memory: Vec<u8>,
    /// TTL had lapsed at read time. Served anyway; the reader should
    /// refresh from the checkpoint store when it matters.
    pub stale: bool,
}

pub type EvictionHook = Box<dyn Fn(CacheEntry) + Send + Sync>;

struct Slot {
    entry: CacheEntry,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Slot>,
    recency: VecDeque<String>,
    total_bytes: usize,
}

pub struct ProcessMemoryCache {
    max_size: usize,
    ttl: Duration,
    on_eviction: Option<EvictionHook>,
    inner: Mutex<Inner>,
}

impl ProcessMemoryCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            max_size,
            ttl,
            on_eviction: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_eviction_hook(mut self, hook: EvictionHook) -> Self {
        self.on_eviction = Some(hook);
        self
    }

    pub fn get(&self, process_id: &str) -> CuResult<Option<CachedMemory>> {
        let (entry, stale) = {
            let mut inner = self.inner.lock().expect("cache lock");
            let now = Instant::now();
            let ttl = self.ttl;
            let Some(slot) = inner.entries.get_mut(process_id) else {
                return Ok(None);
            };
            let stale = now >= slot.expires_at;
            slot.expires_at = now + ttl;
            let entry = slot.entry.clone();
            touch(&mut inner.recency, process_id);
            (entry, stale)
        };
        // Decompress outside the lock; memory can be large.
        let memory = gunzip(&entry.memory_gz)?;
        Ok(Some(CachedMemory {
            evaluation: entry.evaluation,
            memory,
            stale,
        }))
    }

    /// Install the latest memory for a process. A set that would regress
    /// the cached position is dropped, so after any interleaving the
    /// stored evaluation is the latest among those set.
    pub fn set(&self, process_id: &str, evaluation: Evaluation, memory: &[u8]) -> CuResult<bool> {
        let memory_gz = gzip(memory)?;
        let evicted = {
            let mut inner = self.inner.lock().expect("cache lock");
            if let Some(slot) = inner.entries.get(process_id) {
                if !evaluation
                    .position()
                    .is_later_than(&slot.entry.evaluation.position())
                {
                    debug!(
                        process_id,
                        sort_key = %evaluation.sort_key,
                        "dropping cache set that would regress the cached evaluation"
                    );
                    return Ok(false);
                }
            }

            let slot = Slot {
                entry: CacheEntry {
                    evaluation,
                    memory_gz,
                },
                expires_at: Instant::now() + self.ttl,
            };
            let added = slot.entry.memory_gz.len();
            if let Some(old) = inner.entries.insert(process_id.to_string(), slot) {
                inner.total_bytes -= old.entry.memory_gz.len();
            }
            inner.total_bytes += added;
            touch(&mut inner.recency, process_id);
            self.evict_over_budget(&mut inner, process_id)
        };
        for entry in evicted {
            if let Some(hook) = &self.on_eviction {
                hook(entry);
            }
        }
        Ok(true)
    }

    /// Drop LRU entries until the byte budget holds, sparing the entry
    /// that was just touched. Returns the evicted entries so hooks run
    /// outside the lock.
    fn evict_over_budget(&self, inner: &mut Inner, protect: &str) -> Vec<CacheEntry> {
        let mut evicted = Vec::new();
        while inner.total_bytes > self.max_size {
            let Some(victim) = inner
                .recency
                .iter()
                .find(|k| k.as_str() != protect)
                .cloned()
            else {
                break;
            };
            remove_key(&mut inner.recency, &victim);
            if let Some(slot) = inner.entries.remove(&victim) {
                inner.total_bytes -= slot.entry.memory_gz.len();
                debug!(process_id = %victim, "evicting process memory");
                evicted.push(slot.entry);
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().expect("cache lock").total_bytes
    }
}

fn touch(recency: &mut VecDeque<String>, key: &str) {
    remove_key(recency, key);
    recency.push_back(key.to_string());
}

fn remove_key(recency: &mut VecDeque<String>, key: &str) {
    if let Some(at) = recency.iter().position(|k| k == key) {
        recency.remove(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ao_core::{EvalOutputRecord, Evaluation, SortKey};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn eval(process_id: &str, height: u64, timestamp: i64) -> Evaluation {
        Evaluation {
            process_id: process_id.into(),
            sort_key: SortKey::parse(&format!("{height},{timestamp},hash")).unwrap(),
            message_id: Some("msg".into()),
            timestamp,
            is_cron: false,
            cron: None,
            evaluated_at: timestamp,
            deep_hash: None,
            output: EvalOutputRecord::default(),
        }
    }

    #[test]
    fn get_returns_uncompressed_memory() {
        let cache = ProcessMemoryCache::new(1 << 20, Duration::from_secs(60));
        let memory = vec![3u8; 4096];
        assert!(cache.set("p1", eval("p1", 1, 10), &memory).unwrap());

        let hit = cache.get("p1").unwrap().unwrap();
        assert_eq!(hit.memory, memory);
        assert!(!hit.stale);
        assert!(cache.total_bytes() < memory.len());
    }

    #[test]
    fn set_drops_regressions() {
        let cache = ProcessMemoryCache::new(1 << 20, Duration::from_secs(60));
        assert!(cache.set("p1", eval("p1", 2, 20), b"newer").unwrap());
        // Earlier position: no-op.
        assert!(!cache.set("p1", eval("p1", 1, 10), b"older").unwrap());
        assert_eq!(cache.get("p1").unwrap().unwrap().memory, b"newer");

        // Later position replaces.
        assert!(cache.set("p1", eval("p1", 3, 30), b"newest").unwrap());
        assert_eq!(cache.get("p1").unwrap().unwrap().memory, b"newest");
    }

    #[test]
    fn ttl_expiry_marks_stale_but_still_serves() {
        let cache = ProcessMemoryCache::new(1 << 20, Duration::from_millis(0));
        cache.set("p1", eval("p1", 1, 10), b"memory").unwrap();
        let hit = cache.get("p1").unwrap().unwrap();
        assert!(hit.stale);
        assert_eq!(hit.memory, b"memory");
    }

    #[test]
    fn size_pressure_evicts_lru_and_fires_hook() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let seen = evictions.clone();
        // Budget sized to hold roughly two compressed entries.
        let budget = gzip(&random_ish(2)).unwrap().len() + gzip(&random_ish(3)).unwrap().len() + 8;
        let cache = ProcessMemoryCache::new(budget, Duration::from_secs(60))
            .with_eviction_hook(Box::new(move |entry| {
                assert_eq!(entry.evaluation.process_id, "p1");
                seen.fetch_add(1, Ordering::SeqCst);
            }));

        cache.set("p1", eval("p1", 1, 10), &random_ish(1)).unwrap();
        cache.set("p2", eval("p2", 1, 10), &random_ish(2)).unwrap();
        // Touch p2 so p1 is least recent.
        cache.get("p2").unwrap();
        cache.set("p3", eval("p3", 1, 10), &random_ish(3)).unwrap();

        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert!(cache.get("p1").unwrap().is_none());
        assert!(cache.get("p2").unwrap().is_some());
        assert!(cache.get("p3").unwrap().is_some());
    }

    // Incompressible-ish bytes so gzip cannot fold entries below the
    // budget arithmetic above.
    fn random_ish(seed: u8) -> Vec<u8> {
        let mut state = seed as u32 + 1;
        (0..8192u32)
            .map(|i| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223 ^ i);
                (state >> 16) as u8
            })
            .collect()
    }
}
