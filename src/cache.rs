use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

/// Default capacity of the shared decode cache, in payload bytes.
pub const DEFAULT_CACHE_CAPACITY: usize = 64 * 1024 * 1024;

/// Cache key for one decoded bundle payload: the bundle's source file
/// plus the payload's absolute offset within it.
pub type CacheKey = (std::path::PathBuf, u64);

static DECODE_CACHE: LazyLock<Mutex<DecodeCache>> =
    LazyLock::new(|| Mutex::new(DecodeCache::new(DEFAULT_CACHE_CAPACITY)));

/// Process-wide cache of decoded bundle payloads.
///
/// Shared across index loads within one process. It is never reset
/// implicitly; callers that run independent passes must call
/// [`reset`] between them to bound memory and avoid cross-run staleness.
struct DecodeCache {
    capacity: usize,
    total: usize,
    map: HashMap<CacheKey, Arc<Vec<u8>>>,
    // Insertion order, oldest first. Eviction is FIFO.
    order: VecDeque<CacheKey>,
}

impl DecodeCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            total: 0,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Arc<Vec<u8>>> {
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, data: Arc<Vec<u8>>) {
        // Payloads larger than the whole cache are never retained.
        if data.len() > self.capacity {
            return;
        }
        if self.map.contains_key(&key) {
            return;
        }
        while self.total + data.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.map.remove(&oldest) {
                self.total -= evicted.len();
            }
        }
        self.total += data.len();
        self.order.push_back(key.clone());
        self.map.insert(key, data);
    }
}

/// Look up a decoded payload.
pub fn get(key: &CacheKey) -> Option<Arc<Vec<u8>>> {
    DECODE_CACHE.lock().get(key)
}

/// Retain a decoded payload for later loads.
pub fn insert(key: CacheKey, data: Arc<Vec<u8>>) {
    DECODE_CACHE.lock().insert(key, data);
}

/// Drop all cached payloads and set a new capacity. Call between
/// independent runs.
pub fn reset(capacity: usize) {
    *DECODE_CACHE.lock() = DecodeCache::new(capacity);
}
