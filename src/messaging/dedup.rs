//! At-most-once event processing (spec §4.4): an LRU cache of the last
//! 1,000 event ids gives exact membership over recent traffic in
//! bounded memory, backed by a counting Bloom filter sized for ~15,000
//! items at a 1% false-positive rate that persists across restarts
//! (spec §9: "≈144 kbits, ~7 hash functions — trivial to persist").
//! An event is processed iff neither structure reports it; both are
//! updated afterward.

use bloomfilter::Bloom;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const LRU_CAPACITY: usize = 1_000;
const BLOOM_ITEMS: usize = 15_000;
const BLOOM_FP_RATE: f64 = 0.01;

/// Serializable snapshot of the Bloom filter's bitmap, persisted under
/// the `processedEventBloom` state key (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomSnapshot {
    bitmap: Vec<u8>,
    bitmap_bits: u64,
    k_num: u32,
    sip_keys: [(u64, u64); 2],
}

pub struct EventDedup {
    lru: Mutex<LruCache<String, ()>>,
    bloom: Mutex<Bloom<str>>,
}

impl EventDedup {
    pub fn new() -> Self {
        EventDedup {
            lru: Mutex::new(LruCache::new(LRU_CAPACITY)),
            bloom: Mutex::new(Bloom::new_for_fp_rate(BLOOM_ITEMS, BLOOM_FP_RATE)),
        }
    }

    pub fn from_snapshot(snapshot: BloomSnapshot) -> Self {
        let bloom = Bloom::from_existing(
            &snapshot.bitmap,
            snapshot.bitmap_bits,
            snapshot.k_num,
            snapshot.sip_keys,
        );
        EventDedup {
            lru: Mutex::new(LruCache::new(LRU_CAPACITY)),
            bloom: Mutex::new(bloom),
        }
    }

    pub fn snapshot(&self) -> BloomSnapshot {
        let bloom = self.bloom.lock();
        BloomSnapshot {
            bitmap: bloom.bitmap(),
            bitmap_bits: bloom.number_of_bits(),
            k_num: bloom.number_of_hash_functions(),
            sip_keys: bloom.sip_keys(),
        }
    }

    /// Replaces the Bloom filter in place with one loaded from a
    /// persisted snapshot, leaving the (never-persisted) LRU empty.
    /// Used by `PeerCore::load_dedup_snapshot` callers on startup.
    pub fn restore_from(&self, snapshot: BloomSnapshot) {
        let bloom = Bloom::from_existing(
            &snapshot.bitmap,
            snapshot.bitmap_bits,
            snapshot.k_num,
            snapshot.sip_keys,
        );
        *self.bloom.lock() = bloom;
    }

    /// Migration rule (spec §6): a loaded state containing a legacy
    /// `processedEventIds` array gets each entry imported into the
    /// Bloom filter; the array itself is dropped before the next
    /// write — callers do that by simply not round-tripping the
    /// field, and calling this once per legacy id.
    pub fn import_legacy_id(&self, event_id: &str) {
        self.bloom.lock().set(event_id);
    }

    /// True iff `event_id` has not been seen before; marks it as seen
    /// either way so a second call always returns `false` (spec §4.4,
    /// I6).
    pub fn check_and_mark(&self, event_id: &str) -> bool {
        {
            let mut lru = self.lru.lock();
            if lru.get(event_id).is_some() {
                return false;
            }
        }
        let already_in_bloom = self.bloom.lock().check(event_id);
        if already_in_bloom {
            // Bloom false positives are accepted (spec §9): the event
            // is dropped, the sender retries on timeout.
            return false;
        }
        self.bloom.lock().set(event_id);
        self.lru.lock().put(event_id.to_owned(), ());
        true
    }
}

impl Default for EventDedup {
    fn default() -> Self {
        Self::new()
    }
}
