//! Per-session bounded store of finalized command records.
//!
//! Records are shared by `Arc`, so eviction only drops the cache's own
//! reference; a reader holding a record keeps it alive. The store is bounded
//! by total bytes and by record count, evicting oldest-by-completion first.
//! The most recently completed record is never evicted.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use crate::queue::CommandRecord;

/// Fixed per-record overhead charged on top of the text fields.
const RECORD_OVERHEAD: usize = 256;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub records: usize,
    pub bytes: usize,
    pub inserted: u64,
    pub evictions: u64,
}

struct CacheInner {
    map: HashMap<String, Arc<CommandRecord>>,
    /// Command IDs in completion order, oldest first.
    order: VecDeque<String>,
    bytes: usize,
    inserted: u64,
    evictions: u64,
}

/// Bounded result store keyed by command ID.
pub struct ResultCache {
    max_bytes: usize,
    max_records: usize,
    inner: Mutex<CacheInner>,
}

fn record_cost(record: &CommandRecord) -> usize {
    record.command.len()
        + record.output.as_deref().map_or(0, str::len)
        + record.error.as_deref().map_or(0, str::len)
        + record.cancel_reason.as_deref().map_or(0, str::len)
        + RECORD_OVERHEAD
}

impl ResultCache {
    #[must_use]
    pub fn new(max_bytes: usize, max_records: usize) -> Self {
        Self {
            max_bytes,
            max_records: max_records.max(1),
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                bytes: 0,
                inserted: 0,
                evictions: 0,
            }),
        }
    }

    /// Store a finalized record, evicting oldest entries until both caps
    /// hold again. The newest record always survives.
    pub fn put(&self, record: Arc<CommandRecord>) {
        let cost = record_cost(&record);
        let mut inner = self.inner.lock().expect("result cache lock poisoned");

        if inner.map.insert(record.command_id.clone(), record.clone()).is_none() {
            inner.order.push_back(record.command_id.clone());
        }
        inner.bytes += cost;
        inner.inserted += 1;

        while (inner.bytes > self.max_bytes || inner.map.len() > self.max_records)
            && inner.order.len() > 1
        {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.map.remove(&oldest) {
                inner.bytes = inner.bytes.saturating_sub(record_cost(&evicted));
                inner.evictions += 1;
            }
        }
    }

    #[must_use]
    pub fn get(&self, command_id: &str) -> Option<Arc<CommandRecord>> {
        self.inner
            .lock()
            .expect("result cache lock poisoned")
            .map
            .get(command_id)
            .cloned()
    }

    /// All cached records in completion order, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<CommandRecord>> {
        let inner = self.inner.lock().expect("result cache lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|id| inner.map.get(id).cloned())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("result cache lock poisoned").map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("result cache lock poisoned");
        CacheStats {
            records: inner.map.len(),
            bytes: inner.bytes,
            inserted: inner.inserted,
            evictions: inner.evictions,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("result cache lock poisoned");
        inner.map.clear();
        inner.order.clear();
        inner.bytes = 0;
    }
}
