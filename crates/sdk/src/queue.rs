//! Durable FIFO of pending requests.
//!
//! The queue is a JSON array under one store key, mirrored in memory so the
//! head can be read without parsing the array. Entries are only ever
//! appended at the tail and removed by value once the worker has confirmed
//! their delivery, so order is exactly insertion order.

use parking_lot::Mutex;
use pulse_core::PulseResult;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::requests::PendingRequest;
use crate::store::{keys, KeyValueStore};

/// Every mutation is written through to the store before the in-memory copy
/// changes, so a failed write leaves both untouched.
pub struct PendingQueue {
    store: Arc<dyn KeyValueStore>,
    // Loaded from the store on first use.
    entries: Mutex<Option<VecDeque<PendingRequest>>>,
}

impl PendingQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(None),
        }
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut VecDeque<PendingRequest>) -> PulseResult<T>,
    ) -> PulseResult<T> {
        let mut cached = self.entries.lock();
        let loaded = match cached.take() {
            Some(entries) => entries,
            None => self.load()?,
        };
        f(cached.insert(loaded))
    }

    fn load(&self) -> PulseResult<VecDeque<PendingRequest>> {
        match self.store.get(keys::PENDING_REQUESTS)? {
            Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(VecDeque::new()),
        }
    }

    fn save(&self, entries: &VecDeque<PendingRequest>) -> PulseResult<()> {
        if entries.is_empty() {
            return self.store.remove(keys::PENDING_REQUESTS);
        }
        self.store
            .put(keys::PENDING_REQUESTS, &serde_json::to_string(entries)?)
    }

    /// Append at the tail. Durable once this returns `Ok`.
    pub fn enqueue(&self, request: PendingRequest) -> PulseResult<()> {
        self.with_entries(|entries| {
            entries.push_back(request);
            if let Err(e) = self.save(entries) {
                entries.pop_back();
                return Err(e);
            }
            metrics::counter!("pulse.queue.enqueued").increment(1);
            debug!(depth = entries.len(), "request enqueued");
            Ok(())
        })
    }

    pub fn oldest(&self) -> PulseResult<Option<PendingRequest>> {
        self.with_entries(|entries| Ok(entries.front().cloned()))
    }

    /// Removes the first entry equal to `request`. Returns `false` when it
    /// is no longer present, e.g. after an external `clear`.
    pub fn remove_exact(&self, request: &PendingRequest) -> PulseResult<bool> {
        self.with_entries(|entries| {
            let Some(position) = entries.iter().position(|entry| entry == request) else {
                warn!("delivered request was already gone from the queue");
                return Ok(false);
            };
            let removed = entries.remove(position);
            if let Err(e) = self.save(entries) {
                if let Some(removed) = removed {
                    entries.insert(position, removed);
                }
                return Err(e);
            }
            Ok(true)
        })
    }

    pub fn is_empty(&self) -> PulseResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn len(&self) -> PulseResult<usize> {
        self.with_entries(|entries| Ok(entries.len()))
    }

    /// Copy of every queued entry, oldest first.
    pub fn snapshot(&self) -> PulseResult<Vec<PendingRequest>> {
        self.with_entries(|entries| Ok(entries.iter().cloned().collect()))
    }

    pub fn clear(&self) -> PulseResult<()> {
        self.with_entries(|entries| {
            self.store.remove(keys::PENDING_REQUESTS)?;
            entries.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FlakyStore;
    use crate::store::MemoryStore;

    fn request(tag: &str) -> PendingRequest {
        PendingRequest::new(format!("app_key=K&tag={tag}"))
    }

    #[test]
    fn test_fifo_order() {
        let queue = PendingQueue::new(Arc::new(MemoryStore::new()));
        assert!(queue.is_empty().unwrap());
        assert_eq!(queue.oldest().unwrap(), None);

        for tag in ["r1", "r2", "r3"] {
            queue.enqueue(request(tag)).unwrap();
        }
        assert_eq!(queue.len().unwrap(), 3);
        assert_eq!(queue.oldest().unwrap(), Some(request("r1")));

        assert!(queue.remove_exact(&request("r1")).unwrap());
        assert_eq!(queue.oldest().unwrap(), Some(request("r2")));
        assert_eq!(queue.snapshot().unwrap(), vec![request("r2"), request("r3")]);
    }

    #[test]
    fn test_remove_exact_takes_first_match_only() {
        let queue = PendingQueue::new(Arc::new(MemoryStore::new()));
        queue.enqueue(request("dup")).unwrap();
        queue.enqueue(request("other")).unwrap();
        queue.enqueue(request("dup")).unwrap();

        assert!(queue.remove_exact(&request("dup")).unwrap());
        assert_eq!(
            queue.snapshot().unwrap(),
            vec![request("other"), request("dup")]
        );
    }

    #[test]
    fn test_remove_missing_entry_is_noop() {
        let queue = PendingQueue::new(Arc::new(MemoryStore::new()));
        queue.enqueue(request("r1")).unwrap();
        queue.clear().unwrap();
        assert!(!queue.remove_exact(&request("r1")).unwrap());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_failed_writes_leave_queue_unchanged() {
        let store = Arc::new(FlakyStore::default());
        let queue = PendingQueue::new(store.clone());
        queue.enqueue(request("r1")).unwrap();

        store.set_failing(true);
        assert!(queue.enqueue(request("r2")).is_err());
        assert!(queue.remove_exact(&request("r1")).is_err());
        assert_eq!(queue.snapshot().unwrap(), vec![request("r1")]);

        store.set_failing(false);
        let reopened = PendingQueue::new(store);
        assert_eq!(reopened.snapshot().unwrap(), vec![request("r1")]);
    }

    #[test]
    fn test_entries_survive_new_queue_instance() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        PendingQueue::new(store.clone())
            .enqueue(request("r1"))
            .unwrap();
        let reopened = PendingQueue::new(store);
        assert_eq!(reopened.oldest().unwrap(), Some(request("r1")));
    }
}
