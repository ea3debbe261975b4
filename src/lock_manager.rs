//! Per-record two-phase locking with FIFO wait queues.
//!
//! Locks are keyed by a record's string form (`Rid`'s `Display`), not by a
//! pointer into any particular table, so the same manager can arbitrate
//! across every heap table sharing a transaction manager. There is no
//! deadlock detector; a stuck waiter either times out or is cancelled
//! because the transaction that owns it aborted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{CoreError, Result};
use crate::log::TxnId;
use crate::rid::Rid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct QueuedRequest {
    txn: TxnId,
    mode: LockMode,
    seq: u64,
    cancelled: Arc<AtomicBool>,
}

struct RecordState {
    holders: Vec<(TxnId, LockMode)>,
    queue: VecDeque<QueuedRequest>,
}

struct RecordEntry {
    state: Mutex<RecordState>,
    condvar: Condvar,
}

fn is_compatible(holders: &[(TxnId, LockMode)], txn: TxnId, mode: LockMode) -> bool {
    match mode {
        LockMode::Shared => holders.iter().all(|(t, m)| *t == txn || *m == LockMode::Shared),
        LockMode::Exclusive => holders.iter().all(|(t, _)| *t == txn),
    }
}

/// Promote queued requests to holders while the head of the queue remains
/// compatible with current holders. Strict FIFO: a blocked exclusive request
/// stops later shared requests from passing it, even though they might
/// otherwise be grantable — this is what keeps writers from starving.
fn try_grant(state: &mut RecordState) {
    while let Some(front) = state.queue.front() {
        if front.cancelled.load(Ordering::Acquire) {
            state.queue.pop_front();
            continue;
        }
        if !is_compatible(&state.holders, front.txn, front.mode) {
            break;
        }
        let granted = state.queue.pop_front().unwrap();
        state.holders.retain(|(t, _)| *t != granted.txn);
        state.holders.push((granted.txn, granted.mode));
    }
}

/// Record-level lock manager. One instance is shared by every table a
/// transaction manager coordinates.
pub struct LockManager {
    records: Mutex<HashMap<String, Arc<RecordEntry>>>,
    waiters: Mutex<HashMap<TxnId, Vec<(Arc<AtomicBool>, Arc<RecordEntry>)>>>,
    held_by: Mutex<HashMap<TxnId, HashSet<String>>>,
    seq: AtomicU64,
    timeout: Option<Duration>,
}

impl LockManager {
    /// `timeout` is this manager's deadlock policy: a lock request that
    /// cannot be granted within `timeout` fails rather than blocking
    /// forever. `None` waits indefinitely (only advisable with an external
    /// abort path still able to cancel waiters).
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            held_by: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            timeout,
        }
    }

    fn entry_for(&self, key: &str) -> Arc<RecordEntry> {
        let mut records = self.records.lock().unwrap();
        records
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RecordEntry { state: Mutex::new(RecordState { holders: Vec::new(), queue: VecDeque::new() }), condvar: Condvar::new() }))
            .clone()
    }

    pub fn acquire_shared(&self, txn: TxnId, rid: Rid) -> Result<()> {
        self.acquire(txn, rid, LockMode::Shared)
    }

    pub fn acquire_exclusive(&self, txn: TxnId, rid: Rid) -> Result<()> {
        self.acquire(txn, rid, LockMode::Exclusive)
    }

    fn acquire(&self, txn: TxnId, rid: Rid, mode: LockMode) -> Result<()> {
        let key = rid.to_string();
        let entry = self.entry_for(&key);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.waiters.lock().unwrap().entry(txn).or_default().push((Arc::clone(&cancelled), Arc::clone(&entry)));

        let outcome = self.acquire_inner(txn, &key, &entry, mode, &cancelled);

        if let Some(list) = self.waiters.lock().unwrap().get_mut(&txn) {
            list.retain(|(c, _)| !Arc::ptr_eq(c, &cancelled));
        }
        if outcome.is_ok() {
            self.held_by.lock().unwrap().entry(txn).or_default().insert(key);
        }
        outcome
    }

    fn acquire_inner(&self, txn: TxnId, key: &str, entry: &Arc<RecordEntry>, mode: LockMode, cancelled: &Arc<AtomicBool>) -> Result<()> {
        let mut state = entry.state.lock().unwrap();

        if state.holders.iter().any(|(t, m)| *t == txn && (*m == mode || *m == LockMode::Exclusive)) {
            return Ok(());
        }

        // In-place upgrade when this transaction is the sole holder.
        if mode == LockMode::Exclusive && state.holders.len() == 1 && state.holders[0].0 == txn {
            state.holders[0].1 = LockMode::Exclusive;
            return Ok(());
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        state.queue.push_back(QueuedRequest { txn, mode, seq, cancelled: Arc::clone(cancelled) });
        try_grant(&mut state);

        let deadline = self.timeout.map(|d| Instant::now() + d);
        loop {
            if state.holders.iter().any(|(t, m)| *t == txn && (*m == mode || *m == LockMode::Exclusive)) {
                return Ok(());
            }
            if cancelled.load(Ordering::Acquire) {
                state.queue.retain(|r| r.seq != seq);
                return Err(CoreError::Lock(format!("transaction {} aborted while waiting for lock on {}", txn, key)));
            }
            match deadline {
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        state.queue.retain(|r| r.seq != seq);
                        return Err(CoreError::Lock(format!("timed out waiting for lock on {}", key)));
                    }
                    let (guard, _) = entry.condvar.wait_timeout(state, remaining).unwrap();
                    state = guard;
                    try_grant(&mut state);
                }
                None => {
                    state = entry.condvar.wait(state).unwrap();
                    try_grant(&mut state);
                }
            }
        }
    }

    /// Release `txn`'s hold on `rid`. Fails if `txn` does not currently hold
    /// a lock on this record.
    pub fn unlock(&self, txn: TxnId, rid: Rid) -> Result<()> {
        let key = rid.to_string();
        let entry = self.entry_for(&key);
        {
            let mut state = entry.state.lock().unwrap();
            let before = state.holders.len();
            state.holders.retain(|(t, _)| *t != txn);
            if state.holders.len() == before {
                return Err(CoreError::Lock(format!("transaction {} does not hold a lock on {}", txn, key)));
            }
            try_grant(&mut state);
            entry.condvar.notify_all();
        }
        if let Some(set) = self.held_by.lock().unwrap().get_mut(&txn) {
            set.remove(&key);
        }
        Ok(())
    }

    /// Release every lock `txn` currently holds. Used by the transaction
    /// manager at commit and abort time.
    pub fn release_all(&self, txn: TxnId) {
        let keys: Vec<String> = self.held_by.lock().unwrap().remove(&txn).into_iter().flatten().collect();
        for key in keys {
            let entry = self.entry_for(&key);
            let mut state = entry.state.lock().unwrap();
            state.holders.retain(|(t, _)| *t != txn);
            try_grant(&mut state);
            entry.condvar.notify_all();
        }
    }

    /// Wake every request `txn` currently has queued so it notices it was
    /// aborted instead of waiting out the full timeout.
    pub fn cancel_waiters(&self, txn: TxnId) {
        if let Some(list) = self.waiters.lock().unwrap().get(&txn) {
            for (flag, entry) in list {
                flag.store(true, Ordering::Release);
                entry.condvar.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn rid(page: u32, slot: u16) -> Rid {
        Rid::new(page, slot)
    }

    #[test]
    fn shared_locks_from_different_transactions_coexist() {
        let lm = LockManager::new(Some(Duration::from_millis(200)));
        lm.acquire_shared(1, rid(0, 0)).unwrap();
        lm.acquire_shared(2, rid(0, 0)).unwrap();
    }

    #[test]
    fn exclusive_lock_blocks_concurrent_shared() {
        let lm = Arc::new(LockManager::new(Some(Duration::from_millis(100))));
        lm.acquire_exclusive(1, rid(0, 0)).unwrap();
        let lm2 = Arc::clone(&lm);
        let err = lm2.acquire_shared(2, rid(0, 0));
        assert!(err.is_err());
    }

    #[test]
    fn unlock_releases_and_grants_next_waiter() {
        let lm = Arc::new(LockManager::new(Some(Duration::from_secs(2))));
        lm.acquire_exclusive(1, rid(0, 0)).unwrap();
        let lm2 = Arc::clone(&lm);
        let barrier = Arc::new(Barrier::new(2));
        let b2 = Arc::clone(&barrier);
        let handle = thread::spawn(move || {
            b2.wait();
            lm2.acquire_exclusive(2, rid(0, 0)).unwrap();
        });
        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        lm.unlock(1, rid(0, 0)).unwrap();
        handle.join().unwrap();
        lm.unlock(2, rid(0, 0)).unwrap();
    }

    #[test]
    fn unlock_without_holding_fails() {
        let lm = LockManager::new(None);
        assert!(lm.unlock(1, rid(0, 0)).is_err());
    }

    #[test]
    fn cancel_waiters_wakes_blocked_request_immediately() {
        let lm = Arc::new(LockManager::new(Some(Duration::from_secs(5))));
        lm.acquire_exclusive(1, rid(0, 0)).unwrap();
        let lm2 = Arc::clone(&lm);
        let handle = thread::spawn(move || lm2.acquire_shared(2, rid(0, 0)));
        thread::sleep(Duration::from_millis(50));
        lm.cancel_waiters(2);
        let result = handle.join().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn blocked_exclusive_request_holds_priority_over_later_shared() {
        let lm = Arc::new(LockManager::new(Some(Duration::from_millis(300))));
        lm.acquire_shared(1, rid(0, 0)).unwrap();
        let lm2 = Arc::clone(&lm);
        let handle = thread::spawn(move || lm2.acquire_exclusive(2, rid(0, 0)));
        thread::sleep(Duration::from_millis(30));
        // Txn 3's shared request arrives after txn 2's exclusive request is
        // already queued; it must not jump ahead of it.
        let lm3 = Arc::clone(&lm);
        let handle3 = thread::spawn(move || lm3.acquire_shared(3, rid(0, 0)));
        thread::sleep(Duration::from_millis(30));
        lm.unlock(1, rid(0, 0)).unwrap();
        handle.join().unwrap().unwrap();
        assert!(handle3.join().unwrap().is_err());
    }

    #[test]
    fn release_all_frees_every_held_record() {
        let lm = LockManager::new(Some(Duration::from_millis(100)));
        lm.acquire_exclusive(1, rid(0, 0)).unwrap();
        lm.acquire_shared(1, rid(0, 1)).unwrap();
        lm.release_all(1);
        lm.acquire_exclusive(2, rid(0, 0)).unwrap();
        lm.acquire_exclusive(2, rid(0, 1)).unwrap();
    }
}
