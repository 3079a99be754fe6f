//! Manages shared/exclusive page locks for concurrent transactions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::lock_recover;
use crate::page::PageId;
use crate::transaction::TransactionId;

/// Represents the two modes a page lock can be held in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    #[default]
    Shared,
    Exclusive,
}

/// One lock table entry, created lazily on the first acquire of its page.
///
/// `mode` is meaningful only while `holders` is non-empty. The entry must
/// stay in the table while `waiters` is non-zero so that wake-ups still find
/// its condition variable.
#[derive(Debug, Default)]
struct LockEntry {
    mode: LockMode,
    holders: HashSet<TransactionId>,
    waiters: usize,
    cond: Arc<Condvar>,
}

/// All lock manager bookkeeping, guarded by one monitor.
#[derive(Debug, Default)]
struct LockTables {
    entries: HashMap<PageId, LockEntry>,
    /// Waits-for graph: a blocked transaction maps to the holders it
    /// recorded on entry to the wait.
    waits_for: HashMap<TransactionId, HashSet<TransactionId>>,
    pages_by_tid: HashMap<TransactionId, HashSet<PageId>>,
}

#[derive(Debug)]
pub enum LockError {
    Deadlock,
}

/// The main lock manager struct.
#[derive(Debug, Default)]
pub struct LockManager {
    tables: Mutex<LockTables>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `tid` holds a shared lock on `pid`.
    ///
    /// Fails with [`LockError::Deadlock`] when waiting would close a cycle
    /// in the waits-for graph; the lock table is then left as if the call
    /// had never been made.
    pub fn acquire_shared(&self, tid: TransactionId, pid: PageId) -> Result<(), LockError> {
        let mut tables = lock_recover(&self.tables);
        loop {
            let t = &mut *tables;
            let entry = t.entries.entry(pid).or_default();
            // A holder of either mode already satisfies a shared request.
            if entry.holders.contains(&tid) {
                return Ok(());
            }
            if entry.holders.is_empty() || entry.mode == LockMode::Shared {
                entry.mode = LockMode::Shared;
                entry.holders.insert(tid);
                t.pages_by_tid.entry(tid).or_default().insert(pid);
                return Ok(());
            }
            tables = self.wait_for_holders(tables, tid, pid)?;
        }
    }

    /// Blocks until `tid` holds the exclusive lock on `pid`, upgrading in
    /// place when `tid` is the sole holder.
    pub fn acquire_exclusive(&self, tid: TransactionId, pid: PageId) -> Result<(), LockError> {
        let mut tables = lock_recover(&self.tables);
        loop {
            let t = &mut *tables;
            let entry = t.entries.entry(pid).or_default();
            if entry.mode == LockMode::Exclusive && entry.holders.contains(&tid) {
                return Ok(());
            }
            if entry.holders.len() == 1 && entry.holders.contains(&tid) {
                // Sole holder: atomic upgrade, no release in between.
                entry.mode = LockMode::Exclusive;
                return Ok(());
            }
            if entry.holders.is_empty() {
                entry.mode = LockMode::Exclusive;
                entry.holders.insert(tid);
                t.pages_by_tid.entry(tid).or_default().insert(pid);
                return Ok(());
            }
            tables = self.wait_for_holders(tables, tid, pid)?;
        }
    }

    /// Releases whatever lock `tid` holds on `pid` and wakes blocked
    /// acquirers. Releasing a lock that is not held is a silent no-op, so
    /// abort cleanup may double-release freely.
    pub fn release(&self, tid: TransactionId, pid: PageId) {
        let mut tables = lock_recover(&self.tables);
        let t = &mut *tables;
        let Some(entry) = t.entries.get_mut(&pid) else {
            return;
        };
        if !entry.holders.remove(&tid) {
            return;
        }
        if let Some(pages) = t.pages_by_tid.get_mut(&tid) {
            pages.remove(&pid);
            if pages.is_empty() {
                t.pages_by_tid.remove(&tid);
            }
        }
        entry.cond.notify_all();
        if entry.holders.is_empty() && entry.waiters == 0 {
            t.entries.remove(&pid);
        }
    }

    /// True iff `tid` currently holds any lock on `pid`.
    pub fn holds(&self, tid: TransactionId, pid: PageId) -> bool {
        lock_recover(&self.tables)
            .pages_by_tid
            .get(&tid)
            .is_some_and(|pages| pages.contains(&pid))
    }

    /// The pages `tid` currently holds any lock on.
    pub fn pages_of(&self, tid: TransactionId) -> HashSet<PageId> {
        lock_recover(&self.tables)
            .pages_by_tid
            .get(&tid)
            .cloned()
            .unwrap_or_default()
    }

    /// Parks `tid` on `pid`'s condition until the holder set changes.
    ///
    /// The current holders are recorded as `tid`'s waits-for edges and the
    /// acquire aborts instead of sleeping whenever those edges would close a
    /// cycle. The edges are torn down on wake-up, so every retry re-records
    /// them and re-checks against the graph as it is then.
    fn wait_for_holders<'a>(
        &self,
        mut tables: MutexGuard<'a, LockTables>,
        tid: TransactionId,
        pid: PageId,
    ) -> Result<MutexGuard<'a, LockTables>, LockError> {
        let t = &mut *tables;
        let Some(entry) = t.entries.get_mut(&pid) else {
            return Ok(tables);
        };

        let blockers: HashSet<TransactionId> = entry
            .holders
            .iter()
            .copied()
            .filter(|holder| *holder != tid)
            .collect();
        t.waits_for.insert(tid, blockers);
        if closes_cycle(&t.waits_for, tid) {
            t.waits_for.remove(&tid);
            return Err(LockError::Deadlock);
        }

        entry.waiters += 1;
        let cond = Arc::clone(&entry.cond);
        tables = cond
            .wait(tables)
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let t = &mut *tables;
        if let Some(entry) = t.entries.get_mut(&pid) {
            entry.waiters -= 1;
        }
        t.waits_for.remove(&tid);
        Ok(tables)
    }
}

/// Breadth-first walk of the waits-for graph starting from `start`.
///
/// Reports a cycle as soon as any transaction is reached twice, which
/// aborts the caller rather than a victim picked elsewhere.
fn closes_cycle(
    waits_for: &HashMap<TransactionId, HashSet<TransactionId>>,
    start: TransactionId,
) -> bool {
    let mut visited = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(waiter) = queue.pop_front() {
        let Some(blockers) = waits_for.get(&waiter) else {
            continue;
        };
        for &blocker in blockers {
            if blocker == waiter {
                continue;
            }
            if !visited.insert(blocker) {
                return true;
            }
            queue.push_back(blocker);
        }
    }
    false
}
