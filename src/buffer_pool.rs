//! Manages the buffer pool: a fixed-capacity cache of disk pages that
//! fronts the lock manager and drives the transaction commit/abort protocol.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::catalog::Catalog;
use crate::error::{lock_recover, DbError, Result};
use crate::lock_manager::LockManager;
use crate::page::{Page, PageId};
use crate::transaction::TransactionId;

/// Default capacity for callers that do not size the pool themselves.
pub const DEFAULT_PAGES: usize = 50;

/// The access intent a transaction declares when it fetches a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permissions {
    ReadOnly,
    ReadWrite,
}

#[derive(Default)]
struct CacheState {
    pages: HashMap<PageId, Arc<Page>>,
    /// Tick of the most recent access per resident page; the eviction
    /// victim is the clean page with the smallest tick.
    last_used: HashMap<PageId, u64>,
    tick: u64,
}

/// The buffer pool manager.
///
/// Never evicts a dirty page: an aborting transaction can then discard its
/// in-memory changes without the backing file ever having seen them.
pub struct BufferPool {
    num_pages: usize,
    cache: Mutex<CacheState>,
    lock_manager: LockManager,
    catalog: Arc<Catalog>,
}

impl BufferPool {
    /// A pool caching up to `num_pages` pages, reading through the stores
    /// registered in `catalog`.
    pub fn new(num_pages: usize, catalog: Arc<Catalog>) -> Self {
        Self {
            num_pages,
            cache: Mutex::new(CacheState::default()),
            lock_manager: LockManager::new(),
            catalog,
        }
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Fetches `pid` on behalf of `tid`, blocking until the lock matching
    /// `perm` is granted.
    ///
    /// The lock is taken before the cache monitor, never the other way
    /// around, so a blocked acquire cannot hold up unrelated hits and
    /// misses.
    pub fn get_page(
        &self,
        tid: TransactionId,
        pid: PageId,
        perm: Permissions,
    ) -> Result<Arc<Page>> {
        match perm {
            Permissions::ReadOnly => self.lock_manager.acquire_shared(tid, pid)?,
            Permissions::ReadWrite => self.lock_manager.acquire_exclusive(tid, pid)?,
        }

        let mut cache = lock_recover(&self.cache);
        let state = &mut *cache;
        state.tick += 1;
        let now = state.tick;

        if let Some(page) = state.pages.get(&pid) {
            state.last_used.insert(pid, now);
            return Ok(Arc::clone(page));
        }

        // Miss: make room first, so insert never overshoots the capacity.
        if state.pages.len() >= self.num_pages {
            Self::evict_one(state)?;
        }
        let file = self.catalog.file_for(pid.table_id())?;
        let page = Arc::new(file.read_page(pid)?);
        state.pages.insert(pid, Arc::clone(&page));
        state.last_used.insert(pid, now);
        Ok(page)
    }

    /// Drops the least recently used clean page. Dirty pages are never
    /// eviction victims, so an all-dirty pool is out of space.
    fn evict_one(state: &mut CacheState) -> Result<()> {
        let victim = state
            .pages
            .iter()
            .filter(|(_, page)| !page.is_dirty())
            .min_by_key(|(pid, _)| state.last_used.get(*pid).copied().unwrap_or(0))
            .map(|(pid, _)| *pid);
        let Some(victim) = victim else {
            return Err(DbError::NoEvictablePage);
        };
        crate::basalt_debug_log!("[BufferPool::evict] evicting clean page {victim:?}");
        state.pages.remove(&victim);
        state.last_used.remove(&victim);
        Ok(())
    }

    /// Removes `pid` from the cache without writing it back.
    pub fn discard(&self, pid: PageId) {
        let mut cache = lock_recover(&self.cache);
        cache.pages.remove(&pid);
        cache.last_used.remove(&pid);
    }

    /// Writes every dirty resident page through its table's store.
    pub fn flush_all(&self) -> Result<()> {
        let cache = lock_recover(&self.cache);
        let resident: Vec<PageId> = cache.pages.keys().copied().collect();
        for pid in resident {
            self.flush_page(&cache, pid)?;
        }
        Ok(())
    }

    fn flush_page(&self, state: &CacheState, pid: PageId) -> Result<()> {
        let Some(page) = state.pages.get(&pid) else {
            return Ok(());
        };
        if page.is_dirty() {
            let file = self.catalog.file_for(pid.table_id())?;
            file.write_page(page)?;
            page.mark_dirty(None);
        }
        Ok(())
    }

    /// Releases `tid`'s lock on `pid` without touching the cache.
    ///
    /// Escape hatch for operator code that knows the page was never
    /// modified; transactions normally release through
    /// [`BufferPool::transaction_complete`].
    pub fn unsafe_release(&self, tid: TransactionId, pid: PageId) {
        self.lock_manager.release(tid, pid);
    }

    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.lock_manager.holds(tid, pid)
    }

    /// Commits or aborts `tid`: flush (commit) or discard (abort) the pages
    /// it holds locks on, then release every one of those locks.
    ///
    /// A flush failure during commit does not turn into an abort: the
    /// remaining pages are still processed, every lock is still released,
    /// and the first failure is returned so the caller can decide whether
    /// to retry. A failed page stays resident and dirty.
    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> Result<()> {
        let pages = self.lock_manager.pages_of(tid);
        if pages.is_empty() {
            return Ok(());
        }
        crate::basalt_debug_log!(
            "[BufferPool::transaction_complete] {:?} {} with {} page(s)",
            tid,
            if commit { "commit" } else { "abort" },
            pages.len()
        );

        let mut first_error = None;
        {
            let mut cache = lock_recover(&self.cache);
            for &pid in &pages {
                if commit {
                    if let Err(err) = self.flush_page(&cache, pid) {
                        crate::basalt_debug_log!(
                            "[BufferPool::transaction_complete] flush of {pid:?} failed: {err}"
                        );
                        first_error.get_or_insert(err);
                    }
                } else {
                    // Aborted contents are invalid even when another
                    // transaction never saw them.
                    cache.pages.remove(&pid);
                    cache.last_used.remove(&pid);
                }
            }
        }

        for &pid in &pages {
            self.lock_manager.release(tid, pid);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
