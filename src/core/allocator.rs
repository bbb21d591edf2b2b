//! Paged KV cache allocator.
//!
//! The [`PageAllocator`] owns the page pool: a free list, the owner set of
//! every page in use, and the page table of every sequence. It plays the
//! role of an operating system's physical page allocator.
//!
//! ## Features
//!
//! - **All-or-nothing allocation**: a request that cannot be met in full
//!   fails with [`Error::CapacityExceeded`] and changes nothing
//! - **Prefix sharing**: [`fork`](PageAllocator::fork) shares every page of
//!   the parent with the child
//! - **Copy-on-write**: [`reserve`](PageAllocator::reserve) splits shared
//!   pages before a sequence writes into them and reports the copies the
//!   executor must perform
//! - **Pinning**: sequences in the executing batch are marked so the
//!   scheduler never offers them for eviction
//!
//! Every operation runs inside one short critical section on the pool lock,
//! so the allocator can be shared behind an `Arc`.
//!
//! ## Example
//!
//! ```
//! use nano_serve::core::allocator::PageAllocator;
//!
//! let allocator = PageAllocator::new(4, 8);
//! allocator.reserve(1, 0, 6).unwrap();
//! assert_eq!(allocator.num_pages_of(1), 2);
//!
//! allocator.fork(1, 2).unwrap();
//! assert_eq!(allocator.num_free_pages(), 6);
//!
//! // Writing position 6 splits the shared second page.
//! let copies = allocator.reserve(2, 6, 7).unwrap();
//! assert_eq!(copies.len(), 1);
//! assert_eq!(allocator.num_free_pages(), 5);
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CacheConfig;
use crate::core::page::{pages_needed, Page, PageCopy, PageHandle, PageId, PageTable};
use crate::core::sequence::SequenceId;
use crate::error::{Error, Result};

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AllocatorStats {
    pub num_pages: usize,
    pub free_pages: usize,
    pub used_pages: usize,
    /// Pages with more than one owner.
    pub shared_pages: usize,
    pub sequences: usize,
    pub pinned_sequences: usize,
}

/// Serializable page tables, enough to rebuild the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorSnapshot {
    pub page_size: usize,
    pub num_pages: usize,
    pub tables: BTreeMap<SequenceId, Vec<PageId>>,
}

#[derive(Debug)]
struct PoolState {
    /// Pages in use, indexed by page id.
    pages: HashMap<PageId, Page>,
    /// Unowned page ids.
    free_list: VecDeque<PageId>,
    /// Page table of every sequence holding pages.
    tables: HashMap<SequenceId, PageTable>,
    /// Sequences in the executing batch.
    pinned: HashSet<SequenceId>,
}

impl PoolState {
    fn take_free(&mut self, seq_id: SequenceId) -> Option<PageId> {
        let page_id = self.free_list.pop_front()?;
        let mut page = Page::new(page_id);
        page.add_owner(seq_id);
        self.pages.insert(page_id, page);
        Some(page_id)
    }

    /// Drop `seq_id` from a page; recycle the page if nobody is left.
    fn disown(&mut self, page_id: PageId, seq_id: SequenceId) -> bool {
        let Some(page) = self.pages.get_mut(&page_id) else {
            return false;
        };
        if page.remove_owner(seq_id) == 0 {
            self.pages.remove(&page_id);
            self.free_list.push_back(page_id);
            return true;
        }
        false
    }

    fn is_shared(&self, page_id: PageId) -> bool {
        self.pages.get(&page_id).is_some_and(Page::is_shared)
    }

    /// Pages `reserve(seq_id, start, end)` would take off the free list.
    fn pages_required(&self, page_size: usize, seq_id: SequenceId, start: usize, end: usize) -> usize {
        if end <= start {
            return 0;
        }
        let owned = self.tables.get(&seq_id).map_or(0, PageTable::len);
        let target = pages_needed(end, page_size);
        let extension = target.saturating_sub(owned);
        let split = match self.tables.get(&seq_id) {
            Some(table) => (start / page_size..owned.min(target))
                .filter(|&i| table.page_id(i).is_some_and(|p| self.is_shared(p)))
                .count(),
            None => 0,
        };
        extension + split
    }
}

/// Manages the page pool of the KV cache.
#[derive(Debug)]
pub struct PageAllocator {
    state: Mutex<PoolState>,
    page_size: usize,
    num_pages: usize,
}

impl PageAllocator {
    /// Create an allocator with `num_pages` pages of `page_size` tokens.
    pub fn new(page_size: usize, num_pages: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                pages: HashMap::with_capacity(num_pages),
                free_list: (0..num_pages).collect(),
                tables: HashMap::new(),
                pinned: HashSet::new(),
            }),
            page_size,
            num_pages,
        }
    }

    /// Create an allocator from the cache configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.page_size, config.num_pages)
    }

    /// Tokens per page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total pages in the pool.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Pages on the free list.
    pub fn num_free_pages(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Pages owned by at least one sequence.
    pub fn num_used_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Pages in `seq_id`'s page table.
    pub fn num_pages_of(&self, seq_id: SequenceId) -> usize {
        self.state.lock().tables.get(&seq_id).map_or(0, PageTable::len)
    }

    /// Copy of `seq_id`'s page table.
    pub fn page_table(&self, seq_id: SequenceId) -> Option<PageTable> {
        self.state.lock().tables.get(&seq_id).cloned()
    }

    /// Physical slots of positions `start..start + len` of `seq_id`.
    pub fn slot_mapping(&self, seq_id: SequenceId, start: usize, len: usize) -> Option<Vec<usize>> {
        self.state
            .lock()
            .tables
            .get(&seq_id)
            .and_then(|table| table.slot_mapping(start, len))
    }

    /// Owner count of a page (0 when free).
    pub fn ref_count(&self, page_id: PageId) -> usize {
        self.state.lock().pages.get(&page_id).map_or(0, Page::ref_count)
    }

    /// Append `count` fresh pages to `seq_id`'s page table.
    ///
    /// All-or-nothing: if fewer than `count` pages are free the call fails
    /// with [`Error::CapacityExceeded`] and the pool is untouched.
    pub fn allocate(&self, seq_id: SequenceId, count: usize) -> Result<Vec<PageHandle>> {
        let mut state = self.state.lock();
        let free = state.free_list.len();
        if count > free {
            return Err(Error::exhausted_pool(count, free));
        }

        let first = state.tables.get(&seq_id).map_or(0, PageTable::len);
        let mut page_ids = Vec::with_capacity(count);
        for _ in 0..count {
            // Free count was checked above.
            if let Some(page_id) = state.take_free(seq_id) {
                page_ids.push(page_id);
            }
        }
        let table = state
            .tables
            .entry(seq_id)
            .or_insert_with(|| PageTable::new(self.page_size));
        for &page_id in &page_ids {
            table.push(page_id);
        }

        Ok(page_ids
            .into_iter()
            .enumerate()
            .map(|(i, page_id)| PageHandle {
                page_id,
                logical_index: first + i,
            })
            .collect())
    }

    /// Drop `seq_id`'s ownership of `page_ids` and remove them from its table.
    ///
    /// Returns the number of pages that went back to the free list.
    pub fn free(&self, seq_id: SequenceId, page_ids: &[PageId]) -> Result<usize> {
        let mut state = self.state.lock();
        let table = state
            .tables
            .get_mut(&seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        let kept: Vec<PageId> = table
            .page_ids()
            .iter()
            .copied()
            .filter(|p| !page_ids.contains(p))
            .collect();
        let dropped: Vec<PageId> = table
            .page_ids()
            .iter()
            .copied()
            .filter(|p| page_ids.contains(p))
            .collect();
        *table = PageTable::from_pages(self.page_size, kept);

        let mut recycled = 0;
        for page_id in dropped {
            if state.disown(page_id, seq_id) {
                recycled += 1;
            }
        }
        Ok(recycled)
    }

    /// Release every page of `seq_id` and forget its table.
    ///
    /// Returns the number of pages that went back to the free list.
    pub fn release(&self, seq_id: SequenceId) -> usize {
        let mut state = self.state.lock();
        state.pinned.remove(&seq_id);
        let Some(mut table) = state.tables.remove(&seq_id) else {
            return 0;
        };
        let recycled = table
            .take_all()
            .into_iter()
            .filter(|&page_id| state.disown(page_id, seq_id))
            .count();
        debug!(seq_id, recycled, "released sequence pages");
        recycled
    }

    /// Share all of `parent`'s pages with a new sequence `child`.
    pub fn fork(&self, parent: SequenceId, child: SequenceId) -> Result<()> {
        let mut state = self.state.lock();
        if state.tables.contains_key(&child) {
            return Err(Error::InvalidStateTransition {
                from: "Owned",
                to: "Forked",
            });
        }
        let table = state
            .tables
            .get(&parent)
            .cloned()
            .ok_or(Error::SequenceNotFound(parent))?;
        for &page_id in table.page_ids() {
            if let Some(page) = state.pages.get_mut(&page_id) {
                page.add_owner(child);
            }
        }
        debug!(parent, child, pages = table.len(), "forked page table");
        state.tables.insert(child, table);
        Ok(())
    }

    /// Free pages `reserve(seq_id, start, end)` would consume.
    pub fn pages_required(&self, seq_id: SequenceId, start: usize, end: usize) -> usize {
        self.state
            .lock()
            .pages_required(self.page_size, seq_id, start, end)
    }

    /// Make positions `start..end` of `seq_id` writable.
    ///
    /// Extends the page table to cover `end` positions and gives the
    /// sequence a private copy of every shared page in the write range.
    /// Returns the page copies the executor must apply before it writes.
    /// All-or-nothing: on [`Error::CapacityExceeded`] the pool is untouched.
    pub fn reserve(&self, seq_id: SequenceId, start: usize, end: usize) -> Result<Vec<PageCopy>> {
        let mut state = self.state.lock();
        let required = state.pages_required(self.page_size, seq_id, start, end);
        let free = state.free_list.len();
        if required > free {
            return Err(Error::exhausted_pool(required, free));
        }
        if end <= start {
            return Ok(Vec::new());
        }

        let mut table = state
            .tables
            .remove(&seq_id)
            .unwrap_or_else(|| PageTable::new(self.page_size));
        let target = pages_needed(end, self.page_size);

        let mut copies = Vec::new();
        for index in start / self.page_size..table.len().min(target) {
            let Some(src) = table.page_id(index) else {
                continue;
            };
            if !state.is_shared(src) {
                continue;
            }
            let Some(dst) = state.take_free(seq_id) else {
                continue;
            };
            state.disown(src, seq_id);
            table.replace(index, dst);
            copies.push(PageCopy { src, dst });
        }
        while table.len() < target {
            match state.take_free(seq_id) {
                Some(page_id) => table.push(page_id),
                None => break,
            }
        }
        state.tables.insert(seq_id, table);

        if !copies.is_empty() {
            debug!(seq_id, copies = copies.len(), "copy-on-write split");
        }
        Ok(copies)
    }

    /// Shrink `seq_id`'s table to the pages needed for `num_tokens` tokens.
    ///
    /// Returns the number of pages that went back to the free list.
    pub fn trim(&self, seq_id: SequenceId, num_tokens: usize) -> usize {
        let mut state = self.state.lock();
        let keep = pages_needed(num_tokens, self.page_size);
        let Some(table) = state.tables.get_mut(&seq_id) else {
            return 0;
        };
        let dropped = table.split_off(keep);
        dropped
            .into_iter()
            .filter(|&page_id| state.disown(page_id, seq_id))
            .count()
    }

    /// Pages that releasing `seq_id` would return to the free list.
    pub fn reclaimable_pages(&self, seq_id: SequenceId) -> usize {
        let state = self.state.lock();
        state.tables.get(&seq_id).map_or(0, |table| {
            table
                .page_ids()
                .iter()
                .filter(|p| state.pages.get(p).is_some_and(|page| page.ref_count() == 1))
                .count()
        })
    }

    // ========== Pinning ==========

    /// Mark `seq_id` as part of the executing batch.
    pub fn pin(&self, seq_id: SequenceId) {
        self.state.lock().pinned.insert(seq_id);
    }

    /// Clear the batch mark of `seq_id`.
    pub fn unpin(&self, seq_id: SequenceId) {
        self.state.lock().pinned.remove(&seq_id);
    }

    /// Clear every batch mark.
    pub fn unpin_all(&self) {
        self.state.lock().pinned.clear();
    }

    /// Whether `seq_id` is in the executing batch.
    pub fn is_pinned(&self, seq_id: SequenceId) -> bool {
        self.state.lock().pinned.contains(&seq_id)
    }

    // ========== Inspection ==========

    /// Current pool counters.
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats {
            num_pages: self.num_pages,
            free_pages: state.free_list.len(),
            used_pages: state.pages.len(),
            shared_pages: state.pages.values().filter(|p| p.is_shared()).count(),
            sequences: state.tables.len(),
            pinned_sequences: state.pinned.len(),
        }
    }

    /// Check that the free list, owner sets and page tables agree.
    ///
    /// Every page is either free or owned, never both; every owner lists the
    /// page in its table exactly once.
    pub fn is_consistent(&self) -> bool {
        let state = self.state.lock();
        let free: HashSet<PageId> = state.free_list.iter().copied().collect();
        if free.len() != state.free_list.len()
            || free.len() + state.pages.len() != self.num_pages
            || state.pages.keys().any(|p| free.contains(p))
        {
            return false;
        }
        let mut from_tables: HashMap<PageId, Vec<SequenceId>> = HashMap::new();
        for (&seq_id, table) in &state.tables {
            let unique: HashSet<PageId> = table.page_ids().iter().copied().collect();
            if unique.len() != table.len() {
                return false;
            }
            for &page_id in table.page_ids() {
                from_tables.entry(page_id).or_default().push(seq_id);
            }
        }
        from_tables.len() == state.pages.len()
            && state.pages.iter().all(|(page_id, page)| {
                from_tables.get(page_id).is_some_and(|owners| {
                    owners.len() == page.ref_count() && owners.iter().all(|&s| page.is_owned_by(s))
                })
            })
    }

    /// Serializable copy of every page table.
    pub fn snapshot(&self) -> AllocatorSnapshot {
        let state = self.state.lock();
        AllocatorSnapshot {
            page_size: self.page_size,
            num_pages: self.num_pages,
            tables: state
                .tables
                .iter()
                .map(|(&seq_id, table)| (seq_id, table.page_ids().to_vec()))
                .collect(),
        }
    }

    /// Rebuild an allocator from a snapshot.
    pub fn restore(snapshot: &AllocatorSnapshot) -> Result<Self> {
        let allocator = Self::new(snapshot.page_size, snapshot.num_pages);
        {
            let mut state = allocator.state.lock();
            for (&seq_id, page_ids) in &snapshot.tables {
                for &page_id in page_ids {
                    if page_id >= snapshot.num_pages {
                        return Err(Error::Config(format!(
                            "snapshot page {page_id} outside pool of {}",
                            snapshot.num_pages
                        )));
                    }
                    state
                        .pages
                        .entry(page_id)
                        .or_insert_with(|| Page::new(page_id))
                        .add_owner(seq_id);
                }
                state.tables.insert(
                    seq_id,
                    PageTable::from_pages(snapshot.page_size, page_ids.clone()),
                );
            }
            let used: HashSet<PageId> = state.pages.keys().copied().collect();
            state.free_list = (0..snapshot.num_pages).filter(|p| !used.contains(p)).collect();
        }
        Ok(allocator)
    }

    /// Return every page to the free list.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.pages.clear();
        state.tables.clear();
        state.pinned.clear();
        state.free_list = (0..self.num_pages).collect();
    }
}
