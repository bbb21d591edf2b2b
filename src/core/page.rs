//! Page abstractions for the paged KV cache.
//!
//! The cache is split into fixed-size pages, the way an operating system
//! splits memory. A sequence sees a contiguous run of positions; its page
//! table maps each run of `page_size` positions to a physical page anywhere
//! in the pool.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::sequence::SequenceId;

/// Physical page index inside the pool.
pub type PageId = usize;

/// Default page size (tokens per page).
pub const DEFAULT_PAGE_SIZE: usize = 16;

/// Number of pages needed to hold `num_tokens` tokens.
///
/// # Example
///
/// ```
/// use nano_serve::core::page::pages_needed;
///
/// assert_eq!(pages_needed(0, 16), 0);
/// assert_eq!(pages_needed(16, 16), 1);
/// assert_eq!(pages_needed(17, 16), 2);
/// ```
pub fn pages_needed(num_tokens: usize, page_size: usize) -> usize {
    num_tokens.div_ceil(page_size)
}

/// A fixed-size page of KV cache memory and the sequences that read it.
///
/// The owner count is the reference count: a page with more than one owner
/// is shared and must be copied before any owner writes into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    page_id: PageId,
    owners: BTreeSet<SequenceId>,
}

impl Page {
    /// Create an unowned page.
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            owners: BTreeSet::new(),
        }
    }

    /// Get the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Number of sequences referencing this page.
    pub fn ref_count(&self) -> usize {
        self.owners.len()
    }

    /// True when more than one sequence references the page.
    pub fn is_shared(&self) -> bool {
        self.owners.len() > 1
    }

    /// Whether `seq_id` references the page.
    pub fn is_owned_by(&self, seq_id: SequenceId) -> bool {
        self.owners.contains(&seq_id)
    }

    /// Iterate over the owning sequences.
    pub fn owners(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.owners.iter().copied()
    }

    pub(crate) fn add_owner(&mut self, seq_id: SequenceId) {
        self.owners.insert(seq_id);
    }

    /// Drop an owner and return the remaining reference count.
    pub(crate) fn remove_owner(&mut self, seq_id: SequenceId) -> usize {
        self.owners.remove(&seq_id);
        self.owners.len()
    }
}

/// A page granted to a sequence, at its logical position in the page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHandle {
    /// Physical page.
    pub page_id: PageId,
    /// Index of the page in the owner's page table.
    pub logical_index: usize,
}

/// A page copy the executor must perform before the batch runs.
///
/// Emitted by copy-on-write splits: `dst` is a fresh private page that must
/// hold the contents of the shared page `src`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCopy {
    /// Shared source page.
    pub src: PageId,
    /// Private destination page.
    pub dst: PageId,
}

/// Maps a sequence's logical positions to physical pages.
///
/// Token at position `p` lives in logical page `p / page_size`, at offset
/// `p % page_size`, inside physical page `page_ids[p / page_size]`.
///
/// # Example
///
/// ```
/// use nano_serve::core::page::PageTable;
///
/// let table = PageTable::from_pages(4, vec![7, 2]);
/// assert_eq!(table.slot(5), Some(2 * 4 + 1));
/// assert_eq!(table.slot(8), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTable {
    page_ids: Vec<PageId>,
    page_size: usize,
}

impl PageTable {
    /// Create an empty page table.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_ids: Vec::new(),
            page_size,
        }
    }

    /// Create a table from physical pages in logical order.
    pub fn from_pages(page_size: usize, page_ids: Vec<PageId>) -> Self {
        Self {
            page_ids,
            page_size,
        }
    }

    /// Tokens per page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Physical pages in logical order.
    pub fn page_ids(&self) -> &[PageId] {
        &self.page_ids
    }

    /// Number of pages in the table.
    pub fn len(&self) -> usize {
        self.page_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.page_ids.is_empty()
    }

    /// Positions the table can hold.
    pub fn capacity(&self) -> usize {
        self.page_ids.len() * self.page_size
    }

    /// Physical page holding logical page `index`.
    pub fn page_id(&self, index: usize) -> Option<PageId> {
        self.page_ids.get(index).copied()
    }

    /// Physical slot of `position`, if a page covers it.
    pub fn slot(&self, position: usize) -> Option<usize> {
        let page_id = self.page_id(position / self.page_size)?;
        Some(page_id * self.page_size + position % self.page_size)
    }

    /// Physical slots for `len` consecutive positions starting at `start`.
    pub fn slot_mapping(&self, start: usize, len: usize) -> Option<Vec<usize>> {
        (start..start + len).map(|p| self.slot(p)).collect()
    }

    pub(crate) fn push(&mut self, page_id: PageId) {
        self.page_ids.push(page_id);
    }

    pub(crate) fn replace(&mut self, index: usize, page_id: PageId) {
        self.page_ids[index] = page_id;
    }

    /// Keep the first `num_pages` pages and return the rest.
    pub(crate) fn split_off(&mut self, num_pages: usize) -> Vec<PageId> {
        if num_pages >= self.page_ids.len() {
            return Vec::new();
        }
        self.page_ids.split_off(num_pages)
    }

    pub(crate) fn take_all(&mut self) -> Vec<PageId> {
        std::mem::take(&mut self.page_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_owners() {
        let mut page = Page::new(3);
        assert_eq!(page.ref_count(), 0);

        page.add_owner(1);
        page.add_owner(2);
        page.add_owner(2);
        assert_eq!(page.ref_count(), 2);
        assert!(page.is_shared());
        assert!(page.is_owned_by(1));

        assert_eq!(page.remove_owner(1), 1);
        assert!(!page.is_shared());
        assert_eq!(page.owners().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_slot_mapping() {
        let table = PageTable::from_pages(4, vec![5, 1]);
        assert_eq!(table.capacity(), 8);
        assert_eq!(table.slot_mapping(2, 4), Some(vec![22, 23, 4, 5]));
        assert_eq!(table.slot_mapping(6, 3), None);
    }

    #[test]
    fn test_split_off() {
        let mut table = PageTable::from_pages(4, vec![5, 1, 9]);
        assert_eq!(table.split_off(1), vec![1, 9]);
        assert_eq!(table.page_ids(), &[5]);
        assert!(table.split_off(3).is_empty());
        assert_eq!(table.take_all(), vec![5]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_pages_needed() {
        assert_eq!(pages_needed(1, 4), 1);
        assert_eq!(pages_needed(8, 4), 2);
        assert_eq!(pages_needed(9, 4), 3);
    }
}
