//! Paged token store used by the toy executors as their KV cache.
//!
//! Real executors keep key/value tensors per slot; the toys keep the token
//! id that was written there. Reading a position back through a page table
//! is enough to catch stale pages, missing copies and writes into the wrong
//! page.

use crate::core::page::{PageCopy, PageTable};
use crate::error::{Error, Result};
use crate::model::{ExecutorBatch, SequenceInput};

/// Slot-addressed cache of token ids.
#[derive(Debug, Clone)]
pub struct PagedSlotStore {
    page_size: usize,
    slots: Vec<Option<u32>>,
}

impl PagedSlotStore {
    /// Create a store of `num_pages` empty pages.
    pub fn new(page_size: usize, num_pages: usize) -> Self {
        Self {
            page_size,
            slots: vec![None; page_size * num_pages],
        }
    }

    /// Tokens per page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages in the store.
    pub fn num_pages(&self) -> usize {
        self.slots.len() / self.page_size
    }

    /// Apply copy-on-write page copies.
    pub fn apply_copies(&mut self, copies: &[PageCopy]) -> Result<()> {
        for copy in copies {
            let src = self.page_range(copy.src)?;
            let dst = self.page_range(copy.dst)?;
            self.slots.copy_within(src, dst.start);
        }
        Ok(())
    }

    /// Store `token` in `slot`.
    pub fn write(&mut self, slot: usize, token: u32) -> Result<()> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| Error::ExecutorFault(format!("slot {slot} outside the cache")))?;
        *entry = Some(token);
        Ok(())
    }

    /// Token stored at `position` of the sequence owning `table`.
    pub fn read(&self, table: &PageTable, position: usize) -> Result<u32> {
        let slot = table.slot(position).ok_or_else(|| {
            Error::ExecutorFault(format!("no page for position {position}"))
        })?;
        self.slots.get(slot).copied().flatten().ok_or_else(|| {
            Error::ExecutorFault(format!(
                "position {position} (slot {slot}) read before it was written"
            ))
        })
    }

    /// Apply the batch's copies and write every fed token.
    ///
    /// Returns the slots written, per input.
    pub fn ingest(&mut self, batch: &ExecutorBatch, vocab_size: usize) -> Result<Vec<Vec<usize>>> {
        self.apply_copies(&batch.copies)?;
        let mut writes = Vec::with_capacity(batch.inputs.len());
        for input in &batch.inputs {
            for (&slot, &token) in input.slot_mapping.iter().zip(&input.token_ids) {
                if token as usize >= vocab_size {
                    return Err(Error::ExecutorFault(format!(
                        "token {token} outside vocabulary of {vocab_size}"
                    )));
                }
                self.write(slot, token)?;
            }
            writes.push(input.slot_mapping.clone());
        }
        Ok(writes)
    }

    /// Current and previous token of every fed position, read back from
    /// the cache.
    pub fn context(&self, input: &SequenceInput) -> Result<(Vec<u32>, Vec<Option<u32>>)> {
        let mut current = Vec::with_capacity(input.len());
        let mut previous = Vec::with_capacity(input.len());
        for &position in &input.positions {
            current.push(self.read(&input.page_table, position)?);
            previous.push(match position {
                0 => None,
                p => Some(self.read(&input.page_table, p - 1)?),
            });
        }
        Ok((current, previous))
    }

    fn page_range(&self, page_id: usize) -> Result<std::ops::Range<usize>> {
        let start = page_id * self.page_size;
        if start + self.page_size > self.slots.len() {
            return Err(Error::ExecutorFault(format!(
                "page {page_id} outside the cache"
            )));
        }
        Ok(start..start + self.page_size)
    }
}
