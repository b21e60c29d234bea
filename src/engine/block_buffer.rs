//! Sliding window of in-flight blocks
//!
//! The buffer holds indices into its request's block list rather than the
//! blocks themselves, so every query takes that list as an argument. Valid
//! blocks always form a prefix of the window; the first dummy slot is the
//! cursor, the next block eligible for activation.

use crate::engine::block::{self, DllmBlock};
use crate::engine::thresholds::MultiBlockThresholds;
use crate::error::{DllmError, Result};
use crate::TokenId;

/// Bounded, ordered window over a request's blocks
#[derive(Debug, Clone, PartialEq)]
pub struct DllmBlockBuffer {
    /// Id of the owning request
    req_id: u64,

    /// Window capacity
    buffer_size: usize,

    /// Indices into the request's block list, ascending block id
    slots: Vec<usize>,
}

impl DllmBlockBuffer {
    /// Create a buffer over the given block indices
    pub fn new(req_id: u64, buffer_size: usize, slots: Vec<usize>) -> Self {
        assert!(buffer_size > 0, "Buffer size must be positive");

        Self {
            req_id,
            buffer_size,
            slots,
        }
    }

    pub fn req_id(&self) -> u64 {
        self.req_id
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Block indices currently in the window
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Index of the first block in the window
    pub fn front(&self) -> Option<usize> {
        self.slots.first().copied()
    }

    fn filter_slots<F>(&self, blocks: &[DllmBlock], pred: F) -> Vec<usize>
    where
        F: Fn(&DllmBlock) -> bool,
    {
        self.slots
            .iter()
            .copied()
            .filter(|&idx| pred(&blocks[idx]))
            .collect()
    }

    /// Blocks in the window that are not placeholders
    pub fn valid_blocks(&self, blocks: &[DllmBlock]) -> Vec<usize> {
        self.filter_slots(blocks, DllmBlock::is_valid)
    }

    pub fn dummy_blocks(&self, blocks: &[DllmBlock]) -> Vec<usize> {
        self.filter_slots(blocks, DllmBlock::is_dummy)
    }

    pub fn active_blocks(&self, blocks: &[DllmBlock]) -> Vec<usize> {
        self.filter_slots(blocks, DllmBlock::is_active)
    }

    /// Slot position of the next block eligible for activation
    pub fn cursor_slot_index(&self, blocks: &[DllmBlock]) -> usize {
        self.slots.iter().filter(|&&idx| blocks[idx].is_valid()).count()
    }

    /// Block index under the cursor
    pub fn cursor_block(&self, blocks: &[DllmBlock]) -> Result<usize> {
        self.slots
            .get(self.cursor_slot_index(blocks))
            .copied()
            .ok_or(DllmError::CursorOutOfRange {
                req_id: self.req_id,
                buffer_size: self.buffer_size,
            })
    }

    /// Turn the cursor block from a placeholder into the active block.
    ///
    /// Returns the index of the activated block.
    pub fn activate_cursor_block(&self, blocks: &mut [DllmBlock]) -> Result<usize> {
        let idx = self.cursor_block(blocks)?;
        let target = &mut blocks[idx];
        target.status = block::activate(target.block_id, target.status)?;

        tracing::debug!("Activated block {} of request {}", target.block_id, self.req_id);
        Ok(idx)
    }

    /// Whether the cursor block is active and far enough along to open the
    /// next one
    pub fn should_add_block(
        &self,
        blocks: &[DllmBlock],
        tokens: &[TokenId],
        mask_token_id: TokenId,
        thresholds: &MultiBlockThresholds,
    ) -> bool {
        match self.cursor_block(blocks) {
            Ok(idx) => {
                let cursor = &blocks[idx];
                cursor.is_active() && cursor.should_add_block(tokens, mask_token_id, thresholds)
            }
            Err(_) => false,
        }
    }

    /// More blocks are active than the window can hold
    pub fn is_overflow(&self, blocks: &[DllmBlock]) -> bool {
        self.active_blocks(blocks).len() > self.buffer_size
    }

    /// Replace the last slot. Half of a window slide; see [`Self::slide`].
    pub fn push_back(&mut self, block_idx: usize) {
        match self.slots.last_mut() {
            Some(last) => *last = block_idx,
            None => self.slots.push(block_idx),
        }
    }

    /// Shift every slot one step towards the front. The last slot is left
    /// duplicated until the next [`Self::push_back`].
    pub fn pop_front(&mut self) {
        if self.slots.len() > 1 {
            self.slots.rotate_left(1);
            let n = self.slots.len();
            self.slots[n - 1] = self.slots[n - 2];
        }
    }

    /// Drop the front block from the window and append `block_idx`
    pub fn slide(&mut self, block_idx: usize) {
        self.pop_front();
        self.push_back(block_idx);
    }
}
