//! Request phase control for diffusion decoding
//!
//! [`DllmReqState`] is the per-request scheduling state: the working token
//! sequence, the blocks created for it and the sliding window over them. A
//! concrete request type composes one and exposes it through the
//! [`DllmRequest`] capability trait; everything the global step loop calls
//! lives on the blanket [`DllmRequestExt`] trait.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::DllmConfig;
use crate::engine::block::{self, DllmBlock, DllmBlockStatus};
use crate::engine::block_buffer::DllmBlockBuffer;
use crate::error::{DllmError, Result};
use crate::TokenId;

/// Scheduling phase of a diffusion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DllmReqPhase {
    /// A full block of real tokens is ready to submit
    StagingPrefill,
    /// A full block containing placeholders is ready to submit
    StagingDecode,
    /// Still accumulating a full block, starting from a long prompt
    IncomingPrefill,
    /// Still accumulating a full block, starting from a short prompt
    IncomingDecode,
}

impl DllmReqPhase {
    pub fn is_prefill(self) -> bool {
        matches!(self, DllmReqPhase::StagingPrefill | DllmReqPhase::IncomingPrefill)
    }

    pub fn is_staging(self) -> bool {
        matches!(self, DllmReqPhase::StagingPrefill | DllmReqPhase::StagingDecode)
    }
}

/// Per-request diffusion scheduling state
#[derive(Debug, Clone)]
pub struct DllmReqState {
    req_id: u64,
    config: Arc<DllmConfig>,
    phase: DllmReqPhase,

    /// Working tokens: the prompt followed by decoded and masked positions
    dllm_ids: Vec<TokenId>,
    seeded: bool,

    /// Start of the current block in single-block mode
    block_offset: usize,

    /// Every block ever created for the request, indexed by block id
    blocks: Vec<DllmBlock>,
    buffer: Option<DllmBlockBuffer>,
}

impl DllmReqState {
    pub fn new(req_id: u64, config: Arc<DllmConfig>, prompt_len: usize) -> Self {
        let phase = if prompt_len < config.block_size {
            DllmReqPhase::IncomingDecode
        } else {
            DllmReqPhase::IncomingPrefill
        };

        Self {
            req_id,
            config,
            phase,
            dllm_ids: Vec::new(),
            seeded: false,
            block_offset: 0,
            blocks: Vec::new(),
            buffer: None,
        }
    }

    pub fn config(&self) -> &DllmConfig {
        &self.config
    }

    pub fn phase(&self) -> DllmReqPhase {
        self.phase
    }

    pub fn dllm_ids(&self) -> &[TokenId] {
        &self.dllm_ids
    }

    pub fn block_offset(&self) -> usize {
        self.block_offset
    }

    pub fn blocks(&self) -> &[DllmBlock] {
        &self.blocks
    }

    pub fn buffer(&self) -> Option<&DllmBlockBuffer> {
        self.buffer.as_ref()
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Replace the working tokens with the engine's refined output.
    ///
    /// The engine may only rewrite positions, never change the length.
    pub fn update_tokens(&mut self, tokens: Vec<TokenId>) -> Result<()> {
        if tokens.len() != self.dllm_ids.len() {
            return Err(DllmError::invalid_state(format!(
                "request {} expected {} tokens from the engine, got {}",
                self.req_id,
                self.dllm_ids.len(),
                tokens.len()
            )));
        }

        self.dllm_ids = tokens;
        Ok(())
    }

    fn extend_block(&mut self, extend_size: usize) {
        let mask = self.config.mask_token_id;
        self.dllm_ids.extend(std::iter::repeat(mask).take(extend_size));
    }

    /// Seed the working tokens on the first step
    fn seed(&mut self, origin_input_ids: Vec<TokenId>) -> Result<()> {
        self.config.validate()?;

        self.dllm_ids = origin_input_ids;
        self.seeded = true;

        if self.config.is_multi_block() {
            self.init_blocks();
        } else {
            self.extend_block(self.config.block_size);
        }
        Ok(())
    }

    /// Extend the working tokens on every step after the first
    fn advance(&mut self) -> Result<()> {
        if self.config.is_multi_block() {
            self.next_diffusion_step()?;
        } else {
            self.block_offset += self.config.block_size;
            self.extend_block(self.config.block_size);
        }
        Ok(())
    }

    /// Create the prefix blocks, the trailing placeholders and the buffer
    fn init_blocks(&mut self) {
        let block_size = self.config.block_size;
        let buffer_size = self.config.buffer_size;

        let prefix_length = self.dllm_ids.len();
        let padding_length = prefix_length % block_size;
        self.extend_block(padding_length);

        let num_prefix_blocks = self.dllm_ids.len() / block_size;
        for block_id in 0..num_prefix_blocks {
            let status = if block_id + 1 == num_prefix_blocks {
                DllmBlockStatus::Active
            } else {
                DllmBlockStatus::ToCache
            };
            self.blocks.push(DllmBlock::new(
                self.req_id,
                block_id,
                block_size,
                status,
                block_id.checked_sub(1),
            ));
        }

        // A prompt too short for a full block leaves the whole window to placeholders
        let remain_buffer_size = if padding_length > 0 && num_prefix_blocks > 0 {
            buffer_size - 1
        } else {
            buffer_size
        };
        for block_id in num_prefix_blocks..num_prefix_blocks + remain_buffer_size {
            let prev = self.blocks.len().checked_sub(1);
            self.blocks.push(DllmBlock::new(
                self.req_id,
                block_id,
                block_size,
                DllmBlockStatus::Dummy,
                prev,
            ));
        }

        let window_start = self.blocks.len().saturating_sub(buffer_size);
        let slots = (window_start..self.blocks.len()).collect();
        self.buffer = Some(DllmBlockBuffer::new(self.req_id, buffer_size, slots));

        tracing::debug!(
            "Request {}: {} prompt tokens, padding {}, {} prefix blocks, {} placeholder blocks",
            self.req_id,
            prefix_length,
            padding_length,
            num_prefix_blocks,
            remain_buffer_size
        );
    }

    /// Slide the window past cached blocks and open the next block when the
    /// window allows it.
    ///
    /// Returns the id of the block that was activated, if any.
    pub fn next_diffusion_step(&mut self) -> Result<Option<usize>> {
        let req_id = self.req_id;
        let buffer = self.buffer.as_mut().ok_or_else(|| {
            DllmError::invalid_state(format!("request {} has no block buffer", req_id))
        })?;

        while let Some(front) = buffer.front() {
            if !self.blocks[front].is_in_cache() {
                break;
            }

            let last = self.blocks.len() - 1;
            let block_id = self.blocks[last].block_id + 1;
            self.blocks.push(DllmBlock::new(
                self.req_id,
                block_id,
                self.config.block_size,
                DllmBlockStatus::Dummy,
                Some(last),
            ));
            buffer.slide(last + 1);

            tracing::debug!(
                "Request {}: window slid past block {}, appended block {}",
                self.req_id,
                self.blocks[front].block_id,
                block_id
            );
        }

        let mask = self.config.mask_token_id;
        let add_block =
            buffer.should_add_block(&self.blocks, &self.dllm_ids, mask, &self.config.thresholds)
                && !buffer.is_overflow(&self.blocks);

        // Opens the first window block once the block before it is cached
        let bootstrap = buffer.active_blocks(&self.blocks).is_empty()
            && buffer.front().is_some_and(|front| {
                let head = &self.blocks[front];
                head.is_dummy()
                    && head
                        .prev_block
                        .map_or(true, |prev| self.blocks[prev].is_in_cache())
            });

        if !(add_block || bootstrap) {
            return Ok(None);
        }

        let idx = buffer.activate_cursor_block(&mut self.blocks)?;
        let end = self.blocks[idx].end();
        if self.dllm_ids.len() < end {
            self.extend_block(end - self.dllm_ids.len());
        }

        Ok(Some(self.blocks[idx].block_id))
    }

    /// Classify the request from its working tokens
    fn determine_phase(&mut self, prefix_length: usize) {
        if self.config.is_multi_block() {
            self.determine_multi_block_phase();
            return;
        }

        let min_required_length = prefix_length + self.config.block_size;
        if self.dllm_ids.len() < min_required_length {
            // still incoming
            return;
        }

        let input_block = &self.dllm_ids[prefix_length..min_required_length];
        self.phase = if input_block.contains(&self.config.mask_token_id) {
            DllmReqPhase::StagingDecode
        } else {
            DllmReqPhase::StagingPrefill
        };
    }

    fn determine_multi_block_phase(&mut self) {
        let Some(active) = self.blocks.iter().find(|b| b.is_active()) else {
            return;
        };

        let has_mask = active.tokens(&self.dllm_ids).contains(&self.config.mask_token_id);
        self.phase = if has_mask {
            DllmReqPhase::StagingDecode
        } else {
            DllmReqPhase::StagingPrefill
        };
    }

    fn block_mut(&mut self, block_id: usize) -> Result<&mut DllmBlock> {
        let req_id = self.req_id;
        self.blocks
            .get_mut(block_id)
            .ok_or(DllmError::BlockNotFound { req_id, block_id })
    }

    /// Active blocks whose every position holds a real token
    pub fn blocks_ready_to_cache(&self) -> Vec<usize> {
        let mask = self.config.mask_token_id;
        self.blocks
            .iter()
            .filter(|b| b.is_active() && b.is_fully_decoded(&self.dllm_ids, mask))
            .map(|b| b.block_id)
            .collect()
    }

    /// Blocks waiting for the engine's cache write
    pub fn blocks_to_cache(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .filter(|b| b.is_to_cache())
            .map(|b| b.block_id)
            .collect()
    }

    /// Finish refinement of an active block
    pub fn mark_block_to_cache(&mut self, block_id: usize) -> Result<()> {
        let target = self.block_mut(block_id)?;
        target.status = block::mark_to_cache(block_id, target.status)?;
        Ok(())
    }

    /// Record that the cache write for a block completed
    pub fn commit_block_cache(&mut self, block_id: usize) -> Result<u64> {
        let status = self.block_mut(block_id)?.status;
        let status = block::commit_cache(block_id, status)?;

        let target = &self.blocks[block_id];
        let prefix_hash = target.prev_block.and_then(|prev| self.blocks[prev].hash);
        let hash = DllmBlock::compute_hash(target.tokens(&self.dllm_ids), prefix_hash);

        let target = &mut self.blocks[block_id];
        target.status = status;
        target.hash = Some(hash);

        tracing::debug!("Request {}: block {} committed to cache", self.req_id, block_id);
        Ok(hash)
    }

    /// Length of the working-token prefix covered by consecutive cached blocks
    pub fn committed_len(&self) -> usize {
        self.blocks
            .iter()
            .take_while(|b| b.is_in_cache())
            .last()
            .map_or(0, DllmBlock::end)
    }
}

/// What the phase controller needs from a request
pub trait DllmRequest {
    /// The immutable prompt
    fn origin_input_ids(&self) -> &[TokenId];

    /// Length of the prefix already held in the KV cache
    fn prefix_len(&self) -> usize;

    /// Diffusion state; `None` until a dLLM config is attached
    fn dllm_state(&self) -> Option<&DllmReqState>;

    fn dllm_state_mut(&mut self) -> Option<&mut DllmReqState>;
}

fn not_attached() -> DllmError {
    DllmError::invalid_state("dllm config is not set")
}

/// Phase control operations available on every [`DllmRequest`]
pub trait DllmRequestExt: DllmRequest {
    fn is_dllm(&self) -> bool {
        self.dllm_state().is_some()
    }

    fn is_multi_block_dllm(&self) -> Result<bool> {
        self.dllm_state()
            .map(|state| state.config().is_multi_block())
            .ok_or_else(not_attached)
    }

    fn is_dllm_prefill(&self) -> bool {
        self.dllm_state().is_some_and(|state| state.phase().is_prefill())
    }

    fn dllm_phase(&self) -> Option<DllmReqPhase> {
        self.dllm_state().map(DllmReqState::phase)
    }

    /// Tokens to submit for the next forward pass
    fn fill_ids(&self) -> &[TokenId] {
        self.dllm_state().map(DllmReqState::dllm_ids).unwrap_or(&[])
    }

    fn determine_dllm_phase(&mut self) -> Result<()> {
        let prefix_length = self.prefix_len();
        let state = self.dllm_state_mut().ok_or_else(not_attached)?;
        state.determine_phase(prefix_length);
        Ok(())
    }

    /// Prepare the working tokens for the next forward pass
    fn init_fill_ids_for_dllm(&mut self) -> Result<()> {
        let seeded = self.dllm_state().ok_or_else(not_attached)?.is_seeded();

        if seeded {
            self.dllm_state_mut().ok_or_else(not_attached)?.advance()
        } else {
            let origin_input_ids = self.origin_input_ids().to_vec();
            self.dllm_state_mut().ok_or_else(not_attached)?.seed(origin_input_ids)
        }
    }
}

impl<R: DllmRequest + ?Sized> DllmRequestExt for R {}
