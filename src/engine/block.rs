//! Decode blocks for diffusion LLM scheduling
//!
//! A block is a fixed-size, contiguous range of a request's working tokens.
//! It stores only its geometry and status; progress is always recomputed from
//! the token slice handed in by the owning request.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::engine::thresholds::MultiBlockThresholds;
use crate::error::{DllmError, Result};
use crate::TokenId;

/// Life-cycle status of a decode block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DllmBlockStatus {
    /// Placeholder, not yet part of the generation range
    Dummy,
    /// Currently being refined
    Active,
    /// Refinement finished, waiting for the cache write
    ToCache,
    /// Frozen and reused as static context
    InCache,
}

impl DllmBlockStatus {
    /// Whether the block is part of the request's logical range
    pub fn is_valid(self) -> bool {
        self != DllmBlockStatus::Dummy
    }
}

/// Check and apply a status change.
///
/// The only legal moves are `Dummy -> Active -> ToCache -> InCache`.
pub fn transition(
    block_id: usize,
    from: DllmBlockStatus,
    to: DllmBlockStatus,
) -> Result<DllmBlockStatus> {
    use DllmBlockStatus::*;

    match (from, to) {
        (Dummy, Active) | (Active, ToCache) | (ToCache, InCache) => Ok(to),
        _ => Err(DllmError::InvalidTransition { block_id, from, to }),
    }
}

pub fn activate(block_id: usize, from: DllmBlockStatus) -> Result<DllmBlockStatus> {
    transition(block_id, from, DllmBlockStatus::Active)
}

pub fn mark_to_cache(block_id: usize, from: DllmBlockStatus) -> Result<DllmBlockStatus> {
    transition(block_id, from, DllmBlockStatus::ToCache)
}

pub fn commit_cache(block_id: usize, from: DllmBlockStatus) -> Result<DllmBlockStatus> {
    transition(block_id, from, DllmBlockStatus::InCache)
}

/// One block of a request's working token sequence
#[derive(Debug, Clone, PartialEq)]
pub struct DllmBlock {
    /// Id of the owning request
    pub req_id: u64,

    /// Zero-based position of the block within the request
    pub block_id: usize,

    /// Number of tokens in the block
    pub block_size: usize,

    /// Current life-cycle status
    pub status: DllmBlockStatus,

    /// Index of the preceding block in the request's block list
    pub prev_block: Option<usize>,

    /// Content hash, set once the block is committed to the cache
    pub hash: Option<u64>,
}

impl DllmBlock {
    pub fn new(
        req_id: u64,
        block_id: usize,
        block_size: usize,
        status: DllmBlockStatus,
        prev_block: Option<usize>,
    ) -> Self {
        assert!(block_size > 0, "Block size must be positive");

        Self {
            req_id,
            block_id,
            block_size,
            status,
            prev_block,
            hash: None,
        }
    }

    /// First token position covered by the block
    pub fn start(&self) -> usize {
        self.block_id * self.block_size
    }

    /// One past the last token position covered by the block
    pub fn end(&self) -> usize {
        (self.block_id + 1) * self.block_size
    }

    /// The part of `tokens` this block covers. May be shorter than the block
    /// when the working sequence has not been extended that far yet.
    pub fn tokens<'a>(&self, tokens: &'a [TokenId]) -> &'a [TokenId] {
        let end = self.end().min(tokens.len());
        let start = self.start().min(end);
        &tokens[start..end]
    }

    /// Fraction of the block still holding the mask token.
    ///
    /// Decreases towards 0 as decoding proceeds.
    pub fn decode_progress(&self, tokens: &[TokenId], mask_token_id: TokenId) -> f64 {
        let masked = self
            .tokens(tokens)
            .iter()
            .filter(|&&t| t == mask_token_id)
            .count();
        masked as f64 / self.block_size as f64
    }

    pub fn should_add_block(
        &self,
        tokens: &[TokenId],
        mask_token_id: TokenId,
        thresholds: &MultiBlockThresholds,
    ) -> bool {
        self.decode_progress(tokens, mask_token_id) >= thresholds.add_block_threshold
    }

    pub fn is_semi_complete(
        &self,
        tokens: &[TokenId],
        mask_token_id: TokenId,
        thresholds: &MultiBlockThresholds,
    ) -> bool {
        self.decode_progress(tokens, mask_token_id) >= thresholds.semi_complete_threshold
    }

    /// Whether every position of the block exists and holds a real token
    pub fn is_fully_decoded(&self, tokens: &[TokenId], mask_token_id: TokenId) -> bool {
        let block_tokens = self.tokens(tokens);
        block_tokens.len() == self.block_size && !block_tokens.contains(&mask_token_id)
    }

    pub fn is_dummy(&self) -> bool {
        self.status == DllmBlockStatus::Dummy
    }

    pub fn is_active(&self) -> bool {
        self.status == DllmBlockStatus::Active
    }

    pub fn is_to_cache(&self) -> bool {
        self.status == DllmBlockStatus::ToCache
    }

    pub fn is_in_cache(&self) -> bool {
        self.status == DllmBlockStatus::InCache
    }

    pub fn is_valid(&self) -> bool {
        self.status.is_valid()
    }

    /// Compute the cache key for a block's tokens, chained on the previous
    /// block's key
    pub fn compute_hash(token_ids: &[TokenId], prefix_hash: Option<u64>) -> u64 {
        let mut data = Vec::with_capacity(8 * (token_ids.len() + 1));

        if let Some(prefix) = prefix_hash {
            data.extend_from_slice(&prefix.to_le_bytes());
        }

        for &token_id in token_ids {
            data.extend_from_slice(&token_id.to_le_bytes());
        }

        xxh64(&data, 0)
    }
}

impl std::fmt::Display for DllmBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DllmBlock(req={}, id={}, range={}..{}, status={:?})",
            self.req_id,
            self.block_id,
            self.start(),
            self.end(),
            self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const MASK: TokenId = -1;

    #[test]
    fn test_block_geometry() {
        for block_id in 0..5 {
            let block = DllmBlock::new(0, block_id, 4, DllmBlockStatus::Dummy, None);
            assert_eq!(block.start(), block_id * 4);
            assert_eq!(block.end() - block.start(), 4);
        }
    }

    #[test]
    fn test_decode_progress_counts_masks() {
        let tokens = vec![1, 2, 3, 4, 5, MASK, MASK, MASK];
        let first = DllmBlock::new(0, 0, 4, DllmBlockStatus::InCache, None);
        let second = DllmBlock::new(0, 1, 4, DllmBlockStatus::Active, Some(0));

        assert_relative_eq!(first.decode_progress(&tokens, MASK), 0.0);
        assert_relative_eq!(second.decode_progress(&tokens, MASK), 0.75);
    }

    #[test]
    fn test_progress_beyond_working_tokens() {
        let tokens = vec![1, 2, MASK];
        let block = DllmBlock::new(0, 0, 4, DllmBlockStatus::Active, None);
        let far = DllmBlock::new(0, 3, 4, DllmBlockStatus::Dummy, Some(2));

        assert_relative_eq!(block.decode_progress(&tokens, MASK), 0.25);
        assert_relative_eq!(far.decode_progress(&tokens, MASK), 0.0);
        assert!(!block.is_fully_decoded(&tokens, MASK));
        assert!(!far.is_fully_decoded(&tokens, MASK));
    }

    #[test]
    fn test_threshold_predicates() {
        let thresholds = MultiBlockThresholds::default();
        let block = DllmBlock::new(0, 0, 4, DllmBlockStatus::Active, None);

        let half_masked = vec![1, 2, MASK, MASK];
        assert!(block.should_add_block(&half_masked, MASK, &thresholds));
        assert!(!block.is_semi_complete(&half_masked, MASK, &thresholds));

        let all_masked = vec![MASK; 4];
        assert!(block.is_semi_complete(&all_masked, MASK, &thresholds));

        let decoded = vec![1, 2, 3, 4];
        assert!(!block.should_add_block(&decoded, MASK, &thresholds));
        assert!(block.is_fully_decoded(&decoded, MASK));
    }

    #[test]
    fn test_legal_transitions() {
        use DllmBlockStatus::*;

        let status = activate(0, Dummy).unwrap();
        assert_eq!(status, Active);
        let status = mark_to_cache(0, status).unwrap();
        assert_eq!(status, ToCache);
        let status = commit_cache(0, status).unwrap();
        assert_eq!(status, InCache);
    }

    #[test]
    fn test_illegal_transitions() {
        use DllmBlockStatus::*;

        assert!(activate(3, Active).is_err());
        assert!(activate(3, InCache).is_err());
        assert!(mark_to_cache(3, Dummy).is_err());
        assert!(commit_cache(3, Active).is_err());
        assert_eq!(
            transition(3, InCache, Dummy),
            Err(DllmError::InvalidTransition { block_id: 3, from: InCache, to: Dummy })
        );
    }

    #[test]
    fn test_hash_chaining() {
        let tokens = vec![1, 2, 3, 4];
        let hash1 = DllmBlock::compute_hash(&tokens, None);
        let hash2 = DllmBlock::compute_hash(&tokens, None);
        let chained = DllmBlock::compute_hash(&tokens, Some(hash1));

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, chained);
    }
}
