//! Request management for dLLM scheduling
//!
//! [`Req`] is the concrete request type driven by the scheduler. It owns the
//! prompt and composes a [`DllmReqState`] once a dLLM config is attached.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::DllmConfig;
use crate::engine::phase::{DllmReqState, DllmRequest, DllmRequestExt};
use crate::TokenId;

/// Global request ID counter
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Status of a request during processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReqStatus {
    /// Request is waiting to be scheduled
    Waiting,
    /// Request is currently being decoded
    Running,
    /// Request has completed generation
    Finished,
    /// Request was dropped after a scheduling error
    Aborted,
}

/// Output from a completed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqOutput {
    pub req_id: u64,
    /// Decoded tokens following the prompt
    pub output_ids: Vec<TokenId>,
    pub num_prompt_tokens: usize,
    pub status: ReqStatus,
}

/// A single diffusion decoding request
#[derive(Debug, Clone)]
pub struct Req {
    /// Unique request identifier
    pub req_id: u64,

    pub status: ReqStatus,

    /// Prompt token IDs (immutable)
    pub origin_input_ids: Vec<TokenId>,

    /// Number of working tokens already held in the KV cache
    pub num_cached_tokens: usize,

    /// Stop after this many decoded tokens
    pub max_new_tokens: usize,

    /// Diffusion scheduling state, present once a config is attached
    dllm: Option<DllmReqState>,
}

impl Req {
    pub fn new(origin_input_ids: Vec<TokenId>, max_new_tokens: usize) -> Self {
        let req_id = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);

        Self {
            req_id,
            status: ReqStatus::Waiting,
            origin_input_ids,
            num_cached_tokens: 0,
            max_new_tokens,
            dllm: None,
        }
    }

    /// Attach a dLLM config, choosing the initial phase from the prompt length
    pub fn init_diffusion_llm(&mut self, config: Arc<DllmConfig>) {
        self.dllm = Some(DllmReqState::new(self.req_id, config, self.origin_input_ids.len()));
    }

    pub fn with_dllm_config(mut self, config: Arc<DllmConfig>) -> Self {
        self.init_diffusion_llm(config);
        self
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.origin_input_ids.len()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, ReqStatus::Finished | ReqStatus::Aborted)
    }

    /// Working-token prefix whose blocks are final
    fn committed_len(&self) -> usize {
        match &self.dllm {
            Some(state) if state.config().is_multi_block() => state.committed_len(),
            _ => self.num_cached_tokens,
        }
    }

    /// Decoded tokens after the prompt that are final
    pub fn output_ids(&self) -> &[TokenId] {
        let tokens = self.fill_ids();
        let end = self.committed_len().min(tokens.len());
        let start = self.num_prompt_tokens().min(end);
        &tokens[start..end]
    }

    /// Advance the cached prefix over fully decoded blocks
    pub fn update_cached_prefix(&mut self) {
        let Some(state) = &self.dllm else {
            return;
        };

        if state.config().is_multi_block() {
            self.num_cached_tokens = state.committed_len();
            return;
        }

        let block_size = state.config().block_size;
        let mask = state.config().mask_token_id;
        let tokens = state.dllm_ids();
        let mut cached = self.num_cached_tokens;
        while cached + block_size <= tokens.len()
            && !tokens[cached..cached + block_size].contains(&mask)
        {
            cached += block_size;
        }
        self.num_cached_tokens = cached;
    }

    /// Check if generation should stop
    pub fn should_stop(&self, eos_token_id: Option<TokenId>) -> bool {
        let output = self.output_ids();

        if output.len() >= self.max_new_tokens {
            return true;
        }

        eos_token_id.is_some_and(|eos| output.contains(&eos))
    }

    /// Create the output for a completed request.
    ///
    /// Tokens past the first EOS or past `max_new_tokens` are dropped.
    pub fn create_output(&self, eos_token_id: Option<TokenId>) -> ReqOutput {
        let mut output_ids = self.output_ids().to_vec();
        if let Some(pos) = eos_token_id.and_then(|eos| output_ids.iter().position(|&t| t == eos)) {
            output_ids.truncate(pos + 1);
        }
        output_ids.truncate(self.max_new_tokens);

        ReqOutput {
            req_id: self.req_id,
            output_ids,
            num_prompt_tokens: self.num_prompt_tokens(),
            status: self.status,
        }
    }
}

impl DllmRequest for Req {
    fn origin_input_ids(&self) -> &[TokenId] {
        &self.origin_input_ids
    }

    fn prefix_len(&self) -> usize {
        self.num_cached_tokens
    }

    fn dllm_state(&self) -> Option<&DllmReqState> {
        self.dllm.as_ref()
    }

    fn dllm_state_mut(&mut self) -> Option<&mut DllmReqState> {
        self.dllm.as_mut()
    }
}

impl std::fmt::Display for Req {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Req(id={}, status={:?}, prompt={}, phase={:?}, cached={})",
            self.req_id,
            self.status,
            self.num_prompt_tokens(),
            self.dllm_phase(),
            self.num_cached_tokens
        )
    }
}
