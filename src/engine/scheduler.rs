//! Scheduler for diffusion decoding steps
//!
//! The scheduler owns the request queues and drives one decode step at a
//! time: it prepares every running request's fill ids, classifies its phase,
//! and groups the requests into a prefill and a decode batch. After the model
//! engine has refined the submitted tokens, [`Scheduler::postprocess`] writes
//! them back and moves finished blocks through the cache states.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::DllmConfig;
use crate::engine::phase::{DllmReqPhase, DllmRequest, DllmRequestExt};
use crate::engine::request::{Req, ReqOutput, ReqStatus};
use crate::error::{DllmError, Result};
use crate::TokenId;

/// One request scheduled for the next forward pass
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledReq {
    pub req_id: u64,
    pub phase: DllmReqPhase,
    /// Whole working token sequence to submit
    pub fill_ids: Vec<TokenId>,
}

/// Requests of one step, grouped by phase
#[derive(Debug, Clone, Default)]
pub struct ScheduledBatch {
    pub prefill: Vec<ScheduledReq>,
    pub decode: Vec<ScheduledReq>,
}

impl ScheduledBatch {
    pub fn is_empty(&self) -> bool {
        self.prefill.is_empty() && self.decode.is_empty()
    }

    pub fn len(&self) -> usize {
        self.prefill.len() + self.decode.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduledReq> {
        self.prefill.iter().chain(self.decode.iter())
    }
}

/// Refined tokens for one request, produced by the model engine
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub req_id: u64,
    pub token_ids: Vec<TokenId>,
}

/// Statistics about scheduler activity
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Total number of requests added
    pub total_requests: usize,

    pub waiting_requests: usize,

    pub running_requests: usize,

    pub finished_requests: usize,

    /// Requests dropped after a scheduling error
    pub aborted_requests: usize,

    pub steps: usize,

    /// Requests scheduled in a prefill phase, summed over all steps
    pub prefill_scheduled: usize,

    /// Requests scheduled in a decode phase, summed over all steps
    pub decode_scheduled: usize,

    /// Blocks committed to the cache
    pub committed_blocks: usize,
}

impl SchedulerStats {
    /// Get completion rate
    pub fn completion_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.finished_requests as f64 / self.total_requests as f64
        }
    }

    /// Average number of requests per step
    pub fn avg_batch_size(&self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            (self.prefill_scheduled + self.decode_scheduled) as f64 / self.steps as f64
        }
    }
}

/// Scheduler for diffusion requests
#[derive(Debug)]
pub struct Scheduler {
    config: Arc<DllmConfig>,

    /// End-of-sequence token ID
    eos_token_id: Option<TokenId>,

    /// Queue of requests waiting to be admitted
    waiting: VecDeque<Req>,

    /// Requests currently being decoded
    running: VecDeque<Req>,

    stats: SchedulerStats,
}

impl Scheduler {
    /// Create a scheduler, rejecting a config that cannot form blocks
    pub fn new(config: Arc<DllmConfig>, eos_token_id: Option<TokenId>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            eos_token_id,
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            stats: SchedulerStats::default(),
        })
    }

    pub fn config(&self) -> &DllmConfig {
        &self.config
    }

    /// Check if all requests are finished
    pub fn is_finished(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }

    /// Queue a request, attaching the scheduler's config if it has none
    pub fn add_request(&mut self, mut req: Req) -> u64 {
        if !req.is_dllm() {
            req.init_diffusion_llm(self.config.clone());
        }
        req.status = ReqStatus::Waiting;

        let req_id = req.req_id;
        self.waiting.push_back(req);
        self.stats.total_requests += 1;
        self.update_stats();
        req_id
    }

    /// Prepare the next step
    pub fn schedule(&mut self) -> ScheduledBatch {
        while self.running.len() < self.config.max_running_requests {
            let Some(mut req) = self.waiting.pop_front() else {
                break;
            };
            req.status = ReqStatus::Running;
            tracing::debug!("Admitted {}", req);
            self.running.push_back(req);
        }

        let mut batch = ScheduledBatch::default();
        let mut aborted = Vec::new();

        for req in self.running.iter_mut() {
            if let Err(e) = Self::prepare(req) {
                tracing::warn!("Request {} failed to prepare: {}", req.req_id, e);
                aborted.push(req.req_id);
                continue;
            }

            let Some(phase) = req.dllm_phase().filter(|phase| phase.is_staging()) else {
                continue;
            };

            let scheduled = ScheduledReq {
                req_id: req.req_id,
                phase,
                fill_ids: req.fill_ids().to_vec(),
            };
            if req.is_dllm_prefill() {
                batch.prefill.push(scheduled);
            } else {
                batch.decode.push(scheduled);
            }
        }

        for req_id in aborted {
            self.abort(req_id);
        }

        if !batch.is_empty() {
            self.stats.steps += 1;
            self.stats.prefill_scheduled += batch.prefill.len();
            self.stats.decode_scheduled += batch.decode.len();
        }

        tracing::debug!(
            "Scheduled step: {} prefill, {} decode",
            batch.prefill.len(),
            batch.decode.len()
        );
        self.update_stats();
        batch
    }

    fn prepare(req: &mut Req) -> Result<()> {
        req.init_fill_ids_for_dllm()?;
        req.determine_dllm_phase()
    }

    /// Apply the engine's output and collect finished requests
    pub fn postprocess(&mut self, outputs: Vec<StepOutput>) -> Vec<ReqOutput> {
        let mut finished = Vec::new();

        for output in outputs {
            let Some(pos) = self.running.iter().position(|r| r.req_id == output.req_id) else {
                tracing::warn!("Output for unknown request {}", output.req_id);
                continue;
            };

            let req = &mut self.running[pos];
            match Self::apply_output(req, output.token_ids) {
                Ok(committed) => self.stats.committed_blocks += committed,
                Err(e) => {
                    tracing::warn!("Request {} failed to apply output: {}", req.req_id, e);
                    if let Some(out) = self.abort(output.req_id) {
                        finished.push(out);
                    }
                    continue;
                }
            }

            if !req.should_stop(self.eos_token_id) {
                continue;
            }

            if let Some(mut req) = self.running.remove(pos) {
                req.status = ReqStatus::Finished;
                self.stats.finished_requests += 1;
                tracing::debug!("Finished {}", req);
                finished.push(req.create_output(self.eos_token_id));
            }
        }

        self.update_stats();
        finished
    }

    /// Write refined tokens back and move decoded blocks into the cache.
    ///
    /// Returns the number of blocks committed.
    fn apply_output(req: &mut Req, token_ids: Vec<TokenId>) -> Result<usize> {
        let multi_block = req.is_multi_block_dllm()?;
        let state = req
            .dllm_state_mut()
            .ok_or_else(|| DllmError::invalid_state("dllm config is not set"))?;
        state.update_tokens(token_ids)?;

        let mut committed = 0;
        if multi_block {
            for block_id in state.blocks_ready_to_cache() {
                state.mark_block_to_cache(block_id)?;
            }
            for block_id in state.blocks_to_cache() {
                state.commit_block_cache(block_id)?;
                committed += 1;
            }
        }

        req.update_cached_prefix();
        Ok(committed)
    }

    fn abort(&mut self, req_id: u64) -> Option<ReqOutput> {
        let pos = self.running.iter().position(|r| r.req_id == req_id)?;
        let mut req = self.running.remove(pos)?;
        req.status = ReqStatus::Aborted;
        self.stats.aborted_requests += 1;
        Some(req.create_output(self.eos_token_id))
    }

    fn update_stats(&mut self) {
        self.stats.waiting_requests = self.waiting.len();
        self.stats.running_requests = self.running.len();
    }

    /// Get current scheduler statistics
    pub fn get_stats(&self) -> SchedulerStats {
        self.stats.clone()
    }

    /// Get the number of requests in each queue
    pub fn get_queue_lengths(&self) -> (usize, usize) {
        (self.waiting.len(), self.running.len())
    }

    /// Look up a running request
    pub fn running_request(&self, req_id: u64) -> Option<&Req> {
        self.running.iter().find(|r| r.req_id == req_id)
    }
}
