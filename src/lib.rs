//! # Nano-dLLM Rust
//!
//! Block scheduling for diffusion language models, built in the style of
//! nano-vLLM.
//!
//! A diffusion LLM decodes in fixed-size blocks: a block is filled with mask
//! tokens and refined over several forward passes. This crate decides, per
//! request and per step, which block is being refined, when a block is frozen
//! into the cache, and when the next block opens inside a bounded window.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use nano_dllm_rs::{DllmAlgorithm, DllmConfig, Req, Scheduler, StepOutput};
//!
//! let config = Arc::new(DllmConfig::new(DllmAlgorithm::LowConfidenceMultiBlock, 4, 1, -1));
//! let mut scheduler = Scheduler::new(config, None).unwrap();
//! scheduler.add_request(Req::new(vec![11, 12, 13, 14, 15, 16], 8));
//!
//! let batch = scheduler.schedule();
//! let outputs: Vec<StepOutput> = batch
//!     .iter()
//!     .map(|s| StepOutput {
//!         req_id: s.req_id,
//!         token_ids: s.fill_ids.iter().map(|&t| if t == -1 { 0 } else { t }).collect(),
//!     })
//!     .collect();
//! scheduler.postprocess(outputs);
//! ```

pub mod config;
pub mod engine;
pub mod error;

/// Token id as produced by the tokenizer
pub type TokenId = i64;

// Re-export main types for convenience
pub use config::{DllmAlgorithm, DllmArgs, DllmConfig};
pub use engine::{
    DllmBlock, DllmBlockBuffer, DllmBlockStatus, DllmReqPhase, DllmReqState, DllmRequest,
    DllmRequestExt, MultiBlockThresholds, Req, ReqOutput, ReqStatus, ScheduledBatch,
    ScheduledReq, Scheduler, SchedulerStats, StepOutput,
};
pub use error::DllmError;

// Error types
pub use anyhow::{Error, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
