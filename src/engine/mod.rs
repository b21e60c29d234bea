//! Engine module for nano-dLLM
//! 
//! This module contains the block scheduling components for diffusion
//! decoding: thresholds, decode blocks, the sliding block buffer, request
//! phase control and the step scheduler.

pub mod thresholds;
pub mod block;
pub mod block_buffer;
pub mod phase;
pub mod request;
pub mod scheduler;

// Re-export commonly used types
pub use thresholds::MultiBlockThresholds;
pub use block::{DllmBlock, DllmBlockStatus};
pub use block_buffer::DllmBlockBuffer;
pub use phase::{DllmReqPhase, DllmReqState, DllmRequest, DllmRequestExt};
pub use request::{Req, ReqOutput, ReqStatus};
pub use scheduler::{ScheduledBatch, ScheduledReq, Scheduler, SchedulerStats, StepOutput};
