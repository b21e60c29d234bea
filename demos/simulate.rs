//! Drive the scheduler with a toy engine that unmasks a fixed number of
//! positions per request and step.
//!
//! ```text
//! cargo run --example simulate -- \
//!     --algorithm LowConfidenceMultiBlock --block-size 8 --buffer-size 2
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use nano_dllm_rs::{DllmArgs, DllmConfig, Req, ScheduledBatch, Scheduler, StepOutput, TokenId};

#[derive(Parser, Debug)]
#[command(about = "Simulate block-diffusion scheduling")]
struct Args {
    /// Decoding algorithm identifier
    #[arg(long, default_value = "LowConfidenceMultiBlock")]
    algorithm: String,

    /// Model architecture used to pick block geometry
    #[arg(long, default_value = "LLaDA2MoeModelLM")]
    architecture: String,

    /// JSON file with algorithm overrides
    #[arg(long)]
    algorithm_config: Option<PathBuf>,

    /// Override the block size
    #[arg(long)]
    block_size: Option<usize>,

    /// Override the buffer size
    #[arg(long)]
    buffer_size: Option<usize>,

    #[arg(long, default_value_t = 4)]
    max_running_requests: usize,

    /// Prompt lengths, one request each
    #[arg(long, value_delimiter = ',', default_values_t = vec![5, 32, 47, 3])]
    prompts: Vec<usize>,

    #[arg(long, default_value_t = 64)]
    max_new_tokens: usize,

    /// Positions the toy engine unmasks per request and step
    #[arg(long, default_value_t = 8)]
    unmask_per_step: usize,

    #[arg(long, default_value_t = 1000)]
    max_steps: usize,
}

fn refine(batch: &ScheduledBatch, mask: TokenId, per_step: usize, step: usize) -> Vec<StepOutput> {
    batch
        .iter()
        .map(|s| {
            let mut token_ids = s.fill_ids.clone();
            for t in token_ids.iter_mut().filter(|t| **t == mask).take(per_step) {
                *t = (step % 1000) as TokenId;
            }
            StepOutput {
                req_id: s.req_id,
                token_ids,
            }
        })
        .collect()
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let dllm_args = DllmArgs {
        dllm_algorithm: Some(args.algorithm.clone()),
        dllm_algorithm_config: args.algorithm_config.clone(),
        architecture: args.architecture.clone(),
        max_running_requests: Some(args.max_running_requests),
    };
    let mut config = DllmConfig::from_args(&dllm_args)?
        .ok_or_else(|| anyhow::anyhow!("no dLLM algorithm selected"))?;
    if let Some(block_size) = args.block_size {
        config = config.with_block_size(block_size);
    }
    if let Some(buffer_size) = args.buffer_size {
        config = config.with_buffer_size(buffer_size);
    }
    let mask = config.mask_token_id;
    let mut scheduler = Scheduler::new(Arc::new(config), None)?;
    for &len in &args.prompts {
        let prompt = (0..len as TokenId).map(|t| t + 1).collect();
        scheduler.add_request(Req::new(prompt, args.max_new_tokens));
    }

    let mut step = 0;
    while !scheduler.is_finished() && step < args.max_steps {
        let batch = scheduler.schedule();
        for output in scheduler.postprocess(refine(&batch, mask, args.unmask_per_step, step)) {
            tracing::info!(
                "Request {} {:?}: {} prompt tokens, {} output tokens",
                output.req_id,
                output.status,
                output.num_prompt_tokens,
                output.output_ids.len()
            );
        }
        step += 1;
    }

    let stats = scheduler.get_stats();
    tracing::info!(
        "Done after {} steps: {} finished, {} aborted, {} blocks committed, avg batch {:.2}",
        step,
        stats.finished_requests,
        stats.aborted_requests,
        stats.committed_blocks,
        stats.avg_batch_size()
    );

    Ok(())
}
