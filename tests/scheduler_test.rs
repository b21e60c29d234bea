
use std::sync::Arc;

use nano_dllm_rs::{
    DllmArgs, DllmConfig, ReqStatus, Req, ScheduledBatch, Scheduler, StepOutput, TokenId,
};
use test_utils::{init_test_logging, multi_block_config, prompt, single_block_config, MASK};

/// Toy engine: unmask up to `per_step` positions of every submitted request
fn refine(batch: &ScheduledBatch, per_step: usize, fill: TokenId) -> Vec<StepOutput> {
    batch
        .iter()
        .map(|s| {
            let mut token_ids = s.fill_ids.clone();
            for t in token_ids.iter_mut().filter(|t| **t == MASK).take(per_step) {
                *t = fill;
            }
            StepOutput {
                req_id: s.req_id,
                token_ids,
            }
        })
        .collect()
}

fn run_to_completion(scheduler: &mut Scheduler, per_step: usize, max_steps: usize) -> usize {
    let mut finished = 0;
    for _ in 0..max_steps {
        if scheduler.is_finished() {
            break;
        }
        let batch = scheduler.schedule();
        finished += scheduler.postprocess(refine(&batch, per_step, 42)).len();
    }
    finished
}

#[test]
fn test_multi_block_requests_finish() {
    init_test_logging();

    let config = Arc::new(
        DllmConfig::new(nano_dllm_rs::DllmAlgorithm::LowConfidenceMultiBlock, 4, 2, MASK)
            .with_max_running_requests(3),
    );
    let mut scheduler = Scheduler::new(config, None).unwrap();
    for len in [3, 4, 9, 16, 1] {
        scheduler.add_request(Req::new(prompt(len), 12));
    }

    let finished = run_to_completion(&mut scheduler, 2, 200);

    assert_eq!(finished, 5);
    assert!(scheduler.is_finished());
    let stats = scheduler.get_stats();
    assert_eq!(stats.finished_requests, 5);
    assert_eq!(stats.aborted_requests, 0);
    assert_eq!(stats.completion_rate(), 1.0);
    assert!(stats.committed_blocks > 0);
}

#[test]
fn test_single_block_requests_finish() {
    init_test_logging();

    let mut scheduler = Scheduler::new(single_block_config(4), None).unwrap();
    scheduler.add_request(Req::new(prompt(6), 8));

    let finished = run_to_completion(&mut scheduler, 4, 50);
    assert_eq!(finished, 1);
    assert!(scheduler.get_stats().avg_batch_size() > 0.0);
}

#[test]
fn test_outputs_stop_at_eos() {
    init_test_logging();

    let mut scheduler = Scheduler::new(multi_block_config(4, 1), Some(42)).unwrap();
    scheduler.add_request(Req::new(prompt(4), 32));

    let mut outputs = Vec::new();
    for _ in 0..20 {
        if scheduler.is_finished() {
            break;
        }
        let batch = scheduler.schedule();
        outputs.extend(scheduler.postprocess(refine(&batch, 4, 42)));
    }

    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].output_ids, vec![42]);
    assert_eq!(outputs[0].status, ReqStatus::Finished);
}

#[test]
fn test_unknown_request_output_ignored() {
    init_test_logging();

    let mut scheduler = Scheduler::new(multi_block_config(4, 1), None).unwrap();
    scheduler.add_request(Req::new(prompt(4), 8));
    scheduler.schedule();

    let finished = scheduler.postprocess(vec![StepOutput {
        req_id: u64::MAX,
        token_ids: vec![1, 2, 3],
    }]);
    assert!(finished.is_empty());
    assert_eq!(scheduler.get_queue_lengths(), (0, 1));
}

#[test]
fn test_config_from_args() {
    init_test_logging();

    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("algorithm.json");
    std::fs::write(
        &path,
        r#"{"block_size": 16, "multi_block_thresholds": {"decoding_threshold": 0.9}}"#,
    )
    .unwrap();

    let args = DllmArgs {
        dllm_algorithm: Some("LowConfidenceMultiBlock".to_string()),
        dllm_algorithm_config: Some(path),
        architecture: "LLaDA2MoeModelLM".to_string(),
        max_running_requests: None,
    };
    let config = DllmConfig::from_args(&args).unwrap().unwrap();

    assert_eq!(config.block_size, 16);
    assert_eq!(config.buffer_size, 1);
    assert_eq!(config.max_running_requests, 1);
    assert_eq!(config.thresholds.decoding_threshold, 0.9);
    assert_eq!(config.thresholds.add_block_threshold, 0.5);
}

#[test]
fn test_unknown_model_rejected() {
    init_test_logging();

    let args = DllmArgs {
        dllm_algorithm: Some("LowConfidence".to_string()),
        architecture: "GPT2LMHeadModel".to_string(),
        ..Default::default()
    };
    assert_error_contains!(DllmConfig::from_args(&args), "Unknown diffusion LLM");
}
