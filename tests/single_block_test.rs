
use nano_dllm_rs::{DllmReqPhase, DllmRequest, DllmRequestExt, Req};
use test_utils::{init_test_logging, prompt, single_block_config, MASK};

#[test]
fn test_short_working_sequence_stays_incoming() {
    init_test_logging();

    let mut req = Req::new(prompt(3), 8).with_dllm_config(single_block_config(4));
    assert_eq!(req.dllm_phase(), Some(DllmReqPhase::IncomingDecode));

    req.determine_dllm_phase().unwrap();
    assert_eq!(req.dllm_phase(), Some(DllmReqPhase::IncomingDecode));
}

#[test]
fn test_full_window_without_mask_is_prefill() {
    init_test_logging();

    let mut req = Req::new(prompt(4), 8).with_dllm_config(single_block_config(4));
    req.init_fill_ids_for_dllm().unwrap();
    req.determine_dllm_phase().unwrap();

    assert_eq!(req.dllm_phase(), Some(DllmReqPhase::StagingPrefill));
    assert!(req.is_dllm_prefill());
}

#[test]
fn test_window_with_mask_is_decode() {
    init_test_logging();

    let mut req = Req::new(prompt(2), 8).with_dllm_config(single_block_config(4));
    req.init_fill_ids_for_dllm().unwrap();
    assert_eq!(req.fill_ids(), &[100, 101, MASK, MASK, MASK, MASK]);

    req.determine_dllm_phase().unwrap();
    assert_eq!(req.dllm_phase(), Some(DllmReqPhase::StagingDecode));
    assert!(!req.is_dllm_prefill());
}

#[test]
fn test_window_follows_cached_prefix() {
    init_test_logging();

    let mut req = Req::new(prompt(4), 8).with_dllm_config(single_block_config(4));
    req.init_fill_ids_for_dllm().unwrap();
    req.update_cached_prefix();
    assert_eq!(req.prefix_len(), 4);

    req.determine_dllm_phase().unwrap();
    assert_eq!(req.dllm_phase(), Some(DllmReqPhase::StagingDecode));
}

#[test]
fn test_fill_ids_grow_by_block() {
    init_test_logging();

    let mut req = Req::new(prompt(5), 8).with_dllm_config(single_block_config(4));
    assert!(!req.is_multi_block_dllm().unwrap());

    for step in 0..3 {
        req.init_fill_ids_for_dllm().unwrap();
        assert_eq!(req.fill_ids().len(), 5 + 4 * (step + 1));
        assert_eq!(req.dllm_state().unwrap().block_offset(), 4 * step);
    }
}

#[test]
fn test_config_required() {
    init_test_logging();

    let mut req = Req::new(prompt(5), 8);
    assert!(!req.is_dllm());
    assert_error_contains!(req.is_multi_block_dllm(), "dllm config is not set");
    assert_error_contains!(req.determine_dllm_phase(), "dllm config is not set");
}
