use gradwire::{ReducerConfig, ReducerKind};

use super::helpers::{assert_same_output, reduce_on_all, worker_grads};

#[tokio::test]
async fn test_topk_accumulates_selected_positions() {
    let mut config = ReducerConfig::new(ReducerKind::TopK);
    config.compression = 0.5;
    let steps = reduce_on_all(config, 2, 1).await;
    assert_same_output(&steps, 0.0);

    // Each bias keeps only its middle entry: (-2 + -4) / 2.
    assert_eq!(steps[0].out[2].data(), &[0.0, -3.0, 0.0]);
    for (rank, step) in steps.iter().enumerate() {
        let g = worker_grads(rank as u32);
        assert_eq!(step.mem[2].data(), &[g[2].data()[0], 0.0, 0.5]);
    }
}

#[tokio::test]
async fn test_global_topk_identical_across_workers() {
    let mut config = ReducerConfig::new(ReducerKind::GlobalTopK);
    config.compression = 0.2;
    let steps = reduce_on_all(config, 3, 1).await;
    assert_same_output(&steps, 0.0);
    // ⌊0.5 · 0.2 · 39⌋ = 3 values (f32) and positions (i64).
    assert!(steps.iter().all(|s| s.bits == 3 * 32 + 3 * 64));
}
