#![cfg(feature = "sign-codec")]

use gradwire::{ReducerConfig, ReducerKind};

use super::helpers::{assert_same_output, reduce_on_all, worker_grads};

#[tokio::test]
async fn test_sign_averages_signs() {
    let steps = reduce_on_all(ReducerConfig::new(ReducerKind::Sign), 3, 1).await;
    assert_same_output(&steps, 0.0);
    // Bias signs are (+, -, +) on every worker.
    assert_eq!(steps[0].out[2].data(), &[1.0, -1.0, 1.0]);
    // 39 coordinates pack into two words.
    assert!(steps.iter().all(|s| s.bits == 2 * 32));
}

#[tokio::test]
async fn test_majority_vote_outputs_unit_signs() {
    let steps = reduce_on_all(ReducerConfig::new(ReducerKind::MajorityVote), 4, 1).await;
    assert_same_output(&steps, 0.0);
    for t in &steps[0].out {
        assert!(t.data().iter().all(|&v| v == 1.0 || v == -1.0));
    }
}

#[tokio::test]
async fn test_sign_and_norm_memory() {
    let steps = reduce_on_all(ReducerConfig::new(ReducerKind::SignAndNorm), 2, 1).await;
    assert_same_output(&steps, 1e-6);
    for (rank, step) in steps.iter().enumerate() {
        let grads = worker_grads(rank as u32);
        for (g, m) in grads.iter().zip(&step.mem) {
            let scale = g.l1_norm() / g.nelement() as f32;
            for (&x, &r) in g.data().iter().zip(m.data()) {
                let s = if x < 0.0 { -1.0 } else { 1.0 };
                assert!((x - scale * s - r).abs() < 1e-5);
            }
        }
        // Words plus one norm per tensor.
        assert_eq!(step.bits, 2 * 32 + 3 * 32);
    }
}
