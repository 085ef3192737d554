use gradwire::{ReducerConfig, ReducerKind};

use super::helpers::{assert_close, assert_same_output, mean_grads, reduce_on_all};

#[tokio::test]
async fn test_svd_full_rank_is_exact_mean() {
    let mut config = ReducerConfig::new(ReducerKind::Svd);
    config.rank = 4;
    let steps = reduce_on_all(config, 2, 1).await;
    let mean = mean_grads(2);
    for step in &steps {
        for (out, m) in step.out.iter().zip(&mean) {
            assert_close(out.data(), m.data(), 1e-4);
        }
    }
}

#[tokio::test]
async fn test_svd_truncated_agrees_across_workers() {
    let steps = reduce_on_all(ReducerConfig::new(ReducerKind::Svd), 3, 1).await;
    assert_same_output(&steps, 1e-5);
    // Rank-1 triples: embedding (6 + 1 + 4), weight (4 + 1 + 3); bias exact (3).
    assert!(steps.iter().all(|s| s.bits == (11 + 8 + 3) * 32));
}

#[tokio::test]
async fn test_atomo_agrees_across_workers() {
    let steps = reduce_on_all(ReducerConfig::new(ReducerKind::Atomo), 2, 2).await;
    assert_same_output(&steps, 1e-5);
    // Embedding 6×4, weight 4×3, bias viewed as 3×1; one triple each.
    assert!(
        steps
            .iter()
            .all(|s| s.bits == ((6 + 1 + 4) + (4 + 1 + 3) + (3 + 1 + 1)) * 32)
    );
}
