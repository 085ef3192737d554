use gradwire::{ReducerConfig, ReducerKind};

use super::helpers::{assert_close, assert_same_output, mean_grads, reduce_on_all};

#[tokio::test]
async fn test_exact_mean_2_workers() {
    let steps = reduce_on_all(ReducerConfig::new(ReducerKind::Exact), 2, 1).await;
    let mean = mean_grads(2);
    for step in &steps {
        for (out, m) in step.out.iter().zip(&mean) {
            assert_close(out.data(), m.data(), 1e-6);
        }
        assert!(step.mem.iter().all(|m| m.data().iter().all(|&v| v == 0.0)));
        assert_eq!(step.bits, (24 + 12 + 3) * 32);
    }
}

#[tokio::test]
async fn test_exact_mean_4_workers() {
    let steps = reduce_on_all(ReducerConfig::new(ReducerKind::Exact), 4, 2).await;
    let mean = mean_grads(4);
    for step in &steps {
        for (out, m) in step.out.iter().zip(&mean) {
            assert_close(out.data(), m.data(), 1e-5);
        }
    }
    assert_same_output(&steps, 0.0);
}
