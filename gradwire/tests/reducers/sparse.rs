use gradwire::{ReducerConfig, ReducerKind};

use super::helpers::{assert_same_output, reduce_on_all, worker_grads};

#[tokio::test]
async fn test_random_sparse_workers_pick_same_positions() {
    for kind in [
        ReducerKind::UniformRandomSparse,
        ReducerKind::UniformRandomSparseBlock,
        ReducerKind::RandomSparse,
        ReducerKind::RandomSparseBlock,
    ] {
        let mut config = ReducerConfig::new(kind);
        config.compression = 0.25;
        config.seed = 17;
        let steps = reduce_on_all(config, 3, 2).await;
        assert_same_output(&steps, 1e-6);

        // The zeroed memory positions are the sent ones and match on every rank.
        let sent = |rank: usize| -> Vec<bool> {
            steps[rank].mem[1].data().iter().map(|&v| v == 0.0).collect()
        };
        assert_eq!(sent(0), sent(1), "{kind}");
        assert_eq!(sent(0), sent(2), "{kind}");

        for (rank, step) in steps.iter().enumerate() {
            for (g, m) in worker_grads(rank as u32).iter().zip(&step.mem) {
                for (&x, &r) in g.data().iter().zip(m.data()) {
                    assert!(r == 0.0 || r == x);
                }
            }
        }
    }
}
