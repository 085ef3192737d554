use gradwire::{ReducerConfig, ReducerKind};

use super::helpers::{assert_close, assert_same_output, mean_grads, reduce_on_all};

#[tokio::test]
async fn test_sparse_embedding_modes_are_exact() {
    for kind in [
        ReducerKind::OmniEmbed,
        ReducerKind::ExactEmbed,
        ReducerKind::SparCml,
        ReducerKind::Parallax,
    ] {
        for world in [2, 4] {
            let steps = reduce_on_all(ReducerConfig::new(kind), world, 1).await;
            let mean = mean_grads(world);
            for step in &steps {
                for (out, m) in step.out.iter().zip(&mean) {
                    assert_close(out.data(), m.data(), 1e-5);
                }
                assert!(step.mem.iter().all(|m| m.data().iter().all(|&v| v == 0.0)));
            }
        }
    }
}

#[tokio::test]
async fn test_sketch_embed_agrees_across_workers() {
    let mut config = ReducerConfig::new(ReducerKind::SketchEmbed);
    config.sparsity = 0.5;
    config.sketch_rows = 3;
    let steps = reduce_on_all(config, 3, 2).await;
    assert_same_output(&steps, 1e-5);

    let mean = mean_grads(3);
    for step in &steps {
        // Only the embedding is sketched.
        assert_close(step.out[1].data(), mean[1].data(), 1e-5);
        assert_close(step.out[2].data(), mean[2].data(), 1e-5);
        // Three rows of 12 columns, a 6-row bitmap and 15 passthrough floats.
        assert_eq!(step.bits, (36 + 6 + 15) * 32);
    }
}
