use gradwire::{Reducer, ReducerConfig, ReducerKind, Tensor};
use std::sync::Arc;

use super::helpers::{assert_close, assert_same_output, mean_grads, reduce_on_all, run_workers};

/// Rank-1 matrix `a·bᵀ` scaled per worker, plus a bias.
fn rank_one_grads(rank: u32) -> Vec<Tensor> {
    let s = rank as f32 + 1.0;
    let a = [1.0f32, -2.0, 0.5, 3.0, 1.5];
    let b = [2.0f32, 1.0, -1.0, 0.25];
    let m = a
        .iter()
        .flat_map(|x| b.iter().map(move |y| s * x * y))
        .collect();
    vec![
        Tensor::new([5, 4], m).unwrap(),
        Tensor::new([2], vec![s, 1.0]).unwrap(),
    ]
}

async fn run_rank_one(config: ReducerConfig, world: u32, steps: usize) -> Vec<Vec<Tensor>> {
    let config = Arc::new(config);
    run_workers(world, move |comm| {
        let config = Arc::clone(&config);
        async move {
            let mut reducer = Reducer::from_config(&config, comm).unwrap();
            let g = rank_one_grads(reducer.rank());
            let mut out: Vec<Tensor> = g.iter().map(Tensor::zeros_like).collect();
            let mut mem: Vec<Tensor> = g.iter().map(Tensor::zeros_like).collect();
            for _ in 0..steps {
                reducer.reduce(&g, &mut out, &mut mem).await.unwrap();
            }
            out
        }
    })
    .await
}

fn rank_one_mean(world: u32) -> Vec<Tensor> {
    let mut mean: Vec<Tensor> = rank_one_grads(0).iter().map(Tensor::zeros_like).collect();
    for rank in 0..world {
        for (m, g) in mean.iter_mut().zip(rank_one_grads(rank)) {
            for (a, b) in m.data_mut().iter_mut().zip(g.data()) {
                *a += b / world as f32;
            }
        }
    }
    mean
}

#[tokio::test]
async fn test_rank_k_recovers_rank_one_mean() {
    let outs = run_rank_one(ReducerConfig::new(ReducerKind::RankK), 3, 1).await;
    let mean = rank_one_mean(3);
    for out in &outs {
        assert_close(out[0].data(), mean[0].data(), 1e-3);
        assert_close(out[1].data(), mean[1].data(), 1e-6);
    }
}

#[tokio::test]
async fn test_half_rank_k_recovers_after_two_steps() {
    // P then Q: one full power-iteration pass.
    let outs = run_rank_one(ReducerConfig::new(ReducerKind::HalfRankK), 2, 2).await;
    let mean = rank_one_mean(2);
    for out in &outs {
        assert_close(out[0].data(), mean[0].data(), 1e-3);
        assert_close(out[1].data(), mean[1].data(), 1e-6);
    }
}

#[tokio::test]
async fn test_rank_k_variants_agree_across_workers() {
    let mut multi = ReducerConfig::new(ReducerKind::MultiRankK);
    multi.ranks = Some(vec![2, 1, 1]);
    let mut reuse = ReducerConfig::new(ReducerKind::RankK);
    reuse.reuse_query = true;
    reuse.rank = 2;
    let mean = mean_grads(3);
    for config in [
        ReducerConfig::new(ReducerKind::RankK),
        reuse,
        multi,
        ReducerConfig::new(ReducerKind::RankKSparse),
        ReducerConfig::new(ReducerKind::HalfRankK),
    ] {
        let kind = config.kind;
        let steps = reduce_on_all(config, 3, 3).await;
        assert_same_output(&steps, 1e-4);
        // The bias is not compressed and arrives exactly.
        for step in &steps {
            assert_close(step.out[2].data(), mean[2].data(), 1e-5);
            assert!(step.mem[2].data().iter().all(|&v| v == 0.0), "{kind}");
        }
    }
}

#[tokio::test]
async fn test_rank_k_bits() {
    let steps = reduce_on_all(ReducerConfig::new(ReducerKind::RankK), 2, 1).await;
    // Embedding P 6 + Q 4, weight P 4 + Q 3, bias 3.
    assert!(steps.iter().all(|s| s.bits == (6 + 4 + 4 + 3 + 3) * 32));
}
