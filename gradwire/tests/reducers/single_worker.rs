use gradwire::{Communicator, Reducer, ReducerConfig, ReducerKind, Tensor};

use super::helpers::{assert_close, worker_grads};

fn config_for(kind: ReducerKind) -> ReducerConfig {
    let mut config = ReducerConfig::new(kind);
    config.compression = 0.25;
    config.seed = 5;
    if kind == ReducerKind::MultiRankK {
        config.ranks = Some(vec![1, 2, 1]);
    }
    config
}

fn sign_kind(kind: ReducerKind) -> bool {
    matches!(
        kind,
        ReducerKind::Sign | ReducerKind::SignAndNorm | ReducerKind::MajorityVote
    )
}

#[tokio::test]
async fn test_output_plus_memory_is_input() {
    for kind in ReducerKind::ALL {
        if !cfg!(feature = "sign-codec") && sign_kind(kind) {
            continue;
        }
        let mut reducer = Reducer::from_config(&config_for(kind), Communicator::solo()).unwrap();
        let grads = worker_grads(0);
        let mut out: Vec<Tensor> = grads.iter().map(Tensor::zeros_like).collect();
        let mut mem: Vec<Tensor> = grads.iter().map(Tensor::zeros_like).collect();
        for _ in 0..2 {
            let bits = reducer.reduce(&grads, &mut out, &mut mem).await.unwrap();
            assert!(bits > 0, "{kind}");
            for ((g, o), m) in grads.iter().zip(&out).zip(&mem) {
                let sum: Vec<f32> = o.data().iter().zip(m.data()).map(|(a, b)| a + b).collect();
                assert_close(&sum, g.data(), 1e-4);
            }
        }
    }
}

#[tokio::test]
async fn test_empty_tensors_pass_through() {
    for kind in ReducerKind::ALL {
        if !cfg!(feature = "sign-codec") && sign_kind(kind) {
            continue;
        }
        let mut config = config_for(kind);
        if kind == ReducerKind::MultiRankK {
            config.ranks = Some(vec![1, 2, 1, 1]);
        }
        let mut reducer = Reducer::from_config(&config, Communicator::solo()).unwrap();
        let mut grads = worker_grads(0);
        grads.push(Tensor::zeros([0, 4]));
        let mut out: Vec<Tensor> = grads.iter().map(Tensor::zeros_like).collect();
        let mut mem: Vec<Tensor> = grads.iter().map(Tensor::zeros_like).collect();
        reducer
            .reduce(&grads, &mut out, &mut mem)
            .await
            .unwrap_or_else(|e| panic!("{kind}: {e}"));
        assert_eq!(out[3].nelement(), 0, "{kind}");
    }
}

#[tokio::test]
async fn test_exact_reducers_return_input() {
    for kind in [
        ReducerKind::Exact,
        ReducerKind::OmniEmbed,
        ReducerKind::ExactEmbed,
        ReducerKind::SparCml,
        ReducerKind::Parallax,
    ] {
        let mut reducer = Reducer::from_config(&config_for(kind), Communicator::solo()).unwrap();
        let grads = worker_grads(0);
        let mut out: Vec<Tensor> = grads.iter().map(Tensor::zeros_like).collect();
        let mut mem: Vec<Tensor> = grads.iter().map(Tensor::zeros_like).collect();
        reducer.reduce(&grads, &mut out, &mut mem).await.unwrap();
        assert_eq!(out, grads, "{kind}");
    }
}

#[cfg(not(feature = "sign-codec"))]
#[test]
fn test_sign_reducers_unavailable() {
    use gradwire::GradwireError;
    for kind in ReducerKind::ALL.into_iter().filter(|&k| sign_kind(k)) {
        let err = Reducer::from_config(&config_for(kind), Communicator::solo()).unwrap_err();
        assert!(matches!(err, GradwireError::Unavailable { .. }));
    }
}

#[test]
fn test_config_from_lookup_builds() {
    let config = ReducerConfig::from_lookup(|key| match key {
        "GRADWIRE_REDUCER" => Some("top-k".into()),
        "GRADWIRE_COMPRESSION" => Some("0.5".into()),
        _ => None,
    })
    .unwrap();
    let reducer = Reducer::from_config(&config, Communicator::solo()).unwrap();
    assert_eq!(reducer.kind(), ReducerKind::TopK);
}
