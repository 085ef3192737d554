use gradwire::{Communicator, LocalMesh, Reducer, ReducerConfig, Tensor};
use std::future::Future;
use std::sync::Arc;

/// Run `f` on every rank of an in-process mesh concurrently.
/// Results come back in rank order.
pub async fn run_workers<F, Fut, T>(world_size: u32, f: F) -> Vec<T>
where
    F: Fn(Communicator) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let comms = LocalMesh::bootstrap(world_size).unwrap();
    let f = Arc::new(f);
    let mut handles = Vec::new();
    for comm in comms {
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move { f(comm).await }));
    }
    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap());
    }
    results
}

/// Output of the last step on one worker.
#[derive(Debug)]
pub struct Step {
    pub out: Vec<Tensor>,
    pub mem: Vec<Tensor>,
    pub bits: u64,
}

/// A small model: a sparse embedding, a weight matrix and a bias.
/// Values differ per rank.
pub fn worker_grads(rank: u32) -> Vec<Tensor> {
    let r = rank as f32 + 1.0;
    let mut embed = vec![0.0f32; 6 * 4];
    for row in [rank as usize % 6, (rank as usize + 2) % 6] {
        for c in 0..4 {
            embed[row * 4 + c] = r * (c as f32 - 1.5);
        }
    }
    let weight = (0..12).map(|i| r * (((i * 7) % 5) as f32 - 2.0) + 0.3 * i as f32).collect();
    vec![
        Tensor::new([6, 4], embed).unwrap().with_name("encoder.embed.weight"),
        Tensor::new([4, 3], weight).unwrap().with_name("layer.weight"),
        Tensor::new([3], vec![r, -2.0 * r, 0.5]).unwrap().with_name("layer.bias"),
    ]
}

/// Element-wise mean of every rank's [`worker_grads`].
pub fn mean_grads(world_size: u32) -> Vec<Tensor> {
    let mut mean: Vec<Tensor> = worker_grads(0).iter().map(Tensor::zeros_like).collect();
    for rank in 0..world_size {
        for (m, g) in mean.iter_mut().zip(worker_grads(rank)) {
            for (a, b) in m.data_mut().iter_mut().zip(g.data()) {
                *a += b / world_size as f32;
            }
        }
    }
    mean
}

/// Build `config` on every rank and reduce [`worker_grads`] `steps` times.
pub async fn reduce_on_all(config: ReducerConfig, world_size: u32, steps: usize) -> Vec<Step> {
    let config = Arc::new(config);
    run_workers(world_size, move |comm| {
        let config = Arc::clone(&config);
        async move {
            let mut reducer = Reducer::from_config(&config, comm).unwrap();
            let grads = worker_grads(reducer.rank());
            let mut out: Vec<Tensor> = grads.iter().map(Tensor::zeros_like).collect();
            let mut mem: Vec<Tensor> = grads.iter().map(Tensor::zeros_like).collect();
            let mut bits = 0;
            for _ in 0..steps {
                bits = reducer.reduce(&grads, &mut out, &mut mem).await.unwrap();
            }
            Step { out, mem, bits }
        }
    })
    .await
}

pub fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "element {i}: {x} vs {y}");
    }
}

/// Every worker produced the same `grad_out`.
pub fn assert_same_output(steps: &[Step], tol: f32) {
    for step in &steps[1..] {
        for (a, b) in step.out.iter().zip(&steps[0].out) {
            assert_close(a.data(), b.data(), tol);
        }
    }
}
