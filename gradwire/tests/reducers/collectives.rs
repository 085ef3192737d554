use gradwire::{CollectiveGroup, GradwireError, TensorBuffer, Tensor};

use super::helpers::run_workers;

#[tokio::test]
async fn test_all_reduce_sums_3_workers() {
    let results = run_workers(3, |comm| async move {
        let val = comm.rank() as f32 + 1.0;
        let mut data = vec![val; 7];
        comm.all_reduce(&mut data).await.unwrap();
        data
    })
    .await;
    for data in results {
        assert_eq!(data, vec![6.0f32; 7]);
    }
}

#[tokio::test]
async fn test_all_reduce_i64_4_workers() {
    let results = run_workers(4, |comm| async move {
        let mut data = vec![comm.rank() as i64; 3];
        comm.all_reduce(&mut data).await.unwrap();
        data
    })
    .await;
    assert!(results.iter().all(|d| d == &vec![6i64; 3]));
}

#[tokio::test]
async fn test_all_gather_orders_by_rank() {
    let results = run_workers(3, |comm| async move {
        let mine = vec![comm.rank() as i32 * 10, comm.rank() as i32 * 10 + 1];
        comm.all_gather(&mine).await.unwrap()
    })
    .await;
    for gathered in results {
        assert_eq!(gathered, vec![vec![0, 1], vec![10, 11], vec![20, 21]]);
    }
}

#[tokio::test]
async fn test_gather_then_broadcast() {
    let results = run_workers(4, |comm| async move {
        // Variable-length contributions.
        let mine: Vec<u32> = (0..=comm.rank()).collect();
        let gathered = comm.gather(&mine, 0).await.unwrap();
        let mut flat = gathered.map(|g| g.concat()).unwrap_or_default();
        comm.broadcast(&mut flat, 0).await.unwrap();
        flat
    })
    .await;
    for flat in results {
        assert_eq!(flat, vec![0, 0, 1, 0, 1, 2, 0, 1, 2, 3]);
    }
}

#[tokio::test]
async fn test_invalid_root() {
    let results = run_workers(2, |comm| async move {
        let mut data = vec![1.0f32];
        comm.broadcast(&mut data, 5).await
    })
    .await;
    for r in results {
        assert!(matches!(r, Err(GradwireError::InvalidRoot { root: 5, world_size: 2 })));
    }
}

#[tokio::test]
async fn test_non_blocking_group() {
    let results = run_workers(3, |comm| async move {
        let mut group = CollectiveGroup::new();
        group.push(comm.all_reduce_nb(vec![1.0f32; 4]));
        group.push(comm.all_reduce_nb(vec![comm.rank() as f32; 2]));
        group.wait_all().await.unwrap()
    })
    .await;
    for r in results {
        assert_eq!(r, vec![vec![3.0; 4], vec![3.0; 2]]);
    }
}

#[tokio::test]
async fn test_tensor_buffer_non_blocking_all_reduce() {
    let results = run_workers(2, |comm| async move {
        let r = comm.rank() as f32 + 1.0;
        let tensors = vec![
            Tensor::new([2, 2], vec![r; 4]).unwrap(),
            Tensor::new([3], vec![-r; 3]).unwrap(),
        ];
        let pending = TensorBuffer::new(&tensors).all_reduce_nb(&comm);
        let mut reduced = pending.wait().await.unwrap();
        reduced.scale(0.5);
        let mut out: Vec<Tensor> = tensors.iter().map(Tensor::zeros_like).collect();
        reduced.unpack(out.iter_mut()).unwrap();
        out
    })
    .await;
    for out in results {
        assert_eq!(out[0].data(), &[1.5; 4]);
        assert_eq!(out[1].data(), &[-1.5; 3]);
    }
}
