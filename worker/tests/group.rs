use std::time::Duration;

use machine_learning::{
    arch::{ModelKind, ModelSpec, xavier_uniform},
    precision::Precision,
};
use ndarray::{Array4, Array5};
use rand::{SeedableRng, rngs::StdRng};
use tokio::net::TcpListener;
use worker::{
    RunConfig, WorkerErr, bootstrap, data::Batch, engine::StepEngine, group::ProcessGroup,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Sets up a group of `world_size` ranks over loopback TCP, in rank order.
async fn group(world_size: usize) -> Vec<ProcessGroup> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let root = tokio::spawn(bootstrap::host(listener, world_size, TIMEOUT));
    let peers: Vec<_> = (1..world_size)
        .map(|rank| {
            let addr = addr.clone();
            tokio::spawn(async move { bootstrap::join(&addr, rank, world_size, TIMEOUT).await })
        })
        .collect();

    let mut groups = vec![root.await.unwrap().unwrap()];
    for peer in peers {
        groups.push(peer.await.unwrap().unwrap());
    }
    groups
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_rank_gets_the_same_sum() {
    let contributions: Vec<Vec<f32>> = (0..3)
        .map(|rank| vec![0.1 * (rank + 1) as f32, 1. / (rank + 3) as f32, -1e-7 * rank as f32])
        .collect();

    let mut expected = contributions[0].clone();
    for values in &contributions[1..] {
        expected.iter_mut().zip(values).for_each(|(acc, x)| *acc += *x);
    }

    let tasks: Vec<_> = group(3)
        .await
        .into_iter()
        .zip(contributions)
        .map(|(mut group, mut values)| {
            tokio::spawn(async move {
                group.all_reduce_sum(&mut values).await.unwrap();
                group.shutdown().await.unwrap();
                values
            })
        })
        .collect();

    for task in tasks {
        let reduced = task.await.unwrap();
        let bits: Vec<u32> = reduced.iter().map(|v| v.to_bits()).collect();
        let expected: Vec<u32> = expected.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_and_barrier_reach_every_rank() {
    let tasks: Vec<_> = group(3)
        .await
        .into_iter()
        .map(|mut group| {
            tokio::spawn(async move {
                let mut values = vec![group.rank() as f32; 4];
                if group.is_primary() {
                    values = vec![1., 2., 3., 4.];
                }

                group.broadcast(&mut values).await.unwrap();
                group.barrier().await.unwrap();
                let mut mean = [group.rank() as f32];
                group.all_reduce_mean(&mut mean).await.unwrap();
                group.shutdown().await.unwrap();
                (values, mean[0])
            })
        })
        .collect();

    for task in tasks {
        let (values, mean) = task.await.unwrap();
        assert_eq!(values, [1., 2., 3., 4.]);
        assert_eq!(mean, 1.);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_diverging_rank_fails_every_rank() {
    let tasks: Vec<_> = group(3)
        .await
        .into_iter()
        .map(|mut group| {
            tokio::spawn(async move {
                let shape = if group.rank() == 2 { [4, 1, 8] } else { [4, 1, 6] };
                group.verify_uniform("batch shape", &shape).await
            })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(tasks).await;
    let results: Vec<_> = results.into_iter().map(Result::unwrap).collect();

    assert!(matches!(
        &results[0],
        Err(WorkerErr::Divergence { rank: 2, .. })
    ));
    assert!(results[1].is_err());
    assert!(results[2].is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_failing_rank_unblocks_the_others() {
    let mut groups = group(2).await;
    let mut peer = groups.pop().unwrap();
    let mut root = groups.pop().unwrap();

    let root_task = tokio::spawn(async move {
        let mut values = [1.];
        root.all_reduce_sum(&mut values).await
    });

    peer.abort(&WorkerErr::Checkpoint("disk full".into())).await;

    let res = root_task.await.unwrap();
    assert!(matches!(res, Err(WorkerErr::Collective(reason)) if reason.contains("disk full")));
}

#[tokio::test]
async fn rendezvous_gives_up_after_the_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let res = bootstrap::host(listener, 2, Duration::from_millis(200)).await;
    assert!(matches!(res, Err(WorkerErr::RendezvousTimeout { .. })));

    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let res = bootstrap::join(&addr, 1, 2, Duration::from_millis(300)).await;
    assert!(matches!(res, Err(WorkerErr::RendezvousTimeout { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_joins_are_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let root = tokio::spawn(bootstrap::host(listener, 2, TIMEOUT));

    let out_of_range = bootstrap::join(&addr, 2, 2, TIMEOUT).await;
    assert!(matches!(out_of_range, Err(WorkerErr::Rendezvous(_))));

    let wrong_world = bootstrap::join(&addr, 1, 3, TIMEOUT).await;
    assert!(matches!(wrong_world, Err(WorkerErr::Rendezvous(_))));

    let peer = bootstrap::join(&addr, 1, 2, TIMEOUT).await.unwrap();
    let root = root.await.unwrap().unwrap();
    assert_eq!((root.rank(), peer.rank()), (0, 1));
    assert_eq!(peer.world_size(), 2);

    tokio::spawn(peer.shutdown());
    root.shutdown().await.unwrap();
}

fn engine() -> StepEngine {
    let mut config = RunConfig::default();
    config.model = ModelSpec {
        kind: ModelKind::Linear,
        in_channels: 1,
        out_channels: 2,
        roi: [2, 2, 2],
    };
    config.precision = Precision::Full;

    let model = config.model.build().unwrap();
    let params = xavier_uniform(model.layout(), &mut StdRng::seed_from_u64(0)).unwrap();
    StepEngine::new(&config, model, params).unwrap()
}

fn batch(len: usize) -> Batch {
    Batch {
        images: Array5::from_shape_fn((len, 1, 2, 2, 2), |(_, _, z, _, _)| z as f32),
        labels: Array4::from_shape_fn((len, 2, 2, 2), |(_, z, _, _)| z as u8),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_later_batch_of_another_shape_fails_every_rank() {
    let tasks: Vec<_> = group(2)
        .await
        .into_iter()
        .map(|mut group| {
            tokio::spawn(async move {
                let mut engine = engine();
                engine.step(&mut group, &batch(1), 0).await.unwrap();

                let len = group.rank() + 1;
                engine.step(&mut group, &batch(len), 0).await
            })
        })
        .collect();

    let results = futures::future::join_all(tasks).await;
    assert!(matches!(
        results[0].as_ref().unwrap(),
        Err(WorkerErr::Divergence { rank: 1, what, .. }) if what == "batch shape"
    ));
    assert!(results[1].as_ref().unwrap().is_err());
}
