mod common;

use common::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tunchain_core::{ChainError, ChainState, ChainSupervisor, LayerHandle, LayerKind, LayerSet};

fn full_set() -> (LayerSet, Vec<Arc<ScriptedLayer>>) {
    let layers = vec![
        ScriptedLayer::ok(LayerKind::Relay),
        ScriptedLayer::ok(LayerKind::Quic),
        ScriptedLayer::failing(LayerKind::Shaper),
        ScriptedLayer::ok(LayerKind::Core),
    ];
    let mut set = LayerSet::new();
    for layer in &layers {
        set.insert(layer.clone());
    }
    (set, layers)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_stop_keeps_status_consistent() {
    let (set, layers) = full_set();
    let supervisor = ChainSupervisor::new(set);
    let config = full_chain(true, false, false, true);

    let done = Arc::new(AtomicBool::new(false));
    let mut rx = supervisor.subscribe();
    let watcher = {
        let done = done.clone();
        tokio::spawn(async move {
            let mut seen = 0usize;
            while !done.load(Ordering::SeqCst) {
                if rx.changed().await.is_err() {
                    break;
                }
                let status = rx.borrow_and_update().clone();
                assert!(status.is_consistent(), "torn snapshot: {:?}", status);
                if status.state == ChainState::Stopped {
                    assert!(status.layers.is_empty());
                }
                seen += 1;
            }
            seen
        })
    };

    let mut tasks = Vec::new();
    for i in 0..40 {
        let supervisor = supervisor.clone();
        let config = config.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                supervisor.start(&config).await.map(|_| true)
            } else {
                supervisor.stop().await;
                Ok(false)
            }
        }));
    }

    let mut started = 0u64;
    for task in tasks {
        match task.await.unwrap() {
            Ok(true) => started += 1,
            Ok(false) => {}
            Err(e) => assert_eq!(e, ChainError::AlreadyRunning),
        }
    }

    let status = supervisor.status();
    assert_eq!(status.run_id, started);
    assert!(status.is_consistent());

    supervisor.stop().await;
    done.store(true, Ordering::SeqCst);
    supervisor.shutdown().await;
    drop(supervisor);

    let seen = watcher.await.unwrap();
    assert!(seen > 0);

    // Every resource acquired by a start was released by a stop
    for layer in &layers {
        assert!(!layer.holds_resource());
        assert_eq!(u64::from(layer.starts()), started);
        if layer.kind() != LayerKind::Shaper {
            assert_eq!(layer.releases(), layer.starts());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_only_one_wins() {
    let (set, layers) = full_set();
    let supervisor = ChainSupervisor::new(set);
    let config = full_chain(true, false, false, true);

    let results = join_tasks(
        (0..8)
            .map(|_| {
                let supervisor = supervisor.clone();
                let config = config.clone();
                tokio::spawn(async move { supervisor.start(&config).await })
            })
            .collect(),
    )
    .await;

    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| *e == ChainError::AlreadyRunning));

    assert_eq!(layers[0].starts(), 1);
    assert_eq!(supervisor.status().run_id, 1);

    supervisor.shutdown().await;
}

async fn join_tasks<T: Send + 'static>(
    handles: Vec<tokio::task::JoinHandle<T>>,
) -> Vec<T> {
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.unwrap());
    }
    out
}
