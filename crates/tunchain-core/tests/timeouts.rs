mod common;

use common::*;
use std::time::Duration;
use tunchain_core::{
    ChainConfig, ChainError, ChainState, ChainSupervisor, LayerKind, LayerSet, SupervisorConfig,
};

#[tokio::test(start_paused = true)]
async fn test_hanging_critical_layer_times_out() {
    let relay = ScriptedLayer::hanging(LayerKind::Relay);
    let core = ScriptedLayer::ok(LayerKind::Core);
    let mut layers = LayerSet::new();
    layers.insert(relay.clone());
    layers.insert(core.clone());
    let supervisor = ChainSupervisor::new(layers);

    let mut config = ChainConfig::new("scenario-b");
    config.relay = Some(relay_block(true));
    config.core = Some(core_block(false));

    let begin = tokio::time::Instant::now();
    let outcome = supervisor.start(&config).await.unwrap();
    let elapsed = begin.elapsed();

    assert!(elapsed >= Duration::from_secs(30));
    assert!(elapsed < Duration::from_secs(31));

    assert_eq!(outcome.state, ChainState::Degraded);
    assert_eq!(
        outcome.failures,
        vec![ChainError::Timeout {
            layer: LayerKind::Relay
        }]
    );

    // The layer after the hung one was still attempted
    assert_eq!(core.starts(), 1);

    let status = supervisor.status();
    assert_eq!(status.state, ChainState::Degraded);
    assert!(!status.layers["relay"].running);
    assert!(status.layers["relay"].error.as_deref().unwrap().contains("timed out"));
    assert!(status.layers["core"].running);

    let stopped = supervisor.stop().await;
    assert_eq!(stopped.state, ChainState::Stopped);
    assert_eq!(core.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_custom_start_timeout() {
    let quic = ScriptedLayer::hanging(LayerKind::Quic);
    let relay = ScriptedLayer::ok(LayerKind::Relay);
    let mut layers = LayerSet::new();
    layers.insert(quic.clone());
    layers.insert(relay.clone());

    let supervisor = ChainSupervisor::with_config(
        layers,
        SupervisorConfig {
            start_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    );

    let mut config = ChainConfig::new("short-fuse");
    config.relay = Some(relay_block(true));
    config.quic = Some(quic_block(false));

    let begin = tokio::time::Instant::now();
    let outcome = supervisor.start(&config).await.unwrap();

    assert!(begin.elapsed() >= Duration::from_secs(2));
    assert!(begin.elapsed() < Duration::from_secs(3));

    // The hung layer is optional, so the chain still runs
    assert_eq!(outcome.state, ChainState::Running);
    assert_eq!(outcome.failed_layers(), vec![LayerKind::Quic]);

    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_start_does_not_strand_chain() {
    let relay = ScriptedLayer::hanging(LayerKind::Relay);
    let mut layers = LayerSet::new();
    layers.insert(relay.clone());
    let supervisor = ChainSupervisor::new(layers);

    let mut config = ChainConfig::new("impatient");
    config.relay = Some(relay_block(true));

    // The caller gives up long before the layer timeout
    let gave_up = tokio::time::timeout(Duration::from_secs(1), supervisor.start(&config)).await;
    assert!(gave_up.is_err());
    assert_eq!(supervisor.state(), ChainState::Starting);

    // The start keeps going and settles on its own
    let mut rx = supervisor.subscribe();
    let status = rx
        .wait_for(|s| s.state == ChainState::Degraded)
        .await
        .unwrap()
        .clone();
    assert!(status.is_consistent());

    assert_eq!(supervisor.stop().await.state, ChainState::Stopped);
}
