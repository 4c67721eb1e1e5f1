mod common;

use bci_rs::{Calibration, ClientConfig, MulesClient, OnlineSession, PipelineConfig};
use common::{init_logging, muse_samples, MockServer, Reply};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn pipeline(server: &MockServer) -> PipelineConfig {
    PipelineConfig {
        client: ClientConfig::new("127.0.0.1", server.port()),
        training_secs: 2.0,
        buffer_secs: 5.0,
        decision_buffer_len: 10,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_calibrate_then_classify_live_stream() {
    init_logging();
    let server = MockServer::muse().await;
    let config = pipeline(&server);

    // Calibration: 2 s of alpha, then 2 s of beta
    server.push(Reply::Block(muse_samples(10.0, 0, 512)));
    server.push(Reply::Block(muse_samples(20.0, 512, 512)));
    // Online: ten shifts of beta, then the server runs dry
    for i in 0..10 {
        server.push(Reply::Block(muse_samples(20.0, 1024 + i * 77, 77)));
    }

    let mut client = MulesClient::open(config.client.clone()).await.unwrap();
    let calibration = Calibration::acquire(&mut client, &config).await.unwrap();
    assert_eq!(calibration.features0.nrows(), 4);
    assert_eq!(calibration.features1.nrows(), 4);

    let mut session = OnlineSession::new(client, config, calibration.classifier).unwrap();
    let decisions = session.decisions();

    assert_eq!(server.pending_replies(), 10);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        // Leave the loop polling an empty server for a moment before stopping it
        tokio::time::sleep(Duration::from_millis(400)).await;
        trigger.cancel();
    });

    let summary = session.run(cancel).await.unwrap();
    watcher.await.unwrap();

    assert_eq!(server.pending_replies(), 0);
    assert_eq!(summary.iterations, 10);
    assert_eq!(summary.samples_received, 770);
    assert_eq!(decisions.latest(), Some(1));
    assert_eq!(summary.recent_decisions.len(), 10);
    assert!(!session.source().is_connected());

    // Each class recording and the session start flushed the server first
    let flushes = server.received().iter().filter(|&&b| b == b'F').count();
    assert_eq!(flushes, 3);
}

#[tokio::test]
async fn test_cancel_before_any_data() {
    init_logging();
    let server = MockServer::muse().await;
    let config = pipeline(&server);
    server.push(Reply::Block(muse_samples(10.0, 0, 512)));
    server.push(Reply::Block(muse_samples(20.0, 512, 512)));

    let mut client = MulesClient::open(config.client.clone()).await.unwrap();
    let calibration = Calibration::acquire(&mut client, &config).await.unwrap();
    let mut session = OnlineSession::new(client, config, calibration.classifier).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = session.run(cancel).await.unwrap();

    assert_eq!(summary.iterations, 0);
    assert_eq!(summary.recent_decisions, vec![0; 10]);
    assert!(!session.source().is_connected());
}
