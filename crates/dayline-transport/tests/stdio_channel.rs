//! End-to-end checks of `StdioChannel` against the `stub-service` binary.

use std::time::{Duration, Instant};

use dayline_core::ServiceDescriptor;
use dayline_transport::{normalize, CapabilityChannel, StdioChannel, TransportError};
use serde_json::json;

const BUDGET: Duration = Duration::from_secs(5);

fn stub(name: &str) -> ServiceDescriptor {
    ServiceDescriptor::new(name, env!("CARGO_BIN_EXE_stub-service")).env("STUB_NAME", name)
}

#[tokio::test]
async fn test_handshake_and_list() {
    let channel = StdioChannel::connect(&stub("caption"), BUDGET).await.unwrap();
    assert_eq!(channel.server_info().unwrap()["name"], "caption");
    assert!(channel.is_alive());

    let ops = channel.list_operations(BUDGET).await.unwrap();
    assert!(ops.contains("caption_image"));
    assert!(ops.contains("extract_image_metadata"));

    channel.ping(BUDGET).await.unwrap();
    channel.close().await;
}

#[tokio::test]
async fn test_invoke_structured_and_text() {
    let channel = StdioChannel::connect(&stub("caption"), BUDGET).await.unwrap();

    let reply = channel
        .invoke(
            "caption_image",
            json!({"input": {"path": "sample.jpg", "tags": true}}),
            BUDGET,
        )
        .await
        .unwrap();
    assert_eq!(
        normalize(&reply),
        json!({"caption": "a dog on a beach", "tags": ["dog", "beach"]})
    );

    let reply = channel.invoke("text_only", json!({}), BUDGET).await.unwrap();
    assert_eq!(normalize(&reply), json!({"text": "just words"}));

    let reply = channel
        .invoke("echo", json!({"input": {"k": 1}}), BUDGET)
        .await
        .unwrap();
    assert_eq!(normalize(&reply)["echo"]["input"]["k"], 1);

    channel.close().await;
}

#[tokio::test]
async fn test_operation_error_is_invocation_failure() {
    let channel = StdioChannel::connect(&stub("mbti"), BUDGET).await.unwrap();
    let err = channel.invoke("fail", json!({}), BUDGET).await.unwrap_err();
    match err {
        TransportError::Invocation(reason) => assert!(reason.contains("simulated failure")),
        other => panic!("unexpected {:?}", other),
    }

    // Unknown operations come back as protocol errors.
    let err = channel.invoke("nope", json!({}), BUDGET).await.unwrap_err();
    assert!(matches!(err, TransportError::Invocation(_)));

    // The channel is still usable afterwards.
    assert!(channel.invoke("echo", json!({}), BUDGET).await.is_ok());
    channel.close().await;
}

#[tokio::test]
async fn test_timeout_is_bounded_and_kills_service() {
    let channel = StdioChannel::connect(&stub("exif"), BUDGET).await.unwrap();
    let budget = Duration::from_millis(300);

    let started = Instant::now();
    let err = channel.invoke("hang", json!({}), budget).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, TransportError::Timeout { .. }), "{:?}", err);
    assert!(elapsed >= budget);
    assert!(elapsed < budget + Duration::from_secs(1), "took {:?}", elapsed);

    assert!(!channel.is_alive());
    let err = channel.invoke("echo", json!({}), BUDGET).await.unwrap_err();
    assert!(matches!(err, TransportError::Closed));

    channel.close().await;
}

#[tokio::test]
async fn test_service_exit_mid_call() {
    let channel = StdioChannel::connect(&stub("diary"), BUDGET).await.unwrap();
    let err = channel.invoke("crash", json!({}), BUDGET).await.unwrap_err();
    assert!(matches!(err, TransportError::Invocation(_)), "{:?}", err);
    channel.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let channel = StdioChannel::connect(&stub("synth"), BUDGET).await.unwrap();
    channel.close().await;
    channel.close().await;
    assert!(!channel.is_alive());
    assert!(matches!(
        channel.list_operations(BUDGET).await,
        Err(TransportError::Closed)
    ));
}

#[tokio::test]
async fn test_missing_program_is_spawn_error() {
    let desc = ServiceDescriptor::new("caption", "/definitely/not/a/real/program");
    let err = StdioChannel::connect(&desc, BUDGET).await.unwrap_err();
    assert!(matches!(err, TransportError::Spawn(_)), "{:?}", err);
}

#[tokio::test]
async fn test_service_exiting_before_handshake() {
    let desc = stub("caption").env("STUB_MODE", "exit");
    let err = StdioChannel::connect(&desc, BUDGET).await.unwrap_err();
    assert!(matches!(err, TransportError::Handshake(_)), "{:?}", err);
}

#[tokio::test]
async fn test_silent_service_handshake_times_out() {
    let desc = stub("caption").env("STUB_MODE", "mute");
    let started = Instant::now();
    let err = StdioChannel::connect(&desc, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Handshake(_)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_working_directory_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let mut desc = stub("caption");
    desc.cwd = Some(dir.path().to_path_buf());
    let channel = StdioChannel::connect(&desc, BUDGET).await.unwrap();
    assert!(channel.is_alive());
    channel.close().await;
}
