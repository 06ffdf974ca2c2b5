use super::*;
use serde_json::json;

fn unreachable_client() -> Client {
    // Port 1 refuses connections on any sane host.
    Client::new(
        ClientConfig::default()
            .with_name("tests")
            .with_url("amqp://127.0.0.1:1"),
    )
}

#[test]
fn test_accessors() {
    let client = unreachable_client();
    assert_eq!(client.name(), "tests");
    assert_eq!(client.exchange(), "temit");
    assert!(!client.is_closing());
}

#[tokio::test]
async fn test_connect_failure_is_retryable() {
    let client = unreachable_client();

    let first = client.connect().await;
    assert!(matches!(first, Err(TemitError::Connection(_))));

    // A failed attempt leaves the client usable; the next call tries again.
    let second = client.connect().await;
    assert!(matches!(second, Err(TemitError::Connection(_))));
    assert!(!client.is_closing());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let client = unreachable_client();
    client.close().await.unwrap();
    client.close().await.unwrap();
    assert!(client.is_closing());
}

#[tokio::test]
async fn test_operations_after_close_fail() {
    let client = unreachable_client();
    let requester = client.requester("user.get");
    let emitter = client.emitter("user.created");
    let endpoint = client.endpoint("user.get", Responder::data(json!(null)));
    let listener = client.listener("user.created", Responder::data(json!(null)));

    client.close().await.unwrap();

    assert!(matches!(client.connect().await, Err(TemitError::Closed)));
    assert!(matches!(
        requester.send::<_, serde_json::Value>(&json!(1)).await,
        Err(TemitError::Closed)
    ));
    assert!(matches!(emitter.send(&json!(1)).await, Err(TemitError::Closed)));
    assert!(matches!(endpoint.open().await, Err(TemitError::Closed)));
    assert!(matches!(listener.open().await, Err(TemitError::Closed)));
}

#[tokio::test]
async fn test_clones_share_closing_state() {
    let client = unreachable_client();
    let clone = client.clone();
    client.close().await.unwrap();
    assert!(clone.is_closing());
    assert!(matches!(clone.connect().await, Err(TemitError::Closed)));
}
