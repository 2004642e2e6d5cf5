// Drives the client library against an in-process node.
use gateway::{Gateway, http};
use heron_auth::Signer;
use heron_client::{Client, Error, backend_presence, signed_presence};
use heron_conn::{EnvelopeKind, random_node_id};
use heron_distr::{MemStore, Store};
use heron_router::Router;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "client-test-secret";

async fn start_node() -> String {
    let store: Arc<dyn Store> = Arc::new(MemStore::new(2));
    let router = Arc::new(Router::new(random_node_id(), gateway::CONN_TTL));
    let node = Arc::new(Gateway::new(
        Arc::clone(&store),
        Arc::clone(&router),
        Signer::new(SECRET),
    ));

    let (delivery_tx, _drains) = heron_router::start_drains(router, Arc::clone(&store), 2);
    let _listeners = heron_distr::bus::start(store, delivery_tx);

    let app = http::app_with_prefix(node, "/subs");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    format!("http://{addr}/subs")
}

fn channels(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[tokio::test]
async fn subscribe_publish_and_list() {
    let url = start_node().await;
    let backend = Client::new([url.clone()]).with_presence(backend_presence(SECRET));
    let alice = Client::new([url.clone()]).with_presence(signed_presence(SECRET, "alice"));

    let mut backend_sub = backend.subscribe(&channels(&["ch"])).await.expect("subscribe");
    assert!(backend_sub.conn().is_backend);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut alice_sub = alice.subscribe(&channels(&["ch"])).await.expect("subscribe");
    assert_eq!(alice_sub.conn().presence, "alice");

    // The backend observes alice's subscription.
    let event = tokio::time::timeout(Duration::from_secs(2), backend_sub.recv())
        .await
        .expect("timeout")
        .expect("envelope");
    assert_eq!(event.kind, EnvelopeKind::Sub);
    assert_eq!(event.conn.presence, "alice");

    alice
        .publish(&json!({"hello": "bus"}), &channels(&["ch"]))
        .await
        .expect("publish");
    let event = tokio::time::timeout(Duration::from_secs(2), backend_sub.recv())
        .await
        .expect("timeout")
        .expect("envelope");
    assert_eq!(event.kind, EnvelopeKind::Pub);
    assert_eq!(event.message, Some(json!({"hello": "bus"})));

    // Backend publish comes back down alice's subscription.
    backend
        .publish(&json!("pong"), &channels(&["ch"]))
        .await
        .expect("publish");
    let event = tokio::time::timeout(Duration::from_secs(2), alice_sub.recv())
        .await
        .expect("timeout")
        .expect("envelope");
    assert_eq!(event.kind, EnvelopeKind::Pub);
    assert!(event.conn.is_backend);
    assert_eq!(event.message, Some(json!("pong")));

    let listed = backend
        .get_subscribed(&channels(&["ch"]))
        .await
        .expect("get subscribed");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].presence, "alice");
}

#[tokio::test]
async fn listing_without_backend_presence_is_rejected() {
    let url = start_node().await;
    let client = Client::new([url]);
    let err = client
        .get_subscribed(&channels(&["ch"]))
        .await
        .expect_err("listing should be rejected");
    match err {
        Error::Rejected { status, .. } => assert_eq!(status, 403),
        other => panic!("unexpected error: {other}"),
    }
}
