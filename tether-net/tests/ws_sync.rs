//! Round trips over real WebSockets: two clients through an in-process
//! relay, including payloads large enough to exercise fragmentation.

use std::time::Duration;

use automerge::ROOT;
use automerge::transaction::Transactable;
use tokio::time::timeout;

use tether_core::{
    AutomergeDoc, DocHandle, PeerIdentity, Synchronizer, SynchronizerConfig, VersionVector,
};
use tether_net::WsConnector;

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(10);

async fn converge_to(handle: &DocHandle<AutomergeDoc>, version: &VersionVector) {
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    loop {
        if &handle.version() == version {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("document never reached the expected version");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn two_clients_sync_through_a_websocket_relay() {
    let hub = Synchronizer::<AutomergeDoc>::spawn(SynchronizerConfig::new(
        PeerIdentity::service("relay", "relay"),
    ));
    let app = tether_net::router(hub.adapter_handle());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let url = format!("ws://{addr}/sync");

    let a = Synchronizer::<AutomergeDoc>::spawn(SynchronizerConfig::new(PeerIdentity::user(
        "A", "alice",
    )));
    let b = Synchronizer::<AutomergeDoc>::spawn(SynchronizerConfig::new(PeerIdentity::user(
        "B", "bob",
    )));
    let mut conn_a = WsConnector::new(url.clone());
    let mut conn_b = WsConnector::new(url);
    a.attach(&mut conn_a).await.unwrap();
    b.attach(&mut conn_b).await.unwrap();

    let doc_a = a.subscribe("notes").await.unwrap();
    let doc_b = b.subscribe("notes").await.unwrap();
    timeout(CONVERGE_TIMEOUT, doc_a.ready())
        .await
        .expect("ready timed out")
        .unwrap();

    // A small edit flows A → relay → B.
    doc_a
        .with_doc_mut(|d| d.doc_mut().put(ROOT, "title", "meeting notes").unwrap())
        .await
        .unwrap();
    converge_to(&doc_b, &doc_a.version()).await;

    // A payload past the WebSocket fragment threshold still arrives as
    // one logical frame on the far side.
    let blob = "y".repeat(300 * 1024);
    doc_b
        .with_doc_mut(|d| d.doc_mut().put(ROOT, "body", blob).unwrap())
        .await
        .unwrap();
    converge_to(&doc_a, &doc_b.version()).await;

    use tether_core::TransportAdapter as _;
    conn_a.stop().await.unwrap();
    conn_b.stop().await.unwrap();
    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    hub.shutdown().await.unwrap();
}
