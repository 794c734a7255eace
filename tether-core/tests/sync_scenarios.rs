//! End-to-end synchronizer scenarios.
//!
//! Two styles of harness:
//!
//! - A [`Probe`]: a raw wire-level peer speaking directly through the
//!   adapter handle, with full control over framing and timing. Used for
//!   the handshake and echo-suppression scenarios where the exact
//!   outbound traffic matters.
//! - Real runtimes joined by the in-memory transport, for convergence
//!   and relay scenarios.

use std::time::Duration;

use automerge::ROOT;
use automerge::transaction::Transactable;
use tokio::sync::mpsc;
use tokio::time::timeout;

use tether_core::engine::{DocEngine as _, Export, ExportMode};
use tether_core::transport::memory;
use tether_core::wire::{self, Transmission, WireMessage};
use tether_core::{
    AdapterHandle, AutomergeDoc, DocHandle, PeerId, PeerIdentity, Synchronizer,
    SynchronizerConfig, VersionVector,
};

/// How long to wait for an expected frame before failing.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// How long silence must last to count as "no outbound".
const SILENCE: Duration = Duration::from_millis(250);

fn user_sync(id: &str) -> Synchronizer<AutomergeDoc> {
    Synchronizer::spawn(SynchronizerConfig::new(PeerIdentity::user(id, id)))
}

fn relay_sync(id: &str) -> Synchronizer<AutomergeDoc> {
    Synchronizer::spawn(SynchronizerConfig::new(PeerIdentity::service(id, id)))
}

/// A raw wire-level peer attached to one runtime channel.
struct Probe {
    identity: PeerIdentity,
    channel_id: tether_core::ChannelId,
    outbound: mpsc::Receiver<Vec<u8>>,
    net: AdapterHandle,
}

impl Probe {
    /// Open a channel and complete the handshake: the runtime speaks
    /// first with an establish-request, we answer with our identity.
    async fn establish(sync: &Synchronizer<AutomergeDoc>, id: &str) -> Probe {
        let net = sync.adapter_handle();
        let (tx, outbound) = mpsc::channel(64);
        let channel_id = net.open_channel(tx).await;
        let mut probe = Probe {
            identity: PeerIdentity::user(id, id),
            channel_id,
            outbound,
            net,
        };
        match probe.recv().await {
            WireMessage::EstablishRequest { identity } => {
                assert_eq!(identity.peer_id, sync.identity().peer_id);
            }
            other => panic!("expected establish-request first, got {other:?}"),
        }
        probe
            .send(WireMessage::EstablishResponse {
                identity: probe.identity.clone(),
            })
            .await;
        probe
    }

    async fn send(&self, message: WireMessage) {
        let frame = wire::encode(&message).unwrap();
        self.net.deliver(self.channel_id, frame).await;
    }

    /// Next frame, batches unwrapped into their parts.
    async fn recv_all(&mut self) -> Vec<WireMessage> {
        let frame = timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("runtime closed the channel");
        match wire::decode(&frame).unwrap() {
            WireMessage::Batch { messages } => messages,
            other => vec![other],
        }
    }

    /// Next frame, asserting it is a single message.
    async fn recv(&mut self) -> WireMessage {
        let mut messages = self.recv_all().await;
        assert_eq!(messages.len(), 1, "expected one message: {messages:?}");
        messages.remove(0)
    }

    /// Assert nothing is sent for a while.
    async fn expect_silence(&mut self) {
        match timeout(SILENCE, self.outbound.recv()).await {
            Err(_) => {}
            Ok(Some(frame)) => {
                panic!("unexpected outbound: {:?}", wire::decode(&frame));
            }
            Ok(None) => panic!("channel closed during silence window"),
        }
    }

    async fn close(self) {
        self.net.close_channel(self.channel_id).await;
    }
}

/// Poll until a handle reaches a version, or fail after the timeout.
async fn converge_to(handle: &DocHandle<AutomergeDoc>, version: &VersionVector) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        if &handle.version() == version {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("document never reached the expected version");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn put_field(
    handle: &DocHandle<AutomergeDoc>,
    key: &str,
    value: &str,
) -> VersionVector {
    handle
        .with_doc_mut(|d| d.doc_mut().put(ROOT, key, value).unwrap())
        .await
        .unwrap();
    handle.version()
}

// ── Scenario 1: handshake ───────────────────────────────────────────

#[tokio::test]
async fn handshake_establishes_without_sync_traffic() {
    let a = user_sync("A");
    let mut probe = Probe::establish(&a, "B").await;

    // The establish-response races our status query; poll until the
    // runtime has bound the channel.
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let status = a.status().await.unwrap();
        if status.channels == 1 && status.peers == 1 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("channel never established: {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // No sync traffic follows establishment by itself.
    probe.expect_silence().await;
    probe.close().await;
    a.shutdown().await.unwrap();
}

// ── Scenario 2: first sync ──────────────────────────────────────────

#[tokio::test]
async fn first_sync_imports_snapshot_and_stays_quiet() {
    let a = user_sync("A");
    let mut probe = Probe::establish(&a, "B").await;

    let doc = a.subscribe("doc-1").await.unwrap();
    assert!(doc.version().is_empty());

    match probe.recv().await {
        WireMessage::SyncRequest {
            doc_id,
            requester_version,
            bidirectional,
        } => {
            assert_eq!(doc_id.as_str(), "doc-1");
            assert!(requester_version.is_empty());
            assert!(bidirectional);
        }
        other => panic!("expected sync-request, got {other:?}"),
    }

    // B holds doc-1 at v1 and answers with a snapshot.
    let mut b_doc = AutomergeDoc::new(&PeerId::new("B"));
    b_doc.doc_mut().put(ROOT, "title", "hello").unwrap();
    let v1 = b_doc.version();
    let data = match b_doc.export(ExportMode::Snapshot).unwrap() {
        Export::Bytes(bytes) => bytes,
        Export::NoOverlap => unreachable!(),
    };
    probe
        .send(WireMessage::SyncResponse {
            doc_id: "doc-1".into(),
            transmission: Transmission::Snapshot {
                data,
                version: v1.clone(),
            },
            ephemeral: None,
        })
        .await;

    doc.ready().await.unwrap();
    converge_to(&doc, &v1).await;

    // A now holds exactly what B sent; nothing goes back.
    probe.expect_silence().await;
    probe.close().await;
    a.shutdown().await.unwrap();
}

// ── Scenario 3: echo must not happen ────────────────────────────────

#[tokio::test]
async fn concurrent_local_changes_produce_complement_not_echo() {
    let a = user_sync("A");
    let mut probe = Probe::establish(&a, "B").await;

    let doc = a.subscribe("doc-1").await.unwrap();
    let request = probe.recv().await;
    assert!(matches!(request, WireMessage::SyncRequest { .. }));

    // A commits locally before B's response arrives. B is not subscribed
    // on A's side, so nothing streams yet.
    put_field(&doc, "ours", "local").await;
    probe.expect_silence().await;

    let mut b_doc = AutomergeDoc::new(&PeerId::new("B"));
    b_doc.doc_mut().put(ROOT, "theirs", "remote").unwrap();
    let v1 = b_doc.version();
    let data = match b_doc.export(ExportMode::Snapshot).unwrap() {
        Export::Bytes(bytes) => bytes,
        Export::NoOverlap => unreachable!(),
    };
    probe
        .send(WireMessage::SyncResponse {
            doc_id: "doc-1".into(),
            transmission: Transmission::Snapshot {
                data,
                version: v1.clone(),
            },
            ephemeral: None,
        })
        .await;

    // Exactly one outbound: the complement, cut from B's own version.
    match probe.recv().await {
        WireMessage::Update {
            doc_id,
            transmission: Transmission::Update { data, version },
        } => {
            assert_eq!(doc_id.as_str(), "doc-1");
            assert_eq!(version, doc.version());
            // Applying the delta completes B's doc: it contained only
            // what B was missing, never B's own bytes again.
            b_doc.import(&data).unwrap();
            assert_eq!(b_doc.version(), doc.version());
        }
        other => panic!("expected complement update, got {other:?}"),
    }
    probe.expect_silence().await;

    probe.close().await;
    a.shutdown().await.unwrap();
}

// ── Scenario 4: relay ───────────────────────────────────────────────

#[tokio::test]
async fn relay_forwards_between_subscribers_and_converges() {
    let hub = relay_sync("H");
    let a = user_sync("A");
    let b = user_sync("B");

    let link_a = memory::link(&a.adapter_handle(), &hub.adapter_handle()).await;
    let link_b = memory::link(&b.adapter_handle(), &hub.adapter_handle()).await;

    let doc_a = a.subscribe("doc-2").await.unwrap();
    let doc_b = b.subscribe("doc-2").await.unwrap();

    // Both ends see the (empty) hub copy confirmed before editing.
    doc_a.ready().await.unwrap();
    doc_b.ready().await.unwrap();

    let v = put_field(&doc_a, "note", "from A").await;
    converge_to(&doc_b, &v).await;

    // The hub holds the same version despite having no local interest.
    let doc_h = hub.document("doc-2").await.unwrap();
    converge_to(&doc_h, &v).await;

    // And the reverse direction works over the same links.
    let v2 = put_field(&doc_b, "reply", "from B").await;
    converge_to(&doc_a, &v2).await;
    converge_to(&doc_h, &v2).await;

    link_a.disconnect().await;
    link_b.disconnect().await;
    for sync in [a, b, hub] {
        sync.shutdown().await.unwrap();
    }
}

// ── Scenario 5: unavailable then create ─────────────────────────────

#[tokio::test]
async fn unavailable_doc_requires_rerequest_after_creation() {
    let a = user_sync("A");
    let b = user_sync("B");
    let link = memory::link(&a.adapter_handle(), &b.adapter_handle()).await;

    // B has never heard of doc-3 and is a user peer: unavailable.
    let doc_a = a.subscribe("doc-3").await.unwrap();
    tokio::time::sleep(SILENCE).await;
    assert!(!doc_a.is_ready());
    assert!(doc_a.version().is_empty());

    // B creates the doc and commits. A was recorded absent, so nothing
    // is pushed.
    let doc_b = b.create("doc-3").await.unwrap();
    let v1 = put_field(&doc_b, "k", "v").await;
    tokio::time::sleep(SILENCE).await;
    assert!(doc_a.version().is_empty());

    // Re-subscribing re-requests and now gets the data.
    let doc_a = a.subscribe("doc-3").await.unwrap();
    converge_to(&doc_a, &v1).await;

    link.disconnect().await;
    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// ── Scenario 6: fragmentation over a delivery path ──────────────────

#[tokio::test]
async fn large_documents_survive_a_fragmenting_transport() {
    let a = user_sync("A");
    let b = user_sync("B");
    // 1 KiB threshold: every sync frame for this doc fragments.
    let link =
        memory::link_with_threshold(&a.adapter_handle(), &b.adapter_handle(), Some(1024)).await;

    let doc_b = b.create("doc-big").await.unwrap();
    let blob: String = "x".repeat(64 * 1024);
    doc_b
        .with_doc_mut(|d| d.doc_mut().put(ROOT, "blob", blob).unwrap())
        .await
        .unwrap();
    let v1 = doc_b.version();

    let doc_a = a.subscribe("doc-big").await.unwrap();
    converge_to(&doc_a, &v1).await;

    link.disconnect().await;
    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// ── Reconnect recovery ──────────────────────────────────────────────

#[tokio::test]
async fn reconnect_recovers_missed_updates() {
    let a = user_sync("A");
    let b = user_sync("B");

    let link = memory::link(&a.adapter_handle(), &b.adapter_handle()).await;
    let doc_b = b.create("doc-4").await.unwrap();
    let v1 = put_field(&doc_b, "k", "one").await;

    let doc_a = a.subscribe("doc-4").await.unwrap();
    converge_to(&doc_a, &v1).await;

    // Drop the link; B keeps editing.
    link.disconnect().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let v2 = put_field(&doc_b, "k", "two").await;
    tokio::time::sleep(SILENCE).await;
    assert_eq!(doc_a.version(), v1);

    // A fresh link re-establishes; A's outstanding subscription drives a
    // new sync-request round, which closes the gap.
    let link = memory::link(&a.adapter_handle(), &b.adapter_handle()).await;
    converge_to(&doc_a, &v2).await;

    link.disconnect().await;
    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// ── Ephemeral state ─────────────────────────────────────────────────

#[tokio::test]
async fn ephemeral_state_reaches_subscribed_peers() {
    let a = user_sync("A");
    let b = user_sync("B");
    let link = memory::link(&a.adapter_handle(), &b.adapter_handle()).await;

    let doc_b = b.create("doc-5").await.unwrap();
    put_field(&doc_b, "k", "v").await;
    let doc_a = a.subscribe("doc-5").await.unwrap();
    doc_a.ready().await.unwrap();

    // B learned of A's interest through the bidirectional sync-request,
    // so B's presence payload streams to A.
    b.set_ephemeral("doc-5", "presence", b"cursor@42".to_vec())
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let entries = a.ephemeral_state("doc-5").await.unwrap();
        if entries
            .iter()
            .any(|e| e.namespace == "presence" && e.data == b"cursor@42" && e.peer_id == PeerId::new("B"))
        {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("ephemeral state never arrived: {entries:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    link.disconnect().await;
    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// ── Bidirectional streaming ─────────────────────────────────────────

#[tokio::test]
async fn bidirectional_request_creates_streaming_relationship() {
    let a = user_sync("A");
    let mut probe = Probe::establish(&a, "B").await;

    let doc = a.subscribe("doc-x").await.unwrap();
    assert!(matches!(probe.recv().await, WireMessage::SyncRequest { .. }));

    // The probe subscribes bidirectionally to the same doc while already
    // holding nothing; the response to this carries current data.
    probe
        .send(WireMessage::SyncRequest {
            doc_id: "doc-x".into(),
            requester_version: VersionVector::empty(),
            bidirectional: true,
        })
        .await;
    match probe.recv().await {
        WireMessage::SyncResponse {
            transmission: Transmission::UpToDate { version },
            ..
        } => assert!(version.is_empty()),
        other => panic!("expected up-to-date, got {other:?}"),
    }

    // Now every local change streams to the probe.
    let v = put_field(&doc, "k", "v").await;
    match probe.recv().await {
        WireMessage::Update {
            transmission: Transmission::Update { version, .. },
            ..
        } => assert_eq!(version, v),
        other => panic!("expected update, got {other:?}"),
    }

    probe.close().await;
    a.shutdown().await.unwrap();
}
