//! The synchronizer runtime.
//!
//! One logical execution context owns the model: a single dispatch task
//! fed by two queues. The receive queue serializes everything — transport
//! events, application intent, and the executor's follow-ups — so each
//! reducer step runs to completion (including its commands and the
//! outbound flush) before the next input is dequeued.
//!
//! The public surface communicates with the task exclusively through
//! messages; nothing outside ever touches the model. Document handles
//! share the engine doc behind a short-lived mutex so application edits
//! and executor imports both happen in the single context without a
//! reference cycle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::batcher::OutboundBatcher;
use crate::engine::{DocEngine, VersionVector};
use crate::identity::{DocId, PeerIdentity};
use crate::message::Message;
use crate::model::{Model, SharedDoc};
use crate::permissions::{AllowAll, Permissions};
use crate::transport::{AdapterHandle, TransportAdapter, TransportEvent};
use crate::wire::{self, WireMessage};
use crate::{executor, reducer};

/// Runtime configuration.
pub struct SynchronizerConfig {
    pub identity: PeerIdentity,
    pub permissions: Arc<dyn Permissions>,
    /// Serve unknown documents by creating them empty on request instead
    /// of answering `unavailable`. Defaults to `true` for service peers
    /// (relays serve whatever their clients bring) and `false` for users.
    pub create_on_request: bool,
    pub heartbeat_interval: Duration,
    pub ephemeral_ttl: Duration,
    /// Receive queue depth per input source.
    pub queue_capacity: usize,
}

impl SynchronizerConfig {
    pub fn new(identity: PeerIdentity) -> Self {
        let create_on_request = matches!(identity.kind, crate::identity::PeerKind::Service);
        Self {
            identity,
            permissions: Arc::new(AllowAll),
            create_on_request,
            heartbeat_interval: Duration::from_secs(15),
            ephemeral_ttl: Duration::from_secs(45),
            queue_capacity: 1024,
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn Permissions>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_create_on_request(mut self, create: bool) -> Self {
        self.create_on_request = create;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_ephemeral_ttl(mut self, ttl: Duration) -> Self {
        self.ephemeral_ttl = ttl;
        self
    }
}

/// A coarse view of the runtime, for health endpoints and tests.
#[derive(Debug, Clone)]
pub struct Status {
    pub peers: usize,
    pub channels: usize,
    pub docs: usize,
}

enum Input<E: DocEngine> {
    Msg(Message),
    Open {
        doc_id: DocId,
        reply: oneshot::Sender<DocHandle<E>>,
    },
    SetEphemeral {
        doc_id: DocId,
        namespace: String,
        data: Vec<u8>,
    },
    GetEphemeral {
        doc_id: DocId,
        reply: oneshot::Sender<Vec<crate::wire::EphemeralEntry>>,
    },
    Status {
        reply: oneshot::Sender<Status>,
    },
    Shutdown,
}

/// A handle to one synchronized document.
///
/// Edits go through [`DocHandle::with_doc_mut`], which commits the change
/// and feeds a local-change event into the runtime so subscribed peers
/// receive a delta. The closure runs under a short lock; do not block in
/// it.
pub struct DocHandle<E: DocEngine> {
    doc_id: DocId,
    doc: SharedDoc<E>,
    inbox: mpsc::Sender<Input<E>>,
    ready: watch::Receiver<bool>,
}

impl<E: DocEngine> Clone for DocHandle<E> {
    fn clone(&self) -> Self {
        Self {
            doc_id: self.doc_id.clone(),
            doc: self.doc.clone(),
            inbox: self.inbox.clone(),
            ready: self.ready.clone(),
        }
    }
}

impl<E: DocEngine> DocHandle<E> {
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    /// Current version of the local document.
    pub fn version(&self) -> VersionVector {
        self.doc.lock().version()
    }

    /// Read the document.
    pub fn with_doc<T>(&self, f: impl FnOnce(&E) -> T) -> T {
        let doc = self.doc.lock();
        f(&doc)
    }

    /// Mutate the document and notify the runtime of a local change.
    pub async fn with_doc_mut<T>(&self, f: impl FnOnce(&mut E) -> T) -> anyhow::Result<T> {
        let out = {
            let mut doc = self.doc.lock();
            f(&mut doc)
        };
        self.inbox
            .send(Input::Msg(Message::LocalDocChange {
                doc_id: self.doc_id.clone(),
            }))
            .await
            .map_err(|_| anyhow!("synchronizer stopped"))?;
        Ok(out)
    }

    /// Wait until a peer confirms we are up to date or a first import
    /// lands for this document.
    pub async fn ready(&self) -> anyhow::Result<()> {
        let mut rx = self.ready.clone();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            rx.changed()
                .await
                .map_err(|_| anyhow!("synchronizer stopped"))?;
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }
}

/// A running synchronizer.
pub struct Synchronizer<E: DocEngine> {
    identity: PeerIdentity,
    inbox: mpsc::Sender<Input<E>>,
    adapter: AdapterHandle,
    task: JoinHandle<()>,
}

impl<E: DocEngine> Synchronizer<E> {
    /// Spawn the dispatch task and return the facade.
    pub fn spawn(config: SynchronizerConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.queue_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.queue_capacity);
        let adapter = AdapterHandle::new(event_tx);

        let model = Model::new(
            config.identity.clone(),
            config.permissions.clone(),
            config.create_on_request,
            config.ephemeral_ttl,
        );

        let identity = config.identity.clone();
        let heartbeat = config.heartbeat_interval;
        let inbox_for_task = inbox_tx.clone();
        let task = tokio::spawn(run_loop(
            model,
            inbox_rx,
            event_rx,
            inbox_for_task,
            heartbeat,
        ));

        Self {
            identity,
            inbox: inbox_tx,
            adapter,
            task,
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// The handle transports use to feed this runtime.
    pub fn adapter_handle(&self) -> AdapterHandle {
        self.adapter.clone()
    }

    /// Start a transport against this runtime.
    pub async fn attach<A: TransportAdapter>(&self, adapter: &mut A) -> anyhow::Result<()> {
        adapter.start(self.adapter.clone()).await
    }

    /// Get or lazily create a document.
    pub async fn document(&self, doc_id: impl Into<DocId>) -> anyhow::Result<DocHandle<E>> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Input::Open {
                doc_id: doc_id.into(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("synchronizer stopped"))?;
        rx.await.map_err(|_| anyhow!("synchronizer stopped"))
    }

    /// Create a document. Creation is lazy and idempotent; this is
    /// [`Synchronizer::document`] under a name that states intent.
    pub async fn create(&self, doc_id: impl Into<DocId>) -> anyhow::Result<DocHandle<E>> {
        self.document(doc_id).await
    }

    /// Subscribe to a document: ensure it exists locally and request it
    /// from every established peer not already known to be up to date.
    pub async fn subscribe(&self, doc_id: impl Into<DocId>) -> anyhow::Result<DocHandle<E>> {
        let doc_id = doc_id.into();
        let handle = self.document(doc_id.clone()).await?;
        self.inbox
            .send(Input::Msg(Message::Subscribe { doc_id }))
            .await
            .map_err(|_| anyhow!("synchronizer stopped"))?;
        Ok(handle)
    }

    pub async fn unsubscribe(&self, doc_id: impl Into<DocId>) -> anyhow::Result<()> {
        self.inbox
            .send(Input::Msg(Message::Unsubscribe {
                doc_id: doc_id.into(),
            }))
            .await
            .map_err(|_| anyhow!("synchronizer stopped"))
    }

    /// Wait until `doc_id` is ready (see [`DocHandle::ready`]).
    pub async fn on_ready(&self, doc_id: impl Into<DocId>) -> anyhow::Result<()> {
        self.document(doc_id).await?.ready().await
    }

    /// Publish our own ephemeral payload for a document namespace. It is
    /// broadcast immediately and rebroadcast on the heartbeat until it
    /// expires or is replaced.
    pub async fn set_ephemeral(
        &self,
        doc_id: impl Into<DocId>,
        namespace: impl Into<String>,
        data: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.inbox
            .send(Input::SetEphemeral {
                doc_id: doc_id.into(),
                namespace: namespace.into(),
                data,
            })
            .await
            .map_err(|_| anyhow!("synchronizer stopped"))
    }

    /// Current ephemeral entries for a document, across namespaces and
    /// peers.
    pub async fn ephemeral_state(
        &self,
        doc_id: impl Into<DocId>,
    ) -> anyhow::Result<Vec<crate::wire::EphemeralEntry>> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Input::GetEphemeral {
                doc_id: doc_id.into(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("synchronizer stopped"))?;
        rx.await.map_err(|_| anyhow!("synchronizer stopped"))
    }

    pub async fn status(&self) -> anyhow::Result<Status> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Input::Status { reply })
            .await
            .map_err(|_| anyhow!("synchronizer stopped"))?;
        rx.await.map_err(|_| anyhow!("synchronizer stopped"))
    }

    /// Stop the dispatch task. In-queue messages are dropped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.inbox.send(Input::Shutdown).await;
        self.task.await.map_err(|e| anyhow!("dispatch task: {e}"))
    }
}

async fn run_loop<E: DocEngine>(
    mut model: Model<E>,
    mut inputs: mpsc::Receiver<Input<E>>,
    mut events: mpsc::Receiver<TransportEvent>,
    inbox: mpsc::Sender<Input<E>>,
    heartbeat: Duration,
) {
    let mut batcher = OutboundBatcher::default();
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            // Application intent and executor follow-ups outrank transport
            // deliveries, so an import's completion is reduced before the
            // next inbound frame.
            biased;

            input = inputs.recv() => match input {
                None | Some(Input::Shutdown) => break,
                Some(Input::Open { doc_id, reply }) => {
                    let entry = model.docs.ensure(&doc_id);
                    let handle = DocHandle {
                        doc_id,
                        doc: entry.doc().clone(),
                        inbox: inbox.clone(),
                        ready: entry.ready(),
                    };
                    let _ = reply.send(handle);
                }
                Some(Input::SetEphemeral { doc_id, namespace, data }) => {
                    let us = model.identity.peer_id.clone();
                    model.ephemeral.set(&doc_id, &namespace, &us, data);
                    if let Some(command) = reducer::broadcast_ephemeral(&mut model, &doc_id) {
                        run_commands(&mut model, &mut batcher, command).await;
                    }
                }
                Some(Input::GetEphemeral { doc_id, reply }) => {
                    let _ = reply.send(model.ephemeral.encode_doc(&doc_id));
                }
                Some(Input::Status { reply }) => {
                    let _ = reply.send(Status {
                        peers: model.peers.len(),
                        channels: model.channels.len(),
                        docs: model.docs.len(),
                    });
                }
                Some(Input::Msg(message)) => {
                    dispatch(&mut model, &mut batcher, message).await;
                }
            },

            event = events.recv() => match event {
                // All adapter handles dropped; the facade keeps one, so
                // this means the runtime is shutting down anyway.
                None => break,
                Some(TransportEvent::Opened { channel_id, outbound }) => {
                    dispatch(&mut model, &mut batcher, Message::ChannelAdded { channel_id, outbound }).await;
                }
                Some(TransportEvent::Closed { channel_id }) => {
                    dispatch(&mut model, &mut batcher, Message::ChannelRemoved { channel_id }).await;
                }
                Some(TransportEvent::Frame { channel_id, bytes }) => {
                    match wire::decode(&bytes) {
                        Ok(message) => {
                            // Batches are opaque containers: unwrap before
                            // dispatch so the reducer sees the parts.
                            let parts = match message {
                                WireMessage::Batch { messages } => messages,
                                other => vec![other],
                            };
                            for part in parts {
                                dispatch(&mut model, &mut batcher, Message::ChannelReceive {
                                    channel_id,
                                    message: part,
                                }).await;
                            }
                        }
                        Err(e) => {
                            warn!(
                                channel = %channel_id,
                                error = %e,
                                len = bytes.len(),
                                "dropping malformed frame"
                            );
                        }
                    }
                }
            },

            _ = ticker.tick() => {
                let expired = model.ephemeral.expire();
                if expired > 0 {
                    debug!(expired, "ephemeral entries expired");
                }
                if let Some(command) = reducer::heartbeat(&mut model) {
                    run_commands(&mut model, &mut batcher, command).await;
                }
            }
        }
    }
    debug!("synchronizer dispatch loop stopped");
}

/// One dispatch: reduce, execute, flush — repeated for any follow-ups the
/// executor produced, so the whole cycle completes before the caller
/// dequeues the next input.
async fn dispatch<E: DocEngine>(
    model: &mut Model<E>,
    batcher: &mut OutboundBatcher,
    first: Message,
) {
    let mut queue = VecDeque::new();
    queue.push_back(first);
    while let Some(message) = queue.pop_front() {
        if let Some(command) = reducer::update(model, message) {
            for follow_up in executor::execute(model, batcher, command) {
                queue.push_back(follow_up);
            }
        }
        for failed in batcher.flush(&model.channels).await {
            queue.push_back(Message::ChannelRemoved {
                channel_id: failed,
            });
        }
    }
}

/// Execute a command produced outside a reducer step (heartbeat,
/// ephemeral publication).
async fn run_commands<E: DocEngine>(
    model: &mut Model<E>,
    batcher: &mut OutboundBatcher,
    command: crate::command::Command,
) {
    // These commands never import, so there are no follow-ups.
    let follow_ups = executor::execute(model, batcher, command);
    debug_assert!(follow_ups.is_empty());
    for failed in batcher.flush(&model.channels).await {
        dispatch(model, batcher, Message::ChannelRemoved { channel_id: failed }).await;
    }
}
