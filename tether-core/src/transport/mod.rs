//! The transport adapter contract.
//!
//! An adapter owns the sockets; the core owns the protocol. The split is
//! a handle: adapters call [`AdapterHandle::open_channel`] when a
//! connection comes up, [`AdapterHandle::deliver`] for every reassembled
//! inbound frame, and [`AdapterHandle::close_channel`] when the
//! connection dies. Each call enqueues and yields; nothing here re-enters
//! the reducer.
//!
//! Outbound frames flow the other way through the `mpsc::Sender` the
//! adapter hands to `open_channel`. Frames on both sides are complete
//! logical messages; fragmentation (see [`crate::fragment`]) is the
//! adapter's business, applied below this interface.
//!
//! Reconnection, backoff, and retry all belong to adapters. An adapter
//! that drops an in-flight connection must eventually call
//! `close_channel` so the core can reclaim state.

pub mod memory;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::ChannelId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),
    #[error("adapter failed: {0}")]
    Adapter(String),
}

/// Transport lifecycle events, consumed by the dispatch loop.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Opened {
        channel_id: ChannelId,
        outbound: mpsc::Sender<Vec<u8>>,
    },
    Frame {
        channel_id: ChannelId,
        bytes: Vec<u8>,
    },
    Closed {
        channel_id: ChannelId,
    },
}

/// The adapter's way into the runtime. Cheap to clone; valid for the
/// runtime's lifetime.
#[derive(Clone)]
pub struct AdapterHandle {
    events: mpsc::Sender<TransportEvent>,
    next_channel_id: Arc<AtomicU64>,
}

impl AdapterHandle {
    pub(crate) fn new(events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            events,
            next_channel_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new channel. `outbound` receives the frames the runtime
    /// wants sent on it. Returns the channel id the adapter must tag
    /// deliveries with.
    pub async fn open_channel(&self, outbound: mpsc::Sender<Vec<u8>>) -> ChannelId {
        let channel_id = ChannelId::new(self.next_channel_id.fetch_add(1, Ordering::Relaxed));
        let _ = self
            .events
            .send(TransportEvent::Opened {
                channel_id,
                outbound,
            })
            .await;
        channel_id
    }

    /// Hand one complete inbound frame to the runtime.
    pub async fn deliver(&self, channel_id: ChannelId, bytes: Vec<u8>) {
        let _ = self
            .events
            .send(TransportEvent::Frame { channel_id, bytes })
            .await;
    }

    /// Report a channel gone. Idempotent from the core's perspective.
    pub async fn close_channel(&self, channel_id: ChannelId) {
        let _ = self
            .events
            .send(TransportEvent::Closed { channel_id })
            .await;
    }
}

/// A pluggable transport.
#[async_trait]
pub trait TransportAdapter: Send {
    /// Bring the transport up. The adapter keeps the handle and reports
    /// channels and frames through it until `stop`.
    async fn start(&mut self, handle: AdapterHandle) -> anyhow::Result<()>;

    /// Tear the transport down, completing or failing in-flight sends,
    /// and close any channels it opened.
    async fn stop(&mut self) -> anyhow::Result<()>;
}
