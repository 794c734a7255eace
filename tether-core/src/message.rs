//! Inputs to the wire reducer.
//!
//! Everything that can change the model arrives here: transport lifecycle
//! events, decoded wire messages, application intent, and the executor's
//! import-complete notification. The receive queue serializes them so a
//! reducer step always runs to completion before the next begins.

use tokio::sync::mpsc;

use crate::engine::VersionVector;
use crate::identity::{DocId, PeerId};
use crate::model::ChannelId;
use crate::wire::WireMessage;

#[derive(Debug)]
pub enum Message {
    /// A transport opened a channel. `outbound` is where the executor
    /// sends frames for it.
    ChannelAdded {
        channel_id: ChannelId,
        outbound: mpsc::Sender<Vec<u8>>,
    },
    /// A transport closed a channel (or the executor gave up on it).
    ChannelRemoved { channel_id: ChannelId },
    /// A decoded wire message from a channel. Batches are unwrapped
    /// before dispatch, so this is never `WireMessage::Batch`.
    ChannelReceive {
        channel_id: ChannelId,
        message: WireMessage,
    },
    /// The local application committed a change to a document. Fired only
    /// for local-origin events, never for imports.
    LocalDocChange { doc_id: DocId },
    /// The executor finished importing a transmission from `from_peer`.
    /// `sender_version` is the version the sender reported alongside the
    /// imported bytes.
    DocImported {
        doc_id: DocId,
        from_peer: PeerId,
        sender_version: VersionVector,
    },
    /// Application intent: stream this document from peers.
    Subscribe { doc_id: DocId },
    Unsubscribe { doc_id: DocId },
}
