//! Commands: the reducer's side effects, interpreted by the executor.

use crate::engine::VersionVector;
use crate::identity::{DocId, PeerId};
use crate::model::ChannelId;
use crate::wire::{EphemeralEntry, WireMessage};

#[derive(Debug)]
pub enum Command {
    /// Send through the outbound batcher.
    Send {
        channel_id: ChannelId,
        message: WireMessage,
    },
    /// Send outside the batcher. Establishment traffic must be the first
    /// thing on a new channel and never batches with sync messages.
    SendEstablishment {
        channel_id: ChannelId,
        message: WireMessage,
    },
    /// Import opaque bytes into a document. On success the executor
    /// dispatches [`crate::message::Message::DocImported`] back into the
    /// receive queue. `sender_version` is the version the sender reported
    /// in the transmission: the floor of what they hold, used to cut the
    /// complement we owe them back.
    ImportDocData {
        doc_id: DocId,
        from_peer: PeerId,
        sender_version: VersionVector,
        data: Vec<u8>,
    },
    /// Apply inbound ephemeral payloads.
    ApplyEphemeral {
        doc_id: DocId,
        stores: Vec<EphemeralEntry>,
    },
    /// Execute in order.
    Batch(Vec<Command>),
}

impl Command {
    /// Collapse a command list: none for empty, the command itself for a
    /// single entry, a batch otherwise.
    pub fn from_vec(mut commands: Vec<Command>) -> Option<Command> {
        match commands.len() {
            0 => None,
            1 => commands.pop(),
            _ => Some(Command::Batch(commands)),
        }
    }
}
