//! Wire messages and the JSON envelope.
//!
//! Every frame carries one tagged message. CRDT payloads and ephemeral
//! blobs are opaque byte sequences, carried as base64 strings inside the
//! JSON envelope. Unknown tags fail decoding and are protocol errors at
//! the receiver, never panics.
//!
//! A `batch` message is an opaque container: the receive path unwraps it
//! into its parts before dispatch, so the reducer only ever sees the
//! non-batch variants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::VersionVector;
use crate::fragment::FragmentError;
use crate::identity::{DocId, PeerId, PeerIdentity};

/// Base64 codec for opaque byte fields, matching how CRDT payloads are
/// carried in the envelope.
pub(crate) mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// The payload variant inside `sync-response` and `update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Transmission {
    /// A full export, importable into an empty document.
    #[serde(rename = "snapshot")]
    Snapshot {
        #[serde(with = "b64")]
        data: Vec<u8>,
        version: VersionVector,
    },
    /// A delta cut against the receiver's reported version.
    #[serde(rename = "update")]
    Update {
        #[serde(with = "b64")]
        data: Vec<u8>,
        version: VersionVector,
    },
    /// The sender holds exactly the receiver's version; nothing to carry.
    #[serde(rename = "up-to-date")]
    UpToDate { version: VersionVector },
    /// The sender does not have (and will not serve) this document.
    #[serde(rename = "unavailable")]
    Unavailable,
}

/// One namespaced ephemeral payload, tagged with the peer that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralEntry {
    pub peer_id: PeerId,
    pub namespace: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// Everything that travels on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// First frame on every new channel: who we are.
    #[serde(rename = "establish-request")]
    EstablishRequest { identity: PeerIdentity },
    #[serde(rename = "establish-response")]
    EstablishResponse { identity: PeerIdentity },

    /// Ask the peer to stream a document, reporting what we already hold.
    #[serde(rename = "sync-request")]
    SyncRequest {
        doc_id: DocId,
        requester_version: VersionVector,
        /// When set, the sender also wants our future updates for this doc.
        bidirectional: bool,
    },
    #[serde(rename = "sync-response")]
    SyncResponse {
        doc_id: DocId,
        transmission: Transmission,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ephemeral: Option<Vec<EphemeralEntry>>,
    },
    /// An ongoing delta outside the request/response pair.
    #[serde(rename = "update")]
    Update {
        doc_id: DocId,
        transmission: Transmission,
    },

    /// Standalone ephemeral state (presence, cursors). Never persisted.
    #[serde(rename = "ephemeral")]
    Ephemeral {
        doc_id: DocId,
        stores: Vec<EphemeralEntry>,
    },

    /// Opaque container; unwrapped before dispatch.
    #[serde(rename = "batch")]
    Batch { messages: Vec<WireMessage> },
}

impl WireMessage {
    /// The doc this message concerns, if any.
    pub fn doc_id(&self) -> Option<&DocId> {
        match self {
            WireMessage::SyncRequest { doc_id, .. }
            | WireMessage::SyncResponse { doc_id, .. }
            | WireMessage::Update { doc_id, .. }
            | WireMessage::Ephemeral { doc_id, .. } => Some(doc_id),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
    #[error(transparent)]
    Fragment(#[from] FragmentError),
}

/// Encode one logical frame.
pub fn encode(message: &WireMessage) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode one logical frame.
pub fn decode(bytes: &[u8]) -> Result<WireMessage, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}
