//! Peer and document identity.
//!
//! A `PeerId` is a stable opaque string chosen by the runtime that owns it.
//! It is the root identity everywhere: channels bind to it at establishment,
//! awareness is keyed by it, and ephemeral payloads are tagged with it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A stable, opaque peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A document name. Documents are created lazily on first local open or
/// on the first sync exchange that mentions them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What kind of runtime sits behind a peer id.
///
/// Relays and other infrastructure run as `Service`; end-user runtimes are
/// `User`. Permission policies may discriminate on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    User,
    Service,
}

/// The identity a runtime presents during channel establishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub peer_id: PeerId,
    /// Human-readable display name. Untrusted metadata, used for logging.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PeerKind,
}

impl PeerIdentity {
    pub fn user(peer_id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            name: name.into(),
            kind: PeerKind::User,
        }
    }

    pub fn service(peer_id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            name: name.into(),
            kind: PeerKind::Service,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_serde_uses_type_tag() {
        let id = PeerIdentity::service("relay-1", "relay");
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["type"], "service");
        assert_eq!(json["peer_id"], "relay-1");

        let back: PeerIdentity = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }
}
