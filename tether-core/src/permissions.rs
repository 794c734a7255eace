//! Per-document access control.
//!
//! `read` gates every outbound frame that carries document data to a
//! peer; `write` gates every inbound transmission before it reaches the
//! engine. Denials drop silently so a restricted document's existence is
//! never revealed.

use crate::identity::{DocId, PeerIdentity};

pub trait Permissions: Send + Sync {
    /// May `peer` receive data for `doc`?
    fn read(&self, _doc: &DocId, _peer: &PeerIdentity) -> bool {
        true
    }

    /// May `peer` contribute data to `doc`?
    fn write(&self, _doc: &DocId, _peer: &PeerIdentity) -> bool {
        true
    }
}

/// The default policy: everyone may read and write everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Permissions for AllowAll {}
