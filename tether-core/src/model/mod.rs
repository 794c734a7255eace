//! The synchronizer's state: flat registries keyed by id.
//!
//! Channels reference peers and peers list channel ids; both sides are
//! stored as ids into these registries rather than object pointers, so
//! lookup failures are normal (a frame racing a close) and logged, not
//! fatal.

pub mod channel;
pub mod document;
pub mod peer;

use std::sync::Arc;

pub use channel::{Channel, ChannelId, ChannelRegistry, ChannelState};
pub use document::{DocumentEntry, DocumentRegistry, SharedDoc};
pub use peer::{PeerDocSyncState, PeerRegistry, PeerState};

use crate::engine::DocEngine;
use crate::ephemeral::EphemeralStores;
use crate::identity::PeerIdentity;
use crate::permissions::Permissions;

/// Everything the reducer reads and writes. Owned by the dispatch task;
/// nothing outside the runtime holds a mutable reference.
pub struct Model<E> {
    pub identity: PeerIdentity,
    pub channels: ChannelRegistry,
    pub peers: PeerRegistry,
    pub docs: DocumentRegistry<E>,
    pub ephemeral: EphemeralStores,
    pub permissions: Arc<dyn Permissions>,
    /// Serve documents we do not hold by creating them empty on request
    /// (relay mode) instead of answering `unavailable`.
    pub create_on_request: bool,
}

impl<E: DocEngine> Model<E> {
    pub fn new(
        identity: PeerIdentity,
        permissions: Arc<dyn Permissions>,
        create_on_request: bool,
        ephemeral_ttl: std::time::Duration,
    ) -> Self {
        let actor = identity.peer_id.clone();
        Self {
            identity,
            channels: ChannelRegistry::default(),
            peers: PeerRegistry::default(),
            docs: DocumentRegistry::new(actor),
            ephemeral: EphemeralStores::new(ephemeral_ttl),
            permissions,
            create_on_request,
        }
    }
}
