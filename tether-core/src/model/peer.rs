//! Peer registry: identity, live channels, subscriptions, and awareness.
//!
//! *Awareness* (`doc_sync_states`) is this runtime's belief about what a
//! peer holds for each document. It is the load-bearing state for echo
//! suppression: after we merge a peer's bytes, their entry is advanced to
//! our post-merge version, so nothing they sent is ever cut into a delta
//! going back to them.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::engine::VersionVector;
use crate::identity::{DocId, PeerId, PeerIdentity};
use crate::model::channel::ChannelId;

/// What we believe a peer holds for one document.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerDocSyncState {
    /// The peer is believed to hold at least `last_known_version`.
    /// `None` means we know they track the doc but not from which version;
    /// the next send falls back to a snapshot.
    ///
    /// `stale` is set when the peer's last channel closes: the version
    /// stays usable as a delta-cutting floor, but it no longer counts as
    /// up-to-date, so a reconnect always triggers a fresh request round.
    Synced {
        last_known_version: Option<VersionVector>,
        last_updated: DateTime<Utc>,
        stale: bool,
    },
    /// The peer explicitly reported the document unavailable. No automatic
    /// sends; they must re-request.
    Absent { last_updated: DateTime<Utc> },
}

impl PeerDocSyncState {
    pub fn synced(version: VersionVector) -> Self {
        Self::Synced {
            last_known_version: Some(version),
            last_updated: Utc::now(),
            stale: false,
        }
    }

    pub fn absent() -> Self {
        Self::Absent {
            last_updated: Utc::now(),
        }
    }

    pub fn last_known_version(&self) -> Option<&VersionVector> {
        match self {
            Self::Synced {
                last_known_version, ..
            } => last_known_version.as_ref(),
            Self::Absent { .. } => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Synced { stale: true, .. })
    }
}

pub struct PeerState {
    pub identity: PeerIdentity,
    /// Channels currently bound to this peer. Any one may be used to send.
    pub channels: BTreeSet<ChannelId>,
    /// Documents this peer has asked us to stream.
    pub subscriptions: BTreeSet<DocId>,
    pub doc_sync_states: HashMap<DocId, PeerDocSyncState>,
    pub last_seen: DateTime<Utc>,
}

impl PeerState {
    fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            channels: BTreeSet::new(),
            subscriptions: BTreeSet::new(),
            doc_sync_states: HashMap::new(),
            last_seen: Utc::now(),
        }
    }

    /// Any live channel to this peer.
    pub fn any_channel(&self) -> Option<ChannelId> {
        self.channels.iter().next().copied()
    }

    pub fn is_connected(&self) -> bool {
        !self.channels.is_empty()
    }

    pub fn sync_state(&self, doc_id: &DocId) -> Option<&PeerDocSyncState> {
        self.doc_sync_states.get(doc_id)
    }
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerState>,
}

impl PeerRegistry {
    /// Create or merge a peer entry at channel establishment. Identity
    /// metadata is refreshed; awareness from a previous session survives
    /// as a reconnection hint.
    pub fn upsert(&mut self, identity: PeerIdentity, channel_id: ChannelId) -> &mut PeerState {
        let peer = self
            .peers
            .entry(identity.peer_id.clone())
            .or_insert_with(|| PeerState::new(identity.clone()));
        peer.identity = identity;
        peer.channels.insert(channel_id);
        peer.last_seen = Utc::now();
        peer
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerState> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerState> {
        self.peers.get_mut(peer_id)
    }

    pub fn touch(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_seen = Utc::now();
        }
    }

    /// Record awareness for `(peer, doc)`.
    pub fn record_sync_state(&mut self, peer_id: &PeerId, doc_id: &DocId, state: PeerDocSyncState) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.doc_sync_states.insert(doc_id.clone(), state);
        } else {
            tracing::debug!(peer = %peer_id, doc = %doc_id, "sync state for unknown peer dropped");
        }
    }

    /// Detach a closed channel. The peer entry is garbage-collected when
    /// its last channel closes and no subscriptions reference it; otherwise
    /// it is kept (with now-stale awareness) as a reconnection hint.
    /// Returns `true` if the peer entry was dropped.
    pub fn remove_channel(&mut self, peer_id: &PeerId, channel_id: ChannelId) -> bool {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return false;
        };
        peer.channels.remove(&channel_id);
        if peer.channels.is_empty() {
            if peer.subscriptions.is_empty() {
                self.peers.remove(peer_id);
                return true;
            }
            // Disconnected but referenced: awareness degrades to a hint.
            for state in peer.doc_sync_states.values_mut() {
                if let PeerDocSyncState::Synced { stale, .. } = state {
                    *stale = true;
                }
            }
        }
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &PeerState)> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> PeerIdentity {
        PeerIdentity::user(id, id)
    }

    #[test]
    fn upsert_merges_channels() {
        let mut reg = PeerRegistry::default();
        reg.upsert(identity("a"), ChannelId::new(1));
        reg.upsert(identity("a"), ChannelId::new(2));

        let peer = reg.get(&PeerId::new("a")).unwrap();
        assert_eq!(peer.channels.len(), 2);
    }

    #[test]
    fn peer_without_channels_or_subscriptions_is_dropped() {
        let mut reg = PeerRegistry::default();
        reg.upsert(identity("a"), ChannelId::new(1));

        assert!(reg.remove_channel(&PeerId::new("a"), ChannelId::new(1)));
        assert!(reg.get(&PeerId::new("a")).is_none());
    }

    #[test]
    fn subscribed_peer_survives_disconnect() {
        let mut reg = PeerRegistry::default();
        let peer = reg.upsert(identity("a"), ChannelId::new(1));
        peer.subscriptions.insert(DocId::new("doc-1"));
        reg.record_sync_state(
            &PeerId::new("a"),
            &DocId::new("doc-1"),
            PeerDocSyncState::synced(VersionVector::new(vec![1])),
        );

        assert!(!reg.remove_channel(&PeerId::new("a"), ChannelId::new(1)));
        let peer = reg.get(&PeerId::new("a")).unwrap();
        assert!(!peer.is_connected());
        // Awareness kept as a reconnection hint, downgraded to stale so a
        // reconnect cannot skip the request round.
        let state = peer.sync_state(&DocId::new("doc-1")).unwrap();
        assert!(state.is_stale());
        assert!(state.last_known_version().is_some());
    }
}
