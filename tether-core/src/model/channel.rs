//! Channel registry.
//!
//! A channel is an ordered frame stream to one transport endpoint. It is
//! `Connected` from the moment the adapter reports it and `Established`
//! once the identity handshake binds it to a peer. Once established, the
//! binding is immutable for the channel's lifetime.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::identity::PeerId;

/// Runtime-scoped channel identifier, minted by the adapter handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Transport open, peer unknown.
    Connected,
    /// Handshake complete, bound to exactly one peer.
    Established { peer_id: PeerId },
}

pub struct Channel {
    pub id: ChannelId,
    pub state: ChannelState,
    pub opened_at: DateTime<Utc>,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl Channel {
    pub fn peer_id(&self) -> Option<&PeerId> {
        match &self.state {
            ChannelState::Established { peer_id } => Some(peer_id),
            ChannelState::Connected => None,
        }
    }

    /// The adapter-side sender for outbound frames on this channel.
    pub fn outbound(&self) -> &mpsc::Sender<Vec<u8>> {
        &self.outbound
    }
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelId, Channel>,
}

impl ChannelRegistry {
    pub fn insert_connected(&mut self, id: ChannelId, outbound: mpsc::Sender<Vec<u8>>) {
        self.channels.insert(
            id,
            Channel {
                id,
                state: ChannelState::Connected,
                opened_at: Utc::now(),
                outbound,
            },
        );
    }

    /// Bind a connected channel to a peer. Returns `false` if the channel
    /// is unknown or already bound to a different peer; binding the same
    /// peer again is idempotent.
    pub fn establish(&mut self, id: ChannelId, peer_id: PeerId) -> bool {
        match self.channels.get_mut(&id) {
            Some(channel) => match &channel.state {
                ChannelState::Connected => {
                    channel.state = ChannelState::Established { peer_id };
                    true
                }
                ChannelState::Established { peer_id: bound } => *bound == peer_id,
            },
            None => false,
        }
    }

    pub fn remove(&mut self, id: ChannelId) -> Option<Channel> {
        self.channels.remove(&id)
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// The peer a channel is established with, if it is established.
    pub fn peer_of(&self, id: ChannelId) -> Option<PeerId> {
        self.channels.get(&id)?.peer_id().cloned()
    }

    pub fn state_of(&self, id: ChannelId) -> Option<&ChannelState> {
        self.channels.get(&id).map(|c| &c.state)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
