//! Ephemeral stores: presence, cursors, and other non-persistent state.
//!
//! Payloads are opaque bytes keyed by `(doc, namespace, peer)`. They ride
//! along in `sync-response`, are rebroadcast on the heartbeat, and expire
//! on a TTL. Nothing here is ever persisted or merged into a document.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::identity::{DocId, PeerId};
use crate::wire::EphemeralEntry;

struct Blob {
    data: Vec<u8>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct NamespaceStore {
    entries: HashMap<PeerId, Blob>,
}

pub struct EphemeralStores {
    ttl: Duration,
    docs: HashMap<DocId, HashMap<String, NamespaceStore>>,
}

impl EphemeralStores {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(30)),
            docs: HashMap::new(),
        }
    }

    /// Apply inbound entries. Bad payloads are dropped, never fatal.
    pub fn apply(&mut self, doc_id: &DocId, entries: &[EphemeralEntry]) {
        for entry in entries {
            if entry.namespace.is_empty() {
                tracing::warn!(doc = %doc_id, peer = %entry.peer_id, "dropping ephemeral entry with empty namespace");
                continue;
            }
            self.set(doc_id, &entry.namespace, &entry.peer_id, entry.data.clone());
        }
    }

    pub fn set(&mut self, doc_id: &DocId, namespace: &str, peer_id: &PeerId, data: Vec<u8>) {
        self.docs
            .entry(doc_id.clone())
            .or_default()
            .entry(namespace.to_string())
            .or_default()
            .entries
            .insert(
                peer_id.clone(),
                Blob {
                    data,
                    updated_at: Utc::now(),
                },
            );
    }

    /// All live entries for a doc, across namespaces and peers. Used to
    /// piggyback current state on a sync-response.
    pub fn encode_doc(&self, doc_id: &DocId) -> Vec<EphemeralEntry> {
        self.encode_filtered(doc_id, |_| true)
    }

    /// Only the entries owned by `peer_id`, for heartbeat rebroadcast of
    /// our own state.
    pub fn encode_own(&self, doc_id: &DocId, peer_id: &PeerId) -> Vec<EphemeralEntry> {
        self.encode_filtered(doc_id, |p| p == peer_id)
    }

    fn encode_filtered(&self, doc_id: &DocId, keep: impl Fn(&PeerId) -> bool) -> Vec<EphemeralEntry> {
        let Some(namespaces) = self.docs.get(doc_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (namespace, store) in namespaces {
            for (peer_id, blob) in &store.entries {
                if keep(peer_id) {
                    out.push(EphemeralEntry {
                        peer_id: peer_id.clone(),
                        namespace: namespace.clone(),
                        data: blob.data.clone(),
                    });
                }
            }
        }
        out
    }

    /// Docs that currently hold entries owned by `peer_id`.
    pub fn docs_with_own_entries(&self, peer_id: &PeerId) -> Vec<DocId> {
        self.docs
            .iter()
            .filter(|(_, namespaces)| {
                namespaces
                    .values()
                    .any(|store| store.entries.contains_key(peer_id))
            })
            .map(|(doc_id, _)| doc_id.clone())
            .collect()
    }

    /// Refresh the TTL clock on everything a peer owns.
    pub fn touch(&mut self, peer_id: &PeerId) {
        let now = Utc::now();
        for namespaces in self.docs.values_mut() {
            for store in namespaces.values_mut() {
                if let Some(blob) = store.entries.get_mut(peer_id) {
                    blob.updated_at = now;
                }
            }
        }
    }

    /// Drop everything a disconnected peer owned.
    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        for namespaces in self.docs.values_mut() {
            for store in namespaces.values_mut() {
                store.entries.remove(peer_id);
            }
        }
        self.prune();
    }

    /// Drop entries past the TTL. Returns how many were removed.
    pub fn expire(&mut self) -> usize {
        let cutoff = Utc::now() - self.ttl;
        let mut removed = 0;
        for namespaces in self.docs.values_mut() {
            for store in namespaces.values_mut() {
                let before = store.entries.len();
                store.entries.retain(|_, blob| blob.updated_at > cutoff);
                removed += before - store.entries.len();
            }
        }
        self.prune();
        removed
    }

    fn prune(&mut self) {
        for namespaces in self.docs.values_mut() {
            namespaces.retain(|_, store| !store.entries.is_empty());
        }
        self.docs.retain(|_, namespaces| !namespaces.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> DocId {
        DocId::new(id)
    }

    fn peer(id: &str) -> PeerId {
        PeerId::new(id)
    }

    #[test]
    fn set_and_encode() {
        let mut stores = EphemeralStores::new(std::time::Duration::from_secs(30));
        stores.set(&doc("d"), "presence", &peer("a"), vec![1]);
        stores.set(&doc("d"), "cursor", &peer("a"), vec![2]);
        stores.set(&doc("d"), "presence", &peer("b"), vec![3]);

        let all = stores.encode_doc(&doc("d"));
        assert_eq!(all.len(), 3);

        let own = stores.encode_own(&doc("d"), &peer("a"));
        assert_eq!(own.len(), 2);
        assert!(own.iter().all(|e| e.peer_id == peer("a")));
    }

    #[test]
    fn apply_drops_empty_namespace() {
        let mut stores = EphemeralStores::new(std::time::Duration::from_secs(30));
        stores.apply(
            &doc("d"),
            &[
                EphemeralEntry {
                    peer_id: peer("a"),
                    namespace: String::new(),
                    data: vec![1],
                },
                EphemeralEntry {
                    peer_id: peer("a"),
                    namespace: "presence".into(),
                    data: vec![2],
                },
            ],
        );
        assert_eq!(stores.encode_doc(&doc("d")).len(), 1);
    }

    #[test]
    fn expiry_removes_stale_entries() {
        let mut stores = EphemeralStores::new(std::time::Duration::from_secs(0));
        stores.set(&doc("d"), "presence", &peer("a"), vec![1]);
        // TTL of zero: everything set before the sweep is already stale.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(stores.expire(), 1);
        assert!(stores.encode_doc(&doc("d")).is_empty());
        assert!(stores.docs_with_own_entries(&peer("a")).is_empty());
    }

    #[test]
    fn remove_peer_clears_their_state_only() {
        let mut stores = EphemeralStores::new(std::time::Duration::from_secs(30));
        stores.set(&doc("d"), "presence", &peer("a"), vec![1]);
        stores.set(&doc("d"), "presence", &peer("b"), vec![2]);

        stores.remove_peer(&peer("a"));
        let left = stores.encode_doc(&doc("d"));
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].peer_id, peer("b"));
    }
}
