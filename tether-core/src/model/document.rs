//! Document registry: exclusive owner of CRDT handles.
//!
//! Entries are created lazily on first local open, on `subscribe`, or on
//! an inbound sync-request when the runtime serves documents on demand
//! (relay mode). Each entry carries a readiness latch that trips when a
//! peer confirms we are up to date or a first import lands.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::engine::DocEngine;
use crate::identity::{DocId, PeerId};

/// Shared handle to one engine document. Locked briefly and never across
/// an await point.
pub type SharedDoc<E> = Arc<Mutex<E>>;

pub struct DocumentEntry<E> {
    doc: SharedDoc<E>,
    ready_tx: watch::Sender<bool>,
}

impl<E> DocumentEntry<E> {
    fn new(doc: E) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            doc: Arc::new(Mutex::new(doc)),
            ready_tx,
        }
    }

    pub fn doc(&self) -> &SharedDoc<E> {
        &self.doc
    }

    /// Trip the readiness latch. Idempotent.
    pub fn mark_ready(&self) {
        self.ready_tx.send_replace(true);
    }

    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }
}

pub struct DocumentRegistry<E> {
    actor: PeerId,
    docs: HashMap<DocId, DocumentEntry<E>>,
    /// Documents the application has subscribed to.
    local_subscriptions: BTreeSet<DocId>,
}

impl<E: DocEngine> DocumentRegistry<E> {
    pub fn new(actor: PeerId) -> Self {
        Self {
            actor,
            docs: HashMap::new(),
            local_subscriptions: BTreeSet::new(),
        }
    }

    /// Get or lazily create an entry.
    pub fn ensure(&mut self, doc_id: &DocId) -> &DocumentEntry<E> {
        self.docs
            .entry(doc_id.clone())
            .or_insert_with(|| DocumentEntry::new(E::create(&self.actor)))
    }

    pub fn get(&self, doc_id: &DocId) -> Option<&DocumentEntry<E>> {
        self.docs.get(doc_id)
    }

    pub fn contains(&self, doc_id: &DocId) -> bool {
        self.docs.contains_key(doc_id)
    }

    pub fn subscribe_local(&mut self, doc_id: &DocId) {
        self.ensure(doc_id);
        self.local_subscriptions.insert(doc_id.clone());
    }

    pub fn unsubscribe_local(&mut self, doc_id: &DocId) {
        self.local_subscriptions.remove(doc_id);
    }

    pub fn is_locally_subscribed(&self, doc_id: &DocId) -> bool {
        self.local_subscriptions.contains(doc_id)
    }

    pub fn local_subscriptions(&self) -> impl Iterator<Item = &DocId> {
        self.local_subscriptions.iter()
    }

    pub fn doc_ids(&self) -> impl Iterator<Item = &DocId> {
        self.docs.keys()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::crdt::AutomergeDoc;
    use crate::engine::DocEngine as _;

    use super::*;

    #[test]
    fn ensure_is_lazy_and_idempotent() {
        let mut reg: DocumentRegistry<AutomergeDoc> = DocumentRegistry::new(PeerId::new("a"));
        assert!(!reg.contains(&DocId::new("doc-1")));

        reg.ensure(&DocId::new("doc-1"));
        reg.ensure(&DocId::new("doc-1"));
        assert_eq!(reg.len(), 1);
        assert!(reg.get(&DocId::new("doc-1")).unwrap().doc().lock().version().is_empty());
    }

    #[test]
    fn readiness_latch_trips_once() {
        let mut reg: DocumentRegistry<AutomergeDoc> = DocumentRegistry::new(PeerId::new("a"));
        let entry = reg.ensure(&DocId::new("doc-1"));
        let rx = entry.ready();
        assert!(!*rx.borrow());

        entry.mark_ready();
        entry.mark_ready();
        assert!(*rx.borrow());
    }

    #[test]
    fn subscription_tracking() {
        let mut reg: DocumentRegistry<AutomergeDoc> = DocumentRegistry::new(PeerId::new("a"));
        reg.subscribe_local(&DocId::new("doc-1"));
        assert!(reg.is_locally_subscribed(&DocId::new("doc-1")));
        assert!(reg.contains(&DocId::new("doc-1")));

        reg.unsubscribe_local(&DocId::new("doc-1"));
        assert!(!reg.is_locally_subscribed(&DocId::new("doc-1")));
        // The entry itself stays; the registry owns it until shutdown.
        assert!(reg.contains(&DocId::new("doc-1")));
    }
}
