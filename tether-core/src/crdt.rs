//! Automerge-backed document engine.
//!
//! Version vectors are the document's heads: the sorted set of 32-byte
//! change hashes, concatenated. Sorting makes byte equality equal to set
//! equality, which is all the core needs from a version token.
//!
//! Exports cut against a remote version with `save_after`. If the remote
//! basis contains a hash this document has never seen (disjoint history,
//! or history discarded by compaction on the remote), the export reports
//! [`Export::NoOverlap`] and the core falls back to a snapshot.

use automerge::{AutoCommit, ChangeHash};

use crate::engine::{DocEngine, EngineError, Export, ExportMode, VersionVector};
use crate::identity::PeerId;

/// An automerge document owned by the document registry.
pub struct AutomergeDoc {
    doc: AutoCommit,
}

impl AutomergeDoc {
    /// A fresh document whose actor id derives from our peer id, so change
    /// attribution matches transport identity.
    pub fn new(actor: &PeerId) -> Self {
        let actor = automerge::ActorId::from(actor.as_str().as_bytes());
        Self {
            doc: AutoCommit::new().with_actor(actor),
        }
    }

    /// Load from a saved snapshot.
    pub fn load(data: &[u8], actor: &PeerId) -> Result<Self, EngineError> {
        let actor = automerge::ActorId::from(actor.as_str().as_bytes());
        let doc = AutoCommit::load(data)
            .map_err(|e| EngineError::Corrupt(e.to_string()))?
            .with_actor(actor);
        Ok(Self { doc })
    }

    /// Direct access for application edits through the draft API.
    pub fn doc_mut(&mut self) -> &mut AutoCommit {
        &mut self.doc
    }

    pub fn doc(&self) -> &AutoCommit {
        &self.doc
    }

    fn encode_heads(mut heads: Vec<ChangeHash>) -> VersionVector {
        heads.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let mut bytes = Vec::with_capacity(heads.len() * 32);
        for head in &heads {
            bytes.extend_from_slice(&head.0);
        }
        VersionVector::new(bytes)
    }

    fn decode_heads(version: &VersionVector) -> Result<Vec<ChangeHash>, EngineError> {
        let bytes = version.as_bytes();
        if bytes.len() % 32 != 0 {
            return Err(EngineError::BadVersion(format!(
                "length {} is not a multiple of 32",
                bytes.len()
            )));
        }
        bytes
            .chunks_exact(32)
            .map(|chunk| {
                ChangeHash::try_from(chunk)
                    .map_err(|e| EngineError::BadVersion(e.to_string()))
            })
            .collect()
    }
}

impl DocEngine for AutomergeDoc {
    fn create(actor: &PeerId) -> Self {
        Self::new(actor)
    }

    fn version(&mut self) -> VersionVector {
        Self::encode_heads(self.doc.get_heads())
    }

    fn export(&mut self, mode: ExportMode) -> Result<Export, EngineError> {
        match mode {
            ExportMode::Snapshot => Ok(Export::Bytes(self.doc.save())),
            ExportMode::Update { from } => {
                let heads = Self::decode_heads(&from)?;
                for head in &heads {
                    if self.doc.get_change_by_hash(head).is_none() {
                        return Ok(Export::NoOverlap);
                    }
                }
                Ok(Export::Bytes(self.doc.save_after(&heads)))
            }
        }
    }

    fn import(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.doc
            .load_incremental(data)
            .map(|_| ())
            .map_err(|e| EngineError::Corrupt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use automerge::ROOT;
    use automerge::transaction::Transactable;

    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id)
    }

    #[test]
    fn empty_doc_has_empty_version() {
        let mut doc = AutomergeDoc::new(&peer("a"));
        assert!(doc.version().is_empty());
    }

    #[test]
    fn version_changes_after_commit() {
        let mut doc = AutomergeDoc::new(&peer("a"));
        doc.doc_mut().put(ROOT, "k", "v").unwrap();
        let v1 = doc.version();
        assert!(!v1.is_empty());

        doc.doc_mut().put(ROOT, "k", "w").unwrap();
        assert_ne!(doc.version(), v1);
    }

    #[test]
    fn update_export_applies_incrementally() {
        let mut a = AutomergeDoc::new(&peer("a"));
        let mut b = AutomergeDoc::new(&peer("b"));

        a.doc_mut().put(ROOT, "greeting", "hello").unwrap();
        let snapshot = match a.export(ExportMode::Snapshot).unwrap() {
            Export::Bytes(bytes) => bytes,
            Export::NoOverlap => panic!("snapshot export cannot lack overlap"),
        };
        b.import(&snapshot).unwrap();
        let b_version = b.version();
        assert_eq!(b_version, a.version());

        a.doc_mut().put(ROOT, "greeting", "hej").unwrap();
        let update = match a.export(ExportMode::Update { from: b_version }).unwrap() {
            Export::Bytes(bytes) => bytes,
            Export::NoOverlap => panic!("b's version is known to a"),
        };
        b.import(&update).unwrap();
        assert_eq!(b.version(), a.version());
    }

    #[test]
    fn export_from_unknown_basis_reports_no_overlap() {
        let mut a = AutomergeDoc::new(&peer("a"));
        let mut stranger = AutomergeDoc::new(&peer("x"));

        a.doc_mut().put(ROOT, "k", 1).unwrap();
        stranger.doc_mut().put(ROOT, "other", 2).unwrap();

        let from = stranger.version();
        match a.export(ExportMode::Update { from }).unwrap() {
            Export::NoOverlap => {}
            Export::Bytes(_) => panic!("disjoint history must report NoOverlap"),
        }
    }

    #[test]
    fn export_from_empty_version_carries_everything() {
        let mut a = AutomergeDoc::new(&peer("a"));
        let mut b = AutomergeDoc::new(&peer("b"));

        a.doc_mut().put(ROOT, "k", "v").unwrap();
        let update = match a
            .export(ExportMode::Update {
                from: VersionVector::empty(),
            })
            .unwrap()
        {
            Export::Bytes(bytes) => bytes,
            Export::NoOverlap => panic!("empty basis always overlaps"),
        };
        b.import(&update).unwrap();
        assert_eq!(b.version(), a.version());
    }

    #[test]
    fn import_rejects_garbage() {
        let mut doc = AutomergeDoc::new(&peer("a"));
        assert!(doc.import(b"definitely not automerge").is_err());
    }

    #[test]
    fn misaligned_version_is_rejected() {
        let mut doc = AutomergeDoc::new(&peer("a"));
        let bad = VersionVector::new(vec![0u8; 33]);
        assert!(doc.export(ExportMode::Update { from: bad }).is_err());
    }
}
