//! The seam between the synchronizer and the CRDT engine.
//!
//! The core never interprets document bytes. It needs exactly three things
//! from an engine: a comparable version token, an exporter that can cut a
//! delta against a remote version (or fall back to a full snapshot when the
//! remote basis is unknown), and an importer that merges opaque bytes.
//!
//! [`crate::crdt::AutomergeDoc`] is the shipped implementation.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::identity::PeerId;

/// An opaque version token produced by the engine.
///
/// Supports equality and round-trips through the wire as base64. The core
/// never inspects the contents; only the engine that minted a vector can
/// use it as an export cutoff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VersionVector(Vec<u8>);

impl VersionVector {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The version of a document with no history.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for VersionVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for VersionVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(VersionVector)
            .map_err(serde::de::Error::custom)
    }
}

/// What to export from a document.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportMode {
    /// The whole document, importable into an empty peer.
    Snapshot,
    /// Everything the holder of `from` is missing.
    Update { from: VersionVector },
}

/// The result of an export.
#[derive(Debug, Clone, PartialEq)]
pub enum Export {
    Bytes(Vec<u8>),
    /// The requested basis is unknown to this document; the caller should
    /// fall back to a snapshot.
    NoOverlap,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("corrupt document data: {0}")]
    Corrupt(String),
    #[error("malformed version vector: {0}")]
    BadVersion(String),
}

/// A CRDT document as the synchronizer sees it.
pub trait DocEngine: Send + 'static {
    /// A fresh, empty document authored by `actor`.
    fn create(actor: &PeerId) -> Self
    where
        Self: Sized;

    /// The current version token. Two documents with equal versions hold
    /// the same set of changes.
    fn version(&mut self) -> VersionVector;

    fn export(&mut self, mode: ExportMode) -> Result<Export, EngineError>;

    /// Merge opaque bytes produced by another peer's `export`.
    fn import(&mut self, data: &[u8]) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_vector_serde_roundtrip() {
        let v = VersionVector::new(vec![1, 2, 3, 255]);
        let json = serde_json::to_string(&v).unwrap();
        let back: VersionVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn empty_vector_is_empty() {
        assert!(VersionVector::empty().is_empty());
        let json = serde_json::to_string(&VersionVector::empty()).unwrap();
        assert_eq!(json, "\"\"");
    }
}
