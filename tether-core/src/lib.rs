//! tether — a client-server synchronization runtime for CRDT-backed
//! documents.
//!
//! Applications open named documents, mutate them locally, and the
//! runtime streams operations to every peer subscribed to that document
//! over pluggable transports. A service peer can relay documents between
//! clients without any application-level interest of its own.
//!
//! The pieces:
//!
//! - [`sync::Synchronizer`] — the runtime: one dispatch task owning the
//!   model, fed by a serializing receive queue.
//! - the wire reducer (internal) — the protocol as a pure state machine:
//!   `(model, message) → (model, command)`.
//! - [`model`] — flat registries for channels, peers (with per-document
//!   *awareness*), and owned CRDT handles.
//! - [`engine`] / [`crdt`] — the CRDT seam and its automerge
//!   implementation.
//! - [`wire`] / [`fragment`] — the tagged message envelope and the
//!   transport-layer fragmentation codec.
//! - [`transport`] — the adapter contract plus an in-process transport.
//! - [`ephemeral`] — TTL-bounded presence state, broadcast on a
//!   heartbeat, never persisted.
//!
//! ```no_run
//! use tether_core::{AutomergeDoc, PeerIdentity, Synchronizer, SynchronizerConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let sync = Synchronizer::<AutomergeDoc>::spawn(SynchronizerConfig::new(
//!     PeerIdentity::user("peer-1", "alice"),
//! ));
//! let doc = sync.subscribe("notes").await?;
//! doc.ready().await?;
//! doc.with_doc_mut(|d| {
//!     use automerge::transaction::Transactable;
//!     d.doc_mut().put(automerge::ROOT, "title", "hello")
//! })
//! .await??;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod crdt;
pub mod engine;
pub mod ephemeral;
pub mod fragment;
pub mod identity;
pub mod message;
pub mod model;
pub mod permissions;
pub mod sync;
pub mod transport;
pub mod wire;

mod batcher;
mod executor;
mod reducer;

pub use crdt::AutomergeDoc;
pub use engine::{DocEngine, EngineError, Export, ExportMode, VersionVector};
pub use identity::{DocId, PeerId, PeerIdentity, PeerKind};
pub use message::Message;
pub use model::{ChannelId, PeerDocSyncState};
pub use permissions::{AllowAll, Permissions};
pub use sync::{DocHandle, Status, Synchronizer, SynchronizerConfig};
pub use transport::{AdapterHandle, TransportAdapter, TransportError};
pub use wire::{EphemeralEntry, ProtocolError, Transmission, WireMessage};
