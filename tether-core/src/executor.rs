//! Command executor.
//!
//! Interprets the reducer's commands: sends go to the outbound batcher,
//! imports go into the engine, ephemeral payloads into their stores.
//! A successful import yields a `DocImported` follow-up that the dispatch
//! loop feeds back through the receive queue as its own reducer step.
//!
//! Failures stay here: an import error is logged and *nothing* advances
//! (no awareness update, no follow-up), so the peer is simply re-requested
//! on the next subscription round.

use tracing::{error, warn};

use crate::batcher::OutboundBatcher;
use crate::command::Command;
use crate::engine::DocEngine;
use crate::message::Message;
use crate::model::Model;

/// Execute one command tree. Returns follow-up messages for the queue.
pub(crate) fn execute<E: DocEngine>(
    model: &mut Model<E>,
    batcher: &mut OutboundBatcher,
    command: Command,
) -> Vec<Message> {
    let mut follow_ups = Vec::new();
    run(model, batcher, command, &mut follow_ups);
    follow_ups
}

fn run<E: DocEngine>(
    model: &mut Model<E>,
    batcher: &mut OutboundBatcher,
    command: Command,
    follow_ups: &mut Vec<Message>,
) {
    match command {
        Command::Send {
            channel_id,
            message,
        } => batcher.enqueue(channel_id, message),
        Command::SendEstablishment {
            channel_id,
            message,
        } => batcher.enqueue_establishment(channel_id, message),
        Command::ImportDocData {
            doc_id,
            from_peer,
            sender_version,
            data,
        } => {
            let Some(entry) = model.docs.get(&doc_id) else {
                warn!(doc = %doc_id, "import for unknown document, dropping");
                return;
            };
            let result = entry.doc().lock().import(&data);
            match result {
                Ok(()) => follow_ups.push(Message::DocImported {
                    doc_id,
                    from_peer,
                    sender_version,
                }),
                Err(e) => {
                    error!(doc = %doc_id, peer = %from_peer, error = %e, "import failed, dropping transmission");
                }
            }
        }
        Command::ApplyEphemeral { doc_id, stores } => {
            model.ephemeral.apply(&doc_id, &stores);
        }
        Command::Batch(commands) => {
            for command in commands {
                run(model, batcher, command, follow_ups);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::crdt::AutomergeDoc;
    use crate::identity::{DocId, PeerId, PeerIdentity};
    use crate::permissions::AllowAll;

    use super::*;

    fn model() -> Model<AutomergeDoc> {
        Model::new(
            PeerIdentity::user("us", "us"),
            Arc::new(AllowAll),
            false,
            std::time::Duration::from_secs(30),
        )
    }

    #[test]
    fn failed_import_produces_no_follow_up() {
        let mut model = model();
        model.docs.ensure(&DocId::new("d"));
        let mut batcher = OutboundBatcher::default();

        let follow_ups = execute(
            &mut model,
            &mut batcher,
            Command::ImportDocData {
                doc_id: DocId::new("d"),
                from_peer: PeerId::new("a"),
                sender_version: crate::engine::VersionVector::empty(),
                data: b"garbage".to_vec(),
            },
        );
        assert!(follow_ups.is_empty());
    }

    #[test]
    fn successful_import_reports_doc_imported() {
        let mut model = model();
        model.docs.ensure(&DocId::new("d"));
        let mut batcher = OutboundBatcher::default();

        // A valid snapshot from another doc.
        let mut other = AutomergeDoc::new(&PeerId::new("a"));
        use automerge::transaction::Transactable;
        other.doc_mut().put(automerge::ROOT, "k", "v").unwrap();
        let data = match crate::engine::DocEngine::export(
            &mut other,
            crate::engine::ExportMode::Snapshot,
        )
        .unwrap()
        {
            crate::engine::Export::Bytes(bytes) => bytes,
            crate::engine::Export::NoOverlap => unreachable!(),
        };

        let sender_version = crate::engine::DocEngine::version(&mut other);
        let follow_ups = execute(
            &mut model,
            &mut batcher,
            Command::ImportDocData {
                doc_id: DocId::new("d"),
                from_peer: PeerId::new("a"),
                sender_version: sender_version.clone(),
                data,
            },
        );
        assert!(matches!(
            follow_ups.as_slice(),
            [Message::DocImported { doc_id, from_peer, sender_version: v }]
                if doc_id == &DocId::new("d") && from_peer == &PeerId::new("a") && v == &sender_version
        ));
    }
}
