//! The wire reducer: one synchronous step per message.
//!
//! `update` is the whole protocol. It mutates the model and returns at
//! most one command (possibly a batch); it performs no I/O and never
//! suspends, which is what makes the state machine testable without a
//! transport.
//!
//! The critical property lives in [`on_imported`]: after merging a peer's
//! bytes, that peer's awareness advances to our *post-merge* version, not
//! the version they sent. A peer that just gave us data transitively
//! holds everything it sent plus everything we already had sent it, so
//! nothing it authored is ever cut into a delta going back to it.

use tracing::{debug, info, warn};

use crate::command::Command;
use crate::engine::{DocEngine, Export, ExportMode, VersionVector};
use crate::identity::{DocId, PeerId, PeerIdentity};
use crate::message::Message;
use crate::model::{ChannelId, ChannelState, Model, PeerDocSyncState};
use crate::wire::{EphemeralEntry, Transmission, WireMessage};

/// Advance the model by one message.
pub fn update<E: DocEngine>(model: &mut Model<E>, message: Message) -> Option<Command> {
    match message {
        Message::ChannelAdded {
            channel_id,
            outbound,
        } => {
            model.channels.insert_connected(channel_id, outbound);
            debug!(channel = %channel_id, "channel added, requesting establishment");
            Some(Command::SendEstablishment {
                channel_id,
                message: WireMessage::EstablishRequest {
                    identity: model.identity.clone(),
                },
            })
        }
        Message::ChannelRemoved { channel_id } => on_channel_removed(model, channel_id),
        Message::ChannelReceive {
            channel_id,
            message,
        } => on_receive(model, channel_id, message),
        Message::LocalDocChange { doc_id } => on_local_change(model, &doc_id),
        Message::DocImported {
            doc_id,
            from_peer,
            sender_version,
        } => on_imported(model, &doc_id, &from_peer, sender_version),
        Message::Subscribe { doc_id } => on_subscribe(model, &doc_id),
        Message::Unsubscribe { doc_id } => {
            model.docs.unsubscribe_local(&doc_id);
            None
        }
    }
}

/// Periodic ephemeral rebroadcast: our own payloads for every doc that
/// has them, to every connected peer subscribed to that doc.
pub fn heartbeat<E: DocEngine>(model: &mut Model<E>) -> Option<Command> {
    let us = model.identity.peer_id.clone();
    let mut commands = Vec::new();
    for doc_id in model.ephemeral.docs_with_own_entries(&us) {
        let stores = model.ephemeral.encode_own(&doc_id, &us);
        if stores.is_empty() {
            continue;
        }
        for channel_id in subscriber_channels(model, &doc_id, None) {
            commands.push(Command::Send {
                channel_id,
                message: WireMessage::Ephemeral {
                    doc_id: doc_id.clone(),
                    stores: stores.clone(),
                },
            });
        }
    }
    Command::from_vec(commands)
}

/// Immediate broadcast of our own ephemeral payloads for one doc, used
/// when the application publishes new state.
pub(crate) fn broadcast_ephemeral<E: DocEngine>(
    model: &mut Model<E>,
    doc_id: &DocId,
) -> Option<Command> {
    let us = model.identity.peer_id.clone();
    let stores = model.ephemeral.encode_own(doc_id, &us);
    if stores.is_empty() {
        return None;
    }
    let commands = subscriber_channels(model, doc_id, None)
        .into_iter()
        .map(|channel_id| Command::Send {
            channel_id,
            message: WireMessage::Ephemeral {
                doc_id: doc_id.clone(),
                stores: stores.clone(),
            },
        })
        .collect();
    Command::from_vec(commands)
}

// ── Channel lifecycle ───────────────────────────────────────────────

fn on_channel_removed<E: DocEngine>(model: &mut Model<E>, channel_id: ChannelId) -> Option<Command> {
    let Some(channel) = model.channels.remove(channel_id) else {
        debug!(channel = %channel_id, "removal for unknown channel");
        return None;
    };
    if let ChannelState::Established { peer_id } = channel.state {
        let dropped = model.peers.remove_channel(&peer_id, channel_id);
        let disconnected = model
            .peers
            .get(&peer_id)
            .map(|p| !p.is_connected())
            .unwrap_or(true);
        if disconnected {
            // Presence dies with the last channel; awareness survives as a
            // reconnection hint unless the whole entry was collected.
            model.ephemeral.remove_peer(&peer_id);
        }
        if dropped {
            info!(peer = %peer_id, channel = %channel_id, "peer dropped with last channel");
        } else {
            debug!(peer = %peer_id, channel = %channel_id, "channel closed");
        }
    }
    None
}

fn on_receive<E: DocEngine>(
    model: &mut Model<E>,
    channel_id: ChannelId,
    message: WireMessage,
) -> Option<Command> {
    match message {
        WireMessage::EstablishRequest { identity } => {
            on_establish(model, channel_id, identity, true)
        }
        WireMessage::EstablishResponse { identity } => {
            on_establish(model, channel_id, identity, false)
        }
        other => {
            // Everything past establishment requires a bound channel.
            let Some(peer_id) = model.channels.peer_of(channel_id) else {
                warn!(channel = %channel_id, kind = message_kind(&other), "sync message on non-established channel, dropping");
                return None;
            };
            model.peers.touch(&peer_id);
            match other {
                WireMessage::SyncRequest {
                    doc_id,
                    requester_version,
                    bidirectional,
                } => on_sync_request(model, channel_id, &peer_id, doc_id, requester_version, bidirectional),
                WireMessage::SyncResponse {
                    doc_id,
                    transmission,
                    ephemeral,
                } => on_transmission(model, &peer_id, doc_id, transmission, ephemeral),
                WireMessage::Update {
                    doc_id,
                    transmission,
                } => on_transmission(model, &peer_id, doc_id, transmission, None),
                WireMessage::Ephemeral { doc_id, stores } => {
                    on_ephemeral(model, &peer_id, doc_id, stores)
                }
                WireMessage::Batch { .. } => {
                    // Batches are unwrapped before dispatch; a nested batch
                    // is a peer bug.
                    warn!(channel = %channel_id, peer = %peer_id, "nested batch message, dropping");
                    None
                }
                WireMessage::EstablishRequest { .. } | WireMessage::EstablishResponse { .. } => {
                    unreachable!("handled above")
                }
            }
        }
    }
}

fn on_establish<E: DocEngine>(
    model: &mut Model<E>,
    channel_id: ChannelId,
    identity: PeerIdentity,
    reply: bool,
) -> Option<Command> {
    match model.channels.state_of(channel_id) {
        None => {
            warn!(channel = %channel_id, "establishment on unknown channel, dropping");
            return None;
        }
        Some(ChannelState::Established { peer_id }) => {
            if *peer_id != identity.peer_id {
                // Established bindings are immutable; a different identity
                // on the same channel is a protocol violation.
                warn!(
                    channel = %channel_id,
                    bound = %peer_id,
                    claimed = %identity.peer_id,
                    "establishment for already-bound channel, dropping"
                );
            }
            return None;
        }
        Some(ChannelState::Connected) => {}
    }

    model.channels.establish(channel_id, identity.peer_id.clone());
    let peer_id = identity.peer_id.clone();
    model.peers.upsert(identity, channel_id);
    info!(peer = %peer_id, channel = %channel_id, "channel established");

    let mut commands = Vec::new();
    if reply {
        commands.push(Command::SendEstablishment {
            channel_id,
            message: WireMessage::EstablishResponse {
                identity: model.identity.clone(),
            },
        });
    }
    // Establishment itself starts no sync; outstanding local subscriptions
    // do. This is what re-requests missed updates after a reconnect.
    commands.extend(subscription_requests_for_peer(model, channel_id, &peer_id));
    Command::from_vec(commands)
}

// ── Subscriptions ───────────────────────────────────────────────────

fn on_subscribe<E: DocEngine>(model: &mut Model<E>, doc_id: &DocId) -> Option<Command> {
    model.docs.subscribe_local(doc_id);
    let our_version = doc_version(model, doc_id)?;

    let mut targets = Vec::new();
    for (peer_id, peer) in model.peers.iter() {
        let Some(channel_id) = peer.any_channel() else {
            continue;
        };
        if known_up_to_date(peer.sync_state(doc_id), &our_version) {
            continue;
        }
        targets.push((peer_id.clone(), channel_id));
    }

    let mut commands = Vec::new();
    for (peer_id, channel_id) in targets {
        debug!(peer = %peer_id, doc = %doc_id, "requesting sync");
        // Bidirectional: we commit to streaming our own changes back, so
        // the responder becomes a subscriber on our side. This is what
        // lets a relay receive commits it never asked for.
        if let Some(peer) = model.peers.get_mut(&peer_id) {
            peer.subscriptions.insert(doc_id.clone());
        }
        commands.push(Command::Send {
            channel_id,
            message: WireMessage::SyncRequest {
                doc_id: doc_id.clone(),
                requester_version: our_version.clone(),
                bidirectional: true,
            },
        });
    }
    Command::from_vec(commands)
}

/// Sync-requests for every locally-subscribed doc toward one newly
/// established peer.
fn subscription_requests_for_peer<E: DocEngine>(
    model: &mut Model<E>,
    channel_id: ChannelId,
    peer_id: &PeerId,
) -> Vec<Command> {
    let doc_ids: Vec<DocId> = model.docs.local_subscriptions().cloned().collect();
    let mut commands = Vec::new();
    for doc_id in doc_ids {
        let Some(entry) = model.docs.get(&doc_id) else {
            continue;
        };
        let our_version = entry.doc().lock().version();
        let state = model
            .peers
            .get(peer_id)
            .and_then(|p| p.sync_state(&doc_id));
        if known_up_to_date(state, &our_version) {
            continue;
        }
        if let Some(peer) = model.peers.get_mut(peer_id) {
            peer.subscriptions.insert(doc_id.clone());
        }
        commands.push(Command::Send {
            channel_id,
            message: WireMessage::SyncRequest {
                doc_id,
                requester_version: our_version,
                bidirectional: true,
            },
        });
    }
    commands
}

fn known_up_to_date(state: Option<&PeerDocSyncState>, our_version: &VersionVector) -> bool {
    // Stale awareness (survivor of a disconnect) never counts: the peer
    // may have moved on while we were apart.
    matches!(
        state,
        Some(PeerDocSyncState::Synced {
            last_known_version: Some(v),
            stale: false,
            ..
        }) if v == our_version
    )
}

// ── Serving sync-requests ───────────────────────────────────────────

fn on_sync_request<E: DocEngine>(
    model: &mut Model<E>,
    channel_id: ChannelId,
    peer_id: &PeerId,
    doc_id: DocId,
    requester_version: VersionVector,
    bidirectional: bool,
) -> Option<Command> {
    let identity = model.peers.get(peer_id)?.identity.clone();

    if bidirectional {
        if let Some(peer) = model.peers.get_mut(peer_id) {
            peer.subscriptions.insert(doc_id.clone());
        }
    }

    if !model.permissions.read(&doc_id, &identity) {
        // Silent: never reveal the existence of a restricted document.
        debug!(peer = %peer_id, doc = %doc_id, "read denied, dropping sync-request");
        return None;
    }

    if !model.docs.contains(&doc_id) {
        if model.create_on_request {
            info!(peer = %peer_id, doc = %doc_id, "creating document on request");
            model.docs.ensure(&doc_id);
        } else {
            model
                .peers
                .record_sync_state(peer_id, &doc_id, PeerDocSyncState::absent());
            debug!(peer = %peer_id, doc = %doc_id, "document unavailable");
            return Some(Command::Send {
                channel_id,
                message: WireMessage::SyncResponse {
                    doc_id,
                    transmission: Transmission::Unavailable,
                    ephemeral: None,
                },
            });
        }
    }

    let transmission = {
        let entry = model.docs.get(&doc_id)?;
        let mut doc = entry.doc().lock();
        let our_version = doc.version();
        if our_version == requester_version {
            Transmission::UpToDate {
                version: our_version,
            }
        } else {
            match doc.export(ExportMode::Update {
                from: requester_version.clone(),
            }) {
                Ok(Export::Bytes(data)) => Transmission::Update {
                    data,
                    version: our_version,
                },
                Ok(Export::NoOverlap) => match doc.export(ExportMode::Snapshot) {
                    Ok(Export::Bytes(data)) => Transmission::Snapshot {
                        data,
                        version: our_version,
                    },
                    Ok(Export::NoOverlap) | Err(_) => {
                        tracing::error!(doc = %doc_id, "snapshot export failed");
                        return None;
                    }
                },
                Err(e) => {
                    tracing::error!(doc = %doc_id, error = %e, "update export failed");
                    return None;
                }
            }
        }
    };

    let stores = model.ephemeral.encode_doc(&doc_id);
    let ephemeral = if stores.is_empty() { None } else { Some(stores) };

    // Awareness records what the requester told us they had *before* this
    // response; delivery is not guaranteed, so we never assume receipt.
    model.peers.record_sync_state(
        peer_id,
        &doc_id,
        PeerDocSyncState::synced(requester_version),
    );

    Some(Command::Send {
        channel_id,
        message: WireMessage::SyncResponse {
            doc_id,
            transmission,
            ephemeral,
        },
    })
}

// ── Applying inbound transmissions ──────────────────────────────────

fn on_transmission<E: DocEngine>(
    model: &mut Model<E>,
    peer_id: &PeerId,
    doc_id: DocId,
    transmission: Transmission,
    ephemeral: Option<Vec<EphemeralEntry>>,
) -> Option<Command> {
    if !model.docs.contains(&doc_id) {
        // Entries exist for every doc we ever requested; anything else is
        // unsolicited.
        warn!(peer = %peer_id, doc = %doc_id, "transmission for unknown document, dropping");
        return None;
    }
    let identity = model.peers.get(peer_id)?.identity.clone();
    if !model.permissions.write(&doc_id, &identity) {
        debug!(peer = %peer_id, doc = %doc_id, "write denied, dropping transmission");
        return None;
    }

    let mut commands = Vec::new();
    match transmission {
        Transmission::UpToDate { version } => {
            model
                .peers
                .record_sync_state(peer_id, &doc_id, PeerDocSyncState::synced(version));
            if let Some(entry) = model.docs.get(&doc_id) {
                entry.mark_ready();
            }
        }
        Transmission::Unavailable => {
            // Keep our own subscription: the peer may create the doc later
            // and we re-request on the next subscription round.
            model
                .peers
                .record_sync_state(peer_id, &doc_id, PeerDocSyncState::absent());
            debug!(peer = %peer_id, doc = %doc_id, "peer reports document unavailable");
        }
        // Awareness is deliberately not updated here: it advances to our
        // post-merge version once the import completes.
        Transmission::Snapshot { data, version } | Transmission::Update { data, version } => {
            commands.push(Command::ImportDocData {
                doc_id: doc_id.clone(),
                from_peer: peer_id.clone(),
                sender_version: version,
                data,
            });
        }
    }

    if let Some(stores) = ephemeral {
        commands.push(Command::ApplyEphemeral { doc_id, stores });
    }
    Command::from_vec(commands)
}

fn on_ephemeral<E: DocEngine>(
    model: &mut Model<E>,
    peer_id: &PeerId,
    doc_id: DocId,
    stores: Vec<EphemeralEntry>,
) -> Option<Command> {
    if !model.docs.contains(&doc_id) {
        debug!(peer = %peer_id, doc = %doc_id, "ephemeral for unknown document, dropping");
        return None;
    }
    let identity = model.peers.get(peer_id)?.identity.clone();
    if !model.permissions.write(&doc_id, &identity) {
        debug!(peer = %peer_id, doc = %doc_id, "write denied, dropping ephemeral");
        return None;
    }
    Some(Command::ApplyEphemeral { doc_id, stores })
}

// ── Import completion and fan-out ───────────────────────────────────

fn on_imported<E: DocEngine>(
    model: &mut Model<E>,
    doc_id: &DocId,
    from_peer: &PeerId,
    sender_version: VersionVector,
) -> Option<Command> {
    let our_version = doc_version(model, doc_id)?;
    if let Some(entry) = model.docs.get(doc_id) {
        entry.mark_ready();
    }

    let mut commands = Vec::new();

    // If the merge left us ahead of the sender (we held changes they did
    // not), push them the complement, cut from the version *they*
    // reported. The cut can never contain their own bytes.
    if sender_version != our_version {
        if let Some(command) = complement_for_sender(model, doc_id, from_peer, sender_version, &our_version) {
            commands.push(command);
        }
    }

    // Echo suppression: the sender now transitively holds everything it
    // sent, everything we merged it into, and the complement above.
    model.peers.record_sync_state(
        from_peer,
        doc_id,
        PeerDocSyncState::synced(our_version.clone()),
    );

    if let Some(fanned) = fan_out(model, doc_id, &our_version, Some(from_peer)) {
        commands.push(fanned);
    }
    Command::from_vec(commands)
}

fn complement_for_sender<E: DocEngine>(
    model: &Model<E>,
    doc_id: &DocId,
    from_peer: &PeerId,
    sender_version: VersionVector,
    our_version: &VersionVector,
) -> Option<Command> {
    let peer = model.peers.get(from_peer)?;
    let channel_id = peer.any_channel()?;
    if !model.permissions.read(doc_id, &peer.identity) {
        return None;
    }
    let entry = model.docs.get(doc_id)?;
    let mut doc = entry.doc().lock();
    let transmission = export_for(&mut *doc, Some(sender_version), our_version)?;
    Some(Command::Send {
        channel_id,
        message: WireMessage::Update {
            doc_id: doc_id.clone(),
            transmission,
        },
    })
}

fn on_local_change<E: DocEngine>(model: &mut Model<E>, doc_id: &DocId) -> Option<Command> {
    let our_version = doc_version(model, doc_id)?;
    fan_out(model, doc_id, &our_version, None)
}

/// Stream the document to every subscribed, readable, connected peer that
/// is not already at `our_version`, and advance their awareness
/// preemptively. Safe because reducer steps are totally ordered: the send
/// cannot be observed before this state write.
fn fan_out<E: DocEngine>(
    model: &mut Model<E>,
    doc_id: &DocId,
    our_version: &VersionVector,
    exclude: Option<&PeerId>,
) -> Option<Command> {
    // First pass: pick targets and the version to cut from, without
    // holding the doc lock.
    let mut targets: Vec<(PeerId, ChannelId, Option<VersionVector>)> = Vec::new();
    for (peer_id, peer) in model.peers.iter() {
        if exclude == Some(peer_id) {
            continue;
        }
        if !peer.subscriptions.contains(doc_id) {
            continue;
        }
        let Some(channel_id) = peer.any_channel() else {
            continue;
        };
        if !model.permissions.read(doc_id, &peer.identity) {
            continue;
        }
        match peer.sync_state(doc_id) {
            Some(PeerDocSyncState::Synced {
                last_known_version: Some(v),
                ..
            }) => {
                if v != our_version {
                    targets.push((peer_id.clone(), channel_id, Some(v.clone())));
                }
            }
            // Known to track the doc, version unknown: full snapshot.
            Some(PeerDocSyncState::Synced {
                last_known_version: None,
                ..
            }) => targets.push((peer_id.clone(), channel_id, None)),
            // Absent peers asked and were told no, or told us no; they
            // re-request, we do not push.
            Some(PeerDocSyncState::Absent { .. }) => {}
            // Never spoke about this doc: nothing to cut a delta against.
            None => {}
        }
    }
    if targets.is_empty() {
        return None;
    }

    let mut commands = Vec::new();
    {
        let entry = model.docs.get(doc_id)?;
        let mut doc = entry.doc().lock();
        for (peer_id, channel_id, from) in targets {
            let transmission = match export_for(&mut *doc, from, our_version) {
                Some(t) => t,
                None => continue,
            };
            commands.push(Command::Send {
                channel_id,
                message: WireMessage::Update {
                    doc_id: doc_id.clone(),
                    transmission,
                },
            });
            model.peers.record_sync_state(
                &peer_id,
                doc_id,
                PeerDocSyncState::synced(our_version.clone()),
            );
        }
    }
    Command::from_vec(commands)
}

fn export_for<E: DocEngine>(
    doc: &mut E,
    from: Option<VersionVector>,
    our_version: &VersionVector,
) -> Option<Transmission> {
    let snapshot = |doc: &mut E| match doc.export(ExportMode::Snapshot) {
        Ok(Export::Bytes(data)) => Some(Transmission::Snapshot {
            data,
            version: our_version.clone(),
        }),
        Ok(Export::NoOverlap) | Err(_) => {
            tracing::error!("snapshot export failed");
            None
        }
    };
    match from {
        Some(from) => match doc.export(ExportMode::Update { from }) {
            Ok(Export::Bytes(data)) => Some(Transmission::Update {
                data,
                version: our_version.clone(),
            }),
            Ok(Export::NoOverlap) => snapshot(doc),
            Err(e) => {
                tracing::error!(error = %e, "update export failed");
                None
            }
        },
        None => snapshot(doc),
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn doc_version<E: DocEngine>(model: &Model<E>, doc_id: &DocId) -> Option<VersionVector> {
    match model.docs.get(doc_id) {
        Some(entry) => Some(entry.doc().lock().version()),
        None => {
            warn!(doc = %doc_id, "message for unknown document, dropping");
            None
        }
    }
}

/// Channels of connected peers subscribed to a doc (optionally excluding
/// one peer), permission-checked for read.
fn subscriber_channels<E: DocEngine>(
    model: &Model<E>,
    doc_id: &DocId,
    exclude: Option<&PeerId>,
) -> Vec<ChannelId> {
    model
        .peers
        .iter()
        .filter(|(peer_id, _)| exclude != Some(*peer_id))
        .filter(|(_, peer)| peer.subscriptions.contains(doc_id))
        .filter(|(_, peer)| model.permissions.read(doc_id, &peer.identity))
        .filter_map(|(_, peer)| peer.any_channel())
        .collect()
}

fn message_kind(message: &WireMessage) -> &'static str {
    match message {
        WireMessage::EstablishRequest { .. } => "establish-request",
        WireMessage::EstablishResponse { .. } => "establish-response",
        WireMessage::SyncRequest { .. } => "sync-request",
        WireMessage::SyncResponse { .. } => "sync-response",
        WireMessage::Update { .. } => "update",
        WireMessage::Ephemeral { .. } => "ephemeral",
        WireMessage::Batch { .. } => "batch",
    }
}
