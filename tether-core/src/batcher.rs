//! Outbound batcher: per-dispatch-cycle coalescing.
//!
//! Within one dispatch cycle (a reducer step plus its commands), sync
//! messages for the same channel collapse into a single `batch` wire
//! frame, preserving enqueue order. Establishment messages flush first,
//! each as its own frame; they must precede anything else on a new
//! channel and never batch with sync traffic.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::model::{ChannelId, ChannelRegistry};
use crate::wire::{self, WireMessage};

#[derive(Default)]
pub(crate) struct OutboundBatcher {
    establishment: Vec<(ChannelId, WireMessage)>,
    queued: Vec<(ChannelId, WireMessage)>,
}

impl OutboundBatcher {
    pub(crate) fn enqueue(&mut self, channel_id: ChannelId, message: WireMessage) {
        self.queued.push((channel_id, message));
    }

    pub(crate) fn enqueue_establishment(&mut self, channel_id: ChannelId, message: WireMessage) {
        self.establishment.push((channel_id, message));
    }

    /// Flush everything queued this cycle. Returns the channels whose
    /// transport rejected the send; the caller turns those into synthetic
    /// channel removals so cleanup stays centralized.
    pub(crate) async fn flush(&mut self, channels: &ChannelRegistry) -> Vec<ChannelId> {
        let mut failed = Vec::new();

        for (channel_id, message) in self.establishment.drain(..) {
            send_frame(channels, channel_id, &message, &mut failed).await;
        }

        // Group per channel, preserving both channel order of first use
        // and message order within a channel.
        let mut order: Vec<ChannelId> = Vec::new();
        let mut groups: HashMap<ChannelId, Vec<WireMessage>> = HashMap::new();
        for (channel_id, message) in self.queued.drain(..) {
            groups
                .entry(channel_id)
                .or_insert_with(|| {
                    order.push(channel_id);
                    Vec::new()
                })
                .push(message);
        }

        for channel_id in order {
            let Some(mut messages) = groups.remove(&channel_id) else {
                continue;
            };
            let frame = if messages.len() == 1 {
                messages.remove(0)
            } else {
                debug!(channel = %channel_id, count = messages.len(), "batching outbound messages");
                WireMessage::Batch { messages }
            };
            send_frame(channels, channel_id, &frame, &mut failed).await;
        }

        failed.sort_unstable();
        failed.dedup();
        failed
    }
}

async fn send_frame(
    channels: &ChannelRegistry,
    channel_id: ChannelId,
    message: &WireMessage,
    failed: &mut Vec<ChannelId>,
) {
    let Some(channel) = channels.get(channel_id) else {
        // Normal race: the channel closed between reduce and flush.
        debug!(channel = %channel_id, "dropping frame for closed channel");
        return;
    };
    match wire::encode(message) {
        Ok(bytes) => {
            if channel.outbound().send(bytes).await.is_err() {
                warn!(channel = %channel_id, "transport rejected frame, scheduling channel removal");
                failed.push(channel_id);
            }
        }
        Err(e) => error!(channel = %channel_id, error = %e, "frame encoding failed"),
    }
}
