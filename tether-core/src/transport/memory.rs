//! In-process transport: a channel pair between two runtimes in the same
//! process. Used by the test suites and useful for embedding a relay in
//! the same binary as a client.
//!
//! An optional fragment threshold runs every frame through the
//! fragmentation codec, which exercises reassembly over a real delivery
//! path rather than just at the codec level.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::fragment::{self, Reassembler};
use crate::model::ChannelId;
use crate::transport::AdapterHandle;

/// A live link between two runtimes. Dropping it does not tear the link
/// down; call [`MemoryLink::disconnect`].
pub struct MemoryLink {
    a: AdapterHandle,
    b: AdapterHandle,
    a_channel: ChannelId,
    b_channel: ChannelId,
    pumps: Vec<JoinHandle<()>>,
}

impl MemoryLink {
    pub fn channel_ids(&self) -> (ChannelId, ChannelId) {
        (self.a_channel, self.b_channel)
    }

    /// Tear the link down and notify both runtimes.
    pub async fn disconnect(self) {
        for pump in &self.pumps {
            pump.abort();
        }
        self.a.close_channel(self.a_channel).await;
        self.b.close_channel(self.b_channel).await;
    }
}

/// Connect two runtimes directly.
pub async fn link(a: &AdapterHandle, b: &AdapterHandle) -> MemoryLink {
    link_with_threshold(a, b, None).await
}

/// Connect two runtimes, fragmenting every frame over `threshold` bytes.
pub async fn link_with_threshold(
    a: &AdapterHandle,
    b: &AdapterHandle,
    threshold: Option<usize>,
) -> MemoryLink {
    let (a_out_tx, a_out_rx) = mpsc::channel::<Vec<u8>>(64);
    let (b_out_tx, b_out_rx) = mpsc::channel::<Vec<u8>>(64);

    let a_channel = a.open_channel(a_out_tx).await;
    let b_channel = b.open_channel(b_out_tx).await;

    let pumps = vec![
        tokio::spawn(pump(a_out_rx, b.clone(), b_channel, threshold)),
        tokio::spawn(pump(b_out_rx, a.clone(), a_channel, threshold)),
    ];

    MemoryLink {
        a: a.clone(),
        b: b.clone(),
        a_channel,
        b_channel,
        pumps,
    }
}

/// Shuttle frames from one side's outbound queue into the other side's
/// delivery path, optionally through the fragmentation codec.
async fn pump(
    mut outbound: mpsc::Receiver<Vec<u8>>,
    remote: AdapterHandle,
    remote_channel: ChannelId,
    threshold: Option<usize>,
) {
    let mut reassembler = Reassembler::new();
    while let Some(frame) = outbound.recv().await {
        match threshold {
            None => remote.deliver(remote_channel, frame).await,
            Some(threshold) => {
                for message in fragment::split(&frame, threshold) {
                    match reassembler.accept(&message) {
                        Ok(Some(complete)) => remote.deliver(remote_channel, complete).await,
                        Ok(None) => {}
                        Err(e) => {
                            debug!(error = %e, "memory link dropped fragment");
                        }
                    }
                }
            }
        }
    }
    // Sender gone: the runtime shut down or the channel was removed.
    remote.close_channel(remote_channel).await;
}
