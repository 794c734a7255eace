//! Outbound WebSocket connector.
//!
//! Owns the reconnect loop: exponential backoff with jitter, bounded max
//! delay, optional max attempts. Every successful connection registers a
//! fresh channel with the runtime; the runtime re-handshakes and
//! re-requests its subscriptions, which is what recovers missed updates
//! after a drop.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use tether_core::fragment::{self, Reassembler, WS_FRAGMENT_THRESHOLD};
use tether_core::{AdapterHandle, TransportAdapter};

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

/// A WebSocket transport adapter dialing one URL.
pub struct WsConnector {
    url: String,
    reconnect: ReconnectConfig,
    task: Option<JoinHandle<()>>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            task: None,
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

#[async_trait]
impl TransportAdapter for WsConnector {
    async fn start(&mut self, handle: AdapterHandle) -> Result<()> {
        if self.task.is_some() {
            anyhow::bail!("connector already started");
        }
        let url = self.url.clone();
        let reconnect = self.reconnect.clone();
        self.task = Some(tokio::spawn(connect_loop(url, reconnect, handle)));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            // Aborting mid-link is fine: the runtime sees the channel close
            // via the dropped outbound sender.
            task.abort();
        }
        Ok(())
    }
}

async fn connect_loop(url: String, reconnect: ReconnectConfig, handle: AdapterHandle) {
    let mut backoff = reconnect.initial_backoff;
    let mut attempts = 0u32;
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                attempts = 0;
                backoff = reconnect.initial_backoff;
                info!(url = %url, "websocket connected");
                drive(stream, &handle).await;
                warn!(url = %url, "websocket link dropped");
            }
            Err(e) => {
                attempts += 1;
                warn!(
                    url = %url,
                    attempt = attempts,
                    backoff_secs = backoff.as_secs(),
                    "websocket connect failed: {e}"
                );
                if let Some(max) = reconnect.max_attempts {
                    if attempts >= max {
                        warn!(url = %url, "websocket retries exhausted, giving up");
                        return;
                    }
                }
            }
        }

        let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4 + 1);
        tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
        backoff = (backoff * 2).min(reconnect.max_backoff);
    }
}

/// Shuttle one live socket: runtime frames out (fragmented), socket
/// messages in (reassembled).
async fn drive(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, handle: &AdapterHandle) {
    let (mut sink, mut source) = stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
    let channel_id = handle.open_channel(out_tx).await;
    let mut reassembler = Reassembler::new();

    'link: loop {
        tokio::select! {
            frame = out_rx.recv() => match frame {
                Some(frame) => {
                    for part in fragment::split(&frame, WS_FRAGMENT_THRESHOLD) {
                        if sink.send(WsMessage::Binary(part)).await.is_err() {
                            warn!(channel = %channel_id, "websocket send failed");
                            break 'link;
                        }
                    }
                }
                // The runtime dropped the channel.
                None => break 'link,
            },
            message = source.next() => match message {
                Some(Ok(WsMessage::Binary(bytes))) => match reassembler.accept(&bytes) {
                    Ok(Some(frame)) => handle.deliver(channel_id, frame).await,
                    Ok(None) => {}
                    Err(e) => warn!(channel = %channel_id, error = %e, "dropping bad fragment"),
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    debug!(channel = %channel_id, "websocket closed by peer");
                    break 'link;
                }
                Some(Ok(_)) => {} // text/ping/pong
                Some(Err(e)) => {
                    warn!(channel = %channel_id, "websocket receive failed: {e}");
                    break 'link;
                }
            },
        }
    }

    let _ = sink.close().await;
    handle.close_channel(channel_id).await;
}
