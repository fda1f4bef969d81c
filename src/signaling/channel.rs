//! Signaling channel to the relay.
//!
//! The session owns a channel handle for outbound events and a single
//! inbound event stream (its subscription set). The WebSocket implementation
//! reconnects transparently on connection loss; events emitted while the
//! socket is down are queued and treated as unacknowledged.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use super::event::{self, SignalEvent};
use crate::error::ChannelError;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const RECONNECT_JITTER_MS: u64 = 500;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of the relay connection.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Fire-and-forget send. Succeeding only means the event was accepted by
    /// the local transport queue.
    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// Creates connected channels. The inbound receiver is the session's
/// subscription set; dropping it unregisters every handler at once.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn connect(
        &self,
        identity: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<SignalEvent>), ChannelError>;
}

/// WebSocket-backed [`ChannelFactory`].
pub struct WsChannelFactory {
    url: String,
    connect_timeout: Duration,
}

impl WsChannelFactory {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl ChannelFactory for WsChannelFactory {
    async fn connect(
        &self,
        identity: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<SignalEvent>), ChannelError> {
        let url = if identity.is_empty() {
            self.url.clone()
        } else {
            format!("{}?identity={}", self.url, urlencoding::encode(identity))
        };

        let (socket, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ChannelError::ConnectTimeout(self.connect_timeout))?
            .map_err(|e| ChannelError::Unreachable(e.to_string()))?;
        info!(target: "Call/Signaling", "connected to relay at {}", self.url);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (sig_tx, sig_rx) = mpsc::channel(64);
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(supervise(
            socket,
            url,
            self.connect_timeout,
            out_rx,
            sig_tx,
            closed.clone(),
            shutdown.clone(),
        ));

        let channel = WsChannel {
            out: out_tx,
            closed,
            shutdown,
        };
        Ok((Arc::new(channel), sig_rx))
    }
}

struct WsChannel {
    out: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

#[async_trait]
impl SignalingChannel for WsChannel {
    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ChannelError::Closed);
        }
        let text = event::envelope(event, payload)?;
        debug!(target: "Call/Signaling", "--> {event}");
        self.out
            .send(Message::text(text))
            .map_err(|_| ChannelError::Closed)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            debug!(target: "Call/Signaling", "closing relay channel");
            self.shutdown.notify_waiters();
        }
    }
}

enum SocketEnd {
    /// Close requested locally (or the session dropped its subscription).
    Done,
    /// The transport dropped out from under us.
    Lost,
}

async fn supervise(
    first: WsStream,
    url: String,
    connect_timeout: Duration,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    sig_tx: mpsc::Sender<SignalEvent>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut socket = Some(first);
    loop {
        let Some(ws) = socket.take() else { return };
        match run_socket(ws, &mut out_rx, &sig_tx, &shutdown).await {
            SocketEnd::Done => return,
            SocketEnd::Lost => {}
        }
        if closed.load(Ordering::Relaxed) {
            return;
        }
        info!(target: "Call/Signaling", "relay connection lost, reconnecting");
        socket = reconnect(&url, connect_timeout, &shutdown).await;
    }
}

async fn run_socket(
    ws: WsStream,
    out_rx: &mut mpsc::UnboundedReceiver<Message>,
    sig_tx: &mpsc::Sender<SignalEvent>,
    shutdown: &Notify,
) -> SocketEnd {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                return SocketEnd::Done;
            }
            outbound = out_rx.recv() => match outbound {
                Some(msg) => {
                    if sink.send(msg).await.is_err() {
                        return SocketEnd::Lost;
                    }
                }
                None => return SocketEnd::Done,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match SignalEvent::parse(text.as_str()) {
                    Ok(Some(event)) => {
                        debug!(target: "Call/Signaling", "<-- {event:?}");
                        if sig_tx.send(event).await.is_err() {
                            return SocketEnd::Done;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(target: "Call/Signaling", "dropping malformed frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => return SocketEnd::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(target: "Call/Signaling", "socket error: {e}");
                    return SocketEnd::Lost;
                }
            }
        }
    }
}

async fn reconnect(url: &str, connect_timeout: Duration, shutdown: &Notify) -> Option<WsStream> {
    let mut backoff = RECONNECT_BASE;
    loop {
        let jitter = Duration::from_millis(rand::rng().random_range(0..RECONNECT_JITTER_MS));
        tokio::select! {
            _ = tokio::time::sleep(backoff + jitter) => {}
            _ = shutdown.notified() => return None,
        }
        match tokio::time::timeout(connect_timeout, connect_async(url)).await {
            Ok(Ok((ws, _))) => {
                info!(target: "Call/Signaling", "relay connection restored");
                return Some(ws);
            }
            Ok(Err(e)) => debug!(target: "Call/Signaling", "reconnect attempt failed: {e}"),
            Err(_) => debug!(target: "Call/Signaling", "reconnect attempt timed out"),
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}
