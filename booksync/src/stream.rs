//! One duplex WebSocket connection carrying every tracked symbol.
//!
//! [`StreamMultiplexer::connect`] opens a fresh [`StreamConnection`]. A
//! connection is good for exactly one session: once [`StreamConnection::receive`]
//! reports [`SyncError::ConnectionLost`] it never yields again, and the caller
//! reconnects by asking the multiplexer for a new one.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::adapter::{FrameKind, MarketDataAdapter, RawFrame};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection factory for one exchange stream endpoint.
#[derive(Debug, Clone)]
pub struct StreamMultiplexer {
    url: String,
    adapter: Arc<dyn MarketDataAdapter>,
    read_timeout: Duration,
    pong_timeout: Duration,
}

impl StreamMultiplexer {
    pub fn new(url: &str, adapter: Arc<dyn MarketDataAdapter>, config: &SyncConfig) -> Self {
        Self {
            url: url.to_string(),
            adapter,
            read_timeout: config.ws_read_timeout,
            pong_timeout: config.ws_pong_timeout,
        }
    }

    /// Open a new physical connection. Nothing is subscribed yet.
    pub async fn connect(&self) -> Result<StreamConnection> {
        info!(url = %self.url, exchange = self.adapter.name(), "connecting");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (sink, stream) = ws_stream.split();
        info!("connected");

        Ok(StreamConnection {
            sink,
            stream,
            adapter: Arc::clone(&self.adapter),
            read_timeout: self.read_timeout,
            pong_timeout: self.pong_timeout,
            channels: HashMap::new(),
            subscriptions: BTreeSet::new(),
            ping_outstanding: false,
            closed: false,
        })
    }
}

/// A live session. Not restartable.
pub struct StreamConnection {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    adapter: Arc<dyn MarketDataAdapter>,
    read_timeout: Duration,
    pong_timeout: Duration,
    /// Channel id -> trading pair, learned from subscription acks.
    channels: HashMap<u64, String>,
    subscriptions: BTreeSet<String>,
    ping_outstanding: bool,
    closed: bool,
}

impl StreamConnection {
    /// Send the subscribe frames for each pair.
    pub async fn subscribe(&mut self, trading_pairs: &[String]) -> Result<()> {
        for pair in trading_pairs {
            for frame in self.adapter.subscribe_frames(pair) {
                self.send_text(frame).await?;
            }
            self.subscriptions.insert(pair.clone());
            debug!(symbol = %pair, "subscribe sent");
        }
        Ok(())
    }

    /// Send the unsubscribe frames for one pair and forget its channel.
    pub async fn unsubscribe(&mut self, trading_pair: &str) -> Result<()> {
        let channel_id = self
            .channels
            .iter()
            .find(|(_, pair)| pair.as_str() == trading_pair)
            .map(|(id, _)| *id);
        for frame in self.adapter.unsubscribe_frames(trading_pair, channel_id) {
            self.send_text(frame).await?;
        }
        if let Some(id) = channel_id {
            self.channels.remove(&id);
        }
        self.subscriptions.remove(trading_pair);
        debug!(symbol = %trading_pair, "unsubscribe sent");
        Ok(())
    }

    /// Pairs subscribed on this connection.
    pub fn subscriptions(&self) -> &BTreeSet<String> {
        &self.subscriptions
    }

    /// Trading pair bound to `channel_id`, if acknowledged.
    pub fn channel_pair(&self, channel_id: u64) -> Option<&str> {
        self.channels.get(&channel_id).map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next data frame.
    ///
    /// Heartbeats, control events, and subscription acks are consumed here.
    /// A read timeout sends a ping; if nothing arrives within the pong
    /// timeout the connection is declared dead.
    ///
    /// # Errors
    ///
    /// [`SyncError::ConnectionLost`] on close, read error, or pong timeout,
    /// and on every call after that.
    pub async fn receive(&mut self) -> Result<RawFrame> {
        loop {
            if self.closed {
                return Err(SyncError::ConnectionLost("connection closed".into()));
            }

            let wait = if self.ping_outstanding {
                self.pong_timeout
            } else {
                self.read_timeout
            };

            let msg = match time::timeout(wait, self.stream.next()).await {
                Ok(msg) => msg,
                Err(_) if self.ping_outstanding => {
                    warn!("pong timeout");
                    return Err(self.lost("pong timeout"));
                }
                Err(_) => {
                    debug!(timeout = ?wait, "read timeout, sending ping");
                    if let Err(e) = self.sink.send(Message::Ping(Vec::new())).await {
                        return Err(self.lost(&format!("ping failed: {e}")));
                    }
                    self.ping_outstanding = true;
                    continue;
                }
            };

            let msg = match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(self.lost(&format!("read error: {e}"))),
                None => return Err(self.lost("stream ended")),
            };
            // Any inbound traffic proves the peer is alive.
            self.ping_outstanding = false;

            match msg {
                Message::Text(text) => {
                    if let Some(frame) = self.handle_text(text) {
                        return Ok(frame);
                    }
                }
                Message::Ping(data) => {
                    debug!("received server ping");
                    if let Err(e) = self.sink.send(Message::Pong(data)).await {
                        return Err(self.lost(&format!("pong failed: {e}")));
                    }
                }
                Message::Pong(_) => debug!("received pong"),
                Message::Close(_) => {
                    info!("received close frame");
                    return Err(self.lost("server closed connection"));
                }
                _ => {}
            }
        }
    }

    /// Send a close frame and mark the session finished.
    pub async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.sink.send(Message::Close(None)).await;
        self.closed = true;
        info!("disconnected");
    }

    fn handle_text(&mut self, text: String) -> Option<RawFrame> {
        match self.adapter.classify(&text) {
            FrameKind::Heartbeat => None,
            FrameKind::Control => {
                debug!(frame = %text, "control frame");
                None
            }
            FrameKind::Subscribed {
                channel_id,
                trading_pair,
            } => {
                info!(symbol = %trading_pair, channel = ?channel_id, "subscribed");
                if let Some(id) = channel_id {
                    self.channels.insert(id, trading_pair);
                }
                None
            }
            FrameKind::Unsubscribed { channel_id } => {
                if let Some(pair) = channel_id.and_then(|id| self.channels.remove(&id)) {
                    info!(symbol = %pair, "unsubscribed");
                }
                None
            }
            FrameKind::Error(message) => {
                warn!(error = %message, "exchange reported error");
                None
            }
            FrameKind::Data { channel_id } => {
                let trading_pair = channel_id.and_then(|id| self.channels.get(&id).cloned());
                Some(RawFrame {
                    text,
                    trading_pair,
                    received: self.adapter.next_sequence(),
                })
            }
        }
    }

    async fn send_text(&mut self, frame: String) -> Result<()> {
        if self.closed {
            return Err(SyncError::ConnectionLost("connection closed".into()));
        }
        self.sink.send(Message::Text(frame)).await?;
        Ok(())
    }

    fn lost(&mut self, reason: &str) -> SyncError {
        self.closed = true;
        SyncError::ConnectionLost(reason.to_string())
    }
}
