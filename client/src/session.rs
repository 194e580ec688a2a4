//! Transport session: the single WebSocket control connection to the broker.
//!
//! All outbound frames go through one writer task fed by an mpsc queue, so
//! heartbeats and concurrent relays never interleave partial frames.

use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use outpost_shared::protocol::ControlMessage;
use outpost_shared::{Error, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound frames queued ahead of the writer
const OUTBOUND_QUEUE: usize = 256;

/// How long `close` waits for the writer to flush the close frame
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Cloneable handle onto the control channel's single writer
#[derive(Debug, Clone)]
pub struct SessionSender {
    tx: mpsc::Sender<Message>,
}

impl SessionSender {
    pub(crate) fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Queue one control message. Fails once the channel is gone.
    pub async fn send(&self, message: &ControlMessage) -> Result<()> {
        let text = message.encode()?;
        self.send_frame(Message::Text(text)).await
    }

    async fn send_frame(&self, frame: Message) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed("control channel writer has stopped".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One connection to the broker. Never reconnects.
pub struct Session {
    reader: SplitStream<WsStream>,
    sender: SessionSender,
    writer: Option<JoinHandle<()>>,
    /// Silence longer than this means the broker is gone
    read_deadline: Duration,
    closed: bool,
}

impl Session {
    /// Open the control channel, attaching the bearer token.
    pub async fn connect(config: &TunnelConfig) -> Result<Self> {
        let url = config.websocket_url()?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Connect(format!("invalid broker URL {}: {}", url, e)))?;
        if !config.token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", config.token))
                .map_err(|_| Error::Config("auth token is not a valid header value".to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = timeout(config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                Error::Connect(format!(
                    "timed out after {:?} connecting to {}",
                    config.connect_timeout, url
                ))
            })?
            .map_err(|e| Error::Connect(format!("failed to connect to {}: {}", url, e)))?;

        info!("Connected to broker: {}", url);
        Ok(Self::from_stream(stream, config))
    }

    /// Connect, retrying up to `retry_count` more times.
    pub async fn connect_with_retry(config: &TunnelConfig) -> Result<Self> {
        let attempts = config.retry_count.saturating_add(1);
        let mut attempt = 1;
        loop {
            match Self::connect(config).await {
                Ok(session) => return Ok(session),
                Err(e @ Error::Config(_)) => return Err(e),
                Err(e) if attempt >= attempts => {
                    warn!("Giving up after {} connect attempt(s): {}", attempts, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Connect attempt {}/{} failed: {}", attempt, attempts, e);
                    tokio::time::sleep(config.retry_delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn from_stream(stream: WsStream, config: &TunnelConfig) -> Self {
        let (sink, reader) = stream.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_loop(sink, rx, config.keepalive_interval));

        Self {
            reader,
            sender: SessionSender::new(tx),
            writer: Some(writer),
            read_deadline: config.keepalive_interval + config.keepalive_timeout,
            closed: false,
        }
    }

    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    pub async fn send(&self, message: &ControlMessage) -> Result<()> {
        self.sender.send(message).await
    }

    /// Wait for the next text frame from the broker.
    pub async fn receive(&mut self) -> Result<String> {
        if self.closed {
            return Err(Error::ConnectionClosed("session closed".to_string()));
        }

        loop {
            let next = timeout(self.read_deadline, self.reader.next())
                .await
                .map_err(|_| {
                    Error::ConnectionClosed(format!(
                        "no traffic from broker for {:?}",
                        self.read_deadline
                    ))
                })?;

            match next {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(text),
                    Err(_) => warn!("Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.sender.send_frame(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by broker".to_string());
                    return Err(Error::ConnectionClosed(reason));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Error::ConnectionClosed(e.to_string())),
                None => return Err(Error::ConnectionClosed("stream ended".to_string())),
            }
        }
    }

    /// Send a close frame and release the connection. Safe to call twice.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let _ = self.sender.send_frame(Message::Close(None)).await;
        if let Some(mut writer) = self.writer.take() {
            if timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await.is_err() {
                warn!("Control channel writer did not stop in time, aborting");
                writer.abort();
            }
        }
        debug!("Control channel closed");
    }

    /// Kill the writer while leaving the read half open.
    #[cfg(test)]
    pub(crate) fn stop_writer(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Drain the outbound queue into the sink, pinging every `keepalive`.
async fn write_loop<S>(mut sink: S, mut rx: mpsc::Receiver<Message>, keepalive: Duration)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ping = interval_at(Instant::now() + keepalive, keepalive);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        let closing = matches!(frame, Message::Close(_));
        if let Err(e) = sink.send(frame).await {
            debug!("Control channel write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }

    let _ = sink.close().await;
}
