//! WebSocket session against the conversational endpoint.
//!
//! [`Connect::connect`] resolves only once the endpoint has signalled
//! readiness for the requested candidate; anything earlier (refused
//! connection, close during setup, handshake timeout) rejects the
//! candidate so the session manager can try the next one. After that the
//! socket is driven by a background task: outbound envelopes are
//! best-effort, inbound messages are classified into [`TransportEvent`]s.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::SessionConfig;
use crate::constants::{EVENT_QUEUE_CAPACITY, HANDSHAKE_TIMEOUT_SECS};
use crate::error::TransportError;
use crate::transport::wire::{self, SessionSignal, TransportEnvelope};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Events surfaced by an open transport session.
#[derive(Debug)]
pub enum TransportEvent {
    /// One PCM16 chunk of synthesized speech, already transport-decoded.
    Audio(Bytes),
    /// Barge-in: stop all playing audio immediately.
    Interrupted,
    /// Text fragment; the chat surface owns these.
    Text(String),
    /// Fatal transport failure; the session must tear down.
    Error(TransportError),
    /// Graceful close from the remote side.
    Closed,
}

/// An open session: a best-effort outbound queue, an inbound event
/// stream, and a close handle.
pub struct Connection {
    /// Outbound envelope queue; sends never block the caller.
    pub outbound: mpsc::UnboundedSender<TransportEnvelope>,
    /// Inbound events in arrival order.
    pub events: mpsc::Receiver<TransportEvent>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Connection {
    pub fn new(
        outbound: mpsc::UnboundedSender<TransportEnvelope>,
        events: mpsc::Receiver<TransportEvent>,
        shutdown: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            outbound,
            events,
            shutdown,
        }
    }

    /// Request a graceful close. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Decompose into the outbound queue, event stream and close handle.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<TransportEnvelope>,
        mpsc::Receiver<TransportEvent>,
        Option<oneshot::Sender<()>>,
    ) {
        (self.outbound, self.events, self.shutdown)
    }
}

/// Seam between the session manager and the real network.
#[async_trait]
pub trait Connect: Send + Sync {
    /// Open a session against one endpoint candidate, resolving only
    /// after the endpoint signals readiness.
    async fn connect(
        &self,
        endpoint: &str,
        config: &SessionConfig,
    ) -> Result<Connection, TransportError>;
}

/// Production connector speaking WebSocket via `tokio-tungstenite`.
pub struct WsConnector;

#[async_trait]
impl Connect for WsConnector {
    async fn connect(
        &self,
        endpoint: &str,
        config: &SessionConfig,
    ) -> Result<Connection, TransportError> {
        let url = format!("{}?key={}", config.service_url, config.api_key);
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut source) = socket.split();

        sink.send(Message::Text(wire::setup_message(endpoint)?))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        tokio::time::timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            await_ready(&mut source),
        )
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(run_io(sink, source, outbound_rx, event_tx, shutdown_rx));

        Ok(Connection::new(outbound_tx, event_rx, Some(shutdown_tx)))
    }
}

/// Drain the socket until the ready signal, rejecting the candidate on
/// anything terminal.
async fn await_ready(source: &mut WsSource) -> Result<(), TransportError> {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let signals = wire::classify(&text)?;
                if signals.contains(&SessionSignal::Ready) {
                    return Ok(());
                }
            }
            Ok(Message::Close(frame)) => {
                return Err(TransportError::EndpointRejected(
                    frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed during setup".to_string()),
                ));
            }
            Ok(_) => {}
            Err(e) => return Err(TransportError::EndpointRejected(e.to_string())),
        }
    }
    Err(TransportError::EndpointRejected(
        "connection ended during setup".to_string(),
    ))
}

/// Socket pump for one open session.
///
/// Outbound failures are logged and swallowed: audio frames are
/// at-most-once by contract. Inbound failures and closes end the task
/// after surfacing one terminal event.
async fn run_io(
    mut sink: WsSink,
    mut source: WsSource,
    mut outbound: mpsc::UnboundedReceiver<TransportEnvelope>,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            envelope = outbound.recv() => match envelope {
                Some(envelope) => match serde_json::to_string(&envelope) {
                    Ok(json) => {
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            tracing::warn!("audio frame send failed: {e}");
                        }
                    }
                    Err(e) => tracing::warn!("failed to serialize envelope: {e}"),
                },
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => match wire::classify(&text) {
                    Ok(signals) => {
                        for signal in signals {
                            let event = match signal {
                                SessionSignal::Audio(chunk) => TransportEvent::Audio(chunk),
                                SessionSignal::Interrupted => TransportEvent::Interrupted,
                                SessionSignal::Text(text) => TransportEvent::Text(text),
                                SessionSignal::Ready => continue,
                            };
                            if events.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => tracing::warn!("dropping malformed message: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events.send(TransportEvent::Closed).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events
                        .send(TransportEvent::Error(TransportError::ConnectionFailed(
                            e.to_string(),
                        )))
                        .await;
                    break;
                }
            },
        }
    }
}
