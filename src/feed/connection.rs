//! Feed connection lifecycle
//!
//! Connects with a bearer token, subscribes once per connection, spawns the
//! heartbeat task and hands every binary frame to a [`FrameHandler`]. A
//! transport fault leads to `Reconnecting` (backoff, then a fresh connection
//! and a fresh subscription) or to `Error` when reconnecting is disabled.

use std::{sync::Arc, time::Duration};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use reqwest::Url;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, protocol::frame::coding::CloseCode, Message},
};
use tracing::{debug, error, info, warn};

use super::{
    auth::{AuthError, AuthProvider},
    envelope::Envelope,
    session::{ConnectionState, Session, SessionConfig, TransitionReason},
    wire::DecodeError,
};
use crate::aggregator::BufferFull;
use crate::registry::SubscriptionRegistry;

type SharedSink<W> = Arc<Mutex<W>>;

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Buffered,
    Dropped(DecodeError),
    Backpressure(BufferFull),
}

/// Receives every binary frame of an open connection.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: &[u8]) -> FrameOutcome;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("token unavailable: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid feed url {0}")]
    InvalidUrl(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connect failed: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("subscription send failed: {0}")]
    Subscribe(#[source] tungstenite::Error),
    #[error("heartbeat send failed: {0}")]
    Heartbeat(#[source] tungstenite::Error),
    #[error("heartbeat task stopped: {0}")]
    HeartbeatStopped(String),
    #[error("websocket error: {0}")]
    Stream(#[source] tungstenite::Error),
    #[error("server closed connection abnormally ({0})")]
    AbnormalClose(CloseCode),
    #[error("stream ended without close frame")]
    StreamEnded,
}

impl TransportError {
    fn reason(&self) -> TransitionReason {
        match self {
            Self::Auth(_) | Self::InvalidUrl(_) | Self::ConnectTimeout(_) | Self::Connect(_) => {
                TransitionReason::ConnectFailed
            }
            Self::Heartbeat(_) | Self::HeartbeatStopped(_) => TransitionReason::HeartbeatFailed,
            Self::AbnormalClose(_) => TransitionReason::ServerClose,
            Self::Subscribe(_) | Self::Stream(_) | Self::StreamEnded => {
                TransitionReason::NetworkError
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Streaming endpoint without the token query parameter
    pub feed_url: String,
    pub session: SessionConfig,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    registry: Arc<SubscriptionRegistry>,
    auth: Arc<dyn AuthProvider>,
    handler: Arc<dyn FrameHandler>,
    session: Arc<Session>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        registry: Arc<SubscriptionRegistry>,
        auth: Arc<dyn AuthProvider>,
        handler: Arc<dyn FrameHandler>,
    ) -> Self {
        let session = Arc::new(Session::new(config.session.clone()));
        Self {
            config,
            registry,
            auth,
            handler,
            session,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Drive the connection until it reaches a terminal state.
    ///
    /// Returns `Ok` after a normal close and the last transport error when
    /// the session ends in `Error`.
    pub async fn run(&self) -> Result<(), TransportError> {
        self.session
            .transition(ConnectionState::Connecting, TransitionReason::Started);

        loop {
            let err = match self.run_connection().await {
                Ok(()) => {
                    self.session
                        .transition(ConnectionState::Closed, TransitionReason::ServerClose);
                    return Ok(());
                }
                Err(e) => e,
            };

            let Some(backoff) = self.handle_fault(&err) else {
                return Err(err);
            };
            tokio::time::sleep(backoff).await;
            self.session
                .transition(ConnectionState::Connecting, TransitionReason::BackoffElapsed);
        }
    }

    /// Move the session after a transport fault. Returns the reconnect
    /// delay, or `None` once the session is in `Error`.
    fn handle_fault(&self, err: &TransportError) -> Option<Duration> {
        error!(error = %err, state = %self.session.state(), "feed transport fault");

        let terminal = if !self.session.config().reconnect {
            Some(TransitionReason::ReconnectDisabled)
        } else if matches!(err, TransportError::InvalidUrl(_)) {
            Some(TransitionReason::ConnectFailed)
        } else {
            None
        };
        if let Some(reason) = terminal {
            self.session.transition(ConnectionState::Error, reason);
            return None;
        }

        self.session
            .transition(ConnectionState::Reconnecting, err.reason());

        let Some(backoff) = self.session.next_backoff() else {
            self.session
                .transition(ConnectionState::Error, TransitionReason::AttemptsExhausted);
            return None;
        };

        info!(
            backoff_ms = backoff.as_millis() as u64,
            attempt = self.session.backoff_attempt(),
            "reconnect_backoff"
        );
        Some(backoff)
    }

    /// One connection from handshake to close or fault.
    async fn run_connection(&self) -> Result<(), TransportError> {
        let token = self.auth.token().await?;
        let url = feed_url(&self.config.feed_url, &token)?;

        debug!(url = %self.config.feed_url, "connecting");

        let connect_timeout = self.config.session.connect_timeout;
        let (ws_stream, response) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::ConnectTimeout(connect_timeout))?
            .map_err(|e| {
                if let tungstenite::Error::Http(resp) = &e {
                    if resp.status().as_u16() == 401 {
                        self.auth.invalidate();
                    }
                }
                TransportError::Connect(e)
            })?;

        self.session
            .transition(ConnectionState::Open, TransitionReason::Handshake);
        debug!(status = %response.status(), "handshake complete");

        let (write, read) = ws_stream.split();
        self.serve(read, write).await
    }

    /// Subscribe, start heartbeats and stream frames on an open connection.
    async fn serve<R, W>(&self, mut read: R, write: W) -> Result<(), TransportError>
    where
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
        W: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
    {
        let write: SharedSink<W> = Arc::new(Mutex::new(write));

        let subscribe = Envelope::subscribe(&self.registry).to_json();
        write
            .lock()
            .await
            .send(Message::Text(subscribe))
            .await
            .map_err(TransportError::Subscribe)?;
        self.session
            .metrics()
            .subscriptions_sent
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(instruments = self.registry.len(), "subscribed to market data");

        let mut heartbeat = tokio::spawn(heartbeat_loop(
            write.clone(),
            self.config.session.heartbeat_interval,
            self.session.clone(),
        ));

        let result = self.stream_frames(&mut read, &write, &mut heartbeat).await;

        // Heartbeats never outlive the open connection
        heartbeat.abort();
        result
    }

    async fn stream_frames<R, W>(
        &self,
        read: &mut R,
        write: &SharedSink<W>,
        heartbeat: &mut JoinHandle<tungstenite::Error>,
    ) -> Result<(), TransportError>
    where
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let mut saturated = false;

        loop {
            tokio::select! {
                stopped = &mut *heartbeat => {
                    return Err(match stopped {
                        Ok(e) => TransportError::Heartbeat(e),
                        Err(join) => TransportError::HeartbeatStopped(join.to_string()),
                    });
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            saturated = self.dispatch(&data, saturated);
                        }
                        Some(Ok(Message::Text(text))) => {
                            self.session
                                .metrics()
                                .text_frames_ignored
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            debug!(text = %text, "ignoring text frame");
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            write
                                .lock()
                                .await
                                .send(Message::Pong(payload))
                                .await
                                .map_err(TransportError::Stream)?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "server_close");
                            return match frame.map(|f| f.code) {
                                None | Some(CloseCode::Normal) | Some(CloseCode::Away) => Ok(()),
                                Some(code) => Err(TransportError::AbnormalClose(code)),
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(TransportError::Stream(e)),
                        None => return Err(TransportError::StreamEnded),
                    }
                }
            }
        }
    }

    /// Hand one frame to the handler. Returns whether the buffer is saturated.
    fn dispatch(&self, frame: &[u8], saturated: bool) -> bool {
        match self.handler.on_frame(frame) {
            FrameOutcome::Buffered => {
                if saturated {
                    info!("pending buffer accepting ticks again");
                }
                false
            }
            FrameOutcome::Dropped(_) => saturated,
            FrameOutcome::Backpressure(full) => {
                if !saturated {
                    warn!(capacity = full.capacity, "pending buffer full, dropping ticks until next drain");
                }
                true
            }
        }
    }
}

/// Sends a heartbeat envelope every `period`; returns only when a send fails.
async fn heartbeat_loop<W>(
    write: SharedSink<W>,
    period: Duration,
    session: Arc<Session>,
) -> tungstenite::Error
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin + Send,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let payload = Envelope::heartbeat().to_json();

    loop {
        ticker.tick().await;
        if let Err(e) = write.lock().await.send(Message::Text(payload.clone())).await {
            warn!(error = %e, "heartbeat send failed");
            return e;
        }
        session
            .metrics()
            .heartbeats_sent
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!("heartbeat sent");
    }
}

/// Feed endpoint with the bearer token as percent-encoded `token` query
/// parameter. A base without a path gets `/`.
pub fn feed_url(base: &str, token: &str) -> Result<String, TransportError> {
    let mut url =
        Url::parse(base).map_err(|e| TransportError::InvalidUrl(format!("{base}: {e}")))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.to_string())
}
