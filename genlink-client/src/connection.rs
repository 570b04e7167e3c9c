//! Connection management.
//!
//! [`ConnectionManager`] owns the single WebSocket to the service and its
//! state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Ready
//!       any state -> Failed -> (backoff) -> Connecting
//!       any state -> Closing -> Disconnected        (disconnect())
//! ```
//!
//! Concurrent callers share one connection attempt, which runs in its own
//! task so it finishes (or times out) even if every caller gives up. A
//! connection lost while `Ready` is retried with exponential backoff up to the
//! configured attempt cap; after that the manager stays `Failed` until
//! `connect()` is called again. `disconnect()` cancels both the attempt in
//! flight and any pending retry.

use crate::backoff::ReconnectPolicy;
use crate::classify::{classify, ClassifiedError, TransportSignal};
use crate::config::ClientConfig;
use crate::correlator::{Correlator, FrameSender};
use crate::error::ClientError;
use crate::transport::{self, WsStream};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use genlink_protocol::{codec, AuthenticationMessage, TaskRequest, TaskType};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// How long disconnect() waits for the close frame to be flushed.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Automatic reconnection progress. Reset whenever a connection becomes ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectionState {
    /// Reconnection attempts scheduled since the last ready connection.
    pub attempt: u32,
    /// Delay before the most recently scheduled attempt.
    pub next_delay: Option<Duration>,
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), ClientError>>>;

/// A connection attempt running in its own task.
struct InFlight {
    id: u64,
    outcome: ConnectAttempt,
    task: AbortHandle,
}

/// The live transport: writer queue plus the tasks driving the socket.
struct Link {
    generation: u64,
    outbound: FrameSender,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// Owns the connection to the image service.
///
/// Lock order: `link` before `in_flight`.
pub struct ConnectionManager {
    config: ClientConfig,
    policy: ReconnectPolicy,
    correlator: Correlator,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    /// Connection attempt shared by every caller waiting on it.
    in_flight: Mutex<Option<InFlight>>,
    reconnect: Mutex<ReconnectionState>,
    /// Retry timers from an older epoch do nothing when they fire.
    reconnect_epoch: AtomicU64,
    /// Set when automatic recovery has stopped; cleared by connect().
    terminal: Mutex<Option<ClientError>>,
    last_failure: Mutex<Option<ClassifiedError>>,
    /// Session handed out by the service, resent on reconnect.
    session_uuid: Mutex<Option<String>>,
    attempt_ids: AtomicU64,
    generation: AtomicU64,
    transport_opens: AtomicU64,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Creates a manager (not yet connected).
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new_cyclic(|this| Self {
            policy: config.reconnect_policy(),
            correlator: Correlator::new(config.request_timeout()),
            config,
            state,
            link: Mutex::new(None),
            in_flight: Mutex::new(None),
            reconnect: Mutex::new(ReconnectionState::default()),
            reconnect_epoch: AtomicU64::new(0),
            terminal: Mutex::new(None),
            last_failure: Mutex::new(None),
            session_uuid: Mutex::new(None),
            attempt_ids: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            transport_opens: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn reconnection_state(&self) -> ReconnectionState {
        *self.reconnect.lock()
    }

    /// Returns the most recent classified connection loss.
    pub fn last_failure(&self) -> Option<ClassifiedError> {
        self.last_failure.lock().clone()
    }

    /// Returns the number of times a transport was opened.
    pub fn transport_opens(&self) -> u64 {
        self.transport_opens.load(Ordering::SeqCst)
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Connects and authenticates, or joins the attempt already in flight.
    ///
    /// Takes over from automatic recovery: pending retries are cancelled and
    /// the terminal failure left by exhausted reconnection is cleared.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.reconnect_epoch.fetch_add(1, Ordering::SeqCst);
        if self.terminal.lock().take().is_some() {
            info!("Manual reconnect requested, clearing terminal failure");
        }
        *self.reconnect.lock() = ReconnectionState::default();
        self.join_or_start().await
    }

    /// Returns once the connection is ready, connecting if needed.
    ///
    /// Fails immediately while the manager is in a terminal failed state.
    pub async fn ensure_ready(&self) -> Result<(), ClientError> {
        if self.is_ready() {
            return Ok(());
        }
        let terminal = self.terminal.lock().clone();
        if let Some(err) = terminal {
            return Err(err);
        }
        self.join_or_start().await
    }

    /// Sends a task over the ready connection and waits for its response.
    pub async fn request(&self, task: TaskRequest) -> Result<Value, ClientError> {
        // `Ready` implies a link, but the link may be lost between the two
        // checks; waiting again covers that.
        let (outbound, epoch) = loop {
            self.ensure_ready().await?;
            let link = self.link.lock();
            if let Some(link) = link.as_ref() {
                // Read under the link lock: a loss of this link flushes the
                // correlator only after the link is taken.
                break (link.outbound.clone(), self.correlator.epoch());
            }
        };

        self.correlator.send_in_epoch(&outbound, epoch, task).await
    }

    /// Closes the connection and rejects every pending request with
    /// `ConnectionClosed`. Also cancels a connection attempt in flight and
    /// any scheduled reconnection.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        debug!("Closing connection...");
        self.reconnect_epoch.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Closing);

        let in_flight = self.in_flight.lock().take();
        if let Some(attempt) = in_flight {
            debug!("Cancelling connection attempt {}", attempt.id);
            attempt.task.abort();
        }

        let link = self.link.lock().take();
        if let Some(Link {
            outbound,
            mut writer,
            reader,
            ..
        }) = link
        {
            // Closing the queue makes the writer send a close frame and exit.
            drop(outbound);
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
            reader.abort();
        }

        let released = self.correlator.fail_all(ClientError::ConnectionClosed);
        *self.reconnect.lock() = ReconnectionState::default();
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected ({} pending requests released)", released);
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Connection state {} -> {}", previous, next);
        }
    }

    async fn join_or_start(&self) -> Result<(), ClientError> {
        let outcome = {
            let mut slot = self.in_flight.lock();
            if self.is_ready() {
                return Ok(());
            }
            match slot.as_ref() {
                Some(attempt) => attempt.outcome.clone(),
                None => {
                    let this = self.this.upgrade().ok_or(ClientError::NotConnected)?;
                    let id = self.attempt_ids.fetch_add(1, Ordering::SeqCst) + 1;
                    self.set_state(ConnectionState::Connecting);

                    let task = tokio::spawn(this.establish(id));
                    let abort = task.abort_handle();
                    let outcome = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) if e.is_cancelled() => Err(ClientError::ConnectionClosed),
                            Err(e) => Err(ClientError::Unknown(format!(
                                "connection task failed: {}",
                                e
                            ))),
                        }
                    }
                    .boxed()
                    .shared();

                    *slot = Some(InFlight {
                        id,
                        outcome: outcome.clone(),
                        task: abort,
                    });
                    outcome
                }
            }
        };
        outcome.await
    }

    /// Runs connection attempt `id` to completion.
    async fn establish(self: Arc<Self>, id: u64) -> Result<(), ClientError> {
        let timeout = self.config.connect_timeout();
        let outcome = match tokio::time::timeout(timeout, self.open_and_authenticate(id)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let stalled = classify(&TransportSignal::Readiness(self.state()));
                warn!(
                    "Connection attempt timed out after {:?}: {}",
                    timeout, stalled.detail
                );
                Err(ClientError::ConnectTimeout)
            }
        };

        let mut link = self.link.lock();
        let mut slot = self.in_flight.lock();
        if slot.as_ref().map(|attempt| attempt.id) != Some(id) {
            debug!("Connection attempt {} was cancelled by disconnect", id);
            return Err(ClientError::ConnectionClosed);
        }
        slot.take();

        match outcome {
            Ok(ws) => {
                self.install(&mut link, ws);
                Ok(())
            }
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Moves attempt `id` to `next`, unless the attempt was cancelled.
    fn advance(&self, id: u64, next: ConnectionState) {
        let slot = self.in_flight.lock();
        if slot.as_ref().map(|attempt| attempt.id) == Some(id) {
            self.set_state(next);
        }
    }

    /// Opens the transport and performs the authentication handshake.
    /// Reads the handshake response directly, before the reader task exists.
    async fn open_and_authenticate(&self, id: u64) -> Result<WsStream, ClientError> {
        let api_key = self
            .config
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ClientError::Config("no API key configured".to_string()))?;

        self.transport_opens.fetch_add(1, Ordering::SeqCst);
        let mut ws = transport::open(&self.config).await?;

        self.advance(id, ConnectionState::Authenticating);
        let session = self.session_uuid.lock().clone();
        let auth = AuthenticationMessage::new(api_key).with_session(session);
        ws.send(Message::Text(codec::encode(&auth)?))
            .await
            .map_err(|e| ClientError::from(classify(&transport::signal_from_error(&e))))?;
        debug!("Authentication sent, waiting for response...");

        loop {
            let message = match ws.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(classify(&transport::signal_from_error(&e)).into()),
                None => {
                    return Err(classify(&TransportSignal::Closed {
                        code: None,
                        reason: String::new(),
                    })
                    .into())
                }
            };

            let messages = match message {
                Message::Text(text) => codec::decode_frame(&text)?,
                Message::Binary(data) => codec::decode_bytes(&data)?,
                Message::Close(frame) => {
                    return Err(classify(&transport::signal_from_close(frame.as_ref())).into())
                }
                _ => continue,
            };

            for message in messages {
                let about_auth =
                    message.task_uuid.is_none() || message.is_task(TaskType::Authentication);
                if message.is_error() && about_auth {
                    let reason = message.error_message().unwrap_or_default();
                    warn!("Authentication rejected: {}", reason);
                    return Err(ClientError::AuthRejected(reason));
                }
                if message.is_task(TaskType::Authentication) {
                    let session = message
                        .data
                        .as_ref()
                        .and_then(|d| d.get("connectionSessionUUID"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    if session.is_some() {
                        *self.session_uuid.lock() = session;
                    }
                    debug!("Authentication accepted");
                    return Ok(ws);
                }
                debug!("Ignoring frame received during handshake");
            }
        }
    }

    /// Starts the reader and writer tasks and marks the connection ready.
    /// Called with the link lock held, so a loss reported by the new reader
    /// is processed after the `Ready` transition.
    fn install(&self, link: &mut Option<Link>, ws: WsStream) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, stream) = ws.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, queue));
        let reader = tokio::spawn(read_loop(self.this.clone(), generation, stream));

        if let Some(old) = link.replace(Link {
            generation,
            outbound,
            writer,
            reader,
        }) {
            old.reader.abort();
            old.writer.abort();
        }

        *self.reconnect.lock() = ReconnectionState::default();
        *self.terminal.lock() = None;
        self.set_state(ConnectionState::Ready);
        info!("Connected to {}", self.config.endpoint);
    }

    /// Handles the end of a connection's reader task.
    fn on_transport_lost(&self, generation: u64, signal: TransportSignal) {
        {
            let mut link = self.link.lock();
            match link.as_ref() {
                Some(current) if current.generation == generation => {
                    // Leave `Ready` before the link disappears so requests
                    // wait for reconnection instead of finding no link.
                    self.set_state(ConnectionState::Failed);
                    link.take();
                }
                _ => {
                    debug!("Ignoring close of stale connection {}", generation);
                    return;
                }
            }
        }

        let classified = classify(&signal);
        warn!(
            category = %classified.category,
            "Connection lost: {}",
            classified.detail
        );
        *self.last_failure.lock() = Some(classified);

        self.correlator.fail_all(ClientError::ConnectionClosed);
        self.schedule_reconnect(self.reconnect_epoch.load(Ordering::SeqCst));
    }

    fn schedule_reconnect(&self, epoch: u64) {
        if epoch != self.reconnect_epoch.load(Ordering::SeqCst) {
            return;
        }

        let max_attempts = self.config.max_reconnect_attempts;
        let delay = {
            let mut reconnect = self.reconnect.lock();
            if reconnect.attempt >= max_attempts {
                reconnect.next_delay = None;
                error!(
                    "Giving up after {} reconnection attempts; call connect() to retry",
                    reconnect.attempt
                );
                *self.terminal.lock() = Some(ClientError::ReconnectExhausted {
                    attempts: reconnect.attempt,
                });
                return;
            }
            let delay = self.policy.next_delay(reconnect.attempt);
            reconnect.attempt += 1;
            reconnect.next_delay = Some(delay);
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, reconnect.attempt, max_attempts
            );
            delay
        };

        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = this.upgrade() {
                manager.reconnect_now(epoch).await;
            }
        });
    }

    async fn reconnect_now(&self, epoch: u64) {
        if epoch != self.reconnect_epoch.load(Ordering::SeqCst)
            || self.is_ready()
            || self.terminal.lock().is_some()
        {
            return;
        }

        match self.join_or_start().await {
            Ok(()) => info!("Reconnected"),
            Err(ClientError::AuthRejected(reason)) => {
                error!("Reconnection rejected by the service: {}", reason);
                if epoch == self.reconnect_epoch.load(Ordering::SeqCst) {
                    *self.terminal.lock() = Some(ClientError::AuthRejected(reason));
                }
            }
            Err(e) => {
                warn!("Reconnection attempt failed: {}", e);
                self.schedule_reconnect(epoch);
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(attempt) = self.in_flight.get_mut().take() {
            attempt.task.abort();
        }
        if let Some(link) = self.link.get_mut().take() {
            link.reader.abort();
        }
        self.correlator.fail_all(ClientError::ConnectionClosed);
    }
}

/// Drains the outbound queue into the socket. When the queue closes, sends a
/// normal close frame.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut queue: mpsc::UnboundedReceiver<String>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = sink.send(Message::Text(frame)).await {
            debug!("write_loop: send failed: {}", e);
            return;
        }
    }

    let close = CloseFrame {
        code: CloseCode::Normal,
        reason: "client disconnect".into(),
    };
    let _ = sink.send(Message::Close(Some(close))).await;
    let _ = sink.close().await;
}

/// Feeds incoming frames to the correlator until the socket ends, then
/// reports the loss to the manager.
async fn read_loop(
    manager: Weak<ConnectionManager>,
    generation: u64,
    mut stream: SplitStream<WsStream>,
) {
    let signal = loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => break transport::signal_from_error(&e),
            None => {
                break TransportSignal::Closed {
                    code: None,
                    reason: String::new(),
                }
            }
        };

        let Some(this) = manager.upgrade() else {
            return;
        };

        match message {
            Message::Text(text) => {
                this.correlator.on_frame(&text);
            }
            Message::Binary(data) => {
                this.correlator.on_bytes(&data);
            }
            Message::Close(frame) => break transport::signal_from_close(frame.as_ref()),
            // Ping/pong are answered by tungstenite
            _ => {}
        }
    };

    debug!("read_loop: connection {} ended", generation);
    if let Some(this) = manager.upgrade() {
        this.on_transport_lost(generation, signal);
    }
}
