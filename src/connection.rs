//! Persistent connection to the transcription service.
//!
//! Owns a single WebSocket and keeps it alive across transient network
//! failures: exponential backoff with jitter on reconnect, a connect-timeout
//! guard, and a periodic health check that treats prolonged inbound silence
//! as a dead transport.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──open──▶ Connected
//!        ▲                      │                    │
//!        │                 fail │               drop │
//!   disconnect                  ▼                    ▼
//!        └──────────────── Reconnecting ◀────────────┘
//!                               │ retries exhausted
//!                               ▼
//!                             Error (terminal until manual recovery)
//! ```
//!
//! Every transition bumps a generation counter. Timers and spawned loops
//! capture the generation they were born under and re-check it before
//! acting, so a superseded backoff timer or health check can never corrupt
//! a newer state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::protocol::{ControlMessage, ServerMessage, StreamConfig, TranscriptFragment};
use crate::StreamError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Connection manager tunables.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub stream: StreamConfig,
    /// Abort a connection attempt that has not completed within this window
    pub connect_timeout: Duration,
    /// Cadence of the liveness probe while connected
    pub health_check_interval: Duration,
    /// Inbound silence longer than this marks the connection dead
    pub stale_after: Duration,
    /// First backoff delay; doubles per attempt
    pub base_retry_delay: Duration,
    /// Backoff ceiling
    pub max_retry_delay: Duration,
    /// Consecutive failures tolerated before the terminal `Error` state
    pub max_retry_attempts: u32,
    /// Random backoff inflation, as a fraction of the computed delay
    pub jitter_fraction: f64,
    /// Outbound frame queue depth; overflow drops frames
    pub outbound_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            connect_timeout: Duration::from_secs(15),
            health_check_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            max_retry_attempts: 10,
            jitter_fraction: 0.10,
            outbound_queue: 64,
        }
    }
}

/// Read-only view published to observers on every transition.
///
/// A UI can render "reconnecting (attempt 3/10)" from this alone, without
/// reaching into internal counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub is_connected: bool,
    pub connection_error: Option<String>,
    pub network_latency_ms: Option<u64>,
    pub retry_attempt: u32,
}

impl ConnectionStatus {
    fn idle() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            is_connected: false,
            connection_error: None,
            network_latency_ms: None,
            retry_attempt: 0,
        }
    }
}

/// Immutable diagnostics snapshot, recomputed from counters on demand.
#[derive(Debug, Clone)]
pub struct ConnectionDiagnostics {
    pub state: ConnectionState,
    pub connection_attempts: u64,
    pub retry_count: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub latency: Option<Duration>,
    pub uptime: Option<Duration>,
}

impl ConnectionDiagnostics {
    pub fn total_messages(&self) -> u64 {
        self.messages_sent + self.messages_received
    }

    /// errors / total messages; exactly 0 when nothing has moved.
    pub fn error_rate(&self) -> f64 {
        let total = self.total_messages();
        if total == 0 {
            0.0
        } else {
            self.errors as f64 / total as f64
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.is_connected()
            && self.error_rate() < 0.1
            && self.latency.unwrap_or(Duration::ZERO) < Duration::from_secs(2)
    }
}

struct StateCell {
    state: ConnectionState,
    generation: u64,
    last_error: Option<String>,
}

struct Shared {
    config: ConnectionConfig,
    cell: Mutex<StateCell>,
    auto_reconnect: AtomicBool,
    retry_count: AtomicU32,
    attempts: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    errors: AtomicU64,
    connected_at: Mutex<Option<Instant>>,
    last_message_at: Mutex<Option<Instant>>,
    ping_sent_at: Mutex<Option<Instant>>,
    latency: Mutex<Option<Duration>>,
    token: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    status_tx: watch::Sender<ConnectionStatus>,
    fragment_tx: mpsc::Sender<TranscriptFragment>,
}

impl Shared {
    fn current(&self) -> (ConnectionState, u64) {
        let cell = self.cell.lock().unwrap();
        (cell.state, cell.generation)
    }

    /// Transition unconditionally; returns the new generation.
    fn transition(&self, next: ConnectionState, error: Option<String>) -> u64 {
        let mut cell = self.cell.lock().unwrap();
        cell.state = next;
        cell.generation += 1;
        if error.is_some() {
            cell.last_error = error;
        }
        let generation = cell.generation;
        drop(cell);
        self.publish_status();
        generation
    }

    /// Transition only if the generation still matches `expect`.
    ///
    /// Returns `None` when a newer transition has superseded the caller;
    /// the caller must then stand down without touching anything.
    fn transition_if(&self, expect: u64, next: ConnectionState, error: Option<String>) -> Option<u64> {
        let mut cell = self.cell.lock().unwrap();
        if cell.generation != expect {
            return None;
        }
        cell.state = next;
        cell.generation += 1;
        if error.is_some() {
            cell.last_error = error;
        }
        let generation = cell.generation;
        drop(cell);
        self.publish_status();
        Some(generation)
    }

    /// Check-and-transition in one locked step for a caller-initiated
    /// attempt. `None` when an attempt, backoff cycle, or live connection
    /// already owns the state - at most one attempt is ever in flight.
    fn begin_user_attempt(&self) -> Option<u64> {
        let mut cell = self.cell.lock().unwrap();
        match cell.state {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting => None,
            ConnectionState::Disconnected | ConnectionState::Error => {
                cell.state = ConnectionState::Connecting;
                cell.generation += 1;
                let generation = cell.generation;
                drop(cell);
                self.publish_status();
                Some(generation)
            }
        }
    }

    fn publish_status(&self) {
        let cell = self.cell.lock().unwrap();
        let status = ConnectionStatus {
            state: cell.state,
            is_connected: cell.state.is_connected(),
            connection_error: cell.last_error.clone(),
            network_latency_ms: self
                .latency
                .lock()
                .unwrap()
                .map(|d| d.as_millis() as u64),
            retry_attempt: self.retry_count.load(Ordering::SeqCst),
        };
        drop(cell);
        self.status_tx.send_replace(status);
    }
}

/// Handle to the connection manager. Cheap to clone; all clones share the
/// same underlying connection and state machine.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager that forwards parsed fragments to `fragment_tx`.
    pub fn new(config: ConnectionConfig, fragment_tx: mpsc::Sender<TranscriptFragment>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::idle());
        Self {
            shared: Arc::new(Shared {
                config,
                cell: Mutex::new(StateCell {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    last_error: None,
                }),
                auto_reconnect: AtomicBool::new(false),
                retry_count: AtomicU32::new(0),
                attempts: AtomicU64::new(0),
                messages_sent: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                connected_at: Mutex::new(None),
                last_message_at: Mutex::new(None),
                ping_sent_at: Mutex::new(None),
                latency: Mutex::new(None),
                token: Mutex::new(None),
                outbound: Mutex::new(None),
                status_tx,
                fragment_tx,
            }),
        }
    }

    /// Open the connection with the given token.
    ///
    /// Fire-and-forget: the outcome is observable through [`Self::status`].
    /// A call while connected or mid-attempt is a logged no-op, and a call
    /// during a backoff cycle resumes that cycle rather than racing it.
    pub fn connect(&self, token: &str, auto_reconnect: bool) {
        let shared = &self.shared;
        shared.auto_reconnect.store(auto_reconnect, Ordering::SeqCst);
        *shared.token.lock().unwrap() = Some(token.to_string());

        let Some(generation) = shared.begin_user_attempt() else {
            // Already connected, mid-attempt, or in a backoff cycle; the
            // running cycle resumes rather than racing a second one.
            log::debug!("connection: connect ignored, already {:?}", shared.current().0);
            return;
        };

        shared.retry_count.store(0, Ordering::SeqCst);
        launch_attempt(shared.clone(), generation);
    }

    /// Tear the connection down and stay down.
    ///
    /// Idempotent from any state: disables auto-reconnect, invalidates every
    /// pending timer, sends the close control message when a live socket
    /// exists, and parks in `Disconnected`.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        shared.auto_reconnect.store(false, Ordering::SeqCst);

        let (state, _) = shared.current();
        // Bump the generation before touching the socket so every pending
        // timer and read loop goes stale immediately.
        shared.transition(ConnectionState::Disconnected, None);
        *shared.connected_at.lock().unwrap() = None;

        let out = shared.outbound.lock().unwrap().take();
        if let Some(tx) = out {
            if state.is_connected() {
                if let Ok(json) = serde_json::to_string(&ControlMessage::CloseStream) {
                    let _ = tx.send(Message::Text(json)).await;
                }
            }
            // Dropping the sender closes the writer task, which closes the
            // sink gracefully.
        }

        if !matches!(state, ConnectionState::Disconnected) {
            log::info!("connection: disconnected");
        }
    }

    /// Queue a binary audio frame.
    ///
    /// Never errors: audio is lossy-tolerant, so frames sent while not
    /// connected (or into a full queue) are dropped with a debug log.
    pub fn send(&self, data: Vec<u8>) {
        let shared = &self.shared;
        if !shared.current().0.is_connected() {
            log::debug!(
                "connection: not connected, dropping {}-byte frame",
                data.len()
            );
            return;
        }
        let tx = shared.outbound.lock().unwrap().clone();
        match tx {
            Some(tx) => {
                if tx.try_send(Message::Binary(data)).is_ok() {
                    shared.messages_sent.fetch_add(1, Ordering::SeqCst);
                } else {
                    log::debug!("connection: outbound queue full, dropping frame");
                }
            }
            None => log::debug!("connection: no writer, dropping frame"),
        }
    }

    /// Bypass backoff and attempt a fresh connection immediately.
    ///
    /// Manual recovery for e.g. a network interface change, or for leaving
    /// the terminal `Error` state.
    pub fn force_reconnect(&self) {
        let shared = &self.shared;
        if shared.token.lock().unwrap().is_none() {
            log::warn!("connection: force_reconnect before any connect, ignoring");
            return;
        }
        shared.retry_count.store(0, Ordering::SeqCst);
        shared.auto_reconnect.store(true, Ordering::SeqCst);
        *shared.outbound.lock().unwrap() = None;
        // Unconditional takeover: the generation bump retires whatever
        // attempt or timer was in flight.
        let generation = shared.transition(ConnectionState::Connecting, None);
        launch_attempt(shared.clone(), generation);
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.current().0
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to the continuously-updated status view.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Diagnostics snapshot, recomputed from counters.
    pub fn diagnostics(&self) -> ConnectionDiagnostics {
        let shared = &self.shared;
        ConnectionDiagnostics {
            state: shared.current().0,
            connection_attempts: shared.attempts.load(Ordering::SeqCst),
            retry_count: shared.retry_count.load(Ordering::SeqCst),
            messages_sent: shared.messages_sent.load(Ordering::SeqCst),
            messages_received: shared.messages_received.load(Ordering::SeqCst),
            errors: shared.errors.load(Ordering::SeqCst),
            latency: *shared.latency.lock().unwrap(),
            uptime: shared.connected_at.lock().unwrap().map(|t| t.elapsed()),
        }
    }
}

/// Unjittered backoff delay for a 1-indexed attempt:
/// `min(base * 2^(attempt-1), max_delay)`.
fn backoff_delay_base(attempt: u32, config: &ConnectionConfig) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    config
        .base_retry_delay
        .saturating_mul(2u32.saturating_pow(exp))
        .min(config.max_retry_delay)
}

/// Backoff delay with uniform jitter in `[delay, (1 + fraction) * delay)`.
///
/// Jitter only ever inflates the delay, so synchronized clients spread out
/// without any of them retrying early.
fn backoff_delay(attempt: u32, config: &ConnectionConfig) -> Duration {
    let base = backoff_delay_base(attempt, config);
    if config.jitter_fraction <= 0.0 {
        return base;
    }
    let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..config.jitter_fraction));
    base + jitter
}

/// Run one connection attempt under the given generation.
fn launch_attempt(shared: Arc<Shared>, generation: u64) {
    shared.attempts.fetch_add(1, Ordering::SeqCst);

    tokio::spawn(async move {
        let attempt =
            tokio::time::timeout(shared.config.connect_timeout, open_socket(&shared)).await;
        match attempt {
            Ok(Ok(ws)) => on_open(shared, ws, generation),
            Ok(Err(e)) => handle_transport_failure(&shared, generation, &e.to_string()),
            Err(_) => handle_transport_failure(&shared, generation, "connection attempt timed out"),
        }
    });
}

/// Open and authenticate the WebSocket.
async fn open_socket(shared: &Shared) -> Result<WsStream, StreamError> {
    let token = shared
        .token
        .lock()
        .unwrap()
        .clone()
        .ok_or(StreamError::MissingToken)?;

    let url = shared.config.stream.url();
    let mut request = url
        .into_client_request()
        .map_err(|e| StreamError::Protocol(e.to_string()))?;
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Token {}", token))
            .map_err(|e| StreamError::AuthFailed(e.to_string()))?,
    );

    log::info!("connection: opening {}", shared.config.stream.endpoint);
    let (ws, _response) = connect_async_with_config(request, None, true)
        .await
        .map_err(|e| StreamError::ConnectFailed(e.to_string()))?;
    Ok(ws)
}

/// Wire up a freshly opened socket: reader, writer, health check.
fn on_open(shared: Arc<Shared>, ws: WsStream, attempt_generation: u64) {
    let Some(generation) =
        shared.transition_if(attempt_generation, ConnectionState::Connected, None)
    else {
        // A disconnect or forced reconnect superseded this attempt while
        // the handshake was in flight.
        log::debug!("connection: open superseded, dropping socket");
        return;
    };

    shared.retry_count.store(0, Ordering::SeqCst);
    let now = Instant::now();
    *shared.connected_at.lock().unwrap() = Some(now);
    *shared.last_message_at.lock().unwrap() = Some(now);
    shared.publish_status();
    log::info!("connection: established");

    let (sink, source) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(shared.config.outbound_queue);
    *shared.outbound.lock().unwrap() = Some(out_tx);

    tokio::spawn(write_loop(sink, out_rx));
    tokio::spawn(read_loop(shared.clone(), source, generation));
    tokio::spawn(health_loop(shared, generation));
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            log::warn!("connection: write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
    log::debug!("connection: writer exiting");
}

async fn read_loop(shared: Arc<Shared>, mut source: WsSource, generation: u64) {
    while let Some(frame) = source.next().await {
        if shared.current().1 != generation {
            log::debug!("connection: reader superseded, exiting");
            return;
        }
        match frame {
            Ok(Message::Text(text)) => handle_message(&shared, &text).await,
            Ok(Message::Pong(_)) => {
                if let Some(sent) = shared.ping_sent_at.lock().unwrap().take() {
                    *shared.latency.lock().unwrap() = Some(sent.elapsed());
                    shared.publish_status();
                }
            }
            Ok(Message::Close(_)) => {
                handle_transport_failure(&shared, generation, "closed by server");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                handle_transport_failure(&shared, generation, &e.to_string());
                return;
            }
        }
    }
    handle_transport_failure(&shared, generation, "stream ended");
}

async fn handle_message(shared: &Arc<Shared>, text: &str) {
    shared.messages_received.fetch_add(1, Ordering::SeqCst);
    *shared.last_message_at.lock().unwrap() = Some(Instant::now());

    match serde_json::from_str::<ServerMessage>(text) {
        Ok(msg) => {
            // A parsed message after a nonzero retry counter is the
            // recovery signal.
            if shared.retry_count.swap(0, Ordering::SeqCst) > 0 {
                shared.publish_status();
            }
            if let Some(fragment) = msg.to_fragment() {
                // Backpressure: a slow batching stage suspends the reader
                // rather than growing an unbounded queue.
                if shared.fragment_tx.send(fragment).await.is_err() {
                    log::debug!("connection: fragment consumer gone");
                }
            }
        }
        Err(e) => {
            // Malformed frames are counted, not fatal.
            shared.errors.fetch_add(1, Ordering::SeqCst);
            log::warn!("connection: unparseable message: {}", e);
        }
    }
}

/// Liveness probe: dead-air detection plus an RTT measurement ping.
async fn health_loop(shared: Arc<Shared>, generation: u64) {
    let mut ticker = tokio::time::interval(shared.config.health_check_interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if shared.current().1 != generation {
            return;
        }
        let idle = shared
            .last_message_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        if idle > shared.config.stale_after {
            handle_transport_failure(&shared, generation, "no traffic within stale window");
            return;
        }
        *shared.ping_sent_at.lock().unwrap() = Some(Instant::now());
        let tx = shared.outbound.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.try_send(Message::Ping(Vec::new()));
        }
    }
}

/// Route a transport failure into backoff, or into the terminal `Error`
/// state once retries are exhausted.
///
/// Generation-guarded: if a newer transition already superseded `generation`
/// (e.g. an explicit disconnect raced the failure), this does nothing.
fn handle_transport_failure(shared: &Arc<Shared>, generation: u64, reason: &str) {
    shared.errors.fetch_add(1, Ordering::SeqCst);
    *shared.connected_at.lock().unwrap() = None;

    if !shared.auto_reconnect.load(Ordering::SeqCst) {
        if shared
            .transition_if(generation, ConnectionState::Disconnected, Some(reason.to_string()))
            .is_some()
        {
            *shared.outbound.lock().unwrap() = None;
            log::info!("connection: closed ({})", reason);
        }
        return;
    }

    let attempt = shared.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt >= shared.config.max_retry_attempts {
        shared.auto_reconnect.store(false, Ordering::SeqCst);
        if shared
            .transition_if(
                generation,
                ConnectionState::Error,
                Some(format!("retries exhausted: {}", reason)),
            )
            .is_some()
        {
            *shared.outbound.lock().unwrap() = None;
            log::error!(
                "connection: giving up after {} failures ({})",
                shared.config.max_retry_attempts,
                reason
            );
        }
        return;
    }

    let delay = backoff_delay(attempt, &shared.config);
    let Some(backoff_generation) =
        shared.transition_if(generation, ConnectionState::Reconnecting, Some(reason.to_string()))
    else {
        return;
    };
    *shared.outbound.lock().unwrap() = None;
    log::warn!(
        "connection: {} - retrying in {:?} (attempt {}/{})",
        reason,
        delay,
        attempt,
        shared.config.max_retry_attempts
    );

    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // A disconnect or forced reconnect supersedes this timer; the
        // generation check makes a stale wake-up harmless.
        if let Some(generation) =
            shared.transition_if(backoff_generation, ConnectionState::Reconnecting, None)
        {
            launch_attempt(shared, generation);
        }
    });
}
