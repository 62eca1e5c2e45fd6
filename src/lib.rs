//! Real-time audio-to-text streaming core.
//!
//! This crate is the streaming heart of a desktop dictation app: it consumes
//! a continuous feed of PCM samples, recycles fixed-capacity buffers to keep
//! the steady state allocation-free, ships audio over a persistent WebSocket
//! to a transcription service, and turns the returned transcript fragments
//! into ordered, quality-scored batches.
//!
//! # Architecture
//!
//! ```text
//! Capture (channel) ──▶ AudioIngest ──▶ AudioBufferPool (acquire/release)
//!                           │
//!                           ▼ binary PCM frames
//!                    ConnectionManager ◀──▶ transcription service
//!                           │ TranscriptFragment
//!                           ▼
//!                    BatchProcessor ──▶ TranscriptBatch / ProcessorEvent
//! ```
//!
//! # Failure model
//!
//! - Transient transport failures reconnect with exponential backoff and
//!   jitter; callers observe them only through the connection status watch.
//! - Malformed service messages are counted and skipped; the connection
//!   stays up.
//! - Pool exhaustion surfaces as `None` from `acquire` - the frame is
//!   dropped, audio is lossy-tolerant.
//! - Exhausted retries are terminal: the connection parks in `Error` until
//!   `force_reconnect` or a fresh `connect`.

mod auth;
mod batch;
mod connection;
mod ingest;
mod pipeline;
mod pool;
mod protocol;

pub use auth::{EnvTokenProvider, StaticTokenProvider, TokenError, TokenProvider};
pub use batch::{
    BatchConfig, BatchProcessor, ProcessorEvent, ProcessorHandle, ProcessorMetrics,
    QualityMetrics, TranscriptBatch, TuningAdvice,
};
pub use connection::{
    ConnectionConfig, ConnectionDiagnostics, ConnectionManager, ConnectionState, ConnectionStatus,
};
pub use ingest::{AudioIngest, IngestReport};
pub use pipeline::{PipelineConfig, StreamingPipeline};
pub use pool::{
    init_shared_pool, reset_shared_pool, shared_pool, AudioBufferPool, PoolConfig, PoolStats,
    PooledBuffer,
};
pub use protocol::{
    encode_pcm16_le, Alternative, ControlMessage, ResultChannel, ServerMessage, StreamConfig,
    TranscriptFragment, Word,
};

/// Errors surfaced by the streaming pipeline.
///
/// Only terminal conditions reach callers; transient transport failures are
/// retried internally and reported through the connection status watch.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// No authentication token available from the credential store
    MissingToken,
    /// Failed to establish the WebSocket connection
    ConnectFailed(String),
    /// The service rejected the authentication token
    AuthFailed(String),
    /// The endpoint URL or handshake request could not be built
    Protocol(String),
    /// The pipeline is already running (or has already run; instances are
    /// single-session)
    AlreadyRunning,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::MissingToken => {
                write!(f, "no transcription token available from credential store")
            }
            StreamError::ConnectFailed(e) => {
                write!(f, "failed to connect to transcription service: {}", e)
            }
            StreamError::AuthFailed(e) => write!(f, "authentication failed: {}", e),
            StreamError::Protocol(e) => write!(f, "websocket protocol error: {}", e),
            StreamError::AlreadyRunning => write!(f, "streaming pipeline is already running"),
        }
    }
}

impl std::error::Error for StreamError {}
