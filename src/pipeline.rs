//! End-to-end pipeline assembly.
//!
//! Wires the pool, connection manager, batch processor, and ingest loop
//! together behind one lifecycle: `start` pulls a token from the credential
//! seam and begins streaming, `stop` cancels every background task
//! cooperatively and closes the connection gracefully. A pipeline instance
//! runs once; build a new one for a new session.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{TokenError, TokenProvider};
use crate::batch::{
    BatchConfig, BatchProcessor, ProcessorEvent, ProcessorHandle, ProcessorMetrics,
    TranscriptBatch,
};
use crate::connection::{
    ConnectionConfig, ConnectionDiagnostics, ConnectionManager, ConnectionStatus,
};
use crate::ingest::{AudioIngest, IngestReport};
use crate::pool::{AudioBufferPool, PoolConfig, PoolStats};
use crate::StreamError;

/// Top-level configuration: one section per component.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub pool: PoolConfig,
    pub connection: ConnectionConfig,
    pub batch: BatchConfig,
}

/// The assembled streaming pipeline.
pub struct StreamingPipeline {
    pool: Arc<Mutex<AudioBufferPool>>,
    connection: ConnectionManager,
    processor: ProcessorHandle,
    batches: Option<mpsc::Receiver<TranscriptBatch>>,
    events: Option<mpsc::Receiver<ProcessorEvent>>,
    cancel: CancellationToken,
    ingest: Option<JoinHandle<IngestReport>>,
    stopped: bool,
}

impl StreamingPipeline {
    /// Build and wire the components. Must be called within a Tokio
    /// runtime; the processor tasks start immediately and idle until
    /// fragments arrive.
    pub fn new(config: PipelineConfig) -> Self {
        let cancel = CancellationToken::new();

        let pool = Arc::new(Mutex::new(AudioBufferPool::new(config.pool)));

        let (fragment_tx, mut fragment_rx) = mpsc::channel(config.batch.channel_capacity);
        let connection = ConnectionManager::new(config.connection, fragment_tx);

        let (processor, batches, events) =
            BatchProcessor::spawn(config.batch, cancel.child_token());

        // Bridge: connection reader -> processor intake. Kept as a channel
        // hop so each component stays single-writer over its own state.
        let intake = processor.clone();
        let bridge_cancel = cancel.child_token();
        tokio::spawn(async move {
            loop {
                let fragment = tokio::select! {
                    _ = bridge_cancel.cancelled() => break,
                    fragment = fragment_rx.recv() => match fragment {
                        Some(fragment) => fragment,
                        None => break,
                    },
                };
                intake.push(fragment).await;
            }
        });

        Self {
            pool,
            connection,
            processor,
            batches: Some(batches),
            events: Some(events),
            cancel,
            ingest: None,
            stopped: false,
        }
    }

    /// Connect and begin streaming from the given capture channel.
    ///
    /// The token comes from the credential seam; a missing key is the only
    /// startup error a caller has to handle. Connection failures after this
    /// point are retried internally and observable through [`Self::status`].
    pub fn start(
        &mut self,
        tokens: &dyn TokenProvider,
        samples: mpsc::Receiver<Vec<i16>>,
    ) -> Result<(), StreamError> {
        if self.ingest.is_some() || self.stopped {
            return Err(StreamError::AlreadyRunning);
        }

        let token = tokens.token().map_err(|e| match e {
            TokenError::KeyNotFound => StreamError::MissingToken,
            TokenError::Unavailable(msg) => StreamError::AuthFailed(msg),
        })?;

        self.connection.connect(&token, true);

        let ingest = AudioIngest::new(
            samples,
            self.pool.clone(),
            self.connection.clone(),
            self.cancel.child_token(),
        );
        self.ingest = Some(tokio::spawn(ingest.run()));
        log::info!("pipeline: started");
        Ok(())
    }

    /// Cancel every background task cooperatively and close the connection
    /// gracefully. Returns the ingest counters when a session ran.
    pub async fn stop(&mut self) -> Option<IngestReport> {
        self.stopped = true;
        self.cancel.cancel();
        self.connection.disconnect().await;

        let report = match self.ingest.take() {
            Some(handle) => handle.await.ok(),
            None => None,
        };
        log::info!("pipeline: stopped");
        report
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Read-only connection status, continuously updated.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.status()
    }

    pub fn diagnostics(&self) -> ConnectionDiagnostics {
        self.connection.diagnostics()
    }

    pub fn pool_statistics(&self) -> PoolStats {
        self.pool.lock().unwrap().statistics()
    }

    /// Shared pool handle, e.g. for a periodic `resize_to_fit` cadence.
    pub fn pool(&self) -> Arc<Mutex<AudioBufferPool>> {
        self.pool.clone()
    }

    pub fn processing_metrics(&self) -> ProcessorMetrics {
        self.processor.metrics()
    }

    /// Downstream batch stream. Takeable once; consumers that want a
    /// callback shape can wrap the receiver.
    pub fn take_batches(&mut self) -> Option<mpsc::Receiver<TranscriptBatch>> {
        self.batches.take()
    }

    /// Advisory event stream (quality alerts, tuning advice). Takeable once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ProcessorEvent>> {
        self.events.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::protocol::StreamConfig;
    use std::time::Duration;

    fn offline_config() -> PipelineConfig {
        PipelineConfig {
            connection: ConnectionConfig {
                stream: StreamConfig {
                    // Nothing listens here; connect attempts fail fast.
                    endpoint: "ws://127.0.0.1:9".to_string(),
                    ..Default::default()
                },
                base_retry_delay: Duration::from_millis(10),
                max_retry_delay: Duration::from_millis(50),
                max_retry_attempts: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_without_token_fails() {
        let mut pipeline = StreamingPipeline::new(offline_config());
        let (_tx, rx) = mpsc::channel(4);
        let err = pipeline
            .start(&StaticTokenProvider::new(""), rx)
            .unwrap_err();
        assert!(matches!(err, StreamError::MissingToken));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let mut pipeline = StreamingPipeline::new(offline_config());
        let (_tx1, rx1) = mpsc::channel(4);
        let (_tx2, rx2) = mpsc::channel(4);
        let tokens = StaticTokenProvider::new("tok_test");

        pipeline.start(&tokens, rx1).unwrap();
        let err = pipeline.start(&tokens, rx2).unwrap_err();
        assert!(matches!(err, StreamError::AlreadyRunning));

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_stop_returns_ingest_report() {
        let mut pipeline = StreamingPipeline::new(offline_config());
        let (tx, rx) = mpsc::channel(4);
        let tokens = StaticTokenProvider::new("tok_test");

        pipeline.start(&tokens, rx).unwrap();
        tx.send(vec![0i16; 100]).await.unwrap();
        drop(tx);

        // Let the ingest loop drain the closed channel before stopping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = pipeline.stop().await.expect("report");
        assert_eq!(report.samples_consumed, 100);
    }

    #[tokio::test]
    async fn test_start_after_stop_rejected() {
        let mut pipeline = StreamingPipeline::new(offline_config());
        pipeline.stop().await;

        let (_tx, rx) = mpsc::channel(4);
        let err = pipeline
            .start(&StaticTokenProvider::new("tok_test"), rx)
            .unwrap_err();
        assert!(matches!(err, StreamError::AlreadyRunning));
    }

    #[tokio::test]
    async fn test_receivers_takeable_once() {
        let mut pipeline = StreamingPipeline::new(offline_config());
        assert!(pipeline.take_batches().is_some());
        assert!(pipeline.take_batches().is_none());
        assert!(pipeline.take_events().is_some());
        assert!(pipeline.take_events().is_none());
    }

    #[tokio::test]
    async fn test_pool_statistics_reflect_config() {
        let mut config = offline_config();
        config.pool.max_buffers = 8;
        let pipeline = StreamingPipeline::new(config);

        pipeline.pool().lock().unwrap().prewarm(3);
        let stats = pipeline.pool_statistics();
        assert_eq!(stats.available, 3);
        assert_eq!(stats.checked_out, 0);
    }
}
