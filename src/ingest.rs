//! Audio ingest: capture channel to the wire.
//!
//! The platform capture callback lives on the far side of an `mpsc`
//! channel; this loop pulls sample slabs off it, packs them into pooled
//! buffers, and ships full buffers through the connection as binary PCM
//! frames. Buffers go back to the pool the moment their payload has been
//! encoded, so steady-state streaming allocates nothing.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionManager;
use crate::pool::{AudioBufferPool, PooledBuffer};
use crate::protocol::encode_pcm16_le;

/// Counters returned when the ingest loop finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Frames handed to the connection (including the flushed tail)
    pub frames_sent: u64,
    /// Frames lost to pool exhaustion
    pub frames_dropped: u64,
    pub samples_consumed: u64,
}

/// Streams capture samples through the pool and out the connection.
pub struct AudioIngest {
    rx: mpsc::Receiver<Vec<i16>>,
    pool: Arc<Mutex<AudioBufferPool>>,
    connection: ConnectionManager,
    cancel: CancellationToken,
    current: Option<PooledBuffer>,
    frames_sent: u64,
    frames_dropped: u64,
    samples_consumed: u64,
}

impl AudioIngest {
    pub fn new(
        rx: mpsc::Receiver<Vec<i16>>,
        pool: Arc<Mutex<AudioBufferPool>>,
        connection: ConnectionManager,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            pool,
            connection,
            cancel,
            current: None,
            frames_sent: 0,
            frames_dropped: 0,
            samples_consumed: 0,
        }
    }

    /// Run until the capture channel closes or the pipeline is cancelled.
    ///
    /// Flushes the partial tail buffer on the way out; the graceful close
    /// message itself is the connection manager's job.
    pub async fn run(mut self) -> IngestReport {
        log::info!("ingest: starting");
        loop {
            let samples = tokio::select! {
                _ = self.cancel.cancelled() => break,
                slab = self.rx.recv() => match slab {
                    Some(slab) => slab,
                    None => break,
                },
            };
            self.process_samples(&samples);
        }

        self.flush();
        log::info!(
            "ingest: finished, {} frames sent, {} dropped",
            self.frames_sent,
            self.frames_dropped
        );
        IngestReport {
            frames_sent: self.frames_sent,
            frames_dropped: self.frames_dropped,
            samples_consumed: self.samples_consumed,
        }
    }

    fn process_samples(&mut self, mut samples: &[i16]) {
        while !samples.is_empty() {
            if self.current.is_none() {
                match self.pool.lock().unwrap().acquire() {
                    Some(buffer) => self.current = Some(buffer),
                    None => {
                        // Allocation failed; this slab is lost, the stream
                        // carries on.
                        self.frames_dropped += 1;
                        log::warn!(
                            "ingest: no buffer available, dropping {} samples",
                            samples.len()
                        );
                        return;
                    }
                }
            }
            let Some(buffer) = self.current.as_mut() else {
                return;
            };

            let take = buffer.remaining().min(samples.len());
            buffer.samples.extend_from_slice(&samples[..take]);
            self.samples_consumed += take as u64;
            samples = &samples[take..];

            if buffer.is_full() {
                self.send_current();
            }
        }
    }

    /// Encode and send the buffer being filled, then recycle it.
    fn send_current(&mut self) {
        if let Some(buffer) = self.current.take() {
            if !buffer.samples.is_empty() {
                self.connection.send(encode_pcm16_le(&buffer.samples));
                self.frames_sent += 1;
                if self.frames_sent % 50 == 0 {
                    log::debug!("ingest: {} frames sent", self.frames_sent);
                }
            }
            self.pool.lock().unwrap().release(buffer);
        }
    }

    fn flush(&mut self) {
        self.send_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionManager};
    use crate::pool::PoolConfig;

    fn test_pool(buffer_capacity: usize) -> Arc<Mutex<AudioBufferPool>> {
        let pool = AudioBufferPool::new(PoolConfig {
            max_buffers: 4,
            buffer_capacity,
            ..Default::default()
        });
        Arc::new(Mutex::new(pool))
    }

    fn test_connection() -> ConnectionManager {
        // Never connected: every send is a silent drop, which is exactly
        // the path these tests exercise.
        let (tx, _rx) = mpsc::channel(8);
        ConnectionManager::new(ConnectionConfig::default(), tx)
    }

    #[tokio::test]
    async fn test_full_buffers_sent_and_tail_flushed() {
        let pool = test_pool(4);
        let (tx, rx) = mpsc::channel(8);
        let ingest = AudioIngest::new(
            rx,
            pool.clone(),
            test_connection(),
            CancellationToken::new(),
        );

        tx.send(vec![1i16; 6]).await.unwrap();
        tx.send(vec![2i16; 4]).await.unwrap();
        drop(tx);

        let report = ingest.run().await;
        // 10 samples at 4 per buffer: two full frames plus a 2-sample tail.
        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.frames_dropped, 0);
        assert_eq!(report.samples_consumed, 10);

        // Every buffer made it back to the pool.
        let stats = pool.lock().unwrap().statistics();
        assert_eq!(stats.checked_out, 0);
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_tail() {
        let pool = test_pool(5);
        let (tx, rx) = mpsc::channel(8);
        let ingest = AudioIngest::new(
            rx,
            pool.clone(),
            test_connection(),
            CancellationToken::new(),
        );

        tx.send(vec![0i16; 10]).await.unwrap();
        drop(tx);

        let report = ingest.run().await;
        assert_eq!(report.frames_sent, 2);
        assert_eq!(report.samples_consumed, 10);
    }

    #[tokio::test]
    async fn test_cancellation_flushes_partial() {
        let pool = test_pool(100);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let ingest = AudioIngest::new(rx, pool.clone(), test_connection(), cancel.clone());

        tx.send(vec![7i16; 30]).await.unwrap();
        let task = tokio::spawn(ingest.run());

        // Give the loop a turn to pick up the slab, then cancel.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let report = task.await.unwrap();
        assert_eq!(report.samples_consumed, 30);
        assert_eq!(report.frames_sent, 1);
        assert_eq!(pool.lock().unwrap().statistics().checked_out, 0);
    }
}
