//! Event-driven transcript batching.
//!
//! Fragments arrive from the connection as an irregular stream: dense
//! bursts while the service is decoding speech, silence in between. The
//! processor groups them with a debounce-then-chunk policy instead of
//! fixed-interval polling: fragments arriving within a quiet window belong
//! to the same burst, and a burst is capped at a fixed chunk size so one
//! long monologue cannot delay delivery indefinitely.
//!
//! Three background tasks run until cancelled:
//! - the drain loop (debounce, chunk, normalize, emit),
//! - the tuning loop (periodic throughput-vs-target advisory),
//! - the quality loop (per-batch composite-score alerting).
//!
//! All mutable metrics are written by the drain loop alone; the other tasks
//! and snapshot readers only observe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::TranscriptFragment;

/// Batching and quality tunables.
///
/// The weights and thresholds are operating heuristics; hosts tune them to
/// their capture cadence rather than treating them as fixed truths.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Quiet window that closes a burst
    pub debounce_window: Duration,
    /// Fragments per batch; a burst reaching this emits immediately
    pub max_batch_size: usize,
    /// Intake channel depth (fragment pushes suspend when full)
    pub channel_capacity: usize,
    /// Outbound batch queue depth
    pub batch_queue: usize,
    /// Outbound event queue depth
    pub event_queue: usize,
    /// Throughput target, fragments per second
    pub target_throughput: f64,
    /// Cadence of the tuning loop
    pub tuning_interval: Duration,
    /// Throughput below `target * low_ratio` advises smaller batches
    pub throughput_low_ratio: f64,
    /// Throughput above `target * high_ratio` advises larger batches
    pub throughput_high_ratio: f64,
    /// Composite score below this raises a quality alert
    pub quality_alert_threshold: f64,
    /// Fragments below this confidence count against reliability
    pub low_confidence_threshold: f64,
    /// Composite score weights
    pub confidence_weight: f64,
    pub throughput_weight: f64,
    pub reliability_weight: f64,
    /// Batches kept in the rolling latency window
    pub latency_window: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(50),
            max_batch_size: 5,
            channel_capacity: 256,
            batch_queue: 32,
            event_queue: 32,
            target_throughput: 100.0,
            tuning_interval: Duration::from_secs(5),
            throughput_low_ratio: 0.5,
            throughput_high_ratio: 1.5,
            quality_alert_threshold: 0.7,
            low_confidence_threshold: 0.6,
            confidence_weight: 0.4,
            throughput_weight: 0.3,
            reliability_weight: 0.3,
            latency_window: 50,
        }
    }
}

/// An ordered group of fragments from one batching window.
#[derive(Debug, Clone)]
pub struct TranscriptBatch {
    /// Fragments in arrival order
    pub fragments: Vec<TranscriptFragment>,
    /// Fragment texts joined in arrival order
    pub text: String,
    pub mean_confidence: f64,
    pub processing_time: Duration,
}

impl TranscriptBatch {
    pub fn size(&self) -> usize {
        self.fragments.len()
    }
}

/// Running quality aggregate, blended O(1) per batch with
/// `new = (old + sample) / 2`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    pub total_fragments: u64,
    pub mean_confidence: f64,
    pub low_confidence_count: u64,
    pub mean_processing_ms: f64,
    /// Fragments per second
    pub throughput: f64,
}

impl QualityMetrics {
    /// Weighted composite: confidence, throughput-vs-target, reliability.
    pub fn quality_score(&self, config: &BatchConfig) -> f64 {
        let throughput_factor = if config.target_throughput > 0.0 {
            (self.throughput / config.target_throughput).min(1.0)
        } else {
            1.0
        };
        let reliability = if self.total_fragments == 0 {
            1.0
        } else {
            1.0 - self.low_confidence_count as f64 / self.total_fragments as f64
        };
        config.confidence_weight * self.mean_confidence
            + config.throughput_weight * throughput_factor
            + config.reliability_weight * reliability
    }
}

/// Advisory signals from the tuning and quality loops. Never enforced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ProcessorEvent {
    /// Composite quality score dropped below the alert threshold
    QualityAlert { score: f64 },
    /// Throughput crossed a tuning threshold
    TuningAdvice {
        advice: TuningAdvice,
        throughput: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TuningAdvice {
    ReduceBatchSize,
    IncreaseBatchSize,
}

/// Point-in-time processor state.
#[derive(Debug, Clone)]
pub struct ProcessorMetrics {
    /// A batch is in flight or fragments are queued
    pub is_processing: bool,
    pub queued_fragments: usize,
    /// Blended fragments-per-second rate
    pub processing_rate: f64,
    /// Mean batch processing time over the rolling window, milliseconds
    pub rolling_latency_ms: f64,
    pub batches_emitted: u64,
    pub quality: QualityMetrics,
    pub quality_score: f64,
}

struct ProcessorShared {
    config: BatchConfig,
    next_seq: AtomicU64,
    queued: AtomicUsize,
    processing: AtomicBool,
    batches_emitted: AtomicU64,
    quality: Mutex<QualityMetrics>,
    latencies: Mutex<VecDeque<Duration>>,
    last_batch_at: Mutex<Option<Instant>>,
}

/// Intake + snapshot handle. Cheap to clone.
#[derive(Clone)]
pub struct ProcessorHandle {
    tx: mpsc::Sender<(u64, TranscriptFragment)>,
    shared: Arc<ProcessorShared>,
}

impl ProcessorHandle {
    /// Queue a fragment for batching.
    ///
    /// Suspends while the intake channel is full; that backpressure is what
    /// keeps the connection reader from outrunning the batching stage.
    pub async fn push(&self, fragment: TranscriptFragment) {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send((seq, fragment)).await.is_err() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            log::debug!("processor: drain loop gone, fragment dropped");
        }
    }

    /// Snapshot of processing state and quality metrics.
    pub fn metrics(&self) -> ProcessorMetrics {
        let shared = &self.shared;
        let quality = shared.quality.lock().unwrap().clone();
        let latencies = shared.latencies.lock().unwrap();
        let rolling_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies
                .iter()
                .map(|d| d.as_secs_f64() * 1000.0)
                .sum::<f64>()
                / latencies.len() as f64
        };
        let quality_score = quality.quality_score(&shared.config);
        ProcessorMetrics {
            is_processing: shared.processing.load(Ordering::SeqCst),
            queued_fragments: shared.queued.load(Ordering::SeqCst),
            processing_rate: quality.throughput,
            rolling_latency_ms,
            batches_emitted: shared.batches_emitted.load(Ordering::SeqCst),
            quality,
            quality_score,
        }
    }

    /// Reset quality aggregates. Operator action, never automatic.
    pub fn reset_metrics(&self) {
        *self.shared.quality.lock().unwrap() = QualityMetrics::default();
        self.shared.latencies.lock().unwrap().clear();
        *self.shared.last_batch_at.lock().unwrap() = None;
    }
}

pub struct BatchProcessor;

impl BatchProcessor {
    /// Spawn the three processing tasks.
    ///
    /// Returns the intake/snapshot handle plus the downstream batch and
    /// event receivers. All tasks exit cooperatively when `cancel` fires or
    /// when every handle clone is dropped.
    pub fn spawn(
        config: BatchConfig,
        cancel: CancellationToken,
    ) -> (
        ProcessorHandle,
        mpsc::Receiver<TranscriptBatch>,
        mpsc::Receiver<ProcessorEvent>,
    ) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let (batch_tx, batch_rx) = mpsc::channel(config.batch_queue);
        let (event_tx, event_rx) = mpsc::channel(config.event_queue);
        let (completion_tx, completion_rx) = mpsc::channel(config.batch_queue);

        let shared = Arc::new(ProcessorShared {
            config,
            next_seq: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            processing: AtomicBool::new(false),
            batches_emitted: AtomicU64::new(0),
            quality: Mutex::new(QualityMetrics::default()),
            latencies: Mutex::new(VecDeque::new()),
            last_batch_at: Mutex::new(None),
        });

        tokio::spawn(drain_loop(
            shared.clone(),
            rx,
            batch_tx,
            completion_tx,
            cancel.clone(),
        ));
        tokio::spawn(tuning_loop(shared.clone(), event_tx.clone(), cancel.clone()));
        tokio::spawn(quality_loop(
            shared.clone(),
            completion_rx,
            event_tx,
            cancel,
        ));

        (ProcessorHandle { tx, shared }, batch_rx, event_rx)
    }
}

/// Debounce-then-chunk drain: the first fragment opens a burst, a quiet
/// window or the chunk cap closes it.
async fn drain_loop(
    shared: Arc<ProcessorShared>,
    mut rx: mpsc::Receiver<(u64, TranscriptFragment)>,
    batch_tx: mpsc::Sender<TranscriptBatch>,
    completion_tx: mpsc::Sender<f64>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        shared.queued.fetch_sub(1, Ordering::SeqCst);
        shared.processing.store(true, Ordering::SeqCst);

        let mut burst = vec![first];
        let mut intake_closed = false;
        while burst.len() < shared.config.max_batch_size {
            match tokio::time::timeout(shared.config.debounce_window, rx.recv()).await {
                Ok(Some(item)) => {
                    shared.queued.fetch_sub(1, Ordering::SeqCst);
                    burst.push(item);
                }
                Ok(None) => {
                    intake_closed = true;
                    break;
                }
                // Quiet window elapsed - the burst is complete.
                Err(_) => break,
            }
        }

        let batch = process_burst(burst).await;
        let score = record_batch(&shared, &batch);
        shared.batches_emitted.fetch_add(1, Ordering::SeqCst);

        if batch_tx.send(batch).await.is_err() {
            log::debug!("processor: batch consumer gone");
        }
        let _ = completion_tx.send(score).await;

        shared.processing.store(
            shared.queued.load(Ordering::SeqCst) > 0,
            Ordering::SeqCst,
        );
        if intake_closed {
            break;
        }
    }
    shared.processing.store(false, Ordering::SeqCst);
    log::debug!("processor: drain loop exiting");
}

/// Normalize fragments concurrently, then reassemble in arrival order.
///
/// Processing may finish out of order; the sequence stamp restores the
/// logical order before the aggregate text is built.
async fn process_burst(burst: Vec<(u64, TranscriptFragment)>) -> TranscriptBatch {
    let started = Instant::now();

    let tasks: Vec<_> = burst
        .into_iter()
        .map(|(seq, mut fragment)| {
            tokio::spawn(async move {
                fragment.text = normalize_text(&fragment.text);
                (seq, fragment)
            })
        })
        .collect();

    let mut done: Vec<(u64, TranscriptFragment)> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(|r| r.ok())
        .collect();
    done.sort_by_key(|(seq, _)| *seq);

    let fragments: Vec<TranscriptFragment> = done.into_iter().map(|(_, f)| f).collect();
    let text = fragments
        .iter()
        .map(|f| f.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let mean_confidence = if fragments.is_empty() {
        0.0
    } else {
        fragments.iter().map(|f| f.confidence).sum::<f64>() / fragments.len() as f64
    };

    TranscriptBatch {
        fragments,
        text,
        mean_confidence,
        processing_time: started.elapsed(),
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fold a finished batch into the running metrics. Drain-loop only.
fn record_batch(shared: &ProcessorShared, batch: &TranscriptBatch) -> f64 {
    let mut quality = shared.quality.lock().unwrap();
    let seeded = quality.total_fragments > 0;
    let n = batch.size() as u64;

    quality.total_fragments += n;
    quality.mean_confidence = blend(quality.mean_confidence, batch.mean_confidence, seeded);
    quality.low_confidence_count += batch
        .fragments
        .iter()
        .filter(|f| f.confidence < shared.config.low_confidence_threshold)
        .count() as u64;
    quality.mean_processing_ms = blend(
        quality.mean_processing_ms,
        batch.processing_time.as_secs_f64() * 1000.0,
        seeded,
    );

    let mut last = shared.last_batch_at.lock().unwrap();
    let window = match *last {
        Some(t) => t.elapsed(),
        None => batch.processing_time,
    };
    let instantaneous = n as f64 / window.as_secs_f64().max(1e-3);
    *last = Some(Instant::now());
    drop(last);
    quality.throughput = blend(quality.throughput, instantaneous, seeded);

    let score = quality.quality_score(&shared.config);
    drop(quality);

    let mut latencies = shared.latencies.lock().unwrap();
    latencies.push_back(batch.processing_time);
    while latencies.len() > shared.config.latency_window {
        latencies.pop_front();
    }

    score
}

/// O(1) running blend; the first sample seeds the aggregate directly.
fn blend(old: f64, sample: f64, seeded: bool) -> f64 {
    if seeded {
        (old + sample) / 2.0
    } else {
        sample
    }
}

/// Periodic throughput-vs-target comparison. Advisory only.
async fn tuning_loop(
    shared: Arc<ProcessorShared>,
    event_tx: mpsc::Sender<ProcessorEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(shared.config.tuning_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let quality = shared.quality.lock().unwrap().clone();
        if quality.total_fragments == 0 {
            continue;
        }
        let target = shared.config.target_throughput;
        let advice = if quality.throughput < target * shared.config.throughput_low_ratio {
            TuningAdvice::ReduceBatchSize
        } else if quality.throughput > target * shared.config.throughput_high_ratio {
            TuningAdvice::IncreaseBatchSize
        } else {
            continue;
        };
        log::debug!(
            "processor: throughput {:.1}/s vs target {:.1}/s, advising {:?}",
            quality.throughput,
            target,
            advice
        );
        let _ = event_tx.try_send(ProcessorEvent::TuningAdvice {
            advice,
            throughput: quality.throughput,
        });
    }
}

/// Reacts to each completed batch; alerts when the composite score sags.
async fn quality_loop(
    shared: Arc<ProcessorShared>,
    mut completion_rx: mpsc::Receiver<f64>,
    event_tx: mpsc::Sender<ProcessorEvent>,
    cancel: CancellationToken,
) {
    loop {
        let score = tokio::select! {
            _ = cancel.cancelled() => return,
            score = completion_rx.recv() => match score {
                Some(score) => score,
                None => return,
            },
        };
        if score < shared.config.quality_alert_threshold {
            log::warn!(
                "processor: quality score {:.2} below threshold {:.2}",
                score,
                shared.config.quality_alert_threshold
            );
            let _ = event_tx.try_send(ProcessorEvent::QualityAlert { score });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(text: &str, confidence: f64) -> TranscriptFragment {
        TranscriptFragment {
            text: text.to_string(),
            is_final: false,
            confidence,
            start: None,
        }
    }

    fn test_config() -> BatchConfig {
        BatchConfig {
            debounce_window: Duration::from_millis(50),
            max_batch_size: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_blend_seeds_then_averages() {
        assert_eq!(blend(0.0, 0.8, false), 0.8);
        assert_eq!(blend(0.8, 0.4, true), 0.6000000000000001);
        assert_eq!(blend(0.6, 0.6, true), 0.6);
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  hello   world "), "hello world");
        assert_eq!(normalize_text("already clean"), "already clean");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn test_quality_score_weighting() {
        let config = test_config();
        let metrics = QualityMetrics {
            total_fragments: 10,
            mean_confidence: 1.0,
            low_confidence_count: 0,
            mean_processing_ms: 1.0,
            throughput: 100.0,
        };
        // Perfect on every axis: 0.4 + 0.3 + 0.3
        assert!((metrics.quality_score(&config) - 1.0).abs() < 1e-9);

        let metrics = QualityMetrics {
            total_fragments: 10,
            mean_confidence: 0.5,
            low_confidence_count: 5,
            mean_processing_ms: 1.0,
            throughput: 50.0,
        };
        // 0.4*0.5 + 0.3*0.5 + 0.3*0.5
        assert!((metrics.quality_score(&config) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_quality_score_empty_metrics() {
        let config = test_config();
        let metrics = QualityMetrics::default();
        // No fragments: reliability is perfect, everything else zero.
        assert!((metrics.quality_score(&config) - 0.3).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_burst_batched_after_quiet_window() {
        let cancel = CancellationToken::new();
        let (handle, mut batch_rx, _event_rx) =
            BatchProcessor::spawn(test_config(), cancel.clone());

        handle.push(fragment("alpha", 0.9)).await;
        handle.push(fragment("beta", 0.8)).await;
        handle.push(fragment("gamma", 0.7)).await;

        let batch = batch_rx.recv().await.expect("batch");
        assert_eq!(batch.size(), 3);
        assert_eq!(batch.text, "alpha beta gamma");
        assert!((batch.mean_confidence - 0.8).abs() < 1e-9);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_capped_at_chunk_size() {
        // Six fragments inside one quiet window: the cap closes the first
        // batch at five, the sixth opens a new burst.
        let cancel = CancellationToken::new();
        let (handle, mut batch_rx, _event_rx) =
            BatchProcessor::spawn(test_config(), cancel.clone());

        for i in 0..6 {
            handle.push(fragment(&format!("f{}", i), 0.9)).await;
        }

        let first = batch_rx.recv().await.expect("first batch");
        assert_eq!(first.size(), 5);
        assert_eq!(first.text, "f0 f1 f2 f3 f4");

        let second = batch_rx.recv().await.expect("second batch");
        assert_eq!(second.size(), 1);
        assert_eq!(second.text, "f5");

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_preserves_arrival_order() {
        let cancel = CancellationToken::new();
        let (handle, mut batch_rx, _event_rx) =
            BatchProcessor::spawn(test_config(), cancel.clone());

        // Arrival order t1 < t2 < t3; concurrent normalization must not
        // reorder the aggregate.
        handle.push(fragment("  first ", 0.9)).await;
        handle.push(fragment("second", 0.9)).await;
        handle.push(fragment(" third  chunk", 0.9)).await;

        let batch = batch_rx.recv().await.expect("batch");
        assert_eq!(batch.text, "first second third chunk");
        assert_eq!(batch.fragments[0].text, "first");
        assert_eq!(batch.fragments[2].text, "third chunk");

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_after_batches() {
        let cancel = CancellationToken::new();
        let (handle, mut batch_rx, _event_rx) =
            BatchProcessor::spawn(test_config(), cancel.clone());

        handle.push(fragment("one", 1.0)).await;
        handle.push(fragment("two", 0.5)).await;
        let _ = batch_rx.recv().await.expect("batch");

        let metrics = handle.metrics();
        assert_eq!(metrics.batches_emitted, 1);
        assert_eq!(metrics.queued_fragments, 0);
        assert_eq!(metrics.quality.total_fragments, 2);
        assert!((metrics.quality.mean_confidence - 0.75).abs() < 1e-9);
        // One fragment under the 0.6 confidence floor
        assert_eq!(metrics.quality.low_confidence_count, 1);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_alert_on_low_confidence() {
        let config = BatchConfig {
            // Force the alert: no realistic batch scores this high.
            quality_alert_threshold: 0.99,
            ..test_config()
        };
        let cancel = CancellationToken::new();
        let (handle, mut batch_rx, mut event_rx) = BatchProcessor::spawn(config, cancel.clone());

        handle.push(fragment("mumble", 0.1)).await;
        let _ = batch_rx.recv().await.expect("batch");

        match event_rx.recv().await.expect("event") {
            ProcessorEvent::QualityAlert { score } => assert!(score < 0.99),
            other => panic!("expected QualityAlert, got {:?}", other),
        }

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tuning_advice_on_low_throughput() {
        let cancel = CancellationToken::new();
        let (handle, _batch_rx, mut event_rx) =
            BatchProcessor::spawn(test_config(), cancel.clone());

        // Seed metrics directly: throughput far below the 100/s target.
        {
            let mut quality = handle.shared.quality.lock().unwrap();
            quality.total_fragments = 20;
            quality.throughput = 10.0;
        }

        match event_rx.recv().await.expect("event") {
            ProcessorEvent::TuningAdvice { advice, throughput } => {
                assert_eq!(advice, TuningAdvice::ReduceBatchSize);
                assert!((throughput - 10.0).abs() < 1e-9);
            }
            other => panic!("expected TuningAdvice, got {:?}", other),
        }

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_drain() {
        let cancel = CancellationToken::new();
        let (handle, mut batch_rx, _event_rx) =
            BatchProcessor::spawn(test_config(), cancel.clone());

        cancel.cancel();

        // With the drain loop gone the batch channel closes.
        assert!(batch_rx.recv().await.is_none());
        assert!(!handle.metrics().is_processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_metrics() {
        let cancel = CancellationToken::new();
        let (handle, mut batch_rx, _event_rx) =
            BatchProcessor::spawn(test_config(), cancel.clone());

        handle.push(fragment("word", 0.9)).await;
        let _ = batch_rx.recv().await.expect("batch");
        assert_eq!(handle.metrics().quality.total_fragments, 1);

        handle.reset_metrics();
        let metrics = handle.metrics();
        assert_eq!(metrics.quality.total_fragments, 0);
        assert_eq!(metrics.rolling_latency_ms, 0.0);

        cancel.cancel();
    }
}
