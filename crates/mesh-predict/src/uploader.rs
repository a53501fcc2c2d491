//! Background upload of buffered samples to the trainer

use crate::samples::UploadBuffer;
use mesh_core::{Error, Result, SamplesConfig, TrainerClient};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Uploader counters
#[derive(Debug, Default)]
pub struct UploaderStats {
    pub uploaded_samples: AtomicU64,
    pub uploaded_batches: AtomicU64,
    pub failed_attempts: AtomicU64,
    pub failed_flushes: AtomicU64,
}

/// Drains the upload buffer into the trainer in batches
pub struct SampleUploader {
    buffer: Arc<UploadBuffer>,
    trainer: Arc<dyn TrainerClient>,
    config: SamplesConfig,
    stats: Arc<UploaderStats>,
}

impl SampleUploader {
    pub fn new(buffer: Arc<UploadBuffer>, trainer: Arc<dyn TrainerClient>, config: SamplesConfig) -> Self {
        Self {
            buffer,
            trainer,
            config,
            stats: Arc::new(UploaderStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<UploaderStats> {
        Arc::clone(&self.stats)
    }

    /// Delay before retry `attempt` (0-based), doubling up to the configured cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay_ms;
        let delay = base.saturating_mul(1u64 << attempt.min(20));
        Duration::from_millis(delay.min(self.config.retry_max_delay_ms))
    }

    /// Upload the samples buffered when the flush starts; returns the number acknowledged
    ///
    /// Samples finalized during the flush wait for the next one, so a steady
    /// stream of completions cannot keep a flush running. A batch that still
    /// fails after the configured retries stays buffered and the error is
    /// returned.
    pub async fn flush_once(&self) -> Result<usize> {
        let batch_size = self.config.batch_size.max(1);
        let mut batches_left = self.buffer.len().div_ceil(batch_size);
        let mut total = 0;

        while batches_left > 0 {
            let Some(batch) = self.buffer.peek_batch(batch_size) else {
                break;
            };
            batches_left -= 1;
            let mut attempt = 0;
            loop {
                match self.trainer.ingest(&batch.samples).await {
                    Ok(ack) => {
                        let removed = self.buffer.acknowledge(batch.up_to_seq);
                        self.stats
                            .uploaded_samples
                            .fetch_add(removed as u64, Ordering::Relaxed);
                        self.stats.uploaded_batches.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            samples = batch.samples.len(),
                            accepted = ack.accepted,
                            "Uploaded sample batch"
                        );
                        total += removed;
                        break;
                    }
                    Err(e) => {
                        self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                        if attempt >= self.config.max_retries {
                            self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                samples = batch.samples.len(),
                                attempts = attempt + 1,
                                error = %e,
                                "Sample upload failed, keeping batch buffered"
                            );
                            return Err(Error::upload(format!(
                                "batch of {} samples failed after {} attempts: {}",
                                batch.samples.len(),
                                attempt + 1,
                                e
                            )));
                        }
                        let delay = self.backoff(attempt);
                        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying sample upload");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        }

        Ok(total)
    }

    /// Flush on every interval tick until shutdown is signalled, then flush once more
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.flush_interval());
            info!(
                interval_ms = self.config.flush_interval_ms,
                batch_size = self.config.batch_size,
                "Sample uploader started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // failures are already logged and the batch stays buffered
                        let _ = self.flush_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            if let Err(e) = self.flush_once().await {
                warn!(error = %e, "Final sample flush failed");
            }
            info!("Sample uploader stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTrainer;
    use chrono::Utc;
    use mesh_core::{CandidateId, LatencySample, LiveFeatures, RequestId};

    fn sample(id: &str) -> LatencySample {
        LatencySample {
            request_id: RequestId::new(id),
            candidate_id: CandidateId::new("pod-a"),
            observed_ttft_ms: Some(50.0),
            observed_tpot_ms: vec![10.0],
            features: LiveFeatures::default(),
            forecast: None,
            timestamp: Utc::now(),
        }
    }

    fn config(batch_size: usize, max_retries: u32) -> SamplesConfig {
        SamplesConfig {
            batch_size,
            max_retries,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 1_000,
            ..SamplesConfig::default()
        }
    }

    #[tokio::test]
    async fn test_flush_uploads_in_batches() {
        let buffer = Arc::new(UploadBuffer::new(100));
        for i in 0..5 {
            buffer.push(sample(&format!("r{i}")));
        }
        let trainer = Arc::new(MockTrainer::new());
        let uploader = SampleUploader::new(buffer.clone(), trainer.clone(), config(2, 0));

        assert_eq!(uploader.flush_once().await.unwrap(), 5);
        assert!(buffer.is_empty());
        assert_eq!(trainer.batch_sizes(), vec![2, 2, 1]);
        assert_eq!(uploader.stats().uploaded_batches.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_samples_buffered() {
        let buffer = Arc::new(UploadBuffer::new(100));
        buffer.push(sample("r1"));
        let trainer = Arc::new(MockTrainer::new());
        trainer.fail_next(10);
        let uploader = SampleUploader::new(buffer.clone(), trainer.clone(), config(10, 2));

        let err = uploader.flush_once().await.unwrap_err();
        assert!(matches!(err, Error::UploadFailure(_)));
        assert_eq!(buffer.len(), 1);
        assert_eq!(uploader.stats().failed_attempts.load(Ordering::Relaxed), 3);
        assert_eq!(uploader.stats().failed_flushes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let buffer = Arc::new(UploadBuffer::new(100));
        buffer.push(sample("r1"));
        let trainer = Arc::new(MockTrainer::new());
        trainer.fail_next(2);
        let uploader = SampleUploader::new(buffer.clone(), trainer.clone(), config(10, 3));

        assert_eq!(uploader.flush_once().await.unwrap(), 1);
        assert!(buffer.is_empty());
        assert_eq!(trainer.received().len(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let uploader = SampleUploader::new(
            Arc::new(UploadBuffer::new(1)),
            Arc::new(MockTrainer::new()),
            config(1, 3),
        );
        assert_eq!(uploader.backoff(0), Duration::from_millis(100));
        assert_eq!(uploader.backoff(1), Duration::from_millis(200));
        assert_eq!(uploader.backoff(3), Duration::from_millis(800));
        assert_eq!(uploader.backoff(4), Duration::from_millis(1_000));
        assert_eq!(uploader.backoff(40), Duration::from_millis(1_000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_flush_terminates_while_samples_arrive() {
        let buffer = Arc::new(UploadBuffer::new(100_000));
        for i in 0..200 {
            buffer.push(sample(&format!("pre-{i}")));
        }
        let trainer = Arc::new(MockTrainer::new());
        let uploader = Arc::new(SampleUploader::new(buffer.clone(), trainer.clone(), config(7, 0)));

        let producers: Vec<_> = (0..4)
            .map(|t| {
                let buffer = buffer.clone();
                tokio::task::spawn_blocking(move || {
                    for i in 0..500 {
                        buffer.push(sample(&format!("t{t}-{i}")));
                    }
                })
            })
            .collect();

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), uploader.flush_once())
                .await
                .expect("flush did not terminate")
                .unwrap();
        }
        for producer in producers {
            producer.await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), uploader.flush_once())
            .await
            .expect("flush did not terminate")
            .unwrap();

        assert!(buffer.is_empty());
        let received = trainer.received();
        assert_eq!(received.len(), 2_200);
        let unique: std::collections::HashSet<_> = received.iter().map(|s| s.request_id.clone()).collect();
        assert_eq!(unique.len(), 2_200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_flushes_and_stops() {
        let buffer = Arc::new(UploadBuffer::new(100));
        let trainer = Arc::new(MockTrainer::new());
        let uploader = Arc::new(SampleUploader::new(buffer.clone(), trainer.clone(), config(10, 0)));
        let (tx, rx) = watch::channel(false);
        let handle = uploader.spawn(rx);

        buffer.push(sample("r1"));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(trainer.received().len(), 1);

        buffer.push(sample("r2"));
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(trainer.received().len(), 2);
    }
}
