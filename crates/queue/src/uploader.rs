//! Background uploader draining the datum queue
//!
//! Delivery is at-least-once: a record is marked only after the remote
//! service returned its tracking id, so a crash between upload and mark
//! re-sends it on the next cycle.

use crate::blocking::with_store;
use crate::datum::{DurableDatumQueue, DurableDatumRecord, UploadMark};
use crate::error::QueueError;
use async_trait::async_trait;
use fieldlink_core::UploadConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Remote service accepting datum uploads
#[async_trait]
pub trait DatumUploadService: Send + Sync {
    /// Upload one record; returns the remote tracking id
    async fn upload(&self, record: &DurableDatumRecord) -> Result<String, QueueError>;

    /// Upload records in one call; tracking ids match the input positionally.
    ///
    /// The default uploads one at a time.
    async fn upload_batch(&self, records: &[DurableDatumRecord]) -> Result<Vec<String>, QueueError> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(self.upload(record).await?);
        }
        Ok(ids)
    }
}

/// Shortest cycle period; a zero interval would spin
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Counts from one uploader cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub attempted: usize,
    pub uploaded: usize,
    pub purged: usize,
}

pub struct DatumUploader {
    queue: Arc<DurableDatumQueue>,
    service: Arc<dyn DatumUploadService>,
    destination: String,
    batch_size: usize,
    batch_upload: bool,
    interval: Duration,
    retention: Duration,
}

impl DatumUploader {
    pub fn new(
        queue: Arc<DurableDatumQueue>,
        service: Arc<dyn DatumUploadService>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            queue,
            service,
            destination: config.destination.clone(),
            batch_size: config.batch_size.max(1),
            batch_upload: false,
            interval: config.interval().max(MIN_INTERVAL),
            retention: config.retention(),
        }
    }

    /// Send each cycle's records in a single bulk call
    pub fn with_batch_upload(mut self, enabled: bool) -> Self {
        self.batch_upload = enabled;
        self
    }

    /// Upload one batch of pending records, then purge expired ones.
    ///
    /// Transport failures end the cycle early and leave the remaining
    /// records pending; they are reported in the summary, not as an error.
    pub async fn run_once(&self) -> Result<UploadSummary, QueueError> {
        let batch_size = self.batch_size;
        let pending = with_store(&self.queue, move |q| q.pending(batch_size)).await?;
        let mut summary = UploadSummary {
            attempted: pending.len(),
            ..UploadSummary::default()
        };

        if !pending.is_empty() {
            summary.uploaded = if self.batch_upload {
                self.upload_batch(&pending).await?
            } else {
                self.upload_each(&pending).await?
            };
        }

        let retention = self.retention;
        summary.purged = with_store(&self.queue, move |q| q.purge(retention)).await?;
        if summary.attempted > 0 {
            info!(
                destination = %self.destination,
                attempted = summary.attempted,
                uploaded = summary.uploaded,
                purged = summary.purged,
                "Datum upload cycle finished"
            );
        }
        Ok(summary)
    }

    async fn upload_each(&self, records: &[DurableDatumRecord]) -> Result<usize, QueueError> {
        let mut uploaded = 0;
        for record in records {
            match self.service.upload(record).await {
                Ok(tracking_id) => {
                    self.mark(record.local_id, tracking_id).await?;
                    uploaded += 1;
                }
                Err(e) => {
                    warn!(local_id = record.local_id, error = %e, "Datum upload failed; will retry");
                    break;
                }
            }
        }
        Ok(uploaded)
    }

    async fn upload_batch(&self, records: &[DurableDatumRecord]) -> Result<usize, QueueError> {
        let result = self
            .service
            .upload_batch(records)
            .await
            .and_then(|ids| {
                if ids.len() == records.len() {
                    Ok(ids)
                } else {
                    Err(QueueError::BatchMismatch {
                        expected: records.len(),
                        actual: ids.len(),
                    })
                }
            });
        let ids = match result {
            Ok(ids) => ids,
            Err(e) => {
                warn!(count = records.len(), error = %e, "Datum batch upload failed; will retry");
                return Ok(0);
            }
        };

        for (record, tracking_id) in records.iter().zip(ids) {
            self.mark(record.local_id, tracking_id).await?;
        }
        Ok(records.len())
    }

    async fn mark(&self, local_id: i64, tracking_id: String) -> Result<(), QueueError> {
        let mark = UploadMark::now(self.destination.as_str(), tracking_id);
        if !with_store(&self.queue, move |q| q.mark_uploaded(local_id, &mark)).await? {
            debug!(local_id, "Datum already marked uploaded");
        }
        Ok(())
    }

    /// Run cycles on the configured interval until `shutdown` turns true
    /// or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(destination = %self.destination, interval = ?self.interval, "Datum uploader started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Datum upload cycle failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(destination = %self.destination, "Datum uploader stopped");
    }
}
