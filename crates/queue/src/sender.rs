//! Store-and-forward sending through a broker link

use crate::blocking::with_store;
use crate::error::QueueError;
use crate::message::{DurableMessageQueue, DurableMessageRecord, OutboundMessage};
use async_trait::async_trait;
use fieldlink_core::MessageConfig;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Broker link that can publish one stored message
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn publish(&self, record: &DurableMessageRecord) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub delivered: usize,
    /// Messages still stored for this destination after the flush
    pub remaining: usize,
}

pub struct MessageSender {
    queue: Arc<DurableMessageQueue>,
    transport: Arc<dyn MessageTransport>,
    destination: String,
    batch_size: usize,
}

impl MessageSender {
    pub fn new(
        queue: Arc<DurableMessageQueue>,
        transport: Arc<dyn MessageTransport>,
        config: &MessageConfig,
    ) -> Self {
        Self {
            queue,
            transport,
            destination: config.destination.clone(),
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Store a message and try to deliver it right away.
    ///
    /// Returns whether it was delivered; an undelivered message stays stored
    /// for the next [`MessageSender::flush`].
    pub async fn send(
        &self,
        topic: impl Into<String>,
        qos: u8,
        retained: bool,
        payload: impl Into<Vec<u8>>,
    ) -> Result<bool, QueueError> {
        let message = OutboundMessage::new(self.destination.as_str(), topic, payload)
            .with_qos(qos)
            .retained(retained);
        let record = with_store(&self.queue, move |q| q.persist(&message)).await?;
        self.deliver(&record).await
    }

    async fn deliver(&self, record: &DurableMessageRecord) -> Result<bool, QueueError> {
        match self.transport.publish(record).await {
            Ok(()) => {
                let local_id = record.local_id;
                with_store(&self.queue, move |q| q.confirm_delivery(local_id)).await?;
                debug!(local_id = record.local_id, topic = %record.topic, "Message delivered");
                Ok(true)
            }
            Err(e) if e.is_transport() => {
                warn!(local_id = record.local_id, error = %e, "Message publish failed; kept for retry");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Deliver stored messages for this destination in id order, stopping
    /// at the first failure.
    pub async fn flush(&self) -> Result<FlushSummary, QueueError> {
        let mut delivered = 0;
        'drain: loop {
            let (destination, batch_size) = (self.destination.clone(), self.batch_size);
            let batch = with_store(&self.queue, move |q| q.pending_for(&destination, batch_size)).await?;
            if batch.is_empty() {
                break;
            }
            for record in &batch {
                if !self.deliver(record).await? {
                    break 'drain;
                }
                delivered += 1;
            }
        }

        let destination = self.destination.clone();
        let remaining = with_store(&self.queue, move |q| q.count_for(&destination)).await?;
        if delivered > 0 || remaining > 0 {
            info!(destination = %self.destination, delivered, remaining, "Message flush finished");
        }
        Ok(FlushSummary { delivered, remaining })
    }
}
