//! Store-and-forward upload and message delivery

use crate::test_utils::{init_tracing, remove_db, RecordingUploadService};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use fieldlink_core::Config;
use fieldlink_queue::{
    Datum, DatumSamples, DatumUploader, DurableDatumQueue, DurableMessageQueue,
    DurableMessageRecord, MessageSender, MessageTransport, QueueError,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn config_in(dir: &PathBuf) -> Config {
    Config::from_toml_str(&format!(
        r#"
        [storage]
        data_dir = '{}'

        [upload]
        batch_size = 10
        retention_hours = 1
        destination = "D"

        [messages]
        destination = "broker"
        batch_size = 2
        "#,
        dir.display()
    ))
    .unwrap()
}

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("fieldlink_it_{}", uuid::Uuid::new_v4()))
}

#[tokio::test]
async fn test_upload_reconciliation_scenario() {
    init_tracing();
    let dir = temp_dir();
    let config = config_in(&dir);
    let queue = Arc::new(DurableDatumQueue::open(config.storage.datum_path()).unwrap());

    let start = Utc::now() - ChronoDuration::minutes(3);
    for minute in 0..3 {
        let samples = DatumSamples::new()
            .with_instantaneous("watts", 1000.0 + minute as f64)
            .with_accumulating("wattHours", 5000.0 + minute as f64);
        queue
            .enqueue(&Datum::new("Main", start + ChronoDuration::minutes(minute), samples))
            .unwrap();
    }

    // Nothing uploaded yet: purge keeps everything.
    assert_eq!(queue.purge(Duration::ZERO).unwrap(), 0);

    let service = Arc::new(RecordingUploadService::default());
    let uploader = DatumUploader::new(queue.clone(), service.clone(), &config.upload);

    service.set_offline(true);
    let failed = uploader.run_once().await.unwrap();
    assert_eq!(failed.uploaded, 0);
    assert_eq!(queue.count_pending().unwrap(), 3);

    service.set_offline(false);
    let done = uploader.run_once().await.unwrap();
    assert_eq!(done.uploaded, 3);
    // Retention window keeps fresh uploads.
    assert_eq!(done.purged, 0);

    let received = service.received.lock().clone();
    let ids: Vec<i64> = received.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(received.iter().all(|(_, source)| source == "Main"));

    let mark = queue.get(2).unwrap().unwrap().upload_mark.unwrap();
    assert_eq!((mark.destination.as_str(), mark.tracking_id.as_str()), ("D", "trk-2"));

    assert_eq!(queue.purge(Duration::ZERO).unwrap(), 3);
    assert!(queue.get(1).unwrap().is_none());

    drop(uploader);
    drop(queue);
    remove_db(&config.storage.datum_path());
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_pending_datum_survive_restart() {
    let dir = temp_dir();
    let config = config_in(&dir);
    let service = Arc::new(RecordingUploadService::default());
    service.set_offline(true);

    {
        let queue = Arc::new(DurableDatumQueue::open(config.storage.datum_path()).unwrap());
        queue
            .enqueue(&Datum::new("Main", Utc::now(), DatumSamples::new().with_status("mode", "grid")))
            .unwrap();
        let uploader = DatumUploader::new(queue, service.clone(), &config.upload);
        assert_eq!(uploader.run_once().await.unwrap().uploaded, 0);
    }

    service.set_offline(false);
    let queue = Arc::new(DurableDatumQueue::open(config.storage.datum_path()).unwrap());
    let uploader = DatumUploader::new(queue.clone(), service.clone(), &config.upload)
        .with_batch_upload(true);
    assert_eq!(uploader.run_once().await.unwrap().uploaded, 1);
    assert_eq!(queue.count_pending().unwrap(), 0);

    drop(uploader);
    drop(queue);
    remove_db(&config.storage.datum_path());
    let _ = std::fs::remove_dir_all(&dir);
}

#[derive(Default)]
struct Broker {
    down: AtomicBool,
    published: Mutex<Vec<String>>,
}

#[async_trait]
impl MessageTransport for Broker {
    async fn publish(&self, record: &DurableMessageRecord) -> Result<(), QueueError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(QueueError::Transport("broker unreachable".into()));
        }
        self.published.lock().push(record.topic.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_messages_outlive_restart_and_flush_in_order() {
    let dir = temp_dir();
    let config = config_in(&dir);
    let broker = Arc::new(Broker::default());
    broker.down.store(true, Ordering::SeqCst);

    {
        let queue = Arc::new(DurableMessageQueue::open(config.storage.message_path()).unwrap());
        let sender = MessageSender::new(queue.clone(), broker.clone(), &config.messages);
        for n in 1..=3 {
            let delivered = sender
                .send(format!("node/1/datum/{n}"), 1, false, b"{}".to_vec())
                .await
                .unwrap();
            assert!(!delivered);
        }
        assert_eq!(queue.stats().stored, 3);
    }

    broker.down.store(false, Ordering::SeqCst);
    let queue = Arc::new(DurableMessageQueue::open(config.storage.message_path()).unwrap());
    let sender = MessageSender::new(queue.clone(), broker.clone(), &config.messages);
    let summary = sender.flush().await.unwrap();

    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.remaining, 0);
    assert_eq!(
        *broker.published.lock(),
        vec!["node/1/datum/1", "node/1/datum/2", "node/1/datum/3"]
    );
    // Counters are per process lifetime of the queue.
    assert_eq!(queue.stats().deleted, 3);

    drop(sender);
    drop(queue);
    remove_db(&config.storage.message_path());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_transport_errors_classify_as_retryable() {
    let err: fieldlink_core::Error = QueueError::Transport("down".into()).into();
    assert!(err.is_retryable());

    let err: fieldlink_core::Error = QueueError::BatchMismatch { expected: 3, actual: 2 }.into();
    assert!(err.is_retryable());
}
