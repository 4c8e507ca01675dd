//! Shared fixtures for the integration tests

use async_trait::async_trait;
use fieldlink_arbiter::{ArbiterError, ChannelAddress, ChannelConnector};
use fieldlink_queue::{DatumUploadService, DurableDatumRecord, QueueError};
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Unique database path under the system temp directory
pub fn temp_db_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}_{}.db", uuid::Uuid::new_v4()))
}

/// Remove a SQLite database and its WAL side files
pub fn remove_db(path: &Path) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(path.with_extension("db-wal"));
    let _ = std::fs::remove_file(path.with_extension("db-shm"));
}

/// Initialize test logging once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(fieldlink_core::logging::env_filter())
        .with_test_writer()
        .try_init();
}

/// Connector whose connections append every written byte to one buffer
#[derive(Default, Clone)]
pub struct WireCapture {
    pub written: Arc<Mutex<Vec<u8>>>,
    pub opened: Arc<Mutex<Vec<String>>>,
}

pub struct CaptureLink {
    written: Arc<Mutex<Vec<u8>>>,
}

impl Write for CaptureLink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl ChannelConnector for WireCapture {
    type Connection = CaptureLink;

    fn open(&self, address: &ChannelAddress) -> Result<CaptureLink, ArbiterError> {
        self.opened.lock().push(address.to_string());
        Ok(CaptureLink {
            written: self.written.clone(),
        })
    }
}

/// Upload service that can be switched offline and records what it got
#[derive(Default)]
pub struct RecordingUploadService {
    pub offline: AtomicBool,
    pub received: Mutex<Vec<(i64, String)>>,
}

impl RecordingUploadService {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatumUploadService for RecordingUploadService {
    async fn upload(&self, record: &DurableDatumRecord) -> Result<String, QueueError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(QueueError::Transport("service offline".into()));
        }
        self.received
            .lock()
            .push((record.local_id, record.source_id.clone()));
        Ok(format!("trk-{}", record.local_id))
    }
}
