//! Durable store-and-forward queues for fieldlink nodes.
//!
//! - [`DurableDatumQueue`] holds captured samples until a
//!   [`DatumUploader`] has delivered them to the remote service.
//! - [`DurableMessageQueue`] holds outbound broker messages until a
//!   [`MessageSender`] confirmed their delivery.
//!
//! Both stores are SQLite databases with versioned schemas. The async
//! uploader and sender run every store call on tokio's blocking pool.

mod blocking;
pub mod datum;
pub mod error;
pub mod message;
pub mod schema;
pub mod sender;
pub mod uploader;

pub use datum::{Datum, DatumSamples, DurableDatumQueue, DurableDatumRecord, UploadMark};
pub use error::QueueError;
pub use message::{
    BatchAction, BatchOptions, BatchResult, DurableMessageQueue, DurableMessageRecord, MessageStats,
    OutboundMessage, SortDescriptor, SortKey,
};
pub use sender::{FlushSummary, MessageSender, MessageTransport};
pub use uploader::{DatumUploadService, DatumUploader, UploadSummary};
