//! Lease records

use crate::channel::ChannelKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The exclusive right to operate on a channel.
///
/// Recorded when the outermost acquisition on a channel succeeds and cleared
/// when that acquisition ends. Nested acquisitions by the same owner do not
/// produce a second lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLease {
    /// Leased channel
    pub channel: ChannelKey,
    /// Owning operation (thread name and id)
    pub owner: String,
    /// When the lease was granted
    pub acquired_at: DateTime<Utc>,
    /// Wait bound the owner acquired with
    pub timeout: Duration,
}

impl ConnectionLease {
    pub(crate) fn for_current_thread(channel: ChannelKey, timeout: Duration) -> Self {
        let thread = std::thread::current();
        let owner = match thread.name() {
            Some(name) => format!("{}({:?})", name, thread.id()),
            None => format!("{:?}", thread.id()),
        };
        Self {
            channel,
            owner,
            acquired_at: Utc::now(),
            timeout,
        }
    }

    /// How long the lease has been held
    pub fn held_for(&self) -> chrono::Duration {
        Utc::now() - self.acquired_at
    }
}
