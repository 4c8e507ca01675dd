//! Per-channel lease arbitration
//!
//! Each physical channel gets a reentrant timed mutex, created lazily on
//! first use and kept for the life of the arbiter. There is no lock shared
//! across unrelated channels.

use crate::channel::{ChannelAddress, ChannelKey};
use crate::lease::ConnectionLease;
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Arbitration errors
#[derive(Debug, Error)]
pub enum ArbiterError {
    /// The channel stayed leased for longer than the caller would wait
    #[error("Could not acquire channel {channel} lock within {waited:?}")]
    LockTimeout {
        /// Contended channel
        channel: ChannelKey,
        /// Wait bound that elapsed
        waited: Duration,
    },

    /// The connector could not open the channel
    #[error("Failed to open {address}: {reason}")]
    Open {
        /// Address being opened
        address: String,
        /// Connector-supplied reason
        reason: String,
    },

    /// I/O failure while holding the lease
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArbiterError {
    /// Whether this is a lock timeout rather than a device fault
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, ArbiterError::LockTimeout { .. })
    }
}

impl From<ArbiterError> for fieldlink_core::Error {
    fn from(err: ArbiterError) -> Self {
        match err {
            ArbiterError::LockTimeout { channel, waited } => fieldlink_core::Error::LockTimeout {
                channel: channel.to_string(),
                waited,
            },
            other => fieldlink_core::Error::Transport(other.to_string()),
        }
    }
}

/// Opens live connections on a channel.
///
/// The outermost leased operation on a channel opens a connection and closes
/// it when the operation ends. Operations nested inside it on the same
/// thread are handed a [`ChannelConnector::share`] of that connection, so a
/// device that allows only one open handle is not opened twice.
pub trait ChannelConnector: Send + Sync {
    /// Live connection handle passed to operations
    type Connection: Send;

    /// Open a connection to `address`
    fn open(&self, address: &ChannelAddress) -> Result<Self::Connection, ArbiterError>;

    /// Second handle onto an open connection, for nested operations.
    ///
    /// Returning `None` makes nested operations open their own connection.
    fn share(&self, _connection: &Self::Connection) -> Option<Self::Connection> {
        None
    }

    /// Close a connection after its operation finished
    fn close(&self, connection: Self::Connection) {
        drop(connection);
    }
}

struct ChannelSlot<Conn> {
    /// Nesting depth of the current owner
    lock: ReentrantMutex<Cell<usize>>,
    lease: Mutex<Option<ConnectionLease>>,
    /// Shared handle of the outermost connection, used by nested calls
    shared: Mutex<Option<Conn>>,
}

impl<Conn> ChannelSlot<Conn> {
    fn new() -> Self {
        Self {
            lock: ReentrantMutex::new(Cell::new(0)),
            lease: Mutex::new(None),
            shared: Mutex::new(None),
        }
    }
}

/// Closes the operation's connection on every exit path, unwinding included.
/// The outermost call also closes the slot's shared handle.
struct OpenConnection<'a, C: ChannelConnector> {
    connector: &'a C,
    connection: Option<C::Connection>,
    shared: Option<&'a Mutex<Option<C::Connection>>>,
}

impl<C: ChannelConnector> Drop for OpenConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.connector.close(connection);
        }
        if let Some(spare) = self.shared.and_then(|shared| shared.lock().take()) {
            self.connector.close(spare);
        }
    }
}

/// Held for the duration of one `with_connection` call. Dropping it (on
/// return, error or unwind) releases one level of the lease.
struct LeaseGuard<'a> {
    depth: ReentrantMutexGuard<'a, Cell<usize>>,
    lease: &'a Mutex<Option<ConnectionLease>>,
    channel: &'a ChannelKey,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth == 0 {
            if let Some(lease) = self.lease.lock().take() {
                debug!(
                    channel = %self.channel,
                    held_ms = lease.held_for().num_milliseconds(),
                    "Released channel lease"
                );
            }
        }
    }
}

/// Serializes access to shared physical channels.
pub struct ConnectionArbiter<C: ChannelConnector> {
    connector: C,
    channels: DashMap<ChannelKey, Arc<ChannelSlot<C::Connection>>>,
}

impl<C: ChannelConnector> ConnectionArbiter<C> {
    /// Create an arbiter that opens connections with `connector`
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            channels: DashMap::new(),
        }
    }

    /// The connector used to open channels
    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn slot_for(&self, channel: &ChannelKey) -> Arc<ChannelSlot<C::Connection>> {
        self.channels
            .entry(channel.clone())
            .or_insert_with(|| Arc::new(ChannelSlot::new()))
            .clone()
    }

    /// Run `operation` while holding the lease for `address.channel`.
    ///
    /// Waits at most `timeout` for the lease. The lease is released when
    /// `operation` returns, fails or panics. A thread that already holds the
    /// lease may call this again (nested) without waiting, and reuses the
    /// outer connection when the connector can share it.
    ///
    /// # Errors
    /// [`ArbiterError::LockTimeout`] if the lease was not acquired in time;
    /// in that case nothing is held. Errors from opening the connection or
    /// from `operation` itself are returned as-is.
    pub fn with_connection<T, E, F>(
        &self,
        address: &ChannelAddress,
        timeout: Duration,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut C::Connection) -> Result<T, E>,
        E: From<ArbiterError>,
    {
        let channel = &address.channel;
        let slot = self.slot_for(channel);

        debug!(channel = %channel, unit = ?address.unit, ?timeout, "Acquiring channel lease");
        let started = Instant::now();
        let depth = match slot.lock.try_lock_for(timeout) {
            Some(guard) => guard,
            None => {
                warn!(channel = %channel, ?timeout, "Timeout acquiring channel lease");
                return Err(ArbiterError::LockTimeout {
                    channel: channel.clone(),
                    waited: started.elapsed(),
                }
                .into());
            }
        };

        let nested = depth.get() > 0;
        depth.set(depth.get() + 1);
        if !nested {
            *slot.lease.lock() = Some(ConnectionLease::for_current_thread(channel.clone(), timeout));
            debug!(channel = %channel, waited_ms = started.elapsed().as_millis() as u64, "Acquired channel lease");
        }
        let _guard = LeaseGuard {
            depth,
            lease: &slot.lease,
            channel,
        };

        let connection = if nested {
            self.nested_connection(&slot, address)?
        } else {
            self.connector.open(address)?
        };
        let mut open = OpenConnection {
            connector: &self.connector,
            connection: None,
            shared: None,
        };
        if !nested {
            *slot.shared.lock() = self.connector.share(&connection);
            open.shared = Some(&slot.shared);
        }
        let result = operation(open.connection.insert(connection));
        result
    }

    fn nested_connection(
        &self,
        slot: &ChannelSlot<C::Connection>,
        address: &ChannelAddress,
    ) -> Result<C::Connection, ArbiterError> {
        let shared = slot
            .shared
            .lock()
            .as_ref()
            .and_then(|outer| self.connector.share(outer));
        match shared {
            Some(connection) => Ok(connection),
            None => {
                debug!(channel = %address.channel, "Connector cannot share; opening nested connection");
                self.connector.open(address)
            }
        }
    }

    /// The lease currently outstanding on `channel`, if any
    pub fn active_lease(&self, channel: &ChannelKey) -> Option<ConnectionLease> {
        self.channels
            .get(channel)
            .and_then(|slot| slot.lease.lock().clone())
    }

    /// Number of channels seen so far
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
