//! Relay board command frames
//!
//! A relay board listens on a shared serial channel. Each command is a
//! four-byte frame: board identity, relay address, state (1 = open,
//! 0 = closed) and an additive checksum over the first three bytes.

use crate::arbiter::{ArbiterError, ChannelConnector, ConnectionArbiter};
use crate::channel::ChannelAddress;
use std::io::Write;
use std::time::Duration;
use tracing::info;

/// Length of an encoded relay frame
pub const RELAY_FRAME_LEN: usize = 4;

/// A single relay state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayCommand {
    /// Board identity byte
    pub identity: u8,
    /// Relay address on the board
    pub address: u8,
    /// Requested state
    pub open: bool,
}

impl RelayCommand {
    /// Create a command
    pub fn new(identity: u8, address: u8, open: bool) -> Self {
        Self {
            identity,
            address,
            open,
        }
    }

    /// Encode as `[identity, address, state, checksum]`
    pub fn frame(&self) -> [u8; RELAY_FRAME_LEN] {
        let state = u8::from(self.open);
        let checksum = self
            .identity
            .wrapping_add(self.address)
            .wrapping_add(state);
        [self.identity, self.address, state, checksum]
    }
}

/// A relay board reached through an arbitrated channel
pub struct RelayBoard<'a, C: ChannelConnector> {
    arbiter: &'a ConnectionArbiter<C>,
    address: ChannelAddress,
    timeout: Duration,
}

impl<'a, C> RelayBoard<'a, C>
where
    C: ChannelConnector,
    C::Connection: Write,
{
    /// Bind a board to `address`, waiting at most `timeout` for each lease
    pub fn new(arbiter: &'a ConnectionArbiter<C>, address: ChannelAddress, timeout: Duration) -> Self {
        Self {
            arbiter,
            address,
            timeout,
        }
    }

    /// Send one command while holding the channel lease
    pub fn set(&self, command: RelayCommand) -> Result<(), ArbiterError> {
        let frame = command.frame();
        self.arbiter
            .with_connection(&self.address, self.timeout, |conn| {
                conn.write_all(&frame)?;
                conn.flush()?;
                Ok::<_, ArbiterError>(())
            })?;

        info!(
            channel = %self.address,
            identity = command.identity,
            relay = command.address,
            open = command.open,
            "Relay state written"
        );
        Ok(())
    }
}
