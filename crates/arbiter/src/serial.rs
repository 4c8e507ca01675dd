//! Serial port connector

use crate::arbiter::{ArbiterError, ChannelConnector};
use crate::channel::ChannelAddress;
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::time::Duration;
use tracing::{debug, warn};

/// Line settings applied when a port is opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            read_timeout_ms: 2000,
        }
    }
}

/// Opens the channel name as a serial device path
#[derive(Debug, Clone, Default)]
pub struct SerialConnector {
    settings: SerialSettings,
}

impl SerialConnector {
    /// Create a connector with the given line settings
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }
}

impl ChannelConnector for SerialConnector {
    type Connection = Box<dyn SerialPort>;

    fn open(&self, address: &ChannelAddress) -> Result<Self::Connection, ArbiterError> {
        debug!(
            channel = %address.channel,
            baud = self.settings.baud_rate,
            "Opening serial port"
        );
        serialport::new(address.channel.as_str(), self.settings.baud_rate)
            .timeout(Duration::from_millis(self.settings.read_timeout_ms))
            .open()
            .map_err(|e| ArbiterError::Open {
                address: address.to_string(),
                reason: e.to_string(),
            })
    }

    /// Duplicates the open handle; the device stays opened exactly once
    fn share(&self, connection: &Self::Connection) -> Option<Self::Connection> {
        connection
            .try_clone()
            .map_err(|e| warn!(error = %e, "Could not duplicate serial handle"))
            .ok()
    }
}
