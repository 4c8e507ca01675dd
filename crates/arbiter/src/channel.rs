//! Channel identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical name of a physical channel, e.g. a serial device path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Create a key from a channel name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The channel name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ChannelKey {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A channel plus an optional sub-address on that channel.
///
/// Two addresses with the same channel and different units contend for the
/// same lease: they share the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelAddress {
    /// Physical channel
    pub channel: ChannelKey,
    /// Sub-address on the channel (e.g. Modbus unit id)
    pub unit: Option<u16>,
}

impl ChannelAddress {
    /// Address a whole channel
    pub fn new(channel: impl Into<ChannelKey>) -> Self {
        Self {
            channel: channel.into(),
            unit: None,
        }
    }

    /// Address one unit on a shared channel
    pub fn with_unit(channel: impl Into<ChannelKey>, unit: u16) -> Self {
        Self {
            channel: channel.into(),
            unit: Some(unit),
        }
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Some(unit) => write!(f, "{}#{}", self.channel, unit),
            None => write!(f, "{}", self.channel),
        }
    }
}
