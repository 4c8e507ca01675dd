//! Channel arbitration for shared physical links.
//!
//! Serial ports and bus segments are shared by many independent polling and
//! control operations. [`ConnectionArbiter`] hands out at most one lease per
//! physical channel at a time; sub-addresses such as a Modbus unit id ride
//! along in [`ChannelAddress`] without narrowing the lease.
//!
//! ```
//! use fieldlink_arbiter::{ArbiterError, ChannelAddress, ChannelConnector, ConnectionArbiter};
//! use std::time::Duration;
//!
//! struct Loopback;
//!
//! impl ChannelConnector for Loopback {
//!     type Connection = Vec<u8>;
//!
//!     fn open(&self, _address: &ChannelAddress) -> Result<Vec<u8>, ArbiterError> {
//!         Ok(Vec::new())
//!     }
//! }
//!
//! let arbiter = ConnectionArbiter::new(Loopback);
//! let address = ChannelAddress::with_unit("/dev/ttyUSB0", 3);
//! let written = arbiter
//!     .with_connection(&address, Duration::from_secs(1), |conn| {
//!         conn.extend_from_slice(&[0x01, 0x03]);
//!         Ok::<_, ArbiterError>(conn.len())
//!     })
//!     .unwrap();
//! assert_eq!(written, 2);
//! ```

#![warn(missing_docs)]

pub mod arbiter;
pub mod channel;
pub mod lease;
pub mod relay;
#[cfg(feature = "serial")]
pub mod serial;

pub use arbiter::{ArbiterError, ChannelConnector, ConnectionArbiter};
pub use channel::{ChannelAddress, ChannelKey};
pub use lease::ConnectionLease;
pub use relay::{RelayBoard, RelayCommand};
#[cfg(feature = "serial")]
pub use serial::{SerialConnector, SerialSettings};
