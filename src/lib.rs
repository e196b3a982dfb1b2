//! # Rustlink
//!
//! Asynchronous local-network control and monitoring of Broadlink-based
//! consumer devices: smart sockets, power strips, IR/RF blasters and
//! environment sensors. No cloud dependency; everything runs over the
//! devices' UDP protocol on the local subnet.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rustlink::{Device, DeviceConfig, DiscoveryManager, SocketSwitch};
//!
//! # async fn run() -> rustlink::Result<()> {
//! let discovery = DiscoveryManager::new();
//! let config = DeviceConfig::new("192.168.0.23", "aa:bb:cc:dd:ee:ff")?;
//! let device = Device::new(config, Box::new(SocketSwitch), discovery)?;
//! device.start(); // poll connectivity and state in the background
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod device;
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod session;
pub mod transport;

pub use device::{
    Device, DeviceConfig, DeviceHandler, DeviceStatus, Reachability, StatusEvent, TcpProbe,
};
pub use discovery::{DiscoveryListener, DiscoveryManager};
pub use error::{BroadlinkError, Result};
pub use handlers::{A1Reading, A1Sensor, PowerStrip, RemoteBlaster, SocketSwitch, Sp1Switch};
pub use protocol::{CommandCode, DeviceKind, DiscoveryReply};
pub use session::DeviceSession;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
