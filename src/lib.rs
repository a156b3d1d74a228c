#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # ant-sensors
//!
//! Read ANT+ heart rate monitors and bicycle power meters through an ANT
//! dongle, either a USB-serial one or a USB stick driven over its bulk
//! endpoints.
//!
//! The crate is layered the way the radio protocol is:
//!
//! - [`protocol`] frames and checksums ANT messages and resynchronises on a
//!   corrupted byte stream
//! - [`event`] runs the background reader task that decodes frames, hands them
//!   to listeners and answers waits for acknowledgements
//! - [`node`] and [`channel`] configure networks and channels on the dongle
//! - [`device`] pairs with one sensor per channel and decodes its data pages,
//!   with [`heart_rate`] and [`power`] as the two ANT+ profiles
//! - [`sensors`] keeps the last reading of both sensors for callers that just
//!   want numbers
//!
//! ## Quick Start
//!
//! ```no_run
//! use ant_sensors::{SensorsConfig, SerialParams, Sensors};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = SerialParams {
//!         path: "/dev/ttyUSB0".to_string(),
//!         ..SerialParams::default()
//!     };
//!     let sensors = Sensors::serial(params, SensorsConfig::default()).await?;
//!
//!     for _ in 0..20 {
//!         tokio::time::sleep(Duration::from_millis(250)).await;
//!         println!(
//!             "heart rate: {:?} power: {:?} cadence: {:?}",
//!             sensors.heart_rate(),
//!             sensors.power(),
//!             sensors.cadence()
//!         );
//!     }
//!
//!     sensors.close().await?;
//!     Ok(())
//! }
//! ```

/// Channel configuration and lifecycle
pub mod channel;
/// Device profile pairing state machine
pub mod device;
/// Error types and handling
pub mod error;
/// Background frame reader and listener dispatch
pub mod event;
/// ANT+ heart rate monitor profile
pub mod heart_rate;
/// Dongle node with its network table and channel pool
pub mod node;
/// ANT+ bicycle power profile
pub mod power;
/// ANT message framing and decoding
pub mod protocol;
/// Last-value cache over a heart rate monitor and a power meter
pub mod sensors;
/// Byte transports to the dongle
pub mod transport;
/// Type definitions and protocol constants
pub mod types;

#[cfg(test)]
mod testing;

pub use channel::{Channel, ChannelConfig};
pub use device::{DeviceProfile, ProfileCallbacks, ProfileDecoder, DEFAULT_SEARCH_TIMEOUT};
pub use error::{AntError, Result};
pub use event::{EventDispatcher, Listener, ListenerId};
pub use heart_rate::{HeartRate, HeartRateData, HeartRateDecoder, HeartRateTelemetry};
pub use node::Node;
pub use power::{
    BicyclePower, PowerData, PowerDecoder, PowerEvent, PowerTelemetry, TorquePedalData,
};
pub use protocol::{Message, MessageId};
pub use sensors::{SensorReadings, SensorStatus, Sensors, SensorsConfig};
pub use transport::{SerialTransport, Transport, UsbTransport};
pub use types::{
    ChannelId, ChannelState, ChannelType, ConnectionState, EventCode, Network, NodeConfig,
    SerialParams, UsbParams,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
