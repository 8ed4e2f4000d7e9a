//! # Tuyalan
//!
//! A Rust client for the Tuya Local API.
//!
//! `tuyalan` controls and monitors Tuya-compatible smart devices (plugs,
//! switches, lamps) directly over the local network, with no Tuya Cloud
//! dependency.
//!
//! ## Key Features
//! - **Local LAN Control**: Direct device communication over TCP port 6668.
//! - **Asynchronous Architecture**: Built on `tokio` for modern, non-blocking applications.
//! - **Protocol Support**: Versions 3.1 and 3.3, including the framed 55AA
//!   codec, CRC32 validation, and per-version payload encryption.
//! - **Stateful Sessions**: A local DPS mirror kept current by status
//!   reports, with burst coalescing and heartbeat keep-alive.
//! - **Light Support**: Brightness, color temperature, and HSV/RGB color
//!   control for Tuya lamps.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuyalan::{Device, Version};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tuyalan::TuyaError> {
//!     // A device is identified by its IP, ID, and 16-byte local key.
//!     let device = Device::builder("192.168.1.40", "DEVICE_ID", "0123456789abcdef")
//!         .version(Version::V3_3)
//!         .build()?;
//!
//!     device.set_on_update(|| async {
//!         println!("device state changed");
//!     });
//!
//!     // Connect and prime the DPS mirror, then switch DP 1 (power) on.
//!     device.connect().await?;
//!     device.set_enabled(true).await?;
//!     Ok(())
//! }
//! ```

#[macro_use]
pub mod macros;
pub mod connection;
pub mod crypto;
pub mod device;
pub mod error;
pub mod light;
pub mod payload;
pub mod protocol;

pub use connection::{Connection, DeviceInfo};
pub use device::{Device, DeviceBuilder};
pub use error::TuyaError;
pub use light::{Light, LightMode, LightUpdate};
pub use protocol::{CommandType, Version};
