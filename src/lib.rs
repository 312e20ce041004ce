#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Footbridge 🏃
//!
//! Bluetooth Low Energy plumbing for running on a treadmill with a watch that
//! only understands foot-pods.
//!
//! The crate has two independent roles:
//!
//! - **Sensor emulator** (peripheral): advertises the Running Speed and Cadence
//!   service and pushes synthetic measurements for a configured pace and
//!   cadence while a central is subscribed. Served through `BlueZ`, so the
//!   transport is only available on Linux.
//! - **Treadmill reader** (central): finds an FTMS treadmill, subscribes to its
//!   Treadmill Data characteristic and decodes every notification into a
//!   [`TreadmillRecord`].
//!
//! Both roles are state machines over a transport trait
//! ([`FootpodTransport`], [`TreadmillTransport`]) and report through an
//! [`EventSink`]. Shutdown is cooperative via [`shutdown::channel`].
//!
//! ## Wire formats
//!
//! RSC Measurement (`0x2A53`), little endian:
//!
//! | Field          | Size | Unit      | Present when   |
//! |----------------|------|-----------|----------------|
//! | Flags          | 1    |           | always         |
//! | Speed          | 2    | 1/256 m/s | always         |
//! | Cadence        | 1    | steps/min | always         |
//! | Stride length  | 2    | 1/100 m   | flags bit 0    |
//! | Total distance | 4    | 1/10 m    | flags bit 1    |
//!
//! Treadmill Data (`0x2ACD`) starts with 16-bit flags; each set bit appends a
//! fixed-width field in ascending bit order. See [`protocol::decode_treadmill_data`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use footbridge::{
//!     shutdown, BtleplugTransport, ReaderConfig, ScanFilter, TracingSink, TreadmillReader,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = BtleplugTransport::new().await?;
//!     let mut reader = TreadmillReader::new(
//!         transport,
//!         TracingSink,
//!         ScanFilter::default(),
//!         ReaderConfig::default(),
//!     )?;
//!
//!     let (_trigger, shutdown) = shutdown::channel();
//!     reader.run(shutdown).await?;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// FTMS client transport over `btleplug`
pub mod ble;
/// RSC GATT server over `BlueZ`
#[cfg(target_os = "linux")]
pub mod bluez;
/// Command line and environment configuration
pub mod config;
/// Foot-pod sensor emulator state machine
pub mod emulator;
/// Error types and handling
pub mod error;
/// Subscriber setup for the binaries
pub mod logging;
/// RSC and FTMS wire formats
pub mod protocol;
/// Treadmill reader state machine
pub mod reader;
/// Cooperative cancellation
pub mod shutdown;
/// Status and record consumers
pub mod sink;
/// Synthetic foot-pod telemetry
pub mod telemetry;
/// Type definitions and data structures
pub mod types;

pub use ble::BtleplugTransport;
#[cfg(target_os = "linux")]
pub use bluez::BluezFootpod;
pub use emulator::{FootpodTransport, PeripheralEvent, SensorEmulator};
pub use error::{BridgeError, Result};
pub use reader::{ScanFilter, TreadmillInfo, TreadmillReader, TreadmillTransport};
pub use sink::{ChannelSink, EventSink, SinkEvent, TracingSink};
pub use telemetry::TelemetryGenerator;
pub use types::{
    BackoffConfig, ConnectionState, EmulatorConfig, ExpendedEnergy, FootpodConfig, ReaderConfig,
    ReaderState, StatusEvent, TelemetrySample, TreadmillRecord,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Running Speed and Cadence service (`0x1814`)
pub const RSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1814_0000_1000_8000_0080_5f9b_34fb);

/// RSC Measurement characteristic (`0x2A53`), notify only
pub const RSC_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x0000_2a53_0000_1000_8000_0080_5f9b_34fb);

/// RSC Feature characteristic (`0x2A54`), read only
pub const RSC_FEATURE_UUID: Uuid = Uuid::from_u128(0x0000_2a54_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine service (`0x1826`)
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Treadmill Data characteristic (`0x2ACD`)
pub const TREADMILL_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2acd_0000_1000_8000_0080_5f9b_34fb);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsc_uuids() {
        assert_eq!(
            RSC_SERVICE_UUID.to_string(),
            "00001814-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            RSC_MEASUREMENT_UUID.to_string(),
            "00002a53-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            RSC_FEATURE_UUID.to_string(),
            "00002a54-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
