use clap::Parser;

use crate::{
    error::Result,
    reader::ScanFilter,
    types::{BackoffConfig, EmulatorConfig, FootpodConfig, ReaderConfig},
};

/// Advertise a BLE running speed and cadence foot-pod
#[derive(Debug, Clone, Parser)]
#[command(name = "footpod", version, about)]
pub struct FootpodArgs {
    /// Pace to report in km/h
    #[arg(long, env = "FOOTPOD_PACE_KMH", default_value_t = 10.0)]
    pub pace_kmh: f64,

    /// Cadence to report in steps per minute
    #[arg(long, env = "FOOTPOD_CADENCE", default_value_t = 85)]
    pub cadence: u16,

    /// Interval between measurement notifications in milliseconds
    #[arg(long, env = "FOOTPOD_TICK_MS", default_value_t = 1_000)]
    pub tick_ms: u64,

    /// Advertised local name
    #[arg(long, env = "FOOTPOD_NAME", default_value = "Footpod")]
    pub name: String,

    /// Bound on a single notification write in milliseconds
    #[arg(long, env = "FOOTPOD_NOTIFY_TIMEOUT_MS", default_value_t = 1_000)]
    pub notify_timeout_ms: u64,
}

impl FootpodArgs {
    /// Build a validated emulator configuration
    ///
    /// # Errors
    ///
    /// Returns [`crate::BridgeError::InvalidConfig`] for out-of-range values.
    pub fn into_config(self) -> Result<EmulatorConfig> {
        let config = EmulatorConfig {
            footpod: FootpodConfig::new(self.pace_kmh, self.cadence),
            tick_ms: self.tick_ms,
            notify_timeout_ms: self.notify_timeout_ms,
            local_name: self.name,
            backoff: BackoffConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Read treadmill data from an FTMS treadmill
#[derive(Debug, Clone, Parser)]
#[command(name = "treadmill-reader", version, about)]
pub struct ReaderArgs {
    /// Connect only to this device address
    #[arg(long, env = "TREADMILL_ADDRESS")]
    pub address: Option<String>,

    /// Connect only to devices whose name contains this text
    #[arg(long = "name-filter", env = "TREADMILL_NAME_FILTER", value_delimiter = ',')]
    pub name_filters: Vec<String>,

    /// Length of one scan window in milliseconds
    #[arg(long, env = "TREADMILL_SCAN_MS", default_value_t = 10_000)]
    pub scan_ms: u64,

    /// Bound on a connection attempt in milliseconds
    #[arg(long, env = "TREADMILL_CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Bound on a subscription attempt in milliseconds
    #[arg(long, env = "TREADMILL_SUBSCRIBE_TIMEOUT_MS", default_value_t = 5_000)]
    pub subscribe_timeout_ms: u64,

    /// Subscription attempts before giving up
    #[arg(long, env = "TREADMILL_SUBSCRIBE_ATTEMPTS", default_value_t = 3)]
    pub subscribe_attempts: u32,

    /// First retry delay in milliseconds
    #[arg(long, env = "TREADMILL_BACKOFF_INITIAL_MS", default_value_t = 500)]
    pub backoff_initial_ms: u64,

    /// Upper bound for retry delays in milliseconds
    #[arg(long, env = "TREADMILL_BACKOFF_MAX_MS", default_value_t = 5_000)]
    pub backoff_max_ms: u64,
}

impl ReaderArgs {
    /// Build the scan filter and a validated reader configuration
    ///
    /// # Errors
    ///
    /// Returns [`crate::BridgeError::InvalidConfig`] for out-of-range values.
    pub fn into_config(self) -> Result<(ScanFilter, ReaderConfig)> {
        let config = ReaderConfig {
            scan_window_ms: self.scan_ms,
            connect_timeout_ms: self.connect_timeout_ms,
            subscribe_timeout_ms: self.subscribe_timeout_ms,
            max_subscribe_attempts: self.subscribe_attempts,
            backoff: BackoffConfig {
                initial_ms: self.backoff_initial_ms,
                max_ms: self.backoff_max_ms,
                ..BackoffConfig::default()
            },
        };
        config.validate()?;

        let filter = ScanFilter {
            addresses: self.address.into_iter().collect(),
            names: self.name_filters,
        };
        Ok((filter, config))
    }
}
