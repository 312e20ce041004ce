use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::error::{BridgeError, Result};

/// Pace and cadence the emulated foot-pod reports
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FootpodConfig {
    /// Running pace in km/h
    pub pace_kmh: f64,
    /// Cadence in steps per minute
    pub cadence_spm: u16,
}

impl Default for FootpodConfig {
    fn default() -> Self {
        Self {
            pace_kmh: 10.0,
            cadence_spm: 85,
        }
    }
}

impl FootpodConfig {
    /// Create a new foot-pod configuration
    #[must_use]
    pub const fn new(pace_kmh: f64, cadence_spm: u16) -> Self {
        Self {
            pace_kmh,
            cadence_spm,
        }
    }

    /// Check that pace and cadence are usable
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] for a non-positive pace or zero cadence.
    pub fn validate(&self) -> Result<()> {
        if !self.pace_kmh.is_finite() || self.pace_kmh <= 0.0 {
            return Err(BridgeError::InvalidConfig(format!(
                "pace must be a positive number of km/h, got {}",
                self.pace_kmh
            )));
        }
        if self.cadence_spm == 0 {
            return Err(BridgeError::InvalidConfig(
                "cadence must be at least 1 step/min".to_string(),
            ));
        }
        Ok(())
    }

    /// Speed in metres per second
    #[must_use]
    pub fn speed_mps(&self) -> f64 {
        self.pace_kmh / 3.6
    }

    /// Distance covered by one stride in metres
    #[must_use]
    pub fn stride_length_m(&self) -> f64 {
        if self.cadence_spm == 0 {
            return 0.0;
        }
        self.speed_mps() / (f64::from(self.cadence_spm) / 60.0)
    }
}

/// One tick of generated foot-pod telemetry
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Instantaneous speed in m/s
    pub speed_mps: f64,
    /// Instantaneous cadence in steps per minute
    pub cadence_spm: u16,
    /// Stride length in metres
    pub stride_length_m: f64,
    /// Whole strides taken this session
    pub stride_count: u64,
    /// Distance covered this session in metres
    pub cumulative_distance_m: f64,
}

/// Sensor emulator connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not advertising, no central
    Idle,
    /// Advertising the foot-pod service
    Advertising,
    /// A central is connected but has not enabled notifications
    ConnectedUnsubscribed,
    /// A central is connected and receiving measurements
    ConnectedNotifying,
}

impl ConnectionState {
    /// Check if a central occupies the emulator
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::ConnectedUnsubscribed | Self::ConnectedNotifying)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Advertising => write!(f, "Advertising"),
            Self::ConnectedUnsubscribed => write!(f, "Connected (unsubscribed)"),
            Self::ConnectedNotifying => write!(f, "Connected (notifying)"),
        }
    }
}

/// Treadmill reader state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReaderState {
    /// Looking for an FTMS treadmill
    Scanning,
    /// Establishing the link
    Connecting,
    /// Enabling treadmill data notifications
    Subscribing,
    /// Receiving treadmill data
    Streaming,
    /// Link lost, about to scan again
    Disconnected,
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Expended energy as reported by the treadmill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpendedEnergy {
    /// Total energy in kcal
    pub total_kcal: u16,
    /// Energy per hour in kcal
    pub per_hour_kcal: u16,
    /// Energy per minute in kcal
    pub per_minute_kcal: u8,
}

/// Decoded FTMS treadmill data notification
///
/// Only fields whose flag bit was set are populated.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TreadmillRecord {
    /// Raw flags field
    pub flags: u16,
    /// Instantaneous speed in m/s
    pub speed_mps: Option<f64>,
    /// Average speed in m/s
    pub average_speed_mps: Option<f64>,
    /// Total distance in metres
    pub total_distance_m: Option<u32>,
    /// Inclination in percent
    pub incline_percent: Option<f64>,
    /// Ramp angle in degrees
    pub ramp_angle_deg: Option<f64>,
    /// Positive elevation gain in metres
    pub elevation_gain_positive_m: Option<f64>,
    /// Negative elevation gain in metres
    pub elevation_gain_negative_m: Option<f64>,
    /// Instantaneous pace in km/min
    pub pace_km_per_min: Option<f64>,
    /// Average pace in km/min
    pub average_pace_km_per_min: Option<f64>,
    /// Expended energy
    pub energy: Option<ExpendedEnergy>,
    /// Heart rate in beats per minute
    pub heart_rate_bpm: Option<u8>,
    /// Metabolic equivalent
    pub metabolic_equivalent: Option<f64>,
    /// Elapsed time in seconds
    pub elapsed_time_s: Option<u16>,
    /// Remaining time in seconds
    pub remaining_time_s: Option<u16>,
    /// Force on belt in newtons
    pub force_on_belt_n: Option<i16>,
    /// Power output in watts
    pub power_output_w: Option<i16>,
}

impl TreadmillRecord {
    /// Instantaneous speed in km/h
    #[must_use]
    pub fn speed_kmh(&self) -> Option<f64> {
        self.speed_mps.map(|mps| mps * 3.6)
    }

    /// Check whether the given flag bit was set
    #[must_use]
    pub const fn has(&self, bit: u16) -> bool {
        self.flags & bit != 0
    }
}

/// State transitions and failures reported to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusEvent {
    /// The foot-pod service is being advertised
    Advertising,
    /// A central connected or a treadmill link came up
    Connected {
        /// Peer address
        peer: String,
    },
    /// Notifications were enabled
    Subscribed,
    /// Notifications were disabled by the central
    Unsubscribed,
    /// The link went down
    Disconnected {
        /// Peer address
        peer: String,
    },
    /// A second central was turned away
    Rejected {
        /// Peer address
        peer: String,
    },
    /// A matching treadmill was discovered
    TreadmillFound {
        /// Advertised name
        name: String,
        /// Device address
        address: String,
    },
    /// A connection attempt failed
    ConnectionFailed {
        /// Failure description
        reason: String,
    },
    /// Enabling notifications gave up
    SubscriptionFailed {
        /// Number of attempts made
        attempts: u32,
    },
    /// Treadmill data is flowing
    Streaming,
    /// A notification could not be decoded and was dropped
    DecodeFailed {
        /// Failure description
        reason: String,
    },
    /// Pushing a measurement failed
    NotificationFailed {
        /// Failure description
        reason: String,
    },
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Advertising => write!(f, "Advertising"),
            Self::Connected { peer } => write!(f, "Connected to {peer}"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Unsubscribed => write!(f, "Unsubscribed"),
            Self::Disconnected { peer } => write!(f, "Disconnected from {peer}"),
            Self::Rejected { peer } => write!(f, "Rejected {peer}"),
            Self::TreadmillFound { name, address } => write!(f, "Found {name} ({address})"),
            Self::ConnectionFailed { reason } => write!(f, "Connection failed: {reason}"),
            Self::SubscriptionFailed { attempts } => {
                write!(f, "Subscription failed after {attempts} attempt(s)")
            }
            Self::Streaming => write!(f, "Streaming"),
            Self::DecodeFailed { reason } => write!(f, "Decode failed: {reason}"),
            Self::NotificationFailed { reason } => write!(f, "Notification failed: {reason}"),
        }
    }
}

/// Exponential backoff between connection or subscription attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay in milliseconds
    pub initial_ms: u64,
    /// Upper bound for any delay in milliseconds
    pub max_ms: u64,
    /// Growth factor between consecutive delays
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 5_000,
            multiplier: 2,
        }
    }
}

impl BackoffConfig {
    /// Delay before the given retry, counting from zero
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier).saturating_pow(attempt);
        Duration::from_millis(self.initial_ms.saturating_mul(factor).min(self.max_ms))
    }
}

/// Sensor emulator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Pace and cadence to report
    pub footpod: FootpodConfig,
    /// Notification interval in milliseconds
    pub tick_ms: u64,
    /// Bound on a single notification write in milliseconds
    pub notify_timeout_ms: u64,
    /// Advertised local name
    pub local_name: String,
    /// Delay between re-advertising attempts
    pub backoff: BackoffConfig,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            footpod: FootpodConfig::default(),
            tick_ms: 1_000,
            notify_timeout_ms: 1_000,
            local_name: "Footpod".to_string(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl EmulatorConfig {
    /// Notification interval
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Check that every value is usable
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        self.footpod.validate()?;
        if self.tick_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "tick interval must be positive".to_string(),
            ));
        }
        if self.notify_timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "notification timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Treadmill reader settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Length of one scan window in milliseconds
    pub scan_window_ms: u64,
    /// Bound on a connection attempt in milliseconds
    pub connect_timeout_ms: u64,
    /// Bound on a subscription attempt in milliseconds
    pub subscribe_timeout_ms: u64,
    /// Subscription attempts before giving up
    pub max_subscribe_attempts: u32,
    /// Delay policy between failed attempts
    pub backoff: BackoffConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            scan_window_ms: 10_000,
            connect_timeout_ms: 10_000,
            subscribe_timeout_ms: 5_000,
            max_subscribe_attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ReaderConfig {
    /// Check that every value is usable
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.max_subscribe_attempts == 0 {
            return Err(BridgeError::InvalidConfig(
                "at least one subscription attempt is required".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.subscribe_timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footpod_defaults() {
        let config = FootpodConfig::default();
        assert!((config.pace_kmh - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.cadence_spm, 85);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_footpod_validation() {
        assert!(FootpodConfig::new(0.0, 85).validate().is_err());
        assert!(FootpodConfig::new(-3.0, 85).validate().is_err());
        assert!(FootpodConfig::new(f64::NAN, 85).validate().is_err());
        assert!(FootpodConfig::new(10.0, 0).validate().is_err());
        assert!(FootpodConfig::new(0.5, 1).validate().is_ok());
    }

    #[test]
    fn test_derived_speed_and_stride() {
        let config = FootpodConfig::new(12.0, 180);
        assert!((config.speed_mps() - 3.333).abs() < 0.001);
        // 3.333 m/s at 3 steps/s
        assert!((config.stride_length_m() - 1.111).abs() < 0.001);
    }

    #[test]
    fn test_backoff_is_capped() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(1_000));
        assert_eq!(backoff.delay(3), Duration::from_millis(4_000));
        assert_eq!(backoff.delay(4), Duration::from_millis(5_000));
        assert_eq!(backoff.delay(60), Duration::from_millis(5_000));
    }

    #[test]
    fn test_reader_config_defaults() {
        let config = ReaderConfig::default();
        assert_eq!(config.scan_window_ms, 10_000);
        assert_eq!(config.max_subscribe_attempts, 3);
        assert!(config.validate().is_ok());

        let config = ReaderConfig {
            max_subscribe_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_emulator_config_validation() {
        let config = EmulatorConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());

        let config = EmulatorConfig {
            tick_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connection_state_occupancy() {
        assert!(!ConnectionState::Idle.is_connected());
        assert!(!ConnectionState::Advertising.is_connected());
        assert!(ConnectionState::ConnectedUnsubscribed.is_connected());
        assert!(ConnectionState::ConnectedNotifying.is_connected());
    }

    #[test]
    fn test_record_speed_conversion() {
        let record = TreadmillRecord {
            flags: 0x0001,
            speed_mps: Some(25.6 / 3.6),
            ..Default::default()
        };
        assert!((record.speed_kmh().unwrap_or_default() - 25.6).abs() < 1e-9);
        assert!(record.has(0x0001));
        assert!(!record.has(0x0004));
    }
}
