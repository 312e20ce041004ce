use thiserror::Error;

/// Errors raised by the foot-pod emulator, the treadmill reader and the codec
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Bluetooth Low Energy errors from the central stack
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Errors from the `BlueZ` peripheral stack
    #[error("BlueZ error: {0}")]
    Bluez(String),

    /// No usable Bluetooth adapter or service
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    /// Advertising the foot-pod service failed
    #[error("Failed to advertise: {0}")]
    AdvertisingFailed(String),

    /// The treadmill refused the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// The connection attempt did not complete in time
    #[error("Connection timed out after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Enabling treadmill data notifications failed repeatedly
    #[error("Subscription failed after {attempts} attempt(s)")]
    SubscriptionFailed {
        /// Number of attempts made
        attempts: u32,
    },

    /// Payload ended before a field mandated by its flags
    #[error("Truncated payload: needed {needed} bytes, got {available}")]
    TruncatedPayload {
        /// Bytes required to read up to and including the missing field
        needed: usize,
        /// Bytes actually present
        available: usize,
    },

    /// Flags field carries reserved bits
    #[error("Malformed flags: {flags:#06X}")]
    MalformedFlags {
        /// Raw flags value
        flags: u16,
    },

    /// Pushing a notification to the central failed
    #[error("Notification write failed: {0}")]
    NotificationWriteFailed(String),

    /// Configuration values out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Check if this error terminates the role that raised it
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AdapterUnavailable
                | Self::AdvertisingFailed(_)
                | Self::SubscriptionFailed { .. }
                | Self::InvalidConfig(_)
        )
    }

    /// Check if this error is recovered by returning to an earlier state
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused(_)
                | Self::ConnectionTimeout { .. }
                | Self::NotificationWriteFailed(_)
                | Self::TruncatedPayload { .. }
                | Self::MalformedFlags { .. }
        )
    }

    /// Check if this error only drops a single payload
    #[must_use]
    pub const fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::TruncatedPayload { .. } | Self::MalformedFlags { .. }
        )
    }
}

#[cfg(target_os = "linux")]
impl From<bluer::Error> for BridgeError {
    fn from(err: bluer::Error) -> Self {
        Self::Bluez(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let adapter = BridgeError::AdapterUnavailable;
        assert!(adapter.is_fatal());
        assert!(!adapter.is_recoverable());
        assert!(!adapter.is_decode_error());

        let timeout = BridgeError::ConnectionTimeout { timeout_ms: 5000 };
        assert!(!timeout.is_fatal());
        assert!(timeout.is_recoverable());

        let truncated = BridgeError::TruncatedPayload {
            needed: 4,
            available: 1,
        };
        assert!(truncated.is_recoverable());
        assert!(truncated.is_decode_error());

        let subscription = BridgeError::SubscriptionFailed { attempts: 3 };
        assert!(subscription.is_fatal());
        assert!(!subscription.is_decode_error());
    }

    #[test]
    fn test_error_display() {
        let error = BridgeError::MalformedFlags { flags: 0xE001 };
        let error_string = format!("{error}");
        assert!(error_string.contains("Malformed flags"));
        assert!(error_string.contains("0xE001"));

        let error = BridgeError::TruncatedPayload {
            needed: 4,
            available: 1,
        };
        assert_eq!(
            format!("{error}"),
            "Truncated payload: needed 4 bytes, got 1"
        );
    }
}
