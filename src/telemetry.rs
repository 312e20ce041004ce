use std::time::Duration;

use crate::types::{FootpodConfig, TelemetrySample};

// cadence (steps/min) times elapsed milliseconds per whole stride
const STEP_MS_PER_STRIDE: u64 = 60_000;

/// Produces foot-pod telemetry at a fixed tick interval
///
/// Distance and stride counters belong to the generator and only move forward
/// until [`TelemetryGenerator::reset`] starts a new session. Fractional strides
/// are carried between ticks, in integer step-milliseconds, so the stride count
/// tracks the configured cadence without rounding drift.
#[derive(Debug, Clone)]
pub struct TelemetryGenerator {
    config: FootpodConfig,
    tick_interval: Duration,
    stride_count: u64,
    stride_carry: u64,
    distance_m: f64,
}

impl TelemetryGenerator {
    /// Create a generator for the given pace, cadence and tick interval
    #[must_use]
    pub const fn new(config: FootpodConfig, tick_interval: Duration) -> Self {
        Self {
            config,
            tick_interval,
            stride_count: 0,
            stride_carry: 0,
            distance_m: 0.0,
        }
    }

    /// Configuration the generator runs with
    #[must_use]
    pub const fn config(&self) -> &FootpodConfig {
        &self.config
    }

    /// Interval between ticks
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Start a new session with zeroed counters
    pub fn reset(&mut self) {
        self.stride_count = 0;
        self.stride_carry = 0;
        self.distance_m = 0.0;
    }

    /// Advance by one tick and return the resulting sample
    pub fn tick(&mut self) -> TelemetrySample {
        self.distance_m += self.config.speed_mps() * self.tick_interval.as_secs_f64();

        let tick_ms = u64::try_from(self.tick_interval.as_millis()).unwrap_or(u64::MAX);
        self.stride_carry = self
            .stride_carry
            .saturating_add(u64::from(self.config.cadence_spm).saturating_mul(tick_ms));
        self.stride_count += self.stride_carry / STEP_MS_PER_STRIDE;
        self.stride_carry %= STEP_MS_PER_STRIDE;

        self.sample()
    }

    /// Current sample without advancing
    #[must_use]
    pub fn sample(&self) -> TelemetrySample {
        TelemetrySample {
            speed_mps: self.config.speed_mps(),
            cadence_spm: self.config.cadence_spm,
            stride_length_m: self.config.stride_length_m(),
            stride_count: self.stride_count,
            cumulative_distance_m: self.distance_m,
        }
    }
}
