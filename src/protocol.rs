use crate::{
    error::{BridgeError, Result},
    types::{ExpendedEnergy, TelemetrySample, TreadmillRecord},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the FTMS treadmill data flags field in bytes
pub const FTMS_FLAGS_SIZE: usize = 2;

/// Largest RSC measurement payload: flags, speed, cadence, stride length, distance
pub const RSC_MEASUREMENT_MAX_SIZE: usize = 10;

/// RSC features advertised by the emulator: stride length, total distance, running status
pub const RSC_FEATURES: u16 = 0x0007;

/// Flags byte of an RSC measurement
///
/// The same byte decides which optional fields the emulator writes and which
/// fields a receiver reads back, so encode and decode share this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RscFlags(u8);

impl RscFlags {
    /// Instantaneous stride length follows the cadence byte
    pub const STRIDE_LENGTH: Self = Self(0x01);
    /// Total distance follows the stride length
    pub const TOTAL_DISTANCE: Self = Self(0x02);
    /// Wearer is running rather than walking
    pub const RUNNING: Self = Self(0x04);

    /// Flags with no optional field
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build flags from a raw byte
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flags byte
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Check whether every bit of `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Combine two sets of flags
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl Default for RscFlags {
    fn default() -> Self {
        Self::STRIDE_LENGTH
            .union(Self::TOTAL_DISTANCE)
            .union(Self::RUNNING)
    }
}

/// RSC measurement as read back by a receiver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RscMeasurement {
    /// Flags the payload was encoded with
    pub flags: RscFlags,
    /// Instantaneous speed in m/s
    pub speed_mps: f64,
    /// Instantaneous cadence in steps per minute
    pub cadence_spm: u8,
    /// Stride length in metres
    pub stride_length_m: Option<f64>,
    /// Total distance in metres
    pub total_distance_m: Option<f64>,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantize_u16(value: f64) -> u16 {
    if !value.is_finite() || value <= 0.0 {
        0
    } else if value >= f64::from(u16::MAX) {
        u16::MAX
    } else {
        value as u16
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantize_u32(value: f64) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        0
    } else if value >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        value as u32
    }
}

/// Encode an RSC measurement notification
///
/// Layout, little-endian:
/// - Byte 0: flags
/// - Bytes 1-2: speed in 1/256 m/s
/// - Byte 3: cadence in steps per minute
/// - Bytes 4-5: stride length in 1/100 m, only with [`RscFlags::STRIDE_LENGTH`]
/// - Next 4 bytes: total distance in 1/10 m, only with [`RscFlags::TOTAL_DISTANCE`]
#[must_use]
pub fn encode_rsc_measurement(sample: &TelemetrySample, flags: RscFlags) -> Bytes {
    let mut buf = BytesMut::with_capacity(RSC_MEASUREMENT_MAX_SIZE);

    buf.put_u8(flags.bits());
    buf.put_u16_le(quantize_u16(sample.speed_mps * 256.0));
    buf.put_u8(u8::try_from(sample.cadence_spm).unwrap_or(u8::MAX));

    if flags.contains(RscFlags::STRIDE_LENGTH) {
        buf.put_u16_le(quantize_u16(sample.stride_length_m * 100.0));
    }

    if flags.contains(RscFlags::TOTAL_DISTANCE) {
        buf.put_u32_le(quantize_u32(sample.cumulative_distance_m * 10.0));
    }

    buf.freeze()
}

/// Decode an RSC measurement notification
///
/// # Errors
///
/// Returns [`BridgeError::TruncatedPayload`] if a field announced by the flags is missing.
pub fn decode_rsc_measurement(data: &[u8]) -> Result<RscMeasurement> {
    let truncated = |needed: usize| BridgeError::TruncatedPayload {
        needed,
        available: data.len(),
    };

    let flags = RscFlags::from_bits(*data.first().ok_or_else(|| truncated(1))?);
    let mut needed = 4;
    if flags.contains(RscFlags::STRIDE_LENGTH) {
        needed += 2;
    }
    if flags.contains(RscFlags::TOTAL_DISTANCE) {
        needed += 4;
    }
    if data.len() < needed {
        return Err(truncated(needed));
    }

    let mut buf = &data[1..];
    let speed_mps = f64::from(buf.get_u16_le()) / 256.0;
    let cadence_spm = buf.get_u8();

    let stride_length_m = flags
        .contains(RscFlags::STRIDE_LENGTH)
        .then(|| f64::from(buf.get_u16_le()) / 100.0);

    let total_distance_m = flags
        .contains(RscFlags::TOTAL_DISTANCE)
        .then(|| f64::from(buf.get_u32_le()) / 10.0);

    Ok(RscMeasurement {
        flags,
        speed_mps,
        cadence_spm,
        stride_length_m,
        total_distance_m,
    })
}

/// Value of the read-only RSC feature characteristic
#[must_use]
pub const fn rsc_feature_value() -> [u8; 2] {
    RSC_FEATURES.to_le_bytes()
}

/// Flag bits of the FTMS treadmill data characteristic
pub mod treadmill_flags {
    /// Instantaneous speed, u16 in 0.01 km/h
    pub const INSTANTANEOUS_SPEED: u16 = 1 << 0;
    /// Average speed, u16 in 0.01 km/h
    pub const AVERAGE_SPEED: u16 = 1 << 1;
    /// Total distance, u24 in metres
    pub const TOTAL_DISTANCE: u16 = 1 << 2;
    /// Inclination s16 in 0.1 % followed by ramp angle s16 in 0.1 degree
    pub const INCLINATION: u16 = 1 << 3;
    /// Positive then negative elevation gain, u16 each in 0.1 m
    pub const ELEVATION_GAIN: u16 = 1 << 4;
    /// Instantaneous pace, u8 in 0.1 km/min
    pub const INSTANTANEOUS_PACE: u16 = 1 << 5;
    /// Average pace, u8 in 0.1 km/min
    pub const AVERAGE_PACE: u16 = 1 << 6;
    /// Total u16, per hour u16 and per minute u8 energy in kcal
    pub const EXPENDED_ENERGY: u16 = 1 << 7;
    /// Heart rate, u8 in bpm
    pub const HEART_RATE: u16 = 1 << 8;
    /// Metabolic equivalent, u8 in 0.1 MET
    pub const METABOLIC_EQUIVALENT: u16 = 1 << 9;
    /// Elapsed time, u16 in seconds
    pub const ELAPSED_TIME: u16 = 1 << 10;
    /// Remaining time, u16 in seconds
    pub const REMAINING_TIME: u16 = 1 << 11;
    /// Force on belt s16 in newtons followed by power output s16 in watts
    pub const FORCE_AND_POWER: u16 = 1 << 12;
    /// Bits with no assigned field
    pub const RESERVED: u16 = 0xE000;
}

type FieldDecoder = fn(&[u8], &mut TreadmillRecord);

/// One optional FTMS field: the flag bit that announces it and its encoded width
struct FieldLayout {
    bit: u16,
    width: usize,
    decode: FieldDecoder,
}

// Order is the on-air order; each entry consumes exactly `width` bytes.
const TREADMILL_FIELDS: [FieldLayout; 13] = [
    FieldLayout {
        bit: treadmill_flags::INSTANTANEOUS_SPEED,
        width: 2,
        decode: decode_speed,
    },
    FieldLayout {
        bit: treadmill_flags::AVERAGE_SPEED,
        width: 2,
        decode: decode_average_speed,
    },
    FieldLayout {
        bit: treadmill_flags::TOTAL_DISTANCE,
        width: 3,
        decode: decode_total_distance,
    },
    FieldLayout {
        bit: treadmill_flags::INCLINATION,
        width: 4,
        decode: decode_inclination,
    },
    FieldLayout {
        bit: treadmill_flags::ELEVATION_GAIN,
        width: 4,
        decode: decode_elevation_gain,
    },
    FieldLayout {
        bit: treadmill_flags::INSTANTANEOUS_PACE,
        width: 1,
        decode: decode_pace,
    },
    FieldLayout {
        bit: treadmill_flags::AVERAGE_PACE,
        width: 1,
        decode: decode_average_pace,
    },
    FieldLayout {
        bit: treadmill_flags::EXPENDED_ENERGY,
        width: 5,
        decode: decode_energy,
    },
    FieldLayout {
        bit: treadmill_flags::HEART_RATE,
        width: 1,
        decode: decode_heart_rate,
    },
    FieldLayout {
        bit: treadmill_flags::METABOLIC_EQUIVALENT,
        width: 1,
        decode: decode_metabolic_equivalent,
    },
    FieldLayout {
        bit: treadmill_flags::ELAPSED_TIME,
        width: 2,
        decode: decode_elapsed_time,
    },
    FieldLayout {
        bit: treadmill_flags::REMAINING_TIME,
        width: 2,
        decode: decode_remaining_time,
    },
    FieldLayout {
        bit: treadmill_flags::FORCE_AND_POWER,
        width: 4,
        decode: decode_force_and_power,
    },
];

fn kmh_hundredths_to_mps(raw: u16) -> f64 {
    f64::from(raw) / 100.0 / 3.6
}

fn decode_speed(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.speed_mps = Some(kmh_hundredths_to_mps(buf.get_u16_le()));
}

fn decode_average_speed(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.average_speed_mps = Some(kmh_hundredths_to_mps(buf.get_u16_le()));
}

#[allow(clippy::cast_possible_truncation)]
fn decode_total_distance(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.total_distance_m = Some(buf.get_uint_le(3) as u32);
}

fn decode_inclination(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.incline_percent = Some(f64::from(buf.get_i16_le()) / 10.0);
    record.ramp_angle_deg = Some(f64::from(buf.get_i16_le()) / 10.0);
}

fn decode_elevation_gain(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.elevation_gain_positive_m = Some(f64::from(buf.get_u16_le()) / 10.0);
    record.elevation_gain_negative_m = Some(f64::from(buf.get_u16_le()) / 10.0);
}

fn decode_pace(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.pace_km_per_min = Some(f64::from(buf.get_u8()) / 10.0);
}

fn decode_average_pace(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.average_pace_km_per_min = Some(f64::from(buf.get_u8()) / 10.0);
}

fn decode_energy(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.energy = Some(ExpendedEnergy {
        total_kcal: buf.get_u16_le(),
        per_hour_kcal: buf.get_u16_le(),
        per_minute_kcal: buf.get_u8(),
    });
}

fn decode_heart_rate(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.heart_rate_bpm = Some(buf.get_u8());
}

fn decode_metabolic_equivalent(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.metabolic_equivalent = Some(f64::from(buf.get_u8()) / 10.0);
}

fn decode_elapsed_time(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.elapsed_time_s = Some(buf.get_u16_le());
}

fn decode_remaining_time(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.remaining_time_s = Some(buf.get_u16_le());
}

fn decode_force_and_power(mut buf: &[u8], record: &mut TreadmillRecord) {
    record.force_on_belt_n = Some(buf.get_i16_le());
    record.power_output_w = Some(buf.get_i16_le());
}

/// Number of bytes a treadmill data payload with these flags occupies
#[must_use]
pub fn treadmill_data_len(flags: u16) -> usize {
    TREADMILL_FIELDS
        .iter()
        .filter(|field| flags & field.bit != 0)
        .map(|field| field.width)
        .sum::<usize>()
        + FTMS_FLAGS_SIZE
}

/// Decode an FTMS treadmill data notification
///
/// The payload starts with a 16-bit little-endian flags field. Each set bit
/// announces one field; fields follow in bit order with fixed widths, so the
/// flags alone decide every offset. Bytes after the last announced field are
/// ignored.
///
/// # Errors
///
/// Returns [`BridgeError::TruncatedPayload`] if the payload ends inside the flags or
/// inside an announced field, and [`BridgeError::MalformedFlags`] if a reserved bit is set.
/// No partial record is ever returned.
pub fn decode_treadmill_data(data: &[u8]) -> Result<TreadmillRecord> {
    if data.len() < FTMS_FLAGS_SIZE {
        return Err(BridgeError::TruncatedPayload {
            needed: FTMS_FLAGS_SIZE,
            available: data.len(),
        });
    }

    let flags = u16::from_le_bytes([data[0], data[1]]);
    if flags & treadmill_flags::RESERVED != 0 {
        return Err(BridgeError::MalformedFlags { flags });
    }

    let mut record = TreadmillRecord {
        flags,
        ..TreadmillRecord::default()
    };

    let mut offset = FTMS_FLAGS_SIZE;
    for field in &TREADMILL_FIELDS {
        if flags & field.bit == 0 {
            continue;
        }

        let end = offset + field.width;
        let bytes = data
            .get(offset..end)
            .ok_or(BridgeError::TruncatedPayload {
                needed: end,
                available: data.len(),
            })?;

        (field.decode)(bytes, &mut record);
        offset = end;
    }

    Ok(record)
}
