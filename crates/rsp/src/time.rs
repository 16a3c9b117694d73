//! Packet-number and time derivation
//!
//! The station emits one packet per 16 time steps. The packet number is a
//! monotonic index derived from the header timestamp, the within-second
//! sequence, and the sample clock; it is the quantity every alignment
//! decision in the reader operates on.
//!
//! The formula follows Olaf Wucknitz' VLBI recorder convention:
//! `((ts · 10^6 · (160 + 40·clock) + 512) / 1024 + seq) / 16` in integer
//! arithmetic.

use time::PrimitiveDateTime;
use time::macros::format_description;

use crate::{CLOCK_160MHZ_STEPS, CLOCK_200MHZ_STEPS, HeaderError, TIME_SLICES};

/// Packet number for an explicit timestamp/sequence/clock triple.
#[inline]
pub fn beamformed_packet_number(timestamp: u32, sequence: u32, clock_200mhz: bool) -> i64 {
    let clock = clock_200mhz as i64;
    ((timestamp as i64 * 1_000_000 * (160 + 40 * clock) + 512) / 1024 + sequence as i64) / 16
}

/// Packet number of a raw packet, reading the header fields in place.
#[inline]
pub fn packet_number(header: &[u8]) -> i64 {
    let timestamp = u32::from_le_bytes(header[8..12].try_into().unwrap());
    let sequence = u32::from_le_bytes(header[12..16].try_into().unwrap());
    beamformed_packet_number(timestamp, sequence, header[1] & 0x80 != 0)
}

/// Sequence value of the packet directly following this one.
///
/// Overflows into the next second's numbering rather than incrementing the
/// timestamp, matching what the station itself would emit.
#[inline]
pub fn next_sequence(header: &[u8]) -> u32 {
    let timestamp = u32::from_le_bytes(header[8..12].try_into().unwrap());
    (16 * (packet_number(header) + 1) - (timestamp as i64 * 1_000_000 * 200 + 512) / 1024) as u32
}

/// Unix time of the first sample in a packet, fractional seconds included.
pub fn packet_time(header: &[u8]) -> f64 {
    let timestamp = u32::from_le_bytes(header[8..12].try_into().unwrap());
    let sequence = u32::from_le_bytes(header[12..16].try_into().unwrap());
    let steps = if header[1] & 0x80 != 0 {
        CLOCK_200MHZ_STEPS
    } else {
        CLOCK_160MHZ_STEPS
    };
    timestamp as f64 + sequence as f64 / steps
}

/// Modified Julian Date of the first sample in a packet.
pub fn packet_time_mjd(header: &[u8]) -> f64 {
    packet_time(header) / 86_400.0 + 40_587.0
}

/// First packet number at or after a unix timestamp.
pub fn packet_from_unix(timestamp: u32, clock_200mhz: bool) -> i64 {
    beamformed_packet_number(timestamp, 0, clock_200mhz)
}

/// First packet number at or after an ISO-8601 time string
/// (`YYYY-MM-DDTHH:MM:SS`, UTC).
pub fn packet_from_isot(isot: &str, clock_200mhz: bool) -> Result<i64, HeaderError> {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    let parsed = PrimitiveDateTime::parse(isot, &format)
        .map_err(|_| HeaderError::TimestampBeforeEpoch(0))?;
    let unix = parsed.assume_utc().unix_timestamp();
    Ok(packet_from_unix(unix as u32, clock_200mhz))
}

/// Number of packets a stream produces in `seconds` of wall time.
pub fn packets_from_seconds(seconds: f64, clock_200mhz: bool) -> i64 {
    let steps = if clock_200mhz {
        CLOCK_200MHZ_STEPS
    } else {
        CLOCK_160MHZ_STEPS
    };
    (seconds * steps / TIME_SLICES as f64) as i64
}
