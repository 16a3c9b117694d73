//! Wire format of the CEP/RSP beamformed packet stream
//!
//! This crate decodes the 16-byte packet header emitted by a station's RSP
//! boards, derives the monotonic packet number used to align multiple
//! capture streams, and decodes the 4/8/16-bit complex sample payloads.
//!
//! The header layout, byte for byte:
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0      | protocol version |
//! | 1..3   | source bitfield (RSP id, clock bit, bit mode, flags) |
//! | 3      | configuration id |
//! | 4..6   | station id (LE) |
//! | 6      | beamlets per packet |
//! | 7      | time slices per packet (always 16) |
//! | 8..12  | timestamp, unix seconds (LE) |
//! | 12..16 | sequence within the second (LE) |

pub mod header;
pub mod packet;
pub mod samples;
pub mod station;
pub mod time;

pub use header::{BitMode, HeaderError, PacketHeader, SourceField, SyntheticHeader};
pub use packet::Packet;
pub use samples::{Bit4, Bit8, Bit16, InputFormat};
pub use station::station_code;
pub use self::time::{
    packet_from_isot, packet_from_unix, packet_number, packet_time, packet_time_mjd,
    packets_from_seconds,
};

/// Result type for header parsing operations.
pub type Result<T> = std::result::Result<T, HeaderError>;

/// Length of the packet header in bytes.
pub const HEADER_LEN: usize = 16;

/// Time slices (samples per beamlet) in every packet.
pub const TIME_SLICES: usize = 16;

/// Polarization components per sample: X-re, X-im, Y-re, Y-im.
pub const N_POLS: usize = 4;

/// Maximum number of parallel capture streams a station produces.
pub const MAX_PORTS: usize = 4;

/// Hardware ceiling on beamlets per stream (4-bit mode).
pub const MAX_BEAMLETS: u8 = 244;

/// Lowest packet protocol version this crate understands.
pub const MIN_VERSION: u8 = 3;

/// Unix timestamp of 2008-01-01T00:00:00, the earliest plausible capture.
pub const EPOCH_2008: u32 = 1_199_145_600;

/// Highest sequence value the 200 MHz clock can produce within one second.
pub const MAX_SEQUENCE: u32 = 195_313;

/// Time steps per second at the 200 MHz sample clock.
pub const CLOCK_200MHZ_STEPS: f64 = 195_312.5;

/// Time steps per second at the 160 MHz sample clock.
pub const CLOCK_160MHZ_STEPS: f64 = 156_250.0;

/// Packets per second per stream at the 200 MHz clock.
pub const CLOCK_200MHZ_PACKET_RATE: f64 = CLOCK_200MHZ_STEPS / TIME_SLICES as f64;

/// Packets per second per stream at the 160 MHz clock.
pub const CLOCK_160MHZ_PACKET_RATE: f64 = CLOCK_160MHZ_STEPS / TIME_SLICES as f64;
