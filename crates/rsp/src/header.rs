//! Packet header codec
//!
//! Decoding and validation of the fixed 16-byte packet header, plus the
//! synthetic header written into gap-filled packets so that downstream
//! consumers still see a monotonic timestamp/sequence progression.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::warn;

use crate::{EPOCH_2008, HEADER_LEN, MAX_BEAMLETS, MAX_SEQUENCE, MIN_VERSION, TIME_SLICES};

/// Errors raised while decoding or validating a packet header.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header truncated: {actual} bytes, need {HEADER_LEN}")]
    Truncated { actual: usize },

    #[error("protocol version {0} below supported minimum {MIN_VERSION}")]
    UnsupportedVersion(u8),

    #[error("timestamp {0} predates the 2008 epoch")]
    TimestampBeforeEpoch(u32),

    #[error("sequence {0} above the 200 MHz clock maximum {MAX_SEQUENCE}")]
    SequenceTooHigh(u32),

    #[error("{0} beamlets on one stream exceeds the hardware maximum {MAX_BEAMLETS}")]
    TooManyBeamlets(u8),

    #[error("{0} time slices per packet, expected {TIME_SLICES}")]
    BadTimeSliceCount(u8),

    #[error("bit mode 3 does not exist")]
    InvalidBitMode,

    #[error("reserved source bits are set")]
    ReservedBitsSet,

    #[error("error bit set by the station backend")]
    ErrorBitSet,
}

/// Sample width of the packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitMode {
    Bits16,
    Bits8,
    Bits4,
}

impl BitMode {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(BitMode::Bits16),
            1 => Some(BitMode::Bits8),
            2 => Some(BitMode::Bits4),
            _ => None,
        }
    }

    /// Bits per sample component on the wire.
    pub fn bits(self) -> u8 {
        match self {
            BitMode::Bits16 => 16,
            BitMode::Bits8 => 8,
            BitMode::Bits4 => 4,
        }
    }

    /// Payload bytes for one beamlet-packet in this mode:
    /// 16 time slices of 4 components.
    pub fn beamlet_bytes(self) -> usize {
        TIME_SLICES * crate::N_POLS * self.bits() as usize / 8
    }
}

/// The two source bytes at header offsets 1..3, unpacked.
///
/// Byte 1 carries the RSP id (bits 0-4), a reserved padding bit (5), the
/// backend error bit (6) and the clock bit (7). Byte 2 carries the bit mode
/// (bits 0-1) and six more padding bits, of which the lowest doubles as the
/// station's replay-warning marker and the highest is our own
/// synthesized-packet marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceField {
    pub rsp: u8,
    pub padding0: bool,
    pub error_bit: bool,
    /// true = 200 MHz sample clock, false = 160 MHz.
    pub clock_200mhz: bool,
    pub bit_mode_raw: u8,
    pub padding1: u8,
}

impl SourceField {
    /// Unpack from the two raw source bytes.
    pub fn from_bytes(b1: u8, b2: u8) -> Self {
        Self {
            rsp: b1 & 0x1f,
            padding0: b1 & 0x20 != 0,
            error_bit: b1 & 0x40 != 0,
            clock_200mhz: b1 & 0x80 != 0,
            bit_mode_raw: b2 & 0x03,
            padding1: (b2 >> 2) & 0x3f,
        }
    }

    pub fn bit_mode(&self) -> Option<BitMode> {
        BitMode::from_raw(self.bit_mode_raw)
    }

    /// The station re-sent this packet from its own replay buffer.
    pub fn replay_warning(&self) -> bool {
        self.padding1 == 1
    }
}

/// A decoded packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub source: SourceField,
    pub configuration: u8,
    pub station_id: u16,
    pub beamlet_count: u8,
    pub time_slices: u8,
    pub timestamp: u32,
    pub sequence: u32,
}

impl PacketHeader {
    /// Decode a header from the first 16 bytes of `data`.
    ///
    /// Decoding is lenient; call [`PacketHeader::validate`] to apply the
    /// integrity checks used at capture-open time.
    pub fn parse(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < HEADER_LEN {
            return Err(HeaderError::Truncated { actual: data.len() });
        }

        let source = SourceField::from_bytes(data[1], data[2]);

        let mut tail = Cursor::new(&data[4..HEADER_LEN]);
        // The reads below cannot fail: the cursor holds exactly 12 bytes.
        let station_id = tail.read_u16::<LittleEndian>().unwrap();
        let beamlet_count = tail.read_u8().unwrap();
        let time_slices = tail.read_u8().unwrap();
        let timestamp = tail.read_u32::<LittleEndian>().unwrap();
        let sequence = tail.read_u32::<LittleEndian>().unwrap();

        Ok(Self {
            version: data[0],
            source,
            configuration: data[3],
            station_id,
            beamlet_count,
            time_slices,
            timestamp,
            sequence,
        })
    }

    /// Apply the open-time integrity checks.
    ///
    /// A set replay-warning bit is logged but tolerated; every other
    /// irregularity is fatal for the capture.
    pub fn validate(&self) -> Result<(), HeaderError> {
        if self.version < MIN_VERSION {
            return Err(HeaderError::UnsupportedVersion(self.version));
        }
        if self.timestamp < EPOCH_2008 {
            return Err(HeaderError::TimestampBeforeEpoch(self.timestamp));
        }
        if self.sequence > MAX_SEQUENCE {
            return Err(HeaderError::SequenceTooHigh(self.sequence));
        }
        if self.beamlet_count > MAX_BEAMLETS {
            return Err(HeaderError::TooManyBeamlets(self.beamlet_count));
        }
        if self.time_slices as usize != TIME_SLICES {
            return Err(HeaderError::BadTimeSliceCount(self.time_slices));
        }
        if self.source.padding0 {
            return Err(HeaderError::ReservedBitsSet);
        }
        if self.source.error_bit {
            return Err(HeaderError::ErrorBitSet);
        }
        if self.source.bit_mode().is_none() {
            return Err(HeaderError::InvalidBitMode);
        }
        if self.source.padding1 > 1 {
            return Err(HeaderError::ReservedBitsSet);
        }
        if self.source.replay_warning() {
            warn!(
                station = self.station_id,
                "replay-warning bit set; the station re-sent buffered data"
            );
        }
        Ok(())
    }

    /// Station code number, e.g. 607 for SE607 (raw id / 32).
    pub fn station_number(&self) -> u16 {
        self.station_id / 32
    }
}

/// The header written over a gap-filled packet slot.
///
/// Carries the previous good packet's timestamp forward with the sequence a
/// directly following packet would have had, and flags the slot with the
/// synthesized-packet marker (top bit of source byte 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticHeader {
    pub timestamp: u32,
    pub sequence: u32,
}

impl SyntheticHeader {
    /// Build the header of the packet directly following `last_good` (a raw
    /// 16-byte header of the last correctly received packet).
    pub fn following(last_good: &[u8]) -> Self {
        Self {
            timestamp: u32::from_le_bytes(last_good[8..12].try_into().unwrap()),
            sequence: crate::time::next_sequence(last_good),
        }
    }

    /// Serialize into a raw header buffer, preserving the non-time fields
    /// already present.
    pub fn write_into(&self, header: &mut [u8]) {
        header[8..12].copy_from_slice(&self.timestamp.to_le_bytes());
        header[12..16].copy_from_slice(&self.sequence.to_le_bytes());
        // Mask off first so re-marking an already synthetic slot is stable.
        header[2] = (header[2] & 0x7f) | 0x80;
    }

    /// Whether a raw header carries the synthesized-packet marker.
    pub fn is_marked(header: &[u8]) -> bool {
        header[2] & 0x80 != 0
    }
}
