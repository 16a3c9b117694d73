//! Whole-packet view: header plus payload.

use bytes::Bytes;

use crate::{HEADER_LEN, HeaderError, PacketHeader};

/// A parsed packet: validated header and its payload bytes.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    /// Parse one packet from the front of `data`.
    ///
    /// The payload length is derived from the header's beamlet count and bit
    /// mode; trailing bytes beyond one packet are ignored.
    pub fn parse(data: Bytes) -> Result<Self, HeaderError> {
        let header = PacketHeader::parse(&data)?;
        header.validate()?;

        // validate() guarantees a legal bit mode.
        let bit_mode = header.source.bit_mode().unwrap();
        let payload_len = header.beamlet_count as usize * bit_mode.beamlet_bytes();
        let total = HEADER_LEN + payload_len;
        if data.len() < total {
            return Err(HeaderError::Truncated { actual: data.len() });
        }

        Ok(Self {
            header,
            payload: data.slice(HEADER_LEN..total),
        })
    }

    /// Total wire length of this packet in bytes.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}
