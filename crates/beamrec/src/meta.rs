//! Observation metadata and per-stream state
//!
//! One [`ObsMeta`] describes the whole capture (shared geometry, mode,
//! progress counters); one [`PortState`] tracks each input stream (its
//! beamlet range, drop counters and packet buffer).

use rsp::{BitMode, HEADER_LEN, MAX_BEAMLETS, PacketHeader};
use tracing::{debug, warn};

use crate::ReaderError;
use crate::buffer::PortBuffer;
use crate::calibration::CalibrateMode;
use crate::dispatch::{ProcessingMode, StokesParam};

/// Per-stream state.
#[derive(Debug)]
pub struct PortState {
    /// Wire length of one packet on this stream, header included.
    pub packet_len: usize,
    /// Beamlets on the wire.
    pub raw_beamlets: usize,
    /// First beamlet this stream contributes after user limits.
    pub base_beamlet: usize,
    /// One past the last contributed beamlet.
    pub upper_beamlet: usize,
    /// Processed beamlets contributed by lower-numbered streams.
    pub cumulative_beamlets: usize,
    /// Raw beamlets carried by lower-numbered streams.
    pub raw_cumulative_beamlets: usize,
    /// Net packets dropped during the last iteration. Negative means more
    /// out-of-order packets were discarded than gaps were filled.
    pub last_dropped: i64,
    /// Lifetime dropped-packet total.
    pub total_dropped: i64,
    /// Byte offset within the logical buffer where the next read lands.
    pub data_offset: usize,
    /// The stream's packet buffer.
    pub buffer: PortBuffer,
}

impl PortState {
    /// Beamlets this stream contributes to the processed output.
    pub fn proc_beamlets(&self) -> usize {
        self.upper_beamlet - self.base_beamlet
    }
}

/// Whole-capture metadata.
#[derive(Debug)]
pub struct ObsMeta {
    pub num_ports: usize,
    /// Packets processed per iteration right now (shrinks near EOF/cap).
    pub packets_per_iteration: usize,
    pub input_bit_mode: BitMode,
    pub output_bits: u8,
    pub processing_mode: ProcessingMode,
    pub calibrate: CalibrateMode,
    pub dual_stokes_pair: (StokesParam, StokesParam),
    pub total_raw_beamlets: usize,
    pub total_proc_beamlets: usize,
    pub num_outputs: usize,
    /// Bytes one packet contributes to each output.
    pub packet_output_bytes: Vec<usize>,
    /// Packet number every stream's slot 0 holds after alignment; advanced
    /// by M each iteration.
    pub last_packet: i64,
    /// First packet of the iteration being processed.
    pub leading_packet: i64,
    pub packets_read: i64,
    pub packets_read_max: i64,
    pub clock_200mhz: bool,
    pub replay_dropped_packets: bool,
    pub station_id: u16,
    pub input_ready: bool,
    pub output_ready: bool,
}

/// Header-derived facts about one port, before buffers exist.
#[derive(Debug, Clone)]
pub(crate) struct PortLayout {
    pub packet_len: usize,
    pub raw_beamlets: usize,
    pub base_beamlet: usize,
    pub upper_beamlet: usize,
    pub cumulative_beamlets: usize,
    pub raw_cumulative_beamlets: usize,
}

/// Shared facts extracted from the first header of every port.
#[derive(Debug, Clone)]
pub(crate) struct CaptureLayout {
    pub ports: Vec<PortLayout>,
    pub bit_mode: BitMode,
    pub clock_200mhz: bool,
    pub station_id: u16,
    pub total_raw_beamlets: usize,
    pub total_proc_beamlets: usize,
}

/// Which ports a beamlet selection leaves alive.
///
/// Ports wholly outside the selected range carry no output; dropping them
/// up front avoids reading their captures at all. Returned limits are
/// rebased onto the surviving ports.
pub(crate) fn trim_ports_for_limits(
    headers: &[[u8; HEADER_LEN]],
    limits: (usize, usize),
) -> Result<(std::ops::Range<usize>, (usize, usize)), ReaderError> {
    let (lower, upper) = limits;
    let mut first_port = 0;
    let mut last_port = headers.len() - 1;
    let mut cumulative = 0usize;

    let mut raw_counts = Vec::with_capacity(headers.len());
    for (port, header) in headers.iter().enumerate() {
        let parsed =
            PacketHeader::parse(header).map_err(|source| ReaderError::malformed(port, source))?;
        raw_counts.push(parsed.beamlet_count as usize);
    }

    for (port, &count) in raw_counts.iter().enumerate() {
        if lower > 0 && cumulative <= lower && lower < cumulative + count {
            first_port = port;
        }
        if upper > 0 && cumulative < upper && upper <= cumulative + count {
            last_port = port;
        }
        cumulative += count;
    }

    if first_port > last_port {
        return Err(ReaderError::Config(format!(
            "beamlet limits {lower}..{upper} select no whole port range"
        )));
    }

    let dropped_before: usize = raw_counts[..first_port].iter().sum();
    let rebased = (
        lower.saturating_sub(dropped_before),
        if upper > 0 { upper - dropped_before } else { 0 },
    );
    if first_port > 0 || last_port + 1 < headers.len() {
        debug!(
            first_port,
            last_port, "beamlet limits drop ports outside the selection"
        );
    }
    Ok((first_port..last_port + 1, rebased))
}

/// Parse and cross-check the first header of every port.
///
/// Enforces the open-time invariants: valid headers everywhere, one bit
/// mode, one clock. Applies the (already rebased) beamlet limits to carve
/// each port's contribution to the processed band.
pub(crate) fn parse_headers(
    headers: &[[u8; HEADER_LEN]],
    limits: (usize, usize),
) -> Result<CaptureLayout, ReaderError> {
    let mut ports = Vec::with_capacity(headers.len());
    let mut bit_mode = None;
    let mut clock_200mhz = false;
    let mut station_id = 0;
    let mut total_raw = 0usize;
    let mut total_proc = 0usize;

    let (lower, upper) = limits;

    for (port, header) in headers.iter().enumerate() {
        let parsed =
            PacketHeader::parse(header).map_err(|source| ReaderError::malformed(port, source))?;
        parsed
            .validate()
            .map_err(|source| ReaderError::malformed(port, source))?;

        // validate() guarantees the bit mode exists.
        let mode = parsed.source.bit_mode().unwrap();
        match bit_mode {
            None => {
                bit_mode = Some(mode);
                clock_200mhz = parsed.source.clock_200mhz;
                station_id = parsed.station_number();
            }
            Some(cached) => {
                if cached != mode {
                    return Err(ReaderError::Config(format!(
                        "port {port} uses {}-bit samples, port 0 uses {}-bit; parse the ports separately",
                        mode.bits(),
                        cached.bits()
                    )));
                }
                if clock_200mhz != parsed.source.clock_200mhz {
                    return Err(ReaderError::ClockMismatch { port });
                }
            }
        }

        let raw_beamlets = parsed.beamlet_count as usize;
        let mut base_beamlet = 0;
        let mut upper_beamlet = raw_beamlets;

        // The limits are absolute beamlet indices over the concatenated
        // ports; lower is inclusive, upper exclusive, zero means unset.
        if upper > 0 && upper > total_raw && upper <= total_raw + raw_beamlets {
            upper_beamlet = upper - total_raw;
        }
        if lower > 0 && lower >= total_raw && lower < total_raw + raw_beamlets {
            base_beamlet = lower - total_raw;
        }

        let packet_len = HEADER_LEN + raw_beamlets * mode.beamlet_bytes();

        ports.push(PortLayout {
            packet_len,
            raw_beamlets,
            base_beamlet,
            upper_beamlet,
            cumulative_beamlets: total_proc,
            raw_cumulative_beamlets: total_raw,
        });

        total_proc += upper_beamlet - base_beamlet;
        total_raw += raw_beamlets;

        if port > 0 && ports[port].packet_len != ports[port - 1].packet_len {
            warn!(
                port,
                "packet lengths differ between ports; proceeding with caution"
            );
        }
    }

    debug_assert!(total_raw <= headers.len() * MAX_BEAMLETS as usize);
    Ok(CaptureLayout {
        ports,
        bit_mode: bit_mode.expect("at least one port"),
        clock_200mhz,
        station_id,
        total_raw_beamlets: total_raw,
        total_proc_beamlets: total_proc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(beamlets: u8, bit_mode: u8, clock: bool) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[0] = 3;
        h[1] = if clock { 0x80 } else { 0 };
        h[2] = bit_mode;
        h[4..6].copy_from_slice(&(607u16 * 32).to_le_bytes());
        h[6] = beamlets;
        h[7] = 16;
        h[8..12].copy_from_slice(&1_600_000_000u32.to_le_bytes());
        h
    }

    #[test]
    fn two_ports_accumulate_beamlets() {
        let layout = parse_headers(&[header(61, 1, true), header(61, 1, true)], (0, 0)).unwrap();
        assert_eq!(layout.total_raw_beamlets, 122);
        assert_eq!(layout.total_proc_beamlets, 122);
        assert_eq!(layout.station_id, 607);
        assert!(layout.clock_200mhz);
        assert_eq!(layout.ports[0].cumulative_beamlets, 0);
        assert_eq!(layout.ports[1].cumulative_beamlets, 61);
        assert_eq!(layout.ports[1].raw_cumulative_beamlets, 61);
        assert_eq!(layout.ports[0].packet_len, 16 + 61 * 64);
    }

    #[test]
    fn bit_mode_sets_packet_length() {
        let layout = parse_headers(&[header(122, 2, true)], (0, 0)).unwrap();
        assert_eq!(layout.bit_mode, BitMode::Bits4);
        assert_eq!(layout.ports[0].packet_len, 16 + 122 * 32);

        let layout = parse_headers(&[header(61, 0, true)], (0, 0)).unwrap();
        assert_eq!(layout.bit_mode, BitMode::Bits16);
        assert_eq!(layout.ports[0].packet_len, 16 + 61 * 128);
    }

    #[test]
    fn clock_mismatch_is_fatal() {
        assert!(matches!(
            parse_headers(&[header(61, 1, true), header(61, 1, false)], (0, 0)),
            Err(ReaderError::ClockMismatch { port: 1 })
        ));
    }

    #[test]
    fn mixed_bit_modes_are_fatal() {
        assert!(matches!(
            parse_headers(&[header(61, 1, true), header(61, 2, true)], (0, 0)),
            Err(ReaderError::Config(_))
        ));
    }

    #[test]
    fn invalid_header_is_fatal() {
        let mut bad = header(61, 1, true);
        bad[7] = 4;
        assert!(matches!(
            parse_headers(&[bad], (0, 0)),
            Err(ReaderError::MalformedHeader { port: 0, .. })
        ));
    }

    #[test]
    fn beamlet_limits_carve_port_ranges() {
        // 0..61 on port 0, 61..122 on port 1; select 10..100.
        let layout =
            parse_headers(&[header(61, 1, true), header(61, 1, true)], (10, 100)).unwrap();
        assert_eq!(layout.ports[0].base_beamlet, 10);
        assert_eq!(layout.ports[0].upper_beamlet, 61);
        assert_eq!(layout.ports[1].base_beamlet, 0);
        assert_eq!(layout.ports[1].upper_beamlet, 39);
        assert_eq!(layout.total_proc_beamlets, 51 + 39);
        assert_eq!(layout.ports[1].cumulative_beamlets, 51);
    }

    #[test]
    fn limit_trimming_drops_outside_ports() {
        let headers = [
            header(61, 1, true),
            header(61, 1, true),
            header(61, 1, true),
        ];
        // Select beamlets living wholly inside port 1.
        let (range, rebased) = trim_ports_for_limits(&headers, (70, 100)).unwrap();
        assert_eq!(range, 1..2);
        assert_eq!(rebased, (9, 39));

        // No limits keep everything.
        let (range, rebased) = trim_ports_for_limits(&headers, (0, 0)).unwrap();
        assert_eq!(range, 0..3);
        assert_eq!(rebased, (0, 0));
    }
}
