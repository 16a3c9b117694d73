//! Processing-mode selection and output geometry
//!
//! The processing mode is a stable integer code on the outside (the values
//! ride in recording metadata and job scripts) and an enum on the inside.
//! This module decodes the code, validates option combinations, and derives
//! how many output arrays a mode produces and how many bytes one packet
//! contributes to each.

use rsp::{BitMode, N_POLS, TIME_SLICES};

use crate::ReaderError;
use crate::calibration::CalibrateMode;

/// One of the four Stokes parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StokesParam {
    I,
    Q,
    U,
    V,
}

/// Output layout selector.
///
/// `decimation` is the exponent k of the temporal decimation factor `2^k`,
/// k ∈ 0..=4; 0 means no decimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Verbatim packet copy, headers included; one output per port.
    PacketCopy,
    /// Verbatim payload copy, headers stripped; one output per port.
    PayloadCopy,
    /// Four outputs, one per polarization component.
    SplitPols,
    /// Single output ordered `[packet, time, channel, pol]`.
    ChannelMajor,
    /// As [`ProcessingMode::ChannelMajor`] with one output per component.
    ChannelMajorSplit,
    /// Channel-major with the channel axis reversed (high frequency first).
    ReversedChannelMajor,
    ReversedChannelMajorSplit,
    /// Single output ordered `[channel, packet, time, pol]`.
    TimeMajor,
    /// Time-major with one output per component.
    TimeMajorSplit,
    /// Time-major with X and Y each as an interleaved complex pair.
    TimeMajorDual,
    /// As [`ProcessingMode::TimeMajorDual`], forced to f32 for spectral
    /// post-processing.
    TimeMajorDualFloat,
    /// One Stokes parameter, reversed channel-major, f32.
    Stokes { param: StokesParam, decimation: u8 },
    /// All four Stokes parameters as four outputs.
    StokesFull { decimation: u8 },
    /// A configurable pair of Stokes parameters as two outputs.
    StokesDual { decimation: u8 },
}

impl ProcessingMode {
    /// Decode a stable integer mode code.
    pub fn from_code(code: i32) -> Result<Self, ReaderError> {
        let mode = match code {
            0 => Self::PacketCopy,
            1 => Self::PayloadCopy,
            2 => Self::SplitPols,
            10 => Self::ChannelMajor,
            11 => Self::ChannelMajorSplit,
            20 => Self::ReversedChannelMajor,
            21 => Self::ReversedChannelMajorSplit,
            30 => Self::TimeMajor,
            31 => Self::TimeMajorSplit,
            32 => Self::TimeMajorDual,
            35 => Self::TimeMajorDualFloat,
            100..=104 | 110..=114 | 120..=124 | 130..=134 => {
                let param = match (code - 100) / 10 {
                    0 => StokesParam::I,
                    1 => StokesParam::Q,
                    2 => StokesParam::U,
                    _ => StokesParam::V,
                };
                Self::Stokes {
                    param,
                    decimation: (code % 10) as u8,
                }
            }
            150..=154 => Self::StokesFull {
                decimation: (code % 10) as u8,
            },
            160..=164 => Self::StokesDual {
                decimation: (code % 10) as u8,
            },
            other => return Err(ReaderError::UnknownMode(other)),
        };
        Ok(mode)
    }

    /// The stable integer code of this mode.
    pub fn code(&self) -> i32 {
        match self {
            Self::PacketCopy => 0,
            Self::PayloadCopy => 1,
            Self::SplitPols => 2,
            Self::ChannelMajor => 10,
            Self::ChannelMajorSplit => 11,
            Self::ReversedChannelMajor => 20,
            Self::ReversedChannelMajorSplit => 21,
            Self::TimeMajor => 30,
            Self::TimeMajorSplit => 31,
            Self::TimeMajorDual => 32,
            Self::TimeMajorDualFloat => 35,
            Self::Stokes { param, decimation } => {
                let base = match param {
                    StokesParam::I => 100,
                    StokesParam::Q => 110,
                    StokesParam::U => 120,
                    StokesParam::V => 130,
                };
                base + *decimation as i32
            }
            Self::StokesFull { decimation } => 150 + *decimation as i32,
            Self::StokesDual { decimation } => 160 + *decimation as i32,
        }
    }

    /// Whether this mode copies raw packets rather than decoding samples.
    pub fn is_raw_copy(&self) -> bool {
        matches!(self, Self::PacketCopy | Self::PayloadCopy)
    }

    /// Whether the outputs of this mode are Stokes detections.
    pub fn is_stokes(&self) -> bool {
        matches!(
            self,
            Self::Stokes { .. } | Self::StokesFull { .. } | Self::StokesDual { .. }
        )
    }

    /// Temporal decimation factor (1 when the mode does not decimate).
    pub fn decimation_factor(&self) -> usize {
        match self {
            Self::Stokes { decimation, .. }
            | Self::StokesFull { decimation }
            | Self::StokesDual { decimation } => 1usize << decimation,
            _ => 1,
        }
    }
}

/// Reject option combinations the kernels have no implementation for.
pub fn validate_options(
    mode: ProcessingMode,
    calibrate: CalibrateMode,
) -> Result<(), ReaderError> {
    if mode.is_raw_copy() && calibrate != CalibrateMode::None {
        return Err(ReaderError::IncompatibleOptions(
            "raw copy modes (0, 1) move whole packets and cannot be calibrated",
        ));
    }
    if let ProcessingMode::Stokes { decimation, .. }
    | ProcessingMode::StokesFull { decimation }
    | ProcessingMode::StokesDual { decimation } = mode
        && decimation > 4
    {
        return Err(ReaderError::IncompatibleOptions(
            "Stokes decimation is limited to factor 16 (exponent 4)",
        ));
    }
    Ok(())
}

/// Re-validate once the capture clock is known (headers parsed).
pub fn validate_clock(calibrate: CalibrateMode, clock_200mhz: bool) -> Result<(), ReaderError> {
    if calibrate == CalibrateMode::Apply && !clock_200mhz {
        return Err(ReaderError::IncompatibleOptions(
            "calibration of 160 MHz clock captures is unsupported",
        ));
    }
    Ok(())
}

/// Derived output shape for a mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputGeometry {
    /// Number of output arrays.
    pub num_outputs: usize,
    /// Bits per output element (4 and 8 map onto byte storage).
    pub output_bits: u8,
    /// Bytes one packet contributes to each output array.
    pub packet_output_bytes: Vec<usize>,
}

impl OutputGeometry {
    /// Compute the output shape of `mode` for a capture.
    ///
    /// `port_packet_lens` are the per-port wire packet lengths (header
    /// included); `total_proc_beamlets` is the processed channel count
    /// across all ports.
    pub fn derive(
        mode: ProcessingMode,
        calibrate: CalibrateMode,
        input_bits: BitMode,
        port_packet_lens: &[usize],
        total_proc_beamlets: usize,
    ) -> Self {
        let in_bits = input_bits.bits() as usize;

        // Raw copies keep the wire width, everything else expands 4-bit
        // samples to bytes; detection, calibration and the spectral layout
        // force floats.
        let output_bits = if mode.is_raw_copy() {
            in_bits
        } else if mode.is_stokes()
            || calibrate == CalibrateMode::Apply
            || mode == ProcessingMode::TimeMajorDualFloat
        {
            32
        } else if in_bits == 4 {
            8
        } else {
            in_bits
        };
        let out_size = output_bits.div_ceil(8);

        // Decoded quadruples one packet carries across all ports.
        let quads = total_proc_beamlets * TIME_SLICES;
        let factor = mode.decimation_factor();

        let (num_outputs, per_output) = match mode {
            ProcessingMode::PacketCopy => {
                return Self {
                    num_outputs: port_packet_lens.len(),
                    output_bits: output_bits as u8,
                    packet_output_bytes: port_packet_lens.to_vec(),
                };
            }
            ProcessingMode::PayloadCopy => {
                return Self {
                    num_outputs: port_packet_lens.len(),
                    output_bits: output_bits as u8,
                    packet_output_bytes: port_packet_lens
                        .iter()
                        .map(|l| l - rsp::HEADER_LEN)
                        .collect(),
                };
            }
            ProcessingMode::SplitPols
            | ProcessingMode::ChannelMajorSplit
            | ProcessingMode::ReversedChannelMajorSplit
            | ProcessingMode::TimeMajorSplit => (N_POLS, quads * out_size),
            ProcessingMode::ChannelMajor
            | ProcessingMode::ReversedChannelMajor
            | ProcessingMode::TimeMajor => (1, quads * N_POLS * out_size),
            ProcessingMode::TimeMajorDual | ProcessingMode::TimeMajorDualFloat => {
                (2, quads * 2 * out_size)
            }
            ProcessingMode::Stokes { .. } => (1, quads / factor * out_size),
            ProcessingMode::StokesFull { .. } => (4, quads / factor * out_size),
            ProcessingMode::StokesDual { .. } => (2, quads / factor * out_size),
        };

        Self {
            num_outputs,
            output_bits: output_bits as u8,
            packet_output_bytes: vec![per_output; num_outputs],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for code in [
            0, 1, 2, 10, 11, 20, 21, 30, 31, 32, 35, 100, 103, 110, 124, 130, 134, 150, 154, 160,
            164,
        ] {
            assert_eq!(ProcessingMode::from_code(code).unwrap().code(), code);
        }
    }

    #[test]
    fn unknown_codes_rejected() {
        for code in [-1, 3, 12, 36, 105, 140, 155, 165, 200, 230, 264] {
            assert!(matches!(
                ProcessingMode::from_code(code),
                Err(ReaderError::UnknownMode(_))
            ));
        }
    }

    #[test]
    fn stokes_decoding() {
        assert_eq!(
            ProcessingMode::from_code(131).unwrap(),
            ProcessingMode::Stokes {
                param: StokesParam::V,
                decimation: 1
            }
        );
        assert_eq!(ProcessingMode::from_code(131).unwrap().decimation_factor(), 2);
        assert_eq!(ProcessingMode::from_code(164).unwrap().decimation_factor(), 16);
    }

    #[test]
    fn raw_copy_cannot_be_calibrated() {
        assert!(validate_options(ProcessingMode::PacketCopy, CalibrateMode::Apply).is_err());
        assert!(validate_options(ProcessingMode::PayloadCopy, CalibrateMode::GenerateOnly).is_err());
        assert!(validate_options(ProcessingMode::ChannelMajor, CalibrateMode::Apply).is_ok());
    }

    #[test]
    fn calibrated_160mhz_is_unsupported() {
        assert!(validate_clock(CalibrateMode::Apply, false).is_err());
        assert!(validate_clock(CalibrateMode::Apply, true).is_ok());
        assert!(validate_clock(CalibrateMode::None, false).is_ok());
    }

    #[test]
    fn copy_geometry_is_per_port() {
        let lens = vec![16 + 61 * 64, 16 + 61 * 64];
        let geom = OutputGeometry::derive(
            ProcessingMode::PacketCopy,
            CalibrateMode::None,
            BitMode::Bits8,
            &lens,
            122,
        );
        assert_eq!(geom.num_outputs, 2);
        assert_eq!(geom.output_bits, 8);
        assert_eq!(geom.packet_output_bytes, lens);

        let geom = OutputGeometry::derive(
            ProcessingMode::PayloadCopy,
            CalibrateMode::None,
            BitMode::Bits4,
            &lens,
            122,
        );
        assert_eq!(geom.output_bits, 4);
        assert_eq!(geom.packet_output_bytes, vec![61 * 64; 2]);
    }

    #[test]
    fn sample_mode_geometry() {
        // 61 channels, 8-bit: packet payload is 61*64 bytes.
        let lens = vec![16 + 61 * 64];

        let geom = OutputGeometry::derive(
            ProcessingMode::SplitPols,
            CalibrateMode::None,
            BitMode::Bits8,
            &lens,
            61,
        );
        assert_eq!(geom.num_outputs, 4);
        assert_eq!(geom.packet_output_bytes, vec![61 * 16; 4]);

        let geom = OutputGeometry::derive(
            ProcessingMode::ChannelMajor,
            CalibrateMode::None,
            BitMode::Bits16,
            &[16 + 61 * 128],
            61,
        );
        assert_eq!(geom.num_outputs, 1);
        assert_eq!(geom.output_bits, 16);
        assert_eq!(geom.packet_output_bytes, vec![61 * 16 * 4 * 2]);

        // 4-bit expands to bytes.
        let geom = OutputGeometry::derive(
            ProcessingMode::ChannelMajor,
            CalibrateMode::None,
            BitMode::Bits4,
            &[16 + 61 * 32],
            61,
        );
        assert_eq!(geom.output_bits, 8);
        assert_eq!(geom.packet_output_bytes, vec![61 * 16 * 4]);

        // Calibration forces floats.
        let geom = OutputGeometry::derive(
            ProcessingMode::ChannelMajor,
            CalibrateMode::Apply,
            BitMode::Bits8,
            &lens,
            61,
        );
        assert_eq!(geom.output_bits, 32);
        assert_eq!(geom.packet_output_bytes, vec![61 * 16 * 4 * 4]);
    }

    #[test]
    fn stokes_geometry_scales_with_decimation() {
        let lens = vec![16 + 61 * 64];

        let geom = OutputGeometry::derive(
            ProcessingMode::Stokes {
                param: StokesParam::I,
                decimation: 0,
            },
            CalibrateMode::None,
            BitMode::Bits8,
            &lens,
            61,
        );
        assert_eq!(geom.num_outputs, 1);
        assert_eq!(geom.output_bits, 32);
        assert_eq!(geom.packet_output_bytes, vec![61 * 16 * 4]);

        // Stokes V decimated by 2: half the temporal rate.
        let geom = OutputGeometry::derive(
            ProcessingMode::Stokes {
                param: StokesParam::V,
                decimation: 1,
            },
            CalibrateMode::None,
            BitMode::Bits8,
            &lens,
            61,
        );
        assert_eq!(geom.packet_output_bytes, vec![61 * 16 * 4 / 2]);

        let geom = OutputGeometry::derive(
            ProcessingMode::StokesFull { decimation: 0 },
            CalibrateMode::None,
            BitMode::Bits8,
            &lens,
            61,
        );
        assert_eq!(geom.packet_output_bytes, vec![61 * 16 * 4; 4]);

        let geom = OutputGeometry::derive(
            ProcessingMode::StokesDual { decimation: 4 },
            CalibrateMode::None,
            BitMode::Bits8,
            &lens,
            61,
        );
        assert_eq!(geom.packet_output_bytes, vec![61 * 4; 2]);
    }
}
