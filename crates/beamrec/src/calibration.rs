//! Polarimetric calibration supplier
//!
//! Calibration is a time-indexed table of 2×2 complex Jones matrices, one
//! per processed channel per calibration step. The engine only consumes the
//! table; producing the coefficients is the job of a [`CoefficientSource`],
//! typically an out-of-process model of the station beam. One step is
//! applied per iteration; running off the end of the table triggers a
//! regeneration for the following time span.

use std::io::Cursor;
use std::path::PathBuf;
use std::process::Command;

use byteorder::{LittleEndian, ReadBytesExt};
use num_complex::Complex;
use tracing::{debug, info};

use crate::ReaderError;

/// What to do with calibration coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrateMode {
    /// No calibration.
    #[default]
    None,
    /// Keep the table current but emit uncalibrated samples.
    GenerateOnly,
    /// Multiply every sample quadruple by its channel's Jones matrix.
    Apply,
}

/// A generated table of Jones matrices.
///
/// Row-major `[step][channel][8]`, each matrix flattened as
/// `[re00, im00, re01, im01, re10, im10, re11, im11]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    steps: usize,
    channels: usize,
    data: Vec<f32>,
}

impl CalibrationTable {
    /// Wrap a coefficient buffer. `data` must hold `steps × channels × 8`
    /// floats.
    pub fn new(steps: usize, channels: usize, data: Vec<f32>) -> Result<Self, ReaderError> {
        if data.len() != steps * channels * 8 {
            return Err(ReaderError::CalibrationFailed(format!(
                "coefficient buffer holds {} floats, expected {} ({} steps x {} channels x 8)",
                data.len(),
                steps * channels * 8,
                steps,
                channels
            )));
        }
        Ok(Self {
            steps,
            channels,
            data,
        })
    }

    /// Identity Jones matrices for every channel and step.
    pub fn identity(steps: usize, channels: usize) -> Self {
        let mut data = vec![0.0f32; steps * channels * 8];
        for matrix in data.chunks_exact_mut(8) {
            matrix[0] = 1.0;
            matrix[6] = 1.0;
        }
        Self {
            steps,
            channels,
            data,
        }
    }

    /// Parse the external helper's binary format: two f32 header words
    /// `[steps, channels]` followed by the row-major coefficients, all
    /// little-endian.
    pub fn parse(bytes: &[u8]) -> Result<Self, ReaderError> {
        let mut cursor = Cursor::new(bytes);
        let steps = cursor
            .read_f32::<LittleEndian>()
            .map_err(|_| ReaderError::CalibrationFailed("coefficient table truncated".into()))?;
        let channels = cursor
            .read_f32::<LittleEndian>()
            .map_err(|_| ReaderError::CalibrationFailed("coefficient table truncated".into()))?;
        if steps < 1.0 || channels < 1.0 || steps.fract() != 0.0 || channels.fract() != 0.0 {
            return Err(ReaderError::CalibrationFailed(format!(
                "nonsensical coefficient table header ({steps}, {channels})"
            )));
        }

        let (steps, channels) = (steps as usize, channels as usize);
        let expected = steps * channels * 8;
        let mut data = vec![0.0f32; expected];
        cursor
            .read_f32_into::<LittleEndian>(&mut data)
            .map_err(|_| {
                ReaderError::CalibrationFailed(format!(
                    "coefficient table truncated: expected {expected} floats after the header"
                ))
            })?;
        Self::new(steps, channels, data)
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// The flattened Jones matrix of `channel` at `step`.
    #[inline]
    pub fn jones(&self, step: usize, channel: usize) -> &[f32; 8] {
        let base = (step * self.channels + channel) * 8;
        self.data[base..base + 8].try_into().unwrap()
    }

    /// All channels of one step, flattened.
    #[inline]
    pub fn step_row(&self, step: usize) -> &[f32] {
        &self.data[step * self.channels * 8..(step + 1) * self.channels * 8]
    }

    /// The Jones matrix of `channel` at `step` as complex values, row-major.
    pub fn jones_matrix(&self, step: usize, channel: usize) -> [Complex<f32>; 4] {
        let j = self.jones(step, channel);
        [
            Complex::new(j[0], j[1]),
            Complex::new(j[2], j[3]),
            Complex::new(j[4], j[5]),
            Complex::new(j[6], j[7]),
        ]
    }
}

/// Multiply one sample quadruple by a flattened Jones matrix.
///
/// This is the reference implementation the kernels mirror; it exists so the
/// linearity of the transform is testable in isolation.
#[inline]
pub fn apply_jones(j: &[f32; 8], quad: [f32; 4]) -> [f32; 4] {
    let [xr, xi, yr, yi] = quad;
    [
        j[0] * xr - j[1] * xi + j[2] * yr - j[3] * yi,
        j[0] * xi + j[1] * xr + j[2] * yi + j[3] * yr,
        j[4] * xr - j[5] * xi + j[6] * yr - j[7] * yi,
        j[4] * xi + j[5] * xr + j[6] * yi + j[7] * yr,
    ]
}

/// Everything a coefficient source needs to model the observation.
#[derive(Debug, Clone)]
pub struct CalibrationRequest {
    /// Observatory station code, e.g. `SE607`.
    pub station: String,
    /// Antenna-set/subband selection string handed to the generator.
    pub subbands: String,
    /// Start of the span, Modified Julian Date.
    pub start_mjd: f64,
    /// Span length in seconds.
    pub duration_s: f64,
    /// Seconds of data one calibration step covers.
    pub integration_s: f64,
    /// Pointing direction in the configured basis.
    pub pointing: (f64, f64),
    /// Coordinate basis of the pointing, e.g. `J2000`.
    pub basis: String,
    /// Channels the table must cover.
    pub channels: usize,
}

/// Supplies Jones tables on demand as observation time advances.
///
/// The default implementation shells out to an external generator, but the
/// engine does not care where the coefficients come from.
pub trait CoefficientSource {
    fn refresh(&mut self, request: &CalibrationRequest) -> Result<CalibrationTable, ReaderError>;
}

/// Invoke an external coefficient generator.
///
/// The generator is called as
/// `<command> --stn <code> --time <mjd> --sub <subbands> --dur <s> --int <s>
/// --pnt <p0>,<p1>,<basis> --out <path>` and must write the binary table
/// format of [`CalibrationTable::parse`] to the handed-over path.
#[derive(Debug, Clone)]
pub struct HelperProcess {
    command: String,
    scratch_dir: PathBuf,
}

impl HelperProcess {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }
}

impl CoefficientSource for HelperProcess {
    fn refresh(&mut self, request: &CalibrationRequest) -> Result<CalibrationTable, ReaderError> {
        let out_path = self.scratch_dir.join(format!(
            "beamrec-jones-{}-{}.dat",
            std::process::id(),
            request.start_mjd as i64
        ));

        info!(command = %self.command, start_mjd = request.start_mjd, "generating Jones matrices");
        let status = Command::new(&self.command)
            .arg("--stn")
            .arg(&request.station)
            .arg("--time")
            .arg(format!("{:.10}", request.start_mjd))
            .arg("--sub")
            .arg(&request.subbands)
            .arg("--dur")
            .arg(format!("{:.10}", request.duration_s))
            .arg("--int")
            .arg(format!("{:.10}", request.integration_s))
            .arg("--pnt")
            .arg(format!(
                "{},{},{}",
                request.pointing.0, request.pointing.1, request.basis
            ))
            .arg("--out")
            .arg(&out_path)
            .status()
            .map_err(|e| {
                ReaderError::CalibrationFailed(format!(
                    "failed to launch `{}`: {e}",
                    self.command
                ))
            })?;

        if !status.success() {
            return Err(ReaderError::CalibrationFailed(format!(
                "`{}` exited with {status}",
                self.command
            )));
        }

        let bytes = std::fs::read(&out_path).map_err(|e| {
            ReaderError::CalibrationFailed(format!(
                "generator produced no table at {}: {e}",
                out_path.display()
            ))
        })?;
        let _ = std::fs::remove_file(&out_path);

        let table = CalibrationTable::parse(&bytes)?;
        if table.channels() != request.channels {
            return Err(ReaderError::CalibrationFailed(format!(
                "generator covered {} channels, the capture needs {}",
                table.channels(),
                request.channels
            )));
        }
        debug!(
            steps = table.steps(),
            channels = table.channels(),
            "coefficient table loaded"
        );
        Ok(table)
    }
}

/// A fixed in-memory table; regeneration hands out the same coefficients.
///
/// Useful for tests and for replaying archived calibration solutions.
#[derive(Debug, Clone)]
pub struct FixedTable(pub CalibrationTable);

impl CoefficientSource for FixedTable {
    fn refresh(&mut self, request: &CalibrationRequest) -> Result<CalibrationTable, ReaderError> {
        if self.0.channels() != request.channels {
            return Err(ReaderError::CalibrationFailed(format!(
                "fixed table covers {} channels, the capture needs {}",
                self.0.channels(),
                request.channels
            )));
        }
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_bytes(steps: usize, channels: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend((steps as f32).to_le_bytes());
        out.extend((channels as f32).to_le_bytes());
        for i in 0..steps * channels * 8 {
            out.extend((i as f32).to_le_bytes());
        }
        out
    }

    #[test]
    fn parse_round_trip() {
        let table = CalibrationTable::parse(&table_bytes(3, 5)).unwrap();
        assert_eq!(table.steps(), 3);
        assert_eq!(table.channels(), 5);
        assert_eq!(table.jones(0, 0)[0], 0.0);
        assert_eq!(table.jones(1, 2), &[
            56.0, 57.0, 58.0, 59.0, 60.0, 61.0, 62.0, 63.0
        ]);
        assert_eq!(table.step_row(2).len(), 5 * 8);
    }

    #[test]
    fn parse_rejects_truncation_and_garbage() {
        let mut bytes = table_bytes(3, 5);
        bytes.truncate(bytes.len() - 4);
        assert!(matches!(
            CalibrationTable::parse(&bytes),
            Err(ReaderError::CalibrationFailed(_))
        ));
        assert!(CalibrationTable::parse(&[0, 1, 2]).is_err());

        let mut bad_header = table_bytes(1, 1);
        bad_header[..4].copy_from_slice(&(-1.0f32).to_le_bytes());
        assert!(CalibrationTable::parse(&bad_header).is_err());
    }

    #[test]
    fn identity_applies_as_identity() {
        let table = CalibrationTable::identity(2, 4);
        let quad = [3.0, -1.0, 0.5, 2.0];
        for channel in 0..4 {
            assert_eq!(apply_jones(table.jones(1, channel), quad), quad);
            let m = table.jones_matrix(0, channel);
            assert_eq!(m[0], Complex::new(1.0, 0.0));
            assert_eq!(m[1], Complex::new(0.0, 0.0));
            assert_eq!(m[3], Complex::new(1.0, 0.0));
        }
    }

    #[test]
    fn jones_application_is_the_complex_matrix_product() {
        // Arbitrary matrix, checked against num-complex arithmetic.
        let j = [0.5f32, -1.0, 2.0, 0.25, -0.75, 0.1, 1.5, -2.0];
        let quad = [1.0f32, 2.0, -3.0, 0.5];

        let got = apply_jones(&j, quad);

        let x = Complex::new(quad[0], quad[1]);
        let y = Complex::new(quad[2], quad[3]);
        let m = [
            Complex::new(j[0], j[1]),
            Complex::new(j[2], j[3]),
            Complex::new(j[4], j[5]),
            Complex::new(j[6], j[7]),
        ];
        let x_out = m[0] * x + m[1] * y;
        let y_out = m[2] * x + m[3] * y;

        assert!((got[0] - x_out.re).abs() < 1e-6);
        assert!((got[1] - x_out.im).abs() < 1e-6);
        assert!((got[2] - y_out.re).abs() < 1e-6);
        assert!((got[3] - y_out.im).abs() < 1e-6);

        // Zero in, zero out.
        assert_eq!(apply_jones(&j, [0.0; 4]), [0.0; 4]);
    }

    #[test]
    fn fixed_table_checks_channel_count() {
        let mut source = FixedTable(CalibrationTable::identity(1, 8));
        let mut request = CalibrationRequest {
            station: "SE607".into(),
            subbands: "HBA,12:100".into(),
            start_mjd: 59_000.0,
            duration_s: 10.0,
            integration_s: 1.0,
            pointing: (0.0, 0.0),
            basis: "J2000".into(),
            channels: 8,
        };
        assert!(source.refresh(&request).is_ok());
        request.channels = 9;
        assert!(source.refresh(&request).is_err());
    }
}
