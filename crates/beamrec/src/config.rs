//! Reader configuration.

use capture_io::InputSpec;
use rsp::{EPOCH_2008, MAX_PORTS};

use crate::ReaderError;
use crate::calibration::CalibrateMode;
use crate::dispatch::{self, ProcessingMode, StokesParam};

/// Configuration for the out-of-process coefficient generator.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    pub mode: CalibrateMode,
    /// Generator executable, resolved through `PATH`.
    pub helper: String,
    /// Antenna-set/subband selection string handed to the generator.
    pub subbands: String,
    /// Seconds of observation one generated table must cover.
    pub duration_s: f64,
    /// Pointing direction in `basis` coordinates.
    pub pointing: (f64, f64),
    pub basis: String,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            mode: CalibrateMode::Apply,
            helper: "jones-generator".into(),
            subbands: String::new(),
            duration_s: 3600.0,
            pointing: (0.0, 0.0),
            basis: "J2000".into(),
        }
    }
}

/// Everything needed to open a [`crate::Reader`].
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// One capture stream per port, in port order.
    pub inputs: Vec<InputSpec>,
    /// Packets processed per iteration (M).
    pub packets_per_iteration: usize,
    pub processing_mode: ProcessingMode,
    /// Fill gaps by replaying the previous packet instead of zero padding.
    pub replay_dropped_packets: bool,
    /// Packet number to align the first iteration onto; `None` starts at
    /// the first packet every stream can serve.
    pub starting_packet: Option<i64>,
    /// Stop after this many packets.
    pub packets_read_max: Option<i64>,
    /// Restrict processing to beamlets `lower..upper` across the
    /// concatenated ports (`0` leaves a bound open).
    pub beamlet_limits: Option<(usize, usize)>,
    /// Parameters emitted by the dual-Stokes modes.
    pub dual_stokes_pair: (StokesParam, StokesParam),
    pub calibration: Option<CalibrationConfig>,
    /// Worker threads for the parallel port region; `None` shares the
    /// process-wide pool.
    pub worker_threads: Option<usize>,
}

impl ReaderConfig {
    pub fn new(inputs: Vec<InputSpec>, processing_mode: ProcessingMode) -> Self {
        Self {
            inputs,
            packets_per_iteration: 65_536,
            processing_mode,
            replay_dropped_packets: false,
            starting_packet: None,
            packets_read_max: None,
            beamlet_limits: None,
            dual_stokes_pair: (StokesParam::I, StokesParam::V),
            calibration: None,
            worker_threads: None,
        }
    }

    pub(crate) fn calibrate_mode(&self) -> CalibrateMode {
        self.calibration
            .as_ref()
            .map(|c| c.mode)
            .unwrap_or(CalibrateMode::None)
    }

    pub(crate) fn validate(&self) -> Result<(), ReaderError> {
        if self.inputs.is_empty() {
            return Err(ReaderError::Config("no input streams configured".into()));
        }
        if self.inputs.len() > MAX_PORTS {
            return Err(ReaderError::Config(format!(
                "{} input streams configured, the station only produces {MAX_PORTS}",
                self.inputs.len()
            )));
        }
        if self.packets_per_iteration == 0 {
            return Err(ReaderError::Config(
                "packets per iteration must be at least 1".into(),
            ));
        }
        if let Some((lower, upper)) = self.beamlet_limits {
            if lower > 0 && upper > 0 && lower >= upper {
                return Err(ReaderError::Config(format!(
                    "beamlet limits are inverted ({lower} >= {upper})"
                )));
            }
            if self.processing_mode.is_raw_copy() {
                return Err(ReaderError::Config(
                    "raw copy modes (0, 1) move whole packets and do not support beamlet limits"
                        .into(),
                ));
            }
        }
        if let Some(start) = self.starting_packet
            && start > 0
            && start < EPOCH_2008 as i64
        {
            return Err(ReaderError::Config(format!(
                "starting packet {start} is before the 2008 epoch"
            )));
        }
        if let Some(max) = self.packets_read_max
            && max < 1
        {
            return Err(ReaderError::Config(format!(
                "packet cap of {max} leaves nothing to read"
            )));
        }
        if let Some(cal) = &self.calibration
            && cal.mode != CalibrateMode::None
            && cal.helper.is_empty()
        {
            return Err(ReaderError::Config(
                "calibration requested without a generator command".into(),
            ));
        }
        dispatch::validate_options(self.processing_mode, self.calibrate_mode())
    }
}
