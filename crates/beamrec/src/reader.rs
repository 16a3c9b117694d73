//! The iteration driver
//!
//! A [`Reader`] owns the capture backends, the per-stream buffers and the
//! output arrays. [`Reader::step`] produces one iteration: shift leftover
//! packets, refill from the backends, repair and transform the aligned
//! window, publish the outputs.

use capture_io::PortReader;
use rayon::prelude::*;
use rsp::{CLOCK_160MHZ_STEPS, CLOCK_200MHZ_STEPS, EPOCH_2008, HEADER_LEN, TIME_SLICES};
use tracing::{debug, info, warn};

use crate::buffer::PortBuffer;
use crate::calibration::{
    CalibrateMode, CalibrationRequest, CalibrationTable, CoefficientSource, HelperProcess,
};
use crate::cancellation::CancellationToken;
use crate::config::ReaderConfig;
use crate::dispatch::{self, OutputGeometry};
use crate::error::ReaderError;
use crate::kernels;
use crate::meta::{self, ObsMeta, PortState};
use crate::output::OutputBlock;

/// Outcome of one [`Reader::step`].
///
/// Ordered by severity; the driver reports the worst condition of the read
/// and compute phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// A full iteration of clean data.
    Ok,
    /// The iteration completed but some packets were missing or discarded.
    DropsOccurred,
    /// The packet cap truncated this iteration; it is the last one.
    PacketCapReached,
    /// A backend ran dry; this iteration holds the remaining data.
    EndOfData,
}

impl Progress {
    fn severity(self) -> u8 {
        match self {
            Progress::Ok => 0,
            Progress::DropsOccurred => 1,
            Progress::PacketCapReached => 2,
            Progress::EndOfData => 3,
        }
    }

    fn worst(self, other: Progress) -> Progress {
        if self.severity() >= other.severity() {
            self
        } else {
            other
        }
    }
}

pub(crate) struct CalibrationState {
    pub mode: CalibrateMode,
    pub source: Box<dyn CoefficientSource + Send>,
    pub table: Option<CalibrationTable>,
    pub step: usize,
    pub config: crate::config::CalibrationConfig,
}

/// Multi-stream capture reader: alignment, reconstruction and transform.
pub struct Reader {
    pub(crate) meta: ObsMeta,
    pub(crate) ports: Vec<PortState>,
    pub(crate) inputs: Vec<PortReader>,
    pub(crate) outputs: Vec<OutputBlock>,
    pub(crate) calibration: Option<CalibrationState>,
    pub(crate) token: CancellationToken,
    /// Configured packets per iteration; `meta.packets_per_iteration` may
    /// shrink near end of data.
    pub(crate) packets_per_iteration: usize,
    pool: Option<rayon::ThreadPool>,
}

impl Reader {
    /// Open a capture with the default calibration source (the external
    /// generator configured in [`crate::CalibrationConfig`]).
    pub fn open(config: ReaderConfig) -> Result<Self, ReaderError> {
        let helper = config
            .calibration
            .as_ref()
            .map(|c| HelperProcess::new(c.helper.clone()));
        match helper {
            Some(h) => Self::open_with_source(config, Box::new(h)),
            None => Self::open_with_source(config, Box::new(NoSource)),
        }
    }

    /// Open a capture with a custom coefficient source.
    pub fn open_with_source(
        config: ReaderConfig,
        source: Box<dyn CoefficientSource + Send>,
    ) -> Result<Self, ReaderError> {
        config.validate()?;

        let pool = match config.worker_threads {
            Some(threads) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| ReaderError::Config(format!("worker pool: {e}")))?,
            ),
            None => None,
        };

        // Peek the first header of every configured stream.
        let mut all_inputs = Vec::with_capacity(config.inputs.len());
        let mut all_headers: Vec<[u8; HEADER_LEN]> = Vec::with_capacity(config.inputs.len());
        for (port, spec) in config.inputs.iter().enumerate() {
            let mut reader = PortReader::open(spec)?;
            let mut header = [0u8; HEADER_LEN];
            if reader.peek(&mut header)? != HEADER_LEN {
                return Err(ReaderError::Config(format!(
                    "unable to read a packet header from {}",
                    spec.path.display()
                )));
            }
            all_inputs.push(reader);
            all_headers.push(header);
            debug!(port, path = %spec.path.display(), "capture stream primed");
        }

        // Beamlet limits may drop whole ports from both ends.
        let (keep, limits) = match config.beamlet_limits {
            Some(limits) => meta::trim_ports_for_limits(&all_headers, limits)?,
            None => (0..all_headers.len(), (0, 0)),
        };
        let headers: Vec<[u8; HEADER_LEN]> = all_headers[keep.clone()].to_vec();
        let inputs: Vec<PortReader> = all_inputs
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, r)| r)
            .collect();

        let layout = meta::parse_headers(&headers, limits)?;
        let calibrate = config.calibrate_mode();
        dispatch::validate_clock(calibrate, layout.clock_200mhz)?;

        let port_packet_lens: Vec<usize> = layout.ports.iter().map(|p| p.packet_len).collect();
        let geometry = OutputGeometry::derive(
            config.processing_mode,
            calibrate,
            layout.bit_mode,
            &port_packet_lens,
            layout.total_proc_beamlets,
        );

        let m = config.packets_per_iteration;
        let ports: Vec<PortState> = layout
            .ports
            .iter()
            .map(|p| PortState {
                packet_len: p.packet_len,
                raw_beamlets: p.raw_beamlets,
                base_beamlet: p.base_beamlet,
                upper_beamlet: p.upper_beamlet,
                cumulative_beamlets: p.cumulative_beamlets,
                raw_cumulative_beamlets: p.raw_cumulative_beamlets,
                last_dropped: 0,
                total_dropped: 0,
                data_offset: 0,
                buffer: PortBuffer::new(p.packet_len, m),
            })
            .collect();

        let meta = ObsMeta {
            num_ports: ports.len(),
            packets_per_iteration: m,
            input_bit_mode: layout.bit_mode,
            output_bits: geometry.output_bits,
            processing_mode: config.processing_mode,
            calibrate,
            dual_stokes_pair: config.dual_stokes_pair,
            total_raw_beamlets: layout.total_raw_beamlets,
            total_proc_beamlets: layout.total_proc_beamlets,
            num_outputs: geometry.num_outputs,
            packet_output_bytes: geometry.packet_output_bytes,
            last_packet: config.starting_packet.unwrap_or(0),
            leading_packet: 0,
            packets_read: 0,
            packets_read_max: config.packets_read_max.unwrap_or(i64::MAX),
            clock_200mhz: layout.clock_200mhz,
            replay_dropped_packets: config.replay_dropped_packets,
            station_id: layout.station_id,
            input_ready: false,
            output_ready: false,
        };

        let outputs = alloc_outputs(&meta, m);
        let calibration = (calibrate != CalibrateMode::None).then(|| CalibrationState {
            mode: calibrate,
            source,
            table: None,
            step: 0,
            config: config.calibration.clone().unwrap_or_default(),
        });

        let mut reader = Self {
            meta,
            ports,
            inputs,
            outputs,
            calibration,
            token: CancellationToken::new(),
            packets_per_iteration: m,
            pool,
        };

        info!(
            ports = reader.meta.num_ports,
            beamlets = reader.meta.total_proc_beamlets,
            mode = reader.meta.processing_mode.code(),
            bits = reader.meta.input_bit_mode.bits(),
            "reader opened"
        );

        // First gulp, then align every stream onto a common first packet.
        reader.read_step()?;
        reader.meta.input_ready = false;

        if reader.meta.last_packet > EPOCH_2008 as i64 {
            let target = reader.meta.last_packet;
            if reader.skip_to_packet().is_err() {
                for p in 0..reader.meta.num_ports {
                    let first = reader.ports[p].buffer.packet_number_at(0);
                    reader.meta.last_packet = reader.meta.last_packet.max(first);
                }
                warn!(
                    requested = target,
                    fallback = reader.meta.last_packet,
                    "requested start packet unavailable, falling back"
                );
                reader.skip_to_packet()?;
            }
        }

        reader.first_packet_alignment()?;
        reader.meta.input_ready = true;
        reader.meta.output_ready = false;
        Ok(reader)
    }

    /// The cancellation token; cancel it (e.g. from a signal handler) to
    /// make the next `step` return [`ReaderError::Cancelled`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Observation metadata.
    pub fn meta(&self) -> &ObsMeta {
        &self.meta
    }

    /// The output arrays of the last completed iteration.
    pub fn outputs(&self) -> &[OutputBlock] {
        &self.outputs
    }

    /// Packet number of the first packet in the current iteration.
    pub fn leading_packet(&self) -> i64 {
        self.meta.leading_packet
    }

    /// Per-port `(last iteration, lifetime)` dropped-packet counts.
    pub fn port_drops(&self) -> Vec<(i64, i64)> {
        self.ports
            .iter()
            .map(|p| (p.last_dropped, p.total_dropped))
            .collect()
    }

    /// Produce one iteration.
    ///
    /// The caller must consume [`Reader::outputs`] between calls; a new
    /// step reuses the arrays.
    pub fn step(&mut self) -> Result<Progress, ReaderError> {
        if self.token.is_cancelled() {
            return Err(ReaderError::Cancelled);
        }

        self.refresh_calibration()?;

        let mut read_progress = Progress::Ok;
        if !self.meta.input_ready && self.meta.output_ready {
            read_progress = self.read_step()?;
            self.meta.leading_packet = self.meta.last_packet + 1;
            self.meta.output_ready = false;
        }

        let mut compute_progress = Progress::Ok;
        if !self.meta.output_ready && self.meta.packets_per_iteration > 0 {
            let jones = self.calibration.as_ref().and_then(|cal| {
                (cal.mode == CalibrateMode::Apply)
                    .then(|| cal.table.as_ref().map(|t| t.step_row(cal.step)))
                    .flatten()
            });

            let meta = &mut self.meta;
            let ports = &mut self.ports;
            let outputs = &mut self.outputs;
            let drops = match &self.pool {
                Some(pool) => pool.install(|| kernels::run(meta, ports, outputs, jones))?,
                None => kernels::run(meta, ports, outputs, jones)?,
            };

            compute_progress = if drops {
                Progress::DropsOccurred
            } else {
                Progress::Ok
            };
            self.meta.packets_read += self.meta.packets_per_iteration as i64;
            self.meta.input_ready = false;
            if let Some(cal) = &mut self.calibration {
                cal.step += 1;
            }
        }

        Ok(read_progress.worst(compute_progress))
    }

    /// Re-target an open reader onto a later starting packet.
    pub fn resume(
        &mut self,
        starting_packet: i64,
        packets_read_max: Option<i64>,
    ) -> Result<(), ReaderError> {
        self.meta.packets_per_iteration = self.packets_per_iteration;
        self.meta.packets_read = 0;
        // Bound the catch-up scan; restored below.
        self.meta.packets_read_max =
            starting_packet - self.meta.last_packet + 2 * self.packets_per_iteration as i64;
        self.meta.last_packet = starting_packet;

        if let Some(cal) = &mut self.calibration {
            // Force regeneration for the new time span.
            cal.table = None;
            cal.step = 0;
        }
        for port in &mut self.ports {
            port.data_offset = 0;
            port.last_dropped = 0;
        }

        self.meta.input_ready = false;
        if self.meta.last_packet > EPOCH_2008 as i64 {
            self.skip_to_packet()?;
        }
        self.first_packet_alignment()?;

        self.meta.packets_read_max = packets_read_max.unwrap_or(i64::MAX);
        self.meta.input_ready = true;
        self.meta.output_ready = false;
        Ok(())
    }

    /// Keep the Jones table ahead of the data time.
    fn refresh_calibration(&mut self) -> Result<(), ReaderError> {
        let Some(cal) = &mut self.calibration else {
            return Ok(());
        };
        let exhausted = match &cal.table {
            Some(table) => cal.step >= table.steps(),
            None => true,
        };
        if !exhausted {
            return Ok(());
        }

        let steps = if self.meta.clock_200mhz {
            CLOCK_200MHZ_STEPS
        } else {
            CLOCK_160MHZ_STEPS
        };
        let integration_s =
            (self.meta.packets_per_iteration * TIME_SLICES) as f64 / steps;
        let station = rsp::station_code(self.meta.station_id)
            .unwrap_or_else(|| format!("ST{:03}", self.meta.station_id));
        let request = CalibrationRequest {
            station,
            subbands: cal.config.subbands.clone(),
            start_mjd: rsp::packet_time_mjd(self.ports[0].buffer.slot(0)),
            duration_s: cal.config.duration_s,
            integration_s,
            pointing: cal.config.pointing,
            basis: cal.config.basis.clone(),
            channels: self.meta.total_proc_beamlets,
        };

        debug!(start_mjd = request.start_mjd, "calibration table exhausted, regenerating");
        let table = cal.source.refresh(&request)?;
        if table.channels() != self.meta.total_proc_beamlets {
            return Err(ReaderError::CalibrationFailed(format!(
                "coefficient table covers {} channels, the capture needs {}",
                table.channels(),
                self.meta.total_proc_beamlets
            )));
        }
        cal.table = Some(table);
        cal.step = 0;
        Ok(())
    }

    /// Shift each port's unprocessed tail packets to the front and reset
    /// the fill offsets (§ shift semantics in [`PortBuffer::shift_tail`]).
    pub(crate) fn shift_remainder(&mut self, shifts: &[i64], handle_padding: bool) {
        let zero_pad_guard = !self.meta.replay_dropped_packets;
        let m = self.packets_per_iteration as i64;

        for (p, port) in self.ports.iter_mut().enumerate() {
            port.data_offset = 0;
            let mut shift = shifts[p];
            if shift > m {
                warn!(
                    port = p,
                    shift, "requested shift exceeds the buffer, clamping"
                );
                shift = m;
            }
            if shift < 0 {
                if shift < -5 {
                    warn!(
                        port = p,
                        shift,
                        "large negative shift; this indicates data integrity issues"
                    );
                } else {
                    debug!(port = p, shift, "negative shift from out-of-order data");
                }
                shift = 0;
                if !handle_padding {
                    continue;
                }
            }
            if shift > 0 || handle_padding {
                port.data_offset =
                    port.buffer
                        .shift_tail(shift as usize, handle_padding, zero_pad_guard);
            }
        }
    }

    /// Fill every port's buffer with fresh packets, carrying over the
    /// packets the previous iteration could not use.
    pub(crate) fn read_step(&mut self) -> Result<Progress, ReaderError> {
        if self.meta.packets_per_iteration == 0 {
            warn!("previous iteration had no packets, nothing to read");
            return Ok(Progress::EndOfData);
        }

        // Out-of-order packets can shrink the iteration; restore it.
        self.meta.packets_per_iteration = self.packets_per_iteration;

        let shifts: Vec<i64> = self.ports.iter().map(|p| p.last_dropped).collect();
        self.shift_remainder(&shifts, true);

        let mut progress = Progress::Ok;
        if self.meta.packets_read
            >= self
                .meta
                .packets_read_max
                .saturating_sub(self.meta.packets_per_iteration as i64)
        {
            let remaining = (self.meta.packets_read_max - self.meta.packets_read).max(0);
            self.meta.packets_per_iteration = remaining as usize;
            debug!(
                packets = remaining,
                "processing the final read before the packet cap"
            );
            progress = Progress::PacketCapReached;
        }

        let m = self.meta.packets_per_iteration;
        let reads: Result<Vec<Option<(usize, usize)>>, capture_io::InputError> = {
            let ports = &mut self.ports;
            let inputs = &mut self.inputs;
            let mut read_all = || {
                ports
                    .par_iter_mut()
                    .zip(inputs.par_iter_mut())
                    .enumerate()
                    .map(|(p, (port, input))| {
                        if port.last_dropped > m as i64 {
                            warn!(port = p, "skipping read due to excessive packet loss");
                            return Ok(None);
                        }
                        let want = (m * port.packet_len).saturating_sub(port.data_offset);
                        let offset = port.data_offset;
                        let region = &mut port.buffer.fill_region(offset)[..want];
                        let got = input.read(region)?;
                        Ok(Some((got, want)))
                    })
                    .collect()
            };
            match &self.pool {
                Some(pool) => pool.install(read_all),
                None => read_all(),
            }
        };

        let reads = reads?;
        for (p, read) in reads.iter().enumerate() {
            let Some((got, want)) = read else { continue };
            if got < want {
                let available =
                    (got + self.ports[p].data_offset) / self.ports[p].packet_len;
                if available < self.meta.packets_per_iteration {
                    self.meta.packets_per_iteration = available;
                    warn!(
                        port = p,
                        packets = available,
                        "short read, shrinking the iteration; nearing end of data"
                    );
                }
                progress = progress.worst(Progress::EndOfData);
            }
        }

        self.meta.input_ready = true;
        Ok(progress)
    }
}

/// Sentinel source for uncalibrated captures; never invoked.
struct NoSource;

impl CoefficientSource for NoSource {
    fn refresh(&mut self, _request: &CalibrationRequest) -> Result<CalibrationTable, ReaderError> {
        Err(ReaderError::CalibrationFailed(
            "no coefficient source configured".into(),
        ))
    }
}

fn alloc_outputs(meta: &ObsMeta, m: usize) -> Vec<OutputBlock> {
    (0..meta.num_outputs)
        .map(|i| {
            let bytes = meta.packet_output_bytes[i] * m;
            if meta.processing_mode.is_raw_copy() {
                OutputBlock::Bytes(vec![0; bytes])
            } else {
                match meta.output_bits {
                    8 => OutputBlock::Chars(vec![0; bytes]),
                    16 => OutputBlock::Shorts(vec![0; bytes / 2]),
                    _ => OutputBlock::Floats(vec![0.0; bytes / 4]),
                }
            }
        })
        .collect()
}
