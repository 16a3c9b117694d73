//! Beamformed-capture reconstruction engine
//!
//! Ingests the multi-stream UDP packet captures a radio telescope
//! station's digital backend produces, reconstructs one logically
//! continuous, time-aligned stream across the input ports, optionally
//! applies per-channel polarimetric calibration, and emits one of the
//! supported output layouts (raw rearrangements, split-polarization
//! interleavings, Stokes detections with temporal decimation).
//!
//! The engine tolerates packet loss, per-stream skew and out-of-order
//! arrivals: missing packets are synthesized (zero padding or replay of
//! the previous packet), stale duplicates are discarded, and every
//! iteration's outputs cover a gap-free window of packet numbers.
//!
//! ## Usage
//!
//! ```no_run
//! use beamrec::{ProcessingMode, Progress, Reader, ReaderConfig};
//! use capture_io::InputSpec;
//!
//! let config = ReaderConfig::new(
//!     vec![
//!         InputSpec::new("capture-port0.raw"),
//!         InputSpec::new("capture-port1.raw"),
//!     ],
//!     ProcessingMode::from_code(100)?,
//! );
//! let mut reader = Reader::open(config)?;
//! loop {
//!     match reader.step()? {
//!         Progress::Ok | Progress::DropsOccurred => { /* consume reader.outputs() */ }
//!         Progress::PacketCapReached | Progress::EndOfData => break,
//!     }
//! }
//! # Ok::<(), beamrec::ReaderError>(())
//! ```

mod align;
mod buffer;
pub mod calibration;
pub mod cancellation;
mod config;
pub mod dispatch;
mod error;
mod kernels;
mod meta;
mod output;
mod reader;

pub use buffer::PortBuffer;
pub use calibration::{
    CalibrateMode, CalibrationRequest, CalibrationTable, CoefficientSource, FixedTable,
    HelperProcess,
};
pub use cancellation::CancellationToken;
pub use config::{CalibrationConfig, ReaderConfig};
pub use dispatch::{OutputGeometry, ProcessingMode, StokesParam};
pub use error::ReaderError;
pub use meta::{ObsMeta, PortState};
pub use output::OutputBlock;
pub use reader::{Progress, Reader};

/// Result type for reader operations.
pub type Result<T> = std::result::Result<T, ReaderError>;
