//! Engine error types.

use rsp::HeaderError;

/// Fatal conditions raised by the reader.
///
/// Benign conditions (packet drops, short reads, the packet cap) are not
/// errors; they surface through [`crate::Progress`] and the per-port drop
/// counters.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("malformed packet header on port {port}: {source}")]
    MalformedHeader {
        port: usize,
        #[source]
        source: HeaderError,
    },

    #[error("port {port} runs a different sample clock than port 0; process the captures separately")]
    ClockMismatch { port: usize },

    #[error("could not align port {port} onto packet {target}")]
    AlignmentImpossible { port: usize, target: i64 },

    #[error("data integrity failure on port {port}: {excess} packets out of order in one iteration")]
    DataIntegrity { port: usize, excess: i64 },

    #[error("unknown processing mode {0}")]
    UnknownMode(i32),

    #[error("incompatible options: {0}")]
    IncompatibleOptions(&'static str),

    #[error("calibration failed: {0}")]
    CalibrationFailed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("capture input error: {0}")]
    Input(#[from] capture_io::InputError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReaderError {
    pub(crate) fn malformed(port: usize, source: HeaderError) -> Self {
        Self::MalformedHeader { port, source }
    }
}
