//! Byte-stream backends for packet captures
//!
//! A capture stream is an opaque sequence of bytes: a raw packet dump, the
//! same dump compressed, a named pipe fed by another process, or a mapped
//! file. This crate hides the difference behind one read contract and knows
//! nothing about packets.
//!
//! The contract:
//!
//! - [`PortReader::read`] fills as much of the destination as the stream can
//!   provide. Fewer bytes than requested is not an error; it means the
//!   stream has ended (or, for a pipe, that the writer closed it).
//! - [`PortReader::peek`] reads without consuming, which is what the reader
//!   setup needs to inspect the first packet headers before sizing its
//!   buffers. Seekable backends rewind; pipes and compressed streams stash
//!   the peeked bytes in a push-back buffer drained by the next `read`.

mod reader;

pub use reader::{CaptureFormat, InputSpec, PortReader};

/// Errors raised by the capture backends.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to open capture `{path}`: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for capture reads.
pub type Result<T> = std::result::Result<T, InputError>;
