//! Synthetic capture builder shared by the scenario tests.

use std::path::PathBuf;

/// Opt-in log output for debugging a scenario: `RUST_LOG=beamrec=trace`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Timestamp used by all synthetic captures. Chosen so the second starts
/// exactly on a packet boundary at the 200 MHz clock.
pub const TIMESTAMP: u32 = 1_600_000_000;

/// Wire sample width of a capture.
#[derive(Clone, Copy, PartialEq)]
pub enum Width {
    Bits16,
    Bits8,
    Bits4,
}

impl Width {
    fn bit_mode_bits(self) -> u8 {
        match self {
            Width::Bits16 => 0,
            Width::Bits8 => 1,
            Width::Bits4 => 2,
        }
    }
}

/// Build one packet header. `index` is the packet's offset from the start
/// of the second (sequence advances by 16 per packet).
pub fn header(beamlets: usize, width: Width, index: u32) -> [u8; 16] {
    let mut h = [0u8; 16];
    h[0] = 3;
    h[1] = 0x80 | 0x02; // 200 MHz clock, RSP 2
    h[2] = width.bit_mode_bits();
    h[4..6].copy_from_slice(&(607u16 * 32).to_le_bytes());
    h[6] = beamlets as u8;
    h[7] = 16;
    h[8..12].copy_from_slice(&TIMESTAMP.to_le_bytes());
    h[12..16].copy_from_slice(&(index * 16).to_le_bytes());
    h
}

/// Build one packet; `sample(beamlet, ts, pol)` supplies the component
/// values (truncated to the wire width).
pub fn packet(
    beamlets: usize,
    width: Width,
    index: u32,
    sample: impl Fn(usize, usize, usize) -> i32,
) -> Vec<u8> {
    let mut out = header(beamlets, width, index).to_vec();
    for b in 0..beamlets {
        for ts in 0..16 {
            match width {
                Width::Bits16 => {
                    for pol in 0..4 {
                        out.extend((sample(b, ts, pol) as i16).to_le_bytes());
                    }
                }
                Width::Bits8 => {
                    for pol in 0..4 {
                        out.push(sample(b, ts, pol) as i8 as u8);
                    }
                }
                Width::Bits4 => {
                    for pair in 0..2 {
                        let hi = sample(b, ts, pair * 2) as i8 & 0x0f;
                        let lo = sample(b, ts, pair * 2 + 1) as i8 & 0x0f;
                        out.push(((hi as u8) << 4) | lo as u8);
                    }
                }
            }
        }
    }
    out
}

/// Write a capture file holding the packets at the given indices.
pub fn write_capture(
    dir: &tempfile::TempDir,
    name: &str,
    beamlets: usize,
    width: Width,
    indices: &[u32],
    sample: impl Fn(u32, usize, usize, usize) -> i32,
) -> PathBuf {
    let mut bytes = Vec::new();
    for &index in indices {
        bytes.extend(packet(beamlets, width, index, |b, ts, pol| {
            sample(index, b, ts, pol)
        }));
    }
    let path = dir.path().join(name);
    std::fs::write(&path, &bytes).unwrap();
    path
}

/// The default payload pattern: nonzero, distinct per packet/beamlet/slice
/// and well inside every wire width.
pub fn pattern(index: u32, b: usize, ts: usize, pol: usize) -> i32 {
    ((index as usize * 11 + b * 7 + ts * 3 + pol) % 13) as i32 - 6
}
