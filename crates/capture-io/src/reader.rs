//! The per-port capture reader and its backends.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::bufread::MultiGzDecoder;
use memmap2::Mmap;
use tracing::{debug, trace};

use crate::{InputError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// On-disk format of one capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureFormat {
    /// Sniff the gzip magic on open; fall back to a raw file.
    #[default]
    Auto,
    /// Raw packet dump.
    Raw,
    /// Gzip-compressed packet dump (concatenated members are handled).
    Gzip,
    /// Named pipe; opened like a file but never seeked.
    Fifo,
    /// Raw packet dump accessed through a memory map.
    Mmap,
}

/// Where and how to read one capture stream.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub path: PathBuf,
    pub format: CaptureFormat,
}

impl InputSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: CaptureFormat::Auto,
        }
    }

    pub fn with_format(path: impl Into<PathBuf>, format: CaptureFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }
}

enum Backend {
    File(BufReader<File>),
    Gzip(Box<MultiGzDecoder<BufReader<File>>>),
    Fifo(File),
    Mmap { map: Mmap, cursor: usize },
}

/// One open capture stream.
///
/// Owns the backend plus a push-back buffer so that peeked bytes are
/// re-delivered by the next read even on non-seekable backends.
pub struct PortReader {
    backend: Backend,
    pushback: Vec<u8>,
    path: PathBuf,
}

impl PortReader {
    /// Open a capture stream.
    pub fn open(spec: &InputSpec) -> Result<Self> {
        let open_file = |path: &Path| {
            File::open(path).map_err(|source| InputError::Open {
                path: path.display().to_string(),
                source,
            })
        };

        let format = match spec.format {
            CaptureFormat::Auto => Self::sniff(&spec.path)?,
            other => other,
        };

        let backend = match format {
            CaptureFormat::Raw => Backend::File(BufReader::new(open_file(&spec.path)?)),
            CaptureFormat::Gzip => Backend::Gzip(Box::new(MultiGzDecoder::new(BufReader::new(
                open_file(&spec.path)?,
            )))),
            CaptureFormat::Fifo => Backend::Fifo(open_file(&spec.path)?),
            CaptureFormat::Mmap => {
                let file = open_file(&spec.path)?;
                // Safety: the map is read-only and private to this reader;
                // concurrent truncation of the capture file is outside the
                // supported usage.
                let map = unsafe { Mmap::map(&file)? };
                Backend::Mmap { map, cursor: 0 }
            }
            CaptureFormat::Auto => unreachable!("resolved above"),
        };

        debug!(path = %spec.path.display(), ?format, "opened capture stream");
        Ok(Self {
            backend,
            pushback: Vec::new(),
            path: spec.path.clone(),
        })
    }

    fn sniff(path: &Path) -> Result<CaptureFormat> {
        let mut magic = [0u8; 2];
        let mut file = File::open(path).map_err(|source| InputError::Open {
            path: path.display().to_string(),
            source,
        })?;
        match file.read_exact(&mut magic) {
            Ok(()) if magic == GZIP_MAGIC => Ok(CaptureFormat::Gzip),
            _ => Ok(CaptureFormat::Raw),
        }
    }

    /// Path this stream was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fill `dst` from the stream. Returns the number of bytes delivered;
    /// anything short of `dst.len()` means end of stream.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let mut filled = 0;

        if !self.pushback.is_empty() {
            let n = self.pushback.len().min(dst.len());
            dst[..n].copy_from_slice(&self.pushback[..n]);
            self.pushback.drain(..n);
            filled = n;
        }

        while filled < dst.len() {
            let n = match &mut self.backend {
                Backend::File(f) => read_retry(f, &mut dst[filled..])?,
                Backend::Gzip(f) => read_retry(f.as_mut(), &mut dst[filled..])?,
                Backend::Fifo(f) => read_retry(f, &mut dst[filled..])?,
                Backend::Mmap { map, cursor } => {
                    let left = map.len() - *cursor;
                    let n = left.min(dst.len() - filled);
                    dst[filled..filled + n].copy_from_slice(&map[*cursor..*cursor + n]);
                    *cursor += n;
                    n
                }
            };
            if n == 0 {
                trace!(path = %self.path.display(), filled, "end of capture stream");
                break;
            }
            filled += n;
        }

        Ok(filled)
    }

    /// Fill `dst` without consuming the stream.
    pub fn peek(&mut self, dst: &mut [u8]) -> Result<usize> {
        if let Backend::Mmap { map, cursor } = &self.backend {
            let left = map.len() - *cursor;
            let n = left.min(dst.len());
            dst[..n].copy_from_slice(&map[*cursor..*cursor + n]);
            return Ok(n);
        }

        // Bytes stashed by an earlier peek come first; they are still ahead
        // of the consuming read cursor.
        let from_stash = self.pushback.len().min(dst.len());
        dst[..from_stash].copy_from_slice(&self.pushback[..from_stash]);
        let mut n = from_stash;

        if n < dst.len() {
            let fresh = self.read_past_pushback_at(dst, n)?;
            match &mut self.backend {
                Backend::File(f) => {
                    f.seek(SeekFrom::Current(-(fresh as i64)))?;
                }
                Backend::Gzip(_) | Backend::Fifo(_) => {
                    self.pushback.extend_from_slice(&dst[n..n + fresh]);
                }
                Backend::Mmap { .. } => unreachable!("handled above"),
            }
            n += fresh;
        }

        Ok(n)
    }

    /// Read from the underlying backend only, bypassing the push-back
    /// buffer, into `dst[at..]`. Returns the freshly read byte count; the
    /// caller re-stitches stream state.
    fn read_past_pushback_at(&mut self, dst: &mut [u8], at: usize) -> Result<usize> {
        let mut filled = at;
        while filled < dst.len() {
            let n = match &mut self.backend {
                Backend::File(f) => read_retry(f, &mut dst[filled..])?,
                Backend::Gzip(f) => read_retry(f.as_mut(), &mut dst[filled..])?,
                Backend::Fifo(f) => read_retry(f, &mut dst[filled..])?,
                Backend::Mmap { .. } => unreachable!("mmap peeks never reach the backend"),
            };
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled - at)
    }
}

fn read_retry(reader: &mut impl Read, dst: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match reader.read(dst) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn payload() -> Vec<u8> {
        (0..100_000u32).flat_map(|v| v.to_le_bytes()).collect()
    }

    fn write_raw(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn write_gzip(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut enc = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::fast());
        enc.write_all(data).unwrap();
        enc.finish().unwrap();
        path
    }

    fn read_all_chunked(reader: &mut PortReader, chunk: usize, total: usize) -> Vec<u8> {
        let mut out = vec![0u8; total];
        let mut at = 0;
        while at < total {
            let want = chunk.min(total - at);
            let n = reader.read(&mut out[at..at + want]).unwrap();
            at += n;
            if n < want {
                break;
            }
        }
        out.truncate(at);
        out
    }

    #[test]
    fn raw_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload();
        let path = write_raw(&dir, "capture.raw", &data);

        let mut reader =
            PortReader::open(&InputSpec::with_format(&path, CaptureFormat::Raw)).unwrap();
        assert_eq!(read_all_chunked(&mut reader, 7_777, data.len()), data);
    }

    #[test]
    fn gzip_round_trip_resumes_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload();
        let path = write_gzip(&dir, "capture.gz", &data);

        let mut reader =
            PortReader::open(&InputSpec::with_format(&path, CaptureFormat::Gzip)).unwrap();
        assert_eq!(read_all_chunked(&mut reader, 4_096, data.len()), data);
    }

    #[test]
    fn mmap_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload();
        let path = write_raw(&dir, "capture.raw", &data);

        let mut reader =
            PortReader::open(&InputSpec::with_format(&path, CaptureFormat::Mmap)).unwrap();
        assert_eq!(read_all_chunked(&mut reader, 10_000, data.len()), data);
    }

    #[test]
    fn auto_detects_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload();
        let gz = write_gzip(&dir, "capture.gz", &data);
        let raw = write_raw(&dir, "capture.raw", &data);

        let mut out = vec![0u8; 64];
        let mut reader = PortReader::open(&InputSpec::new(&gz)).unwrap();
        reader.read(&mut out).unwrap();
        assert_eq!(out, data[..64]);

        let mut reader = PortReader::open(&InputSpec::new(&raw)).unwrap();
        reader.read(&mut out).unwrap();
        assert_eq!(out, data[..64]);
    }

    #[test]
    fn short_read_at_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(&dir, "tiny.raw", &[1, 2, 3]);

        let mut reader = PortReader::open(&InputSpec::new(&path)).unwrap();
        let mut dst = [0u8; 8];
        assert_eq!(reader.read(&mut dst).unwrap(), 3);
        assert_eq!(&dst[..3], &[1, 2, 3]);
        assert_eq!(reader.read(&mut dst).unwrap(), 0);
    }

    #[test]
    fn peek_then_read_sees_the_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload();

        for format in [CaptureFormat::Raw, CaptureFormat::Gzip, CaptureFormat::Mmap] {
            let path = match format {
                CaptureFormat::Gzip => write_gzip(&dir, "peek.gz", &data),
                _ => write_raw(&dir, "peek.raw", &data),
            };
            let mut reader = PortReader::open(&InputSpec::with_format(&path, format)).unwrap();

            let mut peeked = [0u8; 128];
            assert_eq!(reader.peek(&mut peeked).unwrap(), 128, "{format:?}");
            assert_eq!(peeked, data[..128], "{format:?}");

            // A second peek must see the same window.
            let mut again = [0u8; 64];
            assert_eq!(reader.peek(&mut again).unwrap(), 64, "{format:?}");
            assert_eq!(again, data[..64], "{format:?}");

            let full = read_all_chunked(&mut reader, 9_999, data.len());
            assert_eq!(full, data, "{format:?}");
        }
    }
}
