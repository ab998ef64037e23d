//! [`Segment`]: a record's payload region, either buffered in memory or
//! backed by a file on disk.

use crate::error::{JalError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

/// A payload region. Immutable once the containing record is committed —
/// neither variant exposes a way to mutate its bytes after construction.
///
/// Both variants are plain data (a byte buffer, or a path + length), so
/// `Segment` serialises directly into the record's sled value with no
/// separate storage representation needed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Segment {
    /// Small segments (system metadata, app metadata, most payloads) live
    /// directly in the record's sled value.
    Memory(Vec<u8>),
    /// Payloads over the store's size threshold are written to
    /// `<db_root>/<record_type>/<nonce>` and referenced by path + length.
    File { path: PathBuf, len: u64 },
}

impl Segment {
    pub fn memory(bytes: impl Into<Vec<u8>>) -> Self {
        Segment::Memory(bytes.into())
    }

    pub fn file(path: impl Into<PathBuf>, len: u64) -> Self {
        Segment::File {
            path: path.into(),
            len,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Segment::Memory(buf) => buf.len() as u64,
            Segment::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens a sequential reader over the segment's bytes, starting at
    /// `offset` (used for journal-resume streaming, which skips the
    /// already-delivered prefix).
    pub fn reader(&self, offset: u64) -> Result<SegmentReader> {
        match self {
            Segment::Memory(buf) => {
                let start = offset.min(buf.len() as u64) as usize;
                Ok(SegmentReader::Memory(buf[start..].to_vec(), 0))
            }
            Segment::File { path, .. } => {
                if !path.exists() {
                    return Err(JalError::corrupted(format!(
                        "segment file missing: {}",
                        path.display()
                    )));
                }
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(offset))?;
                Ok(SegmentReader::File(file))
            }
        }
    }
}

/// A sequential reader positioned at some offset within a segment. The
/// feeder calls `read` repeatedly with whatever buffer size the caller
/// supplied, which may be smaller than a whole segment.
pub enum SegmentReader {
    Memory(Vec<u8>, usize),
    File(File),
}

impl Read for SegmentReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            SegmentReader::Memory(data, pos) => {
                let remaining = &data[*pos..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                *pos += n;
                Ok(n)
            }
            SegmentReader::File(file) => file.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn memory_segment_reads_from_offset() {
        let seg = Segment::memory(b"hello world".to_vec());
        let mut reader = seg.reader(6).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"world");
    }

    #[test]
    fn file_segment_reads_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"0123456789")
            .unwrap();
        let seg = Segment::file(&path, 10);
        let mut reader = seg.reader(4).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"456789");
    }

    #[test]
    fn segment_round_trips_through_bincode() {
        let seg = Segment::memory(b"abc".to_vec());
        let bytes = bincode::serialize(&seg).unwrap();
        let back: Segment = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.len(), 3);
    }

    #[test]
    fn missing_file_segment_is_corrupted_error() {
        let seg = Segment::file("/nonexistent/path/for/jald/test", 5);
        assert!(matches!(seg.reader(0), Err(JalError::Corrupted(_))));
    }
}
