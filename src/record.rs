//! Durable on-disk schema and the frame codec shared by every log file.
//!
//! Each file is a sequence of frames:
//!
//! ```text
//! [len: u32 LE][crc32: u32 LE][bincode(RecordFrame): len bytes]
//! ```
//!
//! The first frame of a file is always a [`FileHeader`]. Landing logs then
//! hold [`LandedMessage`] frames; fact-store parts hold [`CandleFact`] frames.
use crate::error::{PipelineError, Result};
use crate::timestamp::Timestamp;
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const FORMAT_VERSION: u16 = 1;
pub const FRAME_PREFIX_LEN: u64 = 8;
const MAX_FRAME_LEN: u32 = 64 << 20;

/// When appended frames are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    EveryWrite,
    EveryN(usize),
    /// Leave it to the OS page cache.
    Never,
}

impl FsyncPolicy {
    pub fn due(self, writes_since_sync: usize) -> bool {
        match self {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => writes_since_sync >= n.max(1),
            FsyncPolicy::Never => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Landing,
    Facts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub version: u16,
    pub kind: FileKind,
    pub created_at: Timestamp,
}

impl FileHeader {
    pub fn new(kind: FileKind) -> Self {
        Self {
            version: FORMAT_VERSION,
            kind,
            created_at: Timestamp::now(),
        }
    }
}

/// One inbound queue message, exactly as consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandedMessage {
    pub partition: u32,
    pub offset: u64,      // dense, starts at 0
    pub consumed_at: Timestamp,
    pub payload: String,  // verbatim, never interpreted here
}

/// Logical identity of a candle: rows sharing it are versions of one fact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FactKey {
    pub ticker: String,
    pub open_dt: Timestamp,
    pub close_dt: Timestamp,
}

/// A decoded, typed candle row as stored in the fact store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleFact {
    pub ticker: String,
    pub open_price: f64,
    pub close_price: f64,
    pub sma: f64,
    pub std: f64,
    pub avg_price: f64,
    pub close_to_open_ratio: f64,
    pub open_dt: Timestamp,
    pub close_dt: Timestamp,
    /// Version discriminator, assigned by the transform view.
    pub landed_at: Timestamp,
}

impl CandleFact {
    pub fn key(&self) -> FactKey {
        FactKey {
            ticker: self.ticker.clone(),
            open_dt: self.open_dt,
            close_dt: self.close_dt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordFrame {
    Header(FileHeader),
    Landed(LandedMessage),
    Fact(CandleFact),
}

/// Result of trying to read one frame.
#[derive(Debug)]
pub enum FrameRead {
    /// A complete, checksummed frame and the number of bytes it occupied.
    Frame(RecordFrame, u64),
    /// Clean end of file at a frame boundary.
    Eof,
    /// The file ends inside a frame: either a writer is mid-append or a
    /// crash cut the last write short.
    Torn,
}

pub fn encode_frame(frame: &RecordFrame) -> Result<Vec<u8>> {
    let payload = bincode::serialize(frame)?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(FRAME_PREFIX_LEN as usize + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Write one frame, returning the bytes written.
pub fn write_frame<W: Write>(w: &mut W, frame: &RecordFrame) -> Result<u64> {
    let bytes = encode_frame(frame)?;
    w.write_all(&bytes)?;
    Ok(bytes.len() as u64)
}

/// Append one frame to a log whose valid length is `len`. If the write
/// fails part-way the file is cut back to `len` so no partial frame is left
/// in front of later appends. Returns the new length.
pub fn append_frame(file: &mut File, len: u64, frame: &RecordFrame) -> Result<u64> {
    let bytes = encode_frame(frame)?;
    if let Err(e) = file.write_all(&bytes) {
        let _ = file.set_len(len);
        let _ = file.seek(SeekFrom::Start(len));
        return Err(e.into());
    }
    Ok(len + bytes.len() as u64)
}

/// Like `read_exact`, but reports how much was read when the input ends.
fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read the frame starting at byte `pos` of `path` (both only used for
/// error reporting).
pub fn read_frame<R: Read>(r: &mut R, path: &Path, pos: u64) -> Result<FrameRead> {
    let corrupt = |reason: String| PipelineError::Corrupt {
        path: path.to_path_buf(),
        offset: pos,
        reason,
    };

    let mut prefix = [0u8; FRAME_PREFIX_LEN as usize];
    match read_up_to(r, &mut prefix)? {
        0 => return Ok(FrameRead::Eof),
        n if n < prefix.len() => return Ok(FrameRead::Torn),
        _ => {}
    }
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    let crc_on_file = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
    if len > MAX_FRAME_LEN {
        return Err(corrupt(format!("implausible frame length {len}")));
    }

    let mut payload = vec![0u8; len as usize];
    if read_up_to(r, &mut payload)? < payload.len() {
        return Ok(FrameRead::Torn);
    }
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc_calc = hasher.finalize();
    if crc_calc != crc_on_file {
        return Err(corrupt(format!(
            "CRC mismatch: file={crc_on_file:#x}, calc={crc_calc:#x}"
        )));
    }
    let frame: RecordFrame =
        bincode::deserialize(&payload).map_err(|e| corrupt(format!("bincode decode: {e}")))?;
    Ok(FrameRead::Frame(frame, FRAME_PREFIX_LEN + u64::from(len)))
}

/// Read and check the header frame a log file must start with.
pub fn read_header<R: Read>(r: &mut R, path: &Path, expected: FileKind) -> Result<Option<(FileHeader, u64)>> {
    match read_frame(r, path, 0)? {
        FrameRead::Frame(RecordFrame::Header(h), len) => {
            if h.kind != expected {
                return Err(PipelineError::Corrupt {
                    path: path.to_path_buf(),
                    offset: 0,
                    reason: format!("expected a {expected:?} file, found {:?}", h.kind),
                });
            }
            if h.version != FORMAT_VERSION {
                return Err(PipelineError::Corrupt {
                    path: path.to_path_buf(),
                    offset: 0,
                    reason: format!("unsupported format version {}", h.version),
                });
            }
            Ok(Some((h, len)))
        }
        FrameRead::Frame(other, _) => Err(PipelineError::Corrupt {
            path: path.to_path_buf(),
            offset: 0,
            reason: format!("first frame is not a header: {other:?}"),
        }),
        FrameRead::Eof | FrameRead::Torn => Ok(None),
    }
}
