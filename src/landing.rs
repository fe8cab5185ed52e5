//! Landing buffer: the append-only log every consumed message lands in
//! before anything tries to interpret it.
//!
//! The writer side ([`LandingBuffer`]) only appends. There is no update or
//! delete. Readers attach with a [`Subscription`], which replays history
//! from a chosen offset and then follows the tail of the file as new
//! entries are flushed. Writers never wait on readers.
use crate::error::{PipelineError, Result};
use crate::record::{self, FileHeader, FileKind, FrameRead, FsyncPolicy, LandedMessage, RecordFrame};
use crate::timestamp::Timestamp;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LANDING_FILE: &str = "landing.log";

#[derive(Debug, Clone)]
pub struct LandingOptions {
    pub partition: u32,
    pub fsync: FsyncPolicy,
}

impl Default for LandingOptions {
    fn default() -> Self {
        Self {
            partition: 0,
            fsync: FsyncPolicy::EveryWrite,
        }
    }
}

pub fn landing_path(dir: &Path) -> PathBuf {
    dir.join(LANDING_FILE)
}

pub struct LandingBuffer {
    path: PathBuf,
    file: File,
    len: u64,
    options: LandingOptions,
    next_offset: u64,
    writes_since_sync: usize,
}

/// Summary of an existing log, produced while reopening it.
struct Recovered {
    valid_len: u64,
    next_offset: u64,
    torn_bytes: u64,
}

fn out_of_sequence(path: &Path, pos: u64, found: u64, expected: u64) -> PipelineError {
    PipelineError::Corrupt {
        path: path.to_path_buf(),
        offset: pos,
        reason: format!("landing offset {found} out of sequence, expected {expected}"),
    }
}

fn scan_existing(path: &Path) -> Result<Option<Recovered>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let file_len = file.metadata()?.len();
    let mut rdr = BufReader::new(file);
    let Some((_, header_len)) = record::read_header(&mut rdr, path, FileKind::Landing)? else {
        return Ok(None);
    };
    let mut pos = header_len;
    let mut next_offset = 0;
    loop {
        match record::read_frame(&mut rdr, path, pos)? {
            FrameRead::Frame(RecordFrame::Landed(m), len) => {
                if m.offset != next_offset {
                    return Err(out_of_sequence(path, pos, m.offset, next_offset));
                }
                next_offset = m.offset + 1;
                pos += len;
            }
            FrameRead::Frame(other, _) => {
                return Err(PipelineError::Corrupt {
                    path: path.to_path_buf(),
                    offset: pos,
                    reason: format!("unexpected frame in landing log: {other:?}"),
                });
            }
            FrameRead::Eof | FrameRead::Torn => break,
        }
    }
    Ok(Some(Recovered {
        valid_len: pos,
        next_offset,
        torn_bytes: file_len - pos,
    }))
}

impl LandingBuffer {
    /// Open the log in `dir`, creating it if needed. A torn trailing frame
    /// left by a crash is cut off; it was never acknowledged.
    pub fn open(dir: &Path, options: LandingOptions) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = landing_path(dir);

        let (mut file, len, next_offset) = match scan_existing(&path)? {
            Some(rec) => {
                let file = OpenOptions::new().write(true).open(&path)?;
                if rec.torn_bytes > 0 {
                    warn!(path = %path.display(), torn_bytes = rec.torn_bytes, "truncating torn landing frame");
                    file.set_len(rec.valid_len)?;
                    file.sync_data()?;
                }
                (file, rec.valid_len, rec.next_offset)
            }
            None => {
                let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
                let len = record::write_frame(&mut file, &RecordFrame::Header(FileHeader::new(FileKind::Landing)))?;
                file.sync_data()?;
                (file, len, 0)
            }
        };
        file.seek(SeekFrom::Start(len))?;
        info!(path = %path.display(), next_offset, "landing buffer open");
        Ok(Self {
            path,
            file,
            len,
            options,
            next_offset,
            writes_since_sync: 0,
        })
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Land one message verbatim. The entry is visible to subscribers once
    /// this returns.
    pub fn append(&mut self, payload: &str) -> Result<LandedMessage> {
        let msg = LandedMessage {
            partition: self.options.partition,
            offset: self.next_offset,
            consumed_at: Timestamp::now(),
            payload: payload.to_owned(),
        };
        self.len = record::append_frame(&mut self.file, self.len, &RecordFrame::Landed(msg.clone()))?;
        // The frame is in the file from here on, so its offset is spent even
        // if the sync below fails.
        self.next_offset += 1;
        self.writes_since_sync += 1;
        if self.options.fsync.due(self.writes_since_sync) {
            self.file.sync_data()?;
            self.writes_since_sync = 0;
        }
        debug!(offset = msg.offset, bytes = msg.payload.len(), "landed");
        Ok(msg)
    }

    /// Attach a reader to this log starting at `from_offset`.
    pub fn subscribe(&self, from_offset: u64, poll_interval: Duration, shutdown: Arc<AtomicBool>) -> Subscription {
        Subscription::at_path(self.path.clone(), from_offset, poll_interval, shutdown)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Every entry currently in the log, oldest first.
    pub fn read_all(dir: &Path) -> Result<Vec<LandedMessage>> {
        let mut sub = Subscription::open(dir, 0, Duration::ZERO, Arc::new(AtomicBool::new(true)));
        sub.drain_available()
    }
}

/// A reader attached to the landing log.
///
/// Iterating yields entries in offset order starting at `from_offset`. At
/// the tail the iterator sleeps for `poll_interval` and retries, until the
/// shared `shutdown` flag is raised, at which point it ends.
pub struct Subscription {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    pos: u64,
    /// Offset the next frame in the file must carry.
    expected: u64,
    from_offset: u64,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Subscription {
    pub fn open(dir: &Path, from_offset: u64, poll_interval: Duration, shutdown: Arc<AtomicBool>) -> Self {
        Self::at_path(landing_path(dir), from_offset, poll_interval, shutdown)
    }

    fn at_path(path: PathBuf, from_offset: u64, poll_interval: Duration, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            path,
            reader: None,
            pos: 0,
            expected: 0,
            from_offset,
            poll_interval,
            shutdown,
        }
    }

    fn attach(&mut self) -> Result<bool> {
        if self.reader.is_some() {
            return Ok(true);
        }
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut rdr = BufReader::new(file);
        match record::read_header(&mut rdr, &self.path, FileKind::Landing)? {
            Some((_, len)) => {
                self.pos = len;
                self.reader = Some(rdr);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Next entry if one is fully written, without waiting.
    pub fn try_next(&mut self) -> Result<Option<LandedMessage>> {
        if !self.attach()? {
            return Ok(None);
        }
        let Some(rdr) = self.reader.as_mut() else {
            return Ok(None);
        };
        loop {
            match record::read_frame(rdr, &self.path, self.pos)? {
                FrameRead::Frame(RecordFrame::Landed(m), len) => {
                    if m.offset != self.expected {
                        return Err(out_of_sequence(&self.path, self.pos, m.offset, self.expected));
                    }
                    self.pos += len;
                    self.expected = m.offset + 1;
                    if m.offset >= self.from_offset {
                        self.from_offset = m.offset + 1;
                        return Ok(Some(m));
                    }
                }
                FrameRead::Frame(other, _) => {
                    return Err(PipelineError::Corrupt {
                        path: self.path.clone(),
                        offset: self.pos,
                        reason: format!("unexpected frame in landing log: {other:?}"),
                    });
                }
                FrameRead::Eof | FrameRead::Torn => {
                    // rewind so the partial frame is re-read once complete
                    rdr.seek(SeekFrom::Start(self.pos))?;
                    return Ok(None);
                }
            }
        }
    }

    /// Everything available right now, without waiting for more.
    pub fn drain_available(&mut self) -> Result<Vec<LandedMessage>> {
        let mut out = Vec::new();
        while let Some(m) = self.try_next()? {
            out.push(m);
        }
        Ok(out)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Iterator for Subscription {
    type Item = Result<LandedMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.is_shut_down() {
                return None;
            }
            match self.try_next() {
                Ok(Some(m)) => return Some(Ok(m)),
                Ok(None) => std::thread::sleep(self.poll_interval),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
