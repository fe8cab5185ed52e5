//! Producer side: copy inbound queue messages into the landing buffer.
//!
//! The inbound topic is read as newline-delimited JSON. Each non-blank line
//! is one message and lands verbatim; nothing here looks inside it.
use crate::error::Result;
use crate::landing::LandingBuffer;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub landed: u64,
    pub blank_lines: u64,
    /// Lines that were not valid UTF-8 and were landed lossily.
    pub lossy_lines: u64,
}

/// Land every line of `reader`.
///
/// With `follow` set, end of input is not the end: the reader is polled
/// again after that interval (like `tail -f`) until `shutdown` is raised. A
/// trailing line without a newline is held back until it is completed, or
/// landed as is once input really ends.
pub fn land_lines<R: BufRead>(
    mut reader: R,
    buffer: &mut LandingBuffer,
    follow: Option<Duration>,
    shutdown: &AtomicBool,
) -> Result<IngestStats> {
    let mut stats = IngestStats::default();
    let mut line = Vec::new();
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let n = reader.read_until(b'\n', &mut line)?;
        let complete = line.last() == Some(&b'\n');
        if n == 0 || !complete {
            if let Some(poll) = follow {
                std::thread::sleep(poll);
                continue;
            }
            if line.is_empty() {
                break;
            }
        }
        land_one(&line, buffer, &mut stats)?;
        line.clear();
    }
    info!(
        landed = stats.landed,
        blank_lines = stats.blank_lines,
        next_offset = buffer.next_offset(),
        "input drained"
    );
    Ok(stats)
}

fn land_one(raw: &[u8], buffer: &mut LandingBuffer, stats: &mut IngestStats) -> Result<()> {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let text = String::from_utf8_lossy(raw);
    if text.trim().is_empty() {
        stats.blank_lines += 1;
        return Ok(());
    }
    if std::str::from_utf8(raw).is_err() {
        stats.lossy_lines += 1;
        debug!(bytes = raw.len(), "landing line with invalid UTF-8 replaced");
    }
    buffer.append(&text)?;
    stats.landed += 1;
    Ok(())
}
