//! Transform view: the continuous projection from the landing log into the
//! fact store.
//!
//! One message in, one fact out. Each landed entry is decoded, stamped with
//! a fresh `landed_at` and appended to the store. The consumer position is
//! kept in a [`CursorStore`] and only moves past an entry once the store
//! has acknowledged its fact, so a crash or a storage outage can replay
//! entries (adding versions the merge later drops) but never skip one.
use crate::cursor::CursorStore;
use crate::decode;
use crate::error::{PipelineError, Result};
use crate::record::{CandleFact, LandedMessage};
use crate::store::FactSink;
use crate::timestamp::LandedAtClock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TransformOptions {
    /// Persist the cursor after this many acknowledged appends.
    pub commit_every: usize,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            commit_every: 64,
            retry_initial: Duration::from_millis(50),
            retry_max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub processed: u64,
    pub append_retries: u64,
    /// Facts written with an empty ticker (undecodable payloads land too).
    pub empty_tickers: u64,
}

pub struct TransformView<S: FactSink> {
    sink: S,
    cursor: CursorStore,
    clock: LandedAtClock,
    options: TransformOptions,
    stats: TransformStats,
    shutdown: Arc<AtomicBool>,
    next_offset: u64,
    progress: Arc<AtomicU64>,
    uncommitted: usize,
}

impl<S: FactSink> TransformView<S> {
    /// The clock is moved past the newest `landed_at` already in the sink so
    /// a restarted view keeps stamping above earlier versions.
    pub fn new(
        sink: S,
        cursor: CursorStore,
        mut clock: LandedAtClock,
        options: TransformOptions,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        clock.observe(sink.max_landed_at());
        let next_offset = cursor.committed();
        Self {
            sink,
            cursor,
            clock,
            options,
            stats: TransformStats::default(),
            shutdown,
            next_offset,
            progress: Arc::new(AtomicU64::new(next_offset)),
            uncommitted: 0,
        }
    }

    /// Landing offset the view resumes from.
    pub fn start_offset(&self) -> u64 {
        self.cursor.committed()
    }

    /// Offset of the next entry to transform. Everything below it is
    /// acknowledged by the store, though not necessarily committed yet.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Shared view of [`TransformView::next_offset`] for other threads.
    pub fn progress(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.progress)
    }

    pub fn stats(&self) -> &TransformStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Transform one landed entry and append the resulting fact.
    pub fn process(&mut self, msg: &LandedMessage) -> Result<CandleFact> {
        let decoded = decode::decode(&msg.payload);
        if decoded.ticker.is_empty() {
            self.stats.empty_tickers += 1;
            warn!(offset = msg.offset, "payload has no ticker; landing an empty row");
        }
        let fact = decoded.land(self.clock.next_stamp());
        self.append_acknowledged(msg.offset, &fact)?;

        self.next_offset = msg.offset + 1;
        self.progress.store(self.next_offset, Ordering::Release);
        self.stats.processed += 1;
        self.uncommitted += 1;
        debug!(offset = msg.offset, ticker = %fact.ticker, landed_at = %fact.landed_at, "transformed");

        if self.uncommitted >= self.options.commit_every.max(1) {
            self.commit()?;
        }
        Ok(fact)
    }

    /// Retry the append with exponential backoff until the sink accepts it.
    /// Only a shutdown request ends the retries early.
    fn append_acknowledged(&mut self, offset: u64, fact: &CandleFact) -> Result<()> {
        let mut delay = self.options.retry_initial;
        loop {
            let err = match self.sink.append(fact) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if self.shutdown.load(Ordering::Acquire) {
                warn!(offset, error = %err, "append failed during shutdown; entry left for replay");
                return Err(PipelineError::ShutDown);
            }
            self.stats.append_retries += 1;
            warn!(offset, error = %err, retry_in_ms = delay.as_millis() as u64, "fact append failed");
            std::thread::sleep(delay);
            delay = (delay * 2).min(self.options.retry_max);
        }
    }

    /// Persist the position of the last acknowledged entry.
    pub fn commit(&mut self) -> Result<()> {
        self.cursor.commit(self.next_offset)?;
        self.uncommitted = 0;
        Ok(())
    }

    /// Consume entries until the source ends, then commit.
    ///
    /// A shutdown request is a clean stop. Any other error is returned
    /// after committing whatever was acknowledged before it.
    pub fn run<I>(&mut self, source: I) -> Result<TransformStats>
    where
        I: IntoIterator<Item = Result<LandedMessage>>,
    {
        info!(from_offset = self.next_offset, "transform view started");
        let outcome = source.into_iter().try_for_each(|item| self.process(&item?).map(drop));
        self.commit()?;
        match outcome {
            Ok(()) | Err(PipelineError::ShutDown) => {
                info!(
                    processed = self.stats.processed,
                    append_retries = self.stats.append_retries,
                    next_offset = self.next_offset,
                    "transform view stopped"
                );
                Ok(self.stats.clone())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Timestamp;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    #[derive(Default)]
    struct MemSink {
        rows: Mutex<Vec<CandleFact>>,
        seed: Timestamp,
    }

    impl FactSink for MemSink {
        fn append(&self, fact: &CandleFact) -> Result<()> {
            self.rows.lock().push(fact.clone());
            Ok(())
        }

        fn max_landed_at(&self) -> Timestamp {
            self.seed
        }
    }

    /// Fails the first `failures` appends, checking the cursor was not
    /// moved while the fact is still unacknowledged.
    struct FlakySink {
        failures: Mutex<usize>,
        cursor_dir: PathBuf,
        rows: Mutex<Vec<CandleFact>>,
    }

    impl FactSink for FlakySink {
        fn append(&self, fact: &CandleFact) -> Result<()> {
            let mut left = self.failures.lock();
            if *left > 0 {
                *left -= 1;
                assert_eq!(CursorStore::open(&self.cursor_dir).unwrap().committed(), 0);
                return Err(std::io::Error::other("disk unavailable").into());
            }
            self.rows.lock().push(fact.clone());
            Ok(())
        }
    }

    fn msg(offset: u64, payload: &str) -> LandedMessage {
        LandedMessage {
            partition: 0,
            offset,
            consumed_at: Timestamp::ZERO,
            payload: payload.into(),
        }
    }

    fn fast() -> TransformOptions {
        TransformOptions {
            commit_every: 1,
            retry_initial: Duration::from_millis(1),
            retry_max: Duration::from_millis(4),
        }
    }

    fn frozen_clock() -> LandedAtClock {
        LandedAtClock::with_source(|| Timestamp::from_micros(1_000))
    }

    #[test]
    fn later_message_gets_later_landed_at() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = CursorStore::open(dir.path()).unwrap();
        let mut view = TransformView::new(MemSink::default(), cursor, frozen_clock(), fast(), Arc::new(AtomicBool::new(false)));
        let a = view.process(&msg(0, r#"{"ticker":"A"}"#)).unwrap();
        let b = view.process(&msg(1, r#"{"ticker":"B"}"#)).unwrap();
        assert!(a.landed_at < b.landed_at);
        let rows = view.sink().rows.lock();
        assert_eq!(rows.iter().map(|r| r.ticker.as_str()).collect::<Vec<_>>(), ["A", "B"]);
    }

    #[test]
    fn clock_is_seeded_above_stored_versions() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MemSink {
            seed: Timestamp::from_micros(5_000),
            ..MemSink::default()
        };
        let cursor = CursorStore::open(dir.path()).unwrap();
        let mut view = TransformView::new(sink, cursor, frozen_clock(), fast(), Arc::new(AtomicBool::new(false)));
        let fact = view.process(&msg(0, "{}")).unwrap();
        assert_eq!(fact.landed_at.as_micros(), 5_001);
        assert_eq!(view.stats().empty_tickers, 1);
    }

    #[test]
    fn failed_appends_are_retried_before_commit() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlakySink {
            failures: Mutex::new(3),
            cursor_dir: dir.path().to_path_buf(),
            rows: Mutex::new(Vec::new()),
        };
        let cursor = CursorStore::open(dir.path()).unwrap();
        let mut view = TransformView::new(sink, cursor, frozen_clock(), fast(), Arc::new(AtomicBool::new(false)));
        view.process(&msg(0, r#"{"ticker":"A"}"#)).unwrap();

        assert_eq!(view.stats().append_retries, 3);
        assert_eq!(view.sink().rows.lock().len(), 1);
        assert_eq!(CursorStore::open(dir.path()).unwrap().committed(), 1);
    }

    #[test]
    fn shutdown_interrupts_retries_without_advancing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlakySink {
            failures: Mutex::new(usize::MAX),
            cursor_dir: dir.path().to_path_buf(),
            rows: Mutex::new(Vec::new()),
        };
        let cursor = CursorStore::open(dir.path()).unwrap();
        let stop = Arc::new(AtomicBool::new(true));
        let mut view = TransformView::new(sink, cursor, frozen_clock(), fast(), stop);

        let stats = view.run(vec![Ok(msg(0, r#"{"ticker":"A"}"#))]).unwrap();
        assert_eq!(stats.processed, 0);
        assert_eq!(view.next_offset(), 0);
        assert_eq!(CursorStore::open(dir.path()).unwrap().committed(), 0);
    }

    #[test]
    fn run_commits_on_exit_even_with_sparse_commits() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = CursorStore::open(dir.path()).unwrap();
        let options = TransformOptions {
            commit_every: 100,
            ..fast()
        };
        let mut view = TransformView::new(MemSink::default(), cursor, frozen_clock(), options, Arc::new(AtomicBool::new(false)));
        let source = (0..3).map(|i| Ok(msg(i, r#"{"ticker":"A"}"#)));
        let stats = view.run(source).unwrap();
        assert_eq!(stats.processed, 3);
        assert_eq!(view.progress().load(Ordering::Acquire), 3);
        assert_eq!(CursorStore::open(dir.path()).unwrap().committed(), 3);
    }

    #[test]
    fn source_error_is_returned_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = CursorStore::open(dir.path()).unwrap();
        let options = TransformOptions {
            commit_every: 100,
            ..fast()
        };
        let mut view = TransformView::new(MemSink::default(), cursor, frozen_clock(), options, Arc::new(AtomicBool::new(false)));
        let source = vec![
            Ok(msg(0, r#"{"ticker":"A"}"#)),
            Err(PipelineError::Corrupt {
                path: PathBuf::from("landing.log"),
                offset: 99,
                reason: "CRC mismatch".into(),
            }),
        ];
        assert!(matches!(view.run(source), Err(PipelineError::Corrupt { .. })));
        assert_eq!(CursorStore::open(dir.path()).unwrap().committed(), 1);
    }
}
