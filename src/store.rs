//! Fact store: an append-only table that merges duplicate versions of a
//! candle in the background.
//!
//! Layout of the store directory:
//!
//! ```text
//! active.log                      rows appended since the last seal
//! part_<min>_<max>_<level>.log    immutable sealed or merged parts
//! ```
//!
//! `<min>..=<max>` is the range of insert blocks a part covers and `<level>`
//! how many merges produced it (0 for a freshly sealed block). A merge
//! rewrites every sealed part into one part that keeps, per identity
//! `(ticker, open_dt, close_dt)`, only the row with the greatest
//! `landed_at`. The rewrite lands in a temp file and is renamed into place
//! before the in-memory part list is swapped, so readers see either the
//! old parts or the merged one, never a mix.
//!
//! Crash safety: a leftover `*.tmp` is deleted on open; a source part that
//! survived its merged replacement is recognised by its covered block range
//! and dropped. Either way the worst outcome of a crash is extra versions
//! that the next merge removes.
use crate::error::{PipelineError, Result};
use crate::record::{self, CandleFact, FactKey, FileHeader, FileKind, FrameRead, FsyncPolicy, RecordFrame};
use crate::timestamp::Timestamp;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ACTIVE_FILE: &str = "active.log";

/// Where the transform view writes. Implemented by [`FactStore`]; tests
/// wrap it to inject storage failures.
pub trait FactSink {
    fn append(&self, fact: &CandleFact) -> Result<()>;

    /// Greatest `landed_at` already stored, used to seed the version clock.
    fn max_landed_at(&self) -> Timestamp {
        Timestamp::ZERO
    }
}

impl<S: FactSink + ?Sized> FactSink for Arc<S> {
    fn append(&self, fact: &CandleFact) -> Result<()> {
        (**self).append(fact)
    }

    fn max_landed_at(&self) -> Timestamp {
        (**self).max_landed_at()
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Seal the active part into a level-0 part once it holds this many rows.
    pub max_active_rows: usize,
    pub fsync: FsyncPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_active_rows: 8192,
            fsync: FsyncPolicy::EveryWrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartName {
    pub min_block: u64,
    pub max_block: u64,
    pub level: u32,
}

impl PartName {
    pub fn file_name(&self) -> String {
        format!("part_{:010}_{:010}_{}.log", self.min_block, self.max_block, self.level)
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_prefix("part_")?.strip_suffix(".log")?;
        let mut it = stem.split('_');
        let name = PartName {
            min_block: it.next()?.parse().ok()?,
            max_block: it.next()?.parse().ok()?,
            level: it.next()?.parse().ok()?,
        };
        if it.next().is_some() || name.min_block > name.max_block {
            return None;
        }
        Some(name)
    }

    /// True when `self` is the product of a merge that consumed `other`.
    pub fn covers(&self, other: &PartName) -> bool {
        self.level > other.level && self.min_block <= other.min_block && other.max_block <= self.max_block
    }
}

#[derive(Debug)]
pub struct Part {
    pub name: PartName,
    pub path: PathBuf,
    pub rows: Vec<CandleFact>,
}

impl Part {
    fn has_duplicate_identities(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.rows.len());
        self.rows.iter().any(|r| !seen.insert(r.key()))
    }
}

struct ActivePart {
    file: File,
    header_len: u64,
    len: u64,
    rows: Vec<CandleFact>,
    writes_since_sync: usize,
    next_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    NothingToMerge,
    Merged {
        name: PartName,
        parts_in: usize,
        rows_in: usize,
        rows_out: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub parts: usize,
    pub active_rows: usize,
    pub total_rows: usize,
    pub identities: usize,
}

impl StoreStats {
    /// Rows that a full merge would discard.
    pub fn superseded_rows(&self) -> usize {
        self.total_rows - self.identities
    }
}

/// Row filter for reads.
#[derive(Debug, Clone, Default)]
pub struct FactFilter {
    pub ticker: Option<String>,
    /// Inclusive lower bound on `open_dt`.
    pub open_from: Option<Timestamp>,
    /// Exclusive upper bound on `open_dt`.
    pub open_until: Option<Timestamp>,
}

impl FactFilter {
    pub fn ticker(ticker: impl Into<String>) -> Self {
        Self {
            ticker: Some(ticker.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, fact: &CandleFact) -> bool {
        self.ticker.as_deref().is_none_or(|t| fact.ticker == t)
            && self.open_from.is_none_or(|from| fact.open_dt >= from)
            && self.open_until.is_none_or(|until| fact.open_dt < until)
    }
}

/// Collapse rows to one per identity, keeping the greatest `landed_at`.
/// Rows are taken as oldest-first; on a `landed_at` tie the later row wins.
/// The result is ordered by identity.
pub fn collapse_versions<I>(rows: I) -> Vec<CandleFact>
where
    I: IntoIterator<Item = CandleFact>,
{
    let mut best: BTreeMap<FactKey, CandleFact> = BTreeMap::new();
    for row in rows {
        match best.get(&row.key()) {
            Some(cur) if cur.landed_at > row.landed_at => {}
            _ => {
                best.insert(row.key(), row);
            }
        }
    }
    best.into_values().collect()
}

fn sync_dir(dir: &Path) {
    // directory fsync is unsupported on some platforms
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

fn write_part(dir: &Path, name: PartName, rows: &[CandleFact]) -> Result<PathBuf> {
    let final_path = dir.join(name.file_name());
    let tmp_path = final_path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut w = BufWriter::with_capacity(1 << 20, file);
        record::write_frame(&mut w, &RecordFrame::Header(FileHeader::new(FileKind::Facts)))?;
        for row in rows {
            record::write_frame(&mut w, &RecordFrame::Fact(row.clone()))?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    sync_dir(dir);
    Ok(final_path)
}

struct FactFile {
    rows: Vec<CandleFact>,
    header_len: u64,
    valid_len: u64,
    torn: bool,
}

/// Read every fact frame of a file, stopping at a torn tail.
fn read_facts(path: &Path) -> Result<FactFile> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    parse_facts(&mut BufReader::new(file), path, file_len)
}

fn parse_facts<R: Read>(rdr: &mut R, path: &Path, file_len: u64) -> Result<FactFile> {
    let Some((_, header_len)) = record::read_header(rdr, path, FileKind::Facts)? else {
        return Ok(FactFile { rows: Vec::new(), header_len: 0, valid_len: 0, torn: true });
    };
    let mut rows = Vec::new();
    let mut pos = header_len;
    loop {
        match record::read_frame(rdr, path, pos)? {
            FrameRead::Frame(RecordFrame::Fact(f), len) => {
                rows.push(f);
                pos += len;
            }
            FrameRead::Frame(other, _) => {
                return Err(PipelineError::Corrupt {
                    path: path.to_path_buf(),
                    offset: pos,
                    reason: format!("unexpected frame in fact file: {other:?}"),
                });
            }
            FrameRead::Eof | FrameRead::Torn => {
                return Ok(FactFile { rows, header_len, valid_len: pos, torn: file_len > pos });
            }
        }
    }
}

fn load_part(path: PathBuf, name: PartName) -> Result<Part> {
    let file = read_facts(&path)?;
    if file.torn {
        // sealed parts are fsynced before they get their final name
        return Err(PipelineError::Corrupt {
            path,
            offset: file.valid_len,
            reason: "sealed part ends in a partial frame".into(),
        });
    }
    Ok(Part { name, path, rows: file.rows })
}

fn open_active(dir: &Path, next_block: u64) -> Result<ActivePart> {
    let path = dir.join(ACTIVE_FILE);
    let existing = if path.exists() { Some(read_facts(&path)?) } else { None };
    let (mut file, header_len, len, rows) = match existing {
        Some(found) if found.header_len > 0 => {
            let file = OpenOptions::new().write(true).open(&path)?;
            if found.torn {
                warn!(path = %path.display(), valid_len = found.valid_len, "truncating torn fact frame");
                file.set_len(found.valid_len)?;
                file.sync_data()?;
            }
            (file, found.header_len, found.valid_len, found.rows)
        }
        _ => {
            let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
            let header_len = record::write_frame(&mut file, &RecordFrame::Header(FileHeader::new(FileKind::Facts)))?;
            file.sync_data()?;
            (file, header_len, header_len, Vec::new())
        }
    };
    file.seek(SeekFrom::Start(len))?;
    Ok(ActivePart {
        file,
        header_len,
        len,
        rows,
        writes_since_sync: 0,
        next_block,
    })
}

pub struct FactStore {
    dir: PathBuf,
    options: StoreOptions,
    // lock order: active, then parts
    active: Mutex<ActivePart>,
    parts: RwLock<Vec<Arc<Part>>>,
    merging: Mutex<()>,
}

impl FactStore {
    pub fn open(dir: &Path, options: StoreOptions) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut found: Vec<(PartName, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if path.extension().is_some_and(|e| e == "tmp") {
                warn!(path = %path.display(), "removing leftover temp part");
                fs::remove_file(&path)?;
            } else if let Some(name) = PartName::parse(&file_name) {
                found.push((name, path));
            }
        }

        let names: Vec<PartName> = found.iter().map(|(n, _)| *n).collect();
        let mut parts = Vec::with_capacity(found.len());
        for (name, path) in found {
            if names.iter().any(|other| other.covers(&name)) {
                warn!(part = %name.file_name(), "dropping part already covered by a merge");
                fs::remove_file(&path)?;
                continue;
            }
            parts.push(Arc::new(load_part(path, name)?));
        }
        parts.sort_by_key(|p| p.name);

        let next_block = parts.iter().map(|p| p.name.max_block + 1).max().unwrap_or(0);
        let active = open_active(dir, next_block)?;
        info!(
            dir = %dir.display(),
            parts = parts.len(),
            active_rows = active.rows.len(),
            next_block,
            "fact store open"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            options,
            active: Mutex::new(active),
            parts: RwLock::new(parts),
            merging: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably append one row. Returns once the row is written (and synced
    /// per the fsync policy); that is the acknowledgement.
    pub fn append(&self, fact: &CandleFact) -> Result<()> {
        let mut active = self.active.lock();
        let len = active.len;
        active.len = record::append_frame(&mut active.file, len, &RecordFrame::Fact(fact.clone()))?;
        active.writes_since_sync += 1;
        if self.options.fsync.due(active.writes_since_sync) {
            active.file.sync_data()?;
            active.writes_since_sync = 0;
        }
        active.rows.push(fact.clone());
        if active.rows.len() >= self.options.max_active_rows.max(1) {
            self.seal_locked(&mut active)?;
        }
        Ok(())
    }

    /// Turn the active rows into an immutable level-0 part.
    fn seal_locked(&self, active: &mut ActivePart) -> Result<Option<PartName>> {
        if active.rows.is_empty() {
            return Ok(None);
        }
        let name = PartName {
            min_block: active.next_block,
            max_block: active.next_block,
            level: 0,
        };
        let path = write_part(&self.dir, name, &active.rows)?;

        active.file.set_len(active.header_len)?;
        active.file.sync_data()?;
        active.file.seek(SeekFrom::Start(active.header_len))?;
        active.len = active.header_len;
        active.writes_since_sync = 0;

        let rows = std::mem::take(&mut active.rows);
        debug!(part = %name.file_name(), rows = rows.len(), "sealed active part");
        let mut parts = self.parts.write();
        parts.push(Arc::new(Part { name, path, rows }));
        parts.sort_by_key(|p| p.name);
        active.next_block += 1;
        Ok(Some(name))
    }

    pub fn seal(&self) -> Result<Option<PartName>> {
        let mut active = self.active.lock();
        self.seal_locked(&mut active)
    }

    fn snapshot(&self) -> (Vec<Arc<Part>>, Vec<CandleFact>) {
        let active = self.active.lock();
        let parts = self.parts.read().clone();
        (parts, active.rows.clone())
    }

    /// Rows matching `pred`, oldest part first. Until a merge has run, an
    /// identity may appear several times with different `landed_at`.
    pub fn query<F>(&self, pred: F) -> Vec<CandleFact>
    where
        F: Fn(&CandleFact) -> bool,
    {
        let (parts, active_rows) = self.snapshot();
        parts
            .iter()
            .flat_map(|p| p.rows.iter().cloned())
            .chain(active_rows)
            .filter(|r| pred(r))
            .collect()
    }

    /// Like [`FactStore::query`] but collapses versions at read time, giving
    /// the post-merge answer without waiting for a merge.
    pub fn query_final<F>(&self, pred: F) -> Vec<CandleFact>
    where
        F: Fn(&CandleFact) -> bool,
    {
        collapse_versions(self.query(pred))
    }

    pub fn parts(&self) -> Vec<PartName> {
        self.parts.read().iter().map(|p| p.name).collect()
    }

    pub fn stats(&self) -> StoreStats {
        let (parts, active_rows) = self.snapshot();
        let mut identities: HashSet<FactKey> = HashSet::new();
        let mut total_rows = 0;
        for row in parts.iter().flat_map(|p| p.rows.iter()).chain(active_rows.iter()) {
            identities.insert(row.key());
            total_rows += 1;
        }
        StoreStats {
            parts: parts.len(),
            active_rows: active_rows.len(),
            total_rows,
            identities: identities.len(),
        }
    }

    pub fn max_landed_at(&self) -> Timestamp {
        let (parts, active_rows) = self.snapshot();
        parts
            .iter()
            .flat_map(|p| p.rows.iter())
            .chain(active_rows.iter())
            .map(|r| r.landed_at)
            .max()
            .unwrap_or(Timestamp::ZERO)
    }

    /// Collapse every sealed part (after sealing the active one) into a
    /// single part holding one row per identity.
    ///
    /// Never called by `append` or `query`; the merge scheduler drives it.
    /// Running it again on a merged store is a no-op.
    pub fn merge_versions(&self) -> Result<MergeOutcome> {
        let _merging = self.merging.lock();
        self.seal()?;

        let sources = self.parts.read().clone();
        let Some(first) = sources.first() else {
            return Ok(MergeOutcome::NothingToMerge);
        };
        if sources.len() == 1 && !first.has_duplicate_identities() {
            return Ok(MergeOutcome::NothingToMerge);
        }

        let rows_in: usize = sources.iter().map(|p| p.rows.len()).sum();
        let merged = collapse_versions(sources.iter().flat_map(|p| p.rows.iter().cloned()));
        let name = PartName {
            min_block: sources.iter().map(|p| p.name.min_block).min().unwrap_or(0),
            max_block: sources.iter().map(|p| p.name.max_block).max().unwrap_or(0),
            level: sources.iter().map(|p| p.name.level).max().unwrap_or(0) + 1,
        };
        let path = write_part(&self.dir, name, &merged)?;
        let rows_out = merged.len();

        {
            let mut parts = self.parts.write();
            parts.retain(|p| !sources.iter().any(|s| s.name == p.name));
            parts.push(Arc::new(Part { name, path, rows: merged }));
            parts.sort_by_key(|p| p.name);
        }
        for src in &sources {
            if let Err(e) = fs::remove_file(&src.path) {
                // dropped on next open because the merged part covers it
                warn!(part = %src.name.file_name(), error = %e, "could not remove merged source part");
            }
        }
        sync_dir(&self.dir);

        info!(
            part = %name.file_name(),
            parts_in = sources.len(),
            rows_in,
            rows_out,
            "merged versions"
        );
        Ok(MergeOutcome::Merged {
            name,
            parts_in: sources.len(),
            rows_in,
            rows_out,
        })
    }
}

/// Read every row in `dir` without opening the store for writing.
///
/// Safe to run next to a live pipeline: nothing is truncated or deleted,
/// temp files and covered parts are skipped, and a torn tail in the active
/// part is ignored. The active part is read before the sealed parts are
/// listed, so a seal racing the scan yields its rows twice (extra versions)
/// rather than not at all. A part that disappears mid-scan (a merge
/// finished) or an active part rewritten under the reader restarts the scan.
pub fn read_snapshot(dir: &Path) -> Result<Vec<CandleFact>> {
    const ATTEMPTS: usize = 8;
    let active = dir.join(ACTIVE_FILE);
    let mut attempt = 1;
    loop {
        match scan_snapshot(dir, &active) {
            Err(e) if attempt < ATTEMPTS && raced_with_writer(&e, &active) => {
                debug!(dir = %dir.display(), attempt, error = %e, "store changed during snapshot; rescanning");
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn raced_with_writer(e: &PipelineError, active: &Path) -> bool {
    match e {
        PipelineError::Io(e) => e.kind() == ErrorKind::NotFound,
        PipelineError::Corrupt { path, .. } => path == active,
        _ => false,
    }
}

fn scan_snapshot(dir: &Path, active: &Path) -> Result<Vec<CandleFact>> {
    // read whole; an image torn by a concurrent seal fails its CRC
    let active_rows = match fs::read(active) {
        Ok(bytes) => parse_facts(&mut bytes.as_slice(), active, bytes.len() as u64)?.rows,
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut found: Vec<PartName> = Vec::new();
    for entry in fs::read_dir(dir)? {
        if let Some(name) = PartName::parse(&entry?.file_name().to_string_lossy()) {
            found.push(name);
        }
    }
    found.sort();
    let mut rows = Vec::new();
    for name in &found {
        if found.iter().any(|other| other.covers(name)) {
            continue;
        }
        rows.extend(load_part(dir.join(name.file_name()), *name)?.rows);
    }
    rows.extend(active_rows);
    Ok(rows)
}

impl FactSink for FactStore {
    fn append(&self, fact: &CandleFact) -> Result<()> {
        FactStore::append(self, fact)
    }

    fn max_landed_at(&self) -> Timestamp {
        FactStore::max_landed_at(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(ticker: &str, open: i64, landed: i64, close_price: f64) -> CandleFact {
        CandleFact {
            ticker: ticker.into(),
            open_price: 1.0,
            close_price,
            sma: 0.0,
            std: 0.0,
            avg_price: 0.0,
            close_to_open_ratio: 0.0,
            open_dt: Timestamp::from_micros(open),
            close_dt: Timestamp::from_micros(open + 60),
            landed_at: Timestamp::from_micros(landed),
        }
    }

    fn small() -> StoreOptions {
        StoreOptions {
            max_active_rows: 2,
            fsync: FsyncPolicy::Never,
        }
    }

    #[test]
    fn part_names_round_trip_and_cover() {
        let merged = PartName { min_block: 0, max_block: 4, level: 2 };
        assert_eq!(PartName::parse(&merged.file_name()), Some(merged));
        assert!(merged.covers(&PartName { min_block: 3, max_block: 3, level: 0 }));
        assert!(merged.covers(&PartName { min_block: 0, max_block: 2, level: 1 }));
        assert!(!merged.covers(&PartName { min_block: 5, max_block: 5, level: 0 }));
        assert!(!merged.covers(&merged));
        assert_eq!(PartName::parse("part_1_0_0.log"), None);
        assert_eq!(PartName::parse("active.log"), None);
    }

    #[test]
    fn collapse_keeps_greatest_landed_at() {
        let rows = vec![fact("A", 0, 30, 3.0), fact("A", 0, 10, 1.0), fact("B", 0, 5, 5.0), fact("A", 0, 20, 2.0)];
        let out = collapse_versions(rows);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ticker, "A");
        assert_eq!(out[0].close_price, 3.0);
        assert_eq!(out[1].ticker, "B");
    }

    #[test]
    fn collapse_tie_goes_to_later_row() {
        let out = collapse_versions(vec![fact("A", 0, 10, 1.0), fact("A", 0, 10, 2.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].close_price, 2.0);
    }

    #[test]
    fn appends_seal_into_parts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path(), small()).unwrap();
        for i in 0..5 {
            store.append(&fact("A", i, i, 0.0)).unwrap();
        }
        let stats = store.stats();
        assert_eq!(stats.parts, 2);
        assert_eq!(stats.active_rows, 1);
        assert_eq!(stats.total_rows, 5);
        assert_eq!(store.parts()[1], PartName { min_block: 1, max_block: 1, level: 0 });
    }

    #[test]
    fn duplicates_visible_until_merge() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path(), StoreOptions::default()).unwrap();
        store.append(&fact("A", 0, 1, 1.0)).unwrap();
        store.append(&fact("A", 0, 2, 2.0)).unwrap();
        assert_eq!(store.query(|_| true).len(), 2);
        assert_eq!(store.query_final(|_| true).len(), 1);

        let outcome = store.merge_versions().unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged { rows_in: 2, rows_out: 1, .. }));
        let rows = store.query(|_| true);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close_price, 2.0);
        assert_eq!(store.stats().superseded_rows(), 0);
    }

    #[test]
    fn merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path(), small()).unwrap();
        for i in 0..6 {
            store.append(&fact("A", i % 2, i, i as f64)).unwrap();
        }
        assert!(matches!(store.merge_versions().unwrap(), MergeOutcome::Merged { .. }));
        let after_first = store.query(|_| true);
        let parts_first = store.parts();
        assert_eq!(store.merge_versions().unwrap(), MergeOutcome::NothingToMerge);
        assert_eq!(store.query(|_| true), after_first);
        assert_eq!(store.parts(), parts_first);
    }

    #[test]
    fn merge_leaves_distinct_rows_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path(), small()).unwrap();
        for i in 0..4 {
            store.append(&fact("A", i, 100 + i, 0.0)).unwrap();
        }
        store.merge_versions().unwrap();
        assert_eq!(store.query(|_| true).len(), 4);
    }

    #[test]
    fn reopen_preserves_rows_and_parts() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FactStore::open(dir.path(), small()).unwrap();
            for i in 0..5 {
                store.append(&fact("A", i, i, 0.0)).unwrap();
            }
        }
        let store = FactStore::open(dir.path(), small()).unwrap();
        let stats = store.stats();
        assert_eq!(stats.total_rows, 5);
        assert_eq!(stats.parts, 2);
        assert_eq!(stats.active_rows, 1);
        store.append(&fact("A", 9, 9, 0.0)).unwrap();
        assert_eq!(store.parts().last().unwrap().min_block, 2);
        assert_eq!(store.max_landed_at().as_micros(), 9);
    }

    #[test]
    fn covered_source_part_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let leftover;
        {
            let store = FactStore::open(dir.path(), small()).unwrap();
            store.append(&fact("A", 0, 1, 1.0)).unwrap();
            store.append(&fact("A", 0, 2, 2.0)).unwrap();
            let first = store.parts()[0];
            leftover = (dir.path().join(first.file_name()), fs::read(dir.path().join(first.file_name())).unwrap());
            store.merge_versions().unwrap();
        }
        // simulate a crash between publishing the merged part and deleting its source
        fs::write(&leftover.0, &leftover.1).unwrap();
        fs::write(dir.path().join("part_0000000009_0000000009_0.tmp"), b"junk").unwrap();

        let store = FactStore::open(dir.path(), small()).unwrap();
        assert!(!leftover.0.exists());
        assert!(!dir.path().join("part_0000000009_0000000009_0.tmp").exists());
        let rows = store.query(|_| true);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close_price, 2.0);
    }

    #[test]
    fn torn_active_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FactStore::open(dir.path(), StoreOptions::default()).unwrap();
            store.append(&fact("A", 0, 1, 1.0)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(dir.path().join(ACTIVE_FILE)).unwrap();
            f.write_all(&[0xFF, 0x00]).unwrap();
        }
        let store = FactStore::open(dir.path(), StoreOptions::default()).unwrap();
        store.append(&fact("B", 0, 2, 1.0)).unwrap();
        drop(store);
        let store = FactStore::open(dir.path(), StoreOptions::default()).unwrap();
        assert_eq!(store.query(|_| true).len(), 2);
    }

    #[test]
    fn snapshot_reads_without_touching_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path(), small()).unwrap();
        for i in 0..5 {
            store.append(&fact("A", i % 2, i, i as f64)).unwrap();
        }
        fs::write(dir.path().join("part_0000000007_0000000007_0.tmp"), b"in flight").unwrap();

        let rows = read_snapshot(dir.path()).unwrap();
        assert_eq!(rows, store.query(|_| true));
        assert!(dir.path().join("part_0000000007_0000000007_0.tmp").exists());

        store.merge_versions().unwrap();
        assert_eq!(collapse_versions(read_snapshot(dir.path()).unwrap()), store.query(|_| true));
    }

    #[test]
    fn snapshot_never_loses_rows_sealed_or_merged_under_it() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        const TOTAL: usize = 3_000;
        let dir = tempfile::tempdir().unwrap();
        let options = StoreOptions {
            max_active_rows: 20,
            fsync: FsyncPolicy::Never,
        };
        let store = Arc::new(FactStore::open(dir.path(), options).unwrap());
        let appended = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let (store, appended, done) = (Arc::clone(&store), Arc::clone(&appended), Arc::clone(&done));
            std::thread::spawn(move || {
                for i in 0..TOTAL {
                    store.append(&fact("A", i as i64, i as i64 + 1, 0.0)).unwrap();
                    appended.store(i + 1, Ordering::Release);
                    if i % 250 == 0 {
                        store.merge_versions().unwrap();
                    }
                }
                done.store(true, Ordering::Release);
            })
        };

        let mut scans = 0;
        loop {
            let finished = done.load(Ordering::Acquire);
            let acknowledged = appended.load(Ordering::Acquire);
            let rows = read_snapshot(dir.path()).unwrap();
            let distinct: HashSet<i64> = rows.iter().map(|r| r.landed_at.as_micros()).collect();
            assert!(
                distinct.len() >= acknowledged,
                "snapshot {scans} saw {} of {acknowledged} acknowledged rows",
                distinct.len()
            );
            scans += 1;
            if finished {
                assert_eq!(distinct.len(), TOTAL);
                break;
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn filter_matches_ticker_and_window() {
        let f = FactFilter {
            ticker: Some("A".into()),
            open_from: Some(Timestamp::from_micros(10)),
            open_until: Some(Timestamp::from_micros(20)),
        };
        assert!(f.matches(&fact("A", 10, 0, 0.0)));
        assert!(!f.matches(&fact("A", 20, 0, 0.0)));
        assert!(!f.matches(&fact("B", 15, 0, 0.0)));
        assert!(FactFilter::default().matches(&fact("B", 15, 0, 0.0)));
    }
}
