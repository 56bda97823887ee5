//! One UTC calendar day of one market.
//!
//! A day is stored in up to three tiers:
//!
//! - normal (`.log`): absolute records, append-only, the live write target;
//! - compact (`.clog`): consolidated delta records, gzip-compressed, written
//!   once when the day is sealed;
//! - fast (`.flog`): the compact tier passed through the approximator.
//!
//! Only the process holding the [`crate::lock::WriterLock`] writes, repairs,
//! promotes or quarantines files. Every other process reads and keeps its
//! write queue trimmed against what the writer has already persisted.
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::approximate::Approximator;
use crate::codec::{Absolute, Codec, Delta};
use crate::config::has_content;
use crate::consolidate::Consolidator;
use crate::error::{IoContext, LogError, Result};
use crate::execution::{Execution, Executions};
use crate::log::{Job, LogContext};
use crate::segment::{CRLF, SegmentFile};
use crate::source::{ArchiveSource, ExchangeSource};

const DAY_MS: i64 = 86_400_000;
const IMPORT_BATCH: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Normal,
    Compact,
    Fast,
}

impl Tier {
    pub fn extension(self) -> &'static str {
        match self {
            Tier::Normal => "log",
            Tier::Compact => "clog",
            Tier::Fast => "flog",
        }
    }

    fn codec(self) -> &'static dyn Codec {
        match self {
            Tier::Normal => &Absolute,
            Tier::Compact | Tier::Fast => &Delta,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Normal => "normal",
            Tier::Compact => "compact",
            Tier::Fast => "fast",
        })
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" | "log" => Ok(Tier::Normal),
            "compact" | "clog" => Ok(Tier::Compact),
            "fast" | "flog" => Ok(Tier::Fast),
            other => Err(format!("unknown tier {other:?}, expected normal, compact or fast")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued.
    Idle,
    /// This process is the writer and appended `written` records.
    Written { written: usize, skipped: usize },
    /// Another process is the writer; queued records it already persisted were dropped.
    Observed {
        dropped: usize,
        retained: usize,
        writer_last_id: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    Complete,
    /// The day cannot be completed right now; a later attempt may succeed.
    Incomplete(String),
}

impl RepairOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, RepairOutcome::Complete)
    }
}

pub fn day_start_millis(date: Date) -> i64 {
    date.midnight().assume_utc().unix_timestamp() * 1_000
}

pub fn date_of_millis(millis: i64) -> Option<Date> {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .ok()
        .map(|t| t.date())
}

pub(crate) fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub struct DayCache {
    ctx: Arc<LogContext>,
    date: Date,
    start: i64,
    end: i64,
    normal: SegmentFile,
    compact: PathBuf,
    fast: PathBuf,
    queue: Mutex<VecDeque<Execution>>,
    /// Serializes appends, promotions and deletions of this day's files.
    writing: Mutex<()>,
}

impl fmt::Debug for DayCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DayCache")
            .field("date", &self.date)
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}

impl DayCache {
    pub(crate) fn new(ctx: Arc<LogContext>, date: Date) -> Self {
        let config = ctx.config();
        let normal = SegmentFile::new(config.tier_path(date, Tier::Normal.extension()));
        let compact = config.tier_path(date, Tier::Compact.extension());
        let fast = config.tier_path(date, Tier::Fast.extension());
        let start = day_start_millis(date);
        Self {
            ctx,
            date,
            start,
            end: start + DAY_MS,
            normal,
            compact,
            fast,
            queue: Mutex::new(VecDeque::new()),
            writing: Mutex::new(()),
        }
    }

    pub fn date(&self) -> Date {
        self.date
    }

    pub fn start_millis(&self) -> i64 {
        self.start
    }

    pub fn end_millis(&self) -> i64 {
        self.end
    }

    pub fn contains(&self, millis: i64) -> bool {
        self.start <= millis && millis < self.end
    }

    pub fn path(&self, tier: Tier) -> &Path {
        match tier {
            Tier::Normal => self.normal.path(),
            Tier::Compact => &self.compact,
            Tier::Fast => &self.fast,
        }
    }

    pub fn exists(&self, tier: Tier) -> bool {
        has_content(self.path(tier))
    }

    /// A day is complete once its compact tier has been written.
    pub fn is_complete(&self) -> bool {
        self.exists(Tier::Compact)
    }

    /// Takes the writer lock if it is free. Only write paths call this.
    fn is_writer(&self) -> Result<bool> {
        self.ctx.lock().try_acquire()
    }

    /// Whether this process already holds the writer lock. Read paths check
    /// this and never acquire.
    fn holds_lock(&self) -> bool {
        self.ctx.lock().is_held()
    }

    /// Last durable id: the normal tier's last line, else the compact tier's last record.
    pub fn last_id(&self) -> Result<Option<u64>> {
        if let Some(id) = self.normal.last_id()? {
            return Ok(Some(id));
        }
        if !self.exists(Tier::Compact) {
            return Ok(None);
        }
        let mut last = None;
        for record in TierLines::open(Tier::Compact, &self.compact)? {
            match record {
                Ok(e) => last = Some(e.id),
                Err(error) => {
                    warn!(%error, "compact tier unreadable while looking up last id");
                    break;
                }
            }
        }
        Ok(last)
    }

    /// Queues a live execution for the next flush.
    pub fn store(&self, e: Execution) {
        self.queue.lock().push_back(e);
    }

    pub fn queued_ids(&self) -> Vec<u64> {
        self.queue.lock().iter().map(|e| e.id).collect()
    }

    /// Drains the write queue into the normal tier, or trims it when another
    /// process is the writer.
    pub fn flush(&self) -> Result<FlushOutcome> {
        let _writing = self.writing.lock();
        if self.queue.lock().is_empty() {
            return Ok(FlushOutcome::Idle);
        }

        if !self.is_writer()? {
            let writer_last_id = self.last_id()?;
            let mut queue = self.queue.lock();
            let before = queue.len();
            if let Some(last) = writer_last_id {
                queue.retain(|e| e.id > last);
            }
            let retained = queue.len();
            debug!(date = %self.date, dropped = before - retained, retained, ?writer_last_id, "observer trimmed queue");
            return Ok(FlushOutcome::Observed {
                dropped: before - retained,
                retained,
                writer_last_id,
            });
        }

        self.normal.repair()?;
        let batch: Vec<Execution> = self.queue.lock().drain(..).collect();
        match self.append_normal(&batch) {
            Ok((written, skipped)) => Ok(FlushOutcome::Written { written, skipped }),
            Err(error) => {
                let mut queue = self.queue.lock();
                for e in batch.into_iter().rev() {
                    queue.push_front(e);
                }
                Err(error)
            }
        }
    }

    /// Appends records with ids above the persisted last id. Callers hold `writing`.
    fn append_normal(&self, records: &[Execution]) -> Result<(usize, usize)> {
        let mut last = self.normal.last_id()?;
        let mut text = Vec::with_capacity(records.len() * 48);
        let (mut written, mut skipped) = (0, 0);
        for e in records {
            if last.is_some_and(|l| e.id <= l) {
                skipped += 1;
                continue;
            }
            let mark = text.len();
            if let Err(error) = Absolute.encode(&Execution::BASE, e, &mut text) {
                text.truncate(mark);
                warn!(id = e.id, %error, "dropping unencodable execution");
                skipped += 1;
                continue;
            }
            text.extend_from_slice(CRLF);
            last = Some(e.id);
            written += 1;
        }
        self.normal.append(&text)?;
        if written > 0 {
            self.ctx.record_local(self.date);
        }
        Ok((written, skipped))
    }

    /// Final flush when the live feed moves past this day, then schedules the
    /// day's completion.
    pub fn seal(self: &Arc<Self>) -> Result<()> {
        let outcome = self.flush()?;
        info!(date = %self.date, ?outcome, "sealed day");
        if self.ctx.config().stable_ids && self.is_writer()? {
            if self.ctx.exchange().is_some() {
                self.repair_later();
            } else {
                self.promote_later();
            }
        }
        Ok(())
    }

    /// Lazily reads the day at `tier`, deriving or fetching whatever is missing.
    pub fn read(self: &Arc<Self>, tier: Tier) -> Result<Executions> {
        if tier == Tier::Fast && self.exists(Tier::Fast) {
            return self.read_fast();
        }
        if self.exists(Tier::Compact) {
            return match tier {
                Tier::Fast => self.read_fast(),
                _ => self.read_compact(),
            };
        }
        if self.normal.exists() {
            if self.holds_lock() {
                let _writing = self.writing.lock();
                self.normal.repair()?;
            }
            return Ok(self.shape(tier, self.read_normal()?));
        }
        if let Some(archive) = self.ctx.archive()
            && archive.has(self.date)
        {
            if self.holds_lock() {
                let complete = self.import_archive(&**archive)?;
                // Opened before promotion so the reader outlives the normal tier.
                let records = self.read_normal()?;
                if complete {
                    self.promote_later();
                } else {
                    warn!(date = %self.date, "archive import incomplete");
                }
                return Ok(self.shape(tier, records));
            }
            return Ok(self.shape(tier, self.stream_archive(&**archive)));
        }
        Ok(Box::new(std::iter::empty()))
    }

    fn shape(&self, tier: Tier, records: Executions) -> Executions {
        match tier {
            Tier::Fast => Box::new(Approximator::with_window(
                records,
                self.ctx.config().approximation_window_ms,
            )),
            Tier::Normal | Tier::Compact => records,
        }
    }

    fn read_normal(&self) -> Result<Executions> {
        if !self.normal.exists() {
            return Ok(Box::new(std::iter::empty()));
        }
        let lines = TierLines::open(Tier::Normal, self.normal.path())?;
        Ok(Box::new(lines.map_while(|record| {
            record.inspect_err(|error| warn!(%error, "normal tier unreadable")).ok()
        })))
    }

    fn read_compact(self: &Arc<Self>) -> Result<Executions> {
        let lines = TierLines::open(Tier::Compact, &self.compact)?;
        let day = Arc::clone(self);
        Ok(Box::new(Lenient::new(
            lines,
            Box::new(move |last| day.after_broken(Tier::Compact, last)),
        )))
    }

    fn read_fast(self: &Arc<Self>) -> Result<Executions> {
        if !self.exists(Tier::Fast) && self.holds_lock() {
            if let Err(error) = self.promote_fast() {
                warn!(date = %self.date, %error, "fast tier derivation failed");
            }
        }
        if !self.exists(Tier::Fast) {
            let compact = self.read_compact()?;
            return Ok(self.shape(Tier::Fast, compact));
        }
        let lines = TierLines::open(Tier::Fast, &self.fast)?;
        let day = Arc::clone(self);
        Ok(Box::new(Lenient::new(
            lines,
            Box::new(move |last| day.after_broken(Tier::Fast, last)),
        )))
    }

    /// Continues a read whose `tier` file failed to decode after yielding `last`.
    fn after_broken(self: &Arc<Self>, tier: Tier, last: Option<Execution>) -> Executions {
        let writer = self.holds_lock();
        if writer {
            let _writing = self.writing.lock();
            if let Err(error) = quarantine(self.path(tier)) {
                warn!(%error, "cannot quarantine broken tier");
            }
        }
        let rest = match tier {
            Tier::Fast => self.read_compact().map(|compact| {
                let after = last.as_ref().map_or(i64::MIN, |e| e.timestamp);
                Box::new(self.shape(Tier::Fast, compact).filter(move |e| e.timestamp > after)) as Executions
            }),
            Tier::Compact | Tier::Normal if self.normal.exists() => self.read_normal().map(|normal| {
                let after = last.as_ref().map(|e| e.id);
                Box::new(normal.filter(move |e| after.is_none_or(|id| e.id > id))) as Executions
            }),
            Tier::Compact | Tier::Normal => {
                if writer {
                    self.repair_later();
                }
                Ok(Box::new(std::iter::empty()) as Executions)
            }
        };
        rest.unwrap_or_else(|error| {
            warn!(date = %self.date, %error, "fallback tier unreadable");
            Box::new(std::iter::empty())
        })
    }

    /// Reads an archive day without persisting it.
    fn stream_archive(&self, archive: &dyn ArchiveSource) -> Executions {
        let (start, end) = (self.start, self.end);
        match archive.convert(self.date) {
            Ok(records) => Box::new(
                records
                    .map_while(|record| record.inspect_err(|error| warn!(%error, "archive stream failed")).ok())
                    .filter(move |e| start <= e.timestamp && e.timestamp < end),
            ),
            Err(error) => {
                warn!(date = %self.date, %error, "archive unavailable");
                Box::new(std::iter::empty())
            }
        }
    }

    /// Copies the archive day into the normal tier. Returns whether the whole
    /// day arrived; a partial import stays on disk and resumes by id.
    fn import_archive(&self, archive: &dyn ArchiveSource) -> Result<bool> {
        let records = match archive.convert(self.date) {
            Ok(records) => records,
            Err(error) => {
                warn!(date = %self.date, %error, "archive unavailable");
                return Ok(false);
            }
        };
        let _writing = self.writing.lock();
        self.normal.repair()?;
        let mut batch = Vec::with_capacity(IMPORT_BATCH);
        let mut imported = 0;
        let mut complete = true;
        for record in records {
            match record {
                Ok(e) if self.contains(e.timestamp) => batch.push(e),
                Ok(_) => continue,
                Err(error) => {
                    warn!(date = %self.date, %error, "archive stream failed");
                    complete = false;
                    break;
                }
            }
            if batch.len() == IMPORT_BATCH {
                imported += self.append_normal(&batch)?.0;
                batch.clear();
            }
        }
        imported += self.append_normal(&batch)?.0;
        info!(date = %self.date, imported, complete, "imported archive day");
        Ok(complete)
    }

    /// Rebuilds the compact tier from the normal tier and deletes the normal tier.
    ///
    /// Returns `false` without touching anything when this process is not the
    /// writer, the day is still open, or there is no normal tier.
    pub fn promote_compact(&self) -> Result<bool> {
        let _writing = self.writing.lock();
        if !self.is_writer()? || !self.normal.exists() {
            return Ok(false);
        }
        if self.end > now_millis() {
            debug!(date = %self.date, "not promoting an open day");
            return Ok(false);
        }
        self.normal.repair()?;
        let Some(expected) = self.normal.last_id()? else {
            return Ok(false);
        };

        let mut failure = None;
        let records = TierLines::open(Tier::Normal, self.normal.path())?
            .map_while(|record| record.map_err(|e| failure = Some(e)).ok());
        let window = self.ctx.config().consolidation_window_ms;
        let staged = Staged::write(&self.compact, Consolidator::with_window(records, window))?;
        if let Some(error) = failure {
            staged.discard();
            return Err(error);
        }
        if staged.last_id != Some(expected) {
            warn!(date = %self.date, expected, written = ?staged.last_id, "compact tier short, keeping normal tier");
            staged.discard();
            return Ok(false);
        }
        let count = staged.count;
        staged.commit(&self.compact)?;
        self.normal.delete()?;
        SegmentFile::new(&self.fast).delete()?;
        self.ctx.record_local(self.date);
        info!(date = %self.date, count, "promoted to compact tier");
        Ok(true)
    }

    /// Derives the fast tier from the compact tier.
    pub fn promote_fast(&self) -> Result<bool> {
        let _writing = self.writing.lock();
        if !self.is_writer()? || !self.exists(Tier::Compact) {
            return Ok(false);
        }
        let mut failure = None;
        let records = TierLines::open(Tier::Compact, &self.compact)?
            .map_while(|record| record.map_err(|e| failure = Some(e)).ok());
        let window = self.ctx.config().approximation_window_ms;
        let staged = Staged::write(&self.fast, Approximator::with_window(records, window))?;
        if let Some(error) = failure {
            staged.discard();
            return Err(error);
        }
        let count = staged.count;
        staged.commit(&self.fast)?;
        info!(date = %self.date, count, "promoted to fast tier");
        Ok(true)
    }

    pub(crate) fn promote_later(self: &Arc<Self>) {
        if self.ctx.schedule(Job::Promote(Arc::clone(self))) {
            return;
        }
        if let Err(error) = self.promote_compact() {
            warn!(date = %self.date, %error, "promotion failed");
        }
    }

    pub(crate) fn repair_later(self: &Arc<Self>) {
        if self.ctx.schedule(Job::Repair(Arc::clone(self))) {
            return;
        }
        match self.repair() {
            Ok(outcome) => debug!(date = %self.date, ?outcome, "repaired inline"),
            Err(error) => warn!(date = %self.date, %error, "repair failed"),
        }
    }

    /// Completes a past day from the archive or by paging the exchange.
    pub fn repair(self: &Arc<Self>) -> Result<RepairOutcome> {
        if self.exists(Tier::Compact) {
            if self.normal.exists() && self.is_writer()? {
                let _writing = self.writing.lock();
                self.normal.delete()?;
                info!(date = %self.date, "removed stale normal tier");
            }
            return Ok(RepairOutcome::Complete);
        }
        if !self.is_writer()? {
            return Ok(RepairOutcome::Incomplete("another process is the writer".into()));
        }
        if self.end > now_millis() {
            return Ok(RepairOutcome::Incomplete("day is still open".into()));
        }
        {
            let _writing = self.writing.lock();
            self.normal.repair()?;
        }

        if let Some(archive) = self.ctx.archive()
            && archive.has(self.date)
            && self.import_archive(&**archive)?
        {
            return self.finish();
        }
        let Some(exchange) = self.ctx.exchange() else {
            return Ok(RepairOutcome::Incomplete("no exchange source configured".into()));
        };
        self.page_exchange(&**exchange)
    }

    fn finish(&self) -> Result<RepairOutcome> {
        if self.promote_compact()? {
            Ok(RepairOutcome::Complete)
        } else {
            Ok(RepairOutcome::Incomplete("compact tier not written".into()))
        }
    }

    fn page_exchange(&self, exchange: &dyn ExchangeSource) -> Result<RepairOutcome> {
        let config = self.ctx.config();
        let page = config.page_size.max(1);
        let known = self.normal.last_id()?;
        let Some(mut cursor) = known.or_else(|| self.estimate_start(exchange)) else {
            return Ok(RepairOutcome::Incomplete("no starting id for exchange paging".into()));
        };
        let floor = known.unwrap_or(0);
        info!(date = %self.date, cursor, "paging exchange");

        loop {
            let to = cursor.saturating_add(page);
            let records = match config.retry.run("exchange page", |_| exchange.executions(cursor, to)) {
                Ok(records) => records,
                Err(error) => return Ok(RepairOutcome::Incomplete(error.to_string())),
            };
            let Some(page_last) = records.last().map(|e| e.id) else {
                info!(date = %self.date, cursor, "exchange has nothing more, day incomplete");
                return Ok(RepairOutcome::Incomplete(format!("exchange returned no executions after id {cursor}")));
            };

            let mut batch = Vec::with_capacity(records.len());
            let mut complete = false;
            for e in records {
                if e.timestamp >= self.end {
                    complete = true;
                    break;
                }
                if e.id > floor && e.timestamp >= self.start {
                    batch.push(e);
                }
            }
            if !batch.is_empty() {
                let _writing = self.writing.lock();
                self.append_normal(&batch)?;
            }
            if complete {
                info!(date = %self.date, "reached next day, completing");
                return self.finish();
            }
            cursor = if page_last > cursor { page_last } else { to };
        }
    }

    /// Paging start when the day has no records yet.
    fn estimate_start(&self, exchange: &dyn ExchangeSource) -> Option<u64> {
        if let Some(previous) = self.date.previous_day() {
            match self.ctx.day(previous).last_id() {
                Ok(Some(id)) => return Some(id),
                Ok(None) => {}
                Err(error) => warn!(%error, "cannot read previous day"),
            }
        }
        let config = self.ctx.config();
        match config.retry.run("nearest execution", |_| exchange.search_nearest_execution(self.start)) {
            Ok(Some(e)) if e.timestamp >= self.start => Some(e.id.saturating_sub(config.page_size)),
            Ok(Some(e)) => Some(e.id),
            Ok(None) => None,
            Err(error) => {
                warn!(%error, "nearest execution search failed");
                None
            }
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Moves a tier that failed to decode out of the way so it is derived again.
fn quarantine(path: &Path) -> Result<()> {
    let broken = sibling(path, ".broken");
    fs::rename(path, &broken).at(path)?;
    warn!(path = %broken.display(), "quarantined broken tier");
    Ok(())
}

/// A gzip delta tier written next to its final path, renamed into place on commit.
struct Staged {
    tmp: PathBuf,
    count: usize,
    last_id: Option<u64>,
}

impl Staged {
    fn write(path: &Path, records: impl Iterator<Item = Execution>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        let tmp = sibling(path, ".tmp");
        let file = File::create(&tmp).at(&tmp)?;
        let mut out = GzEncoder::new(BufWriter::with_capacity(1 << 20, file), Compression::default());
        let mut previous = Execution::BASE;
        let mut line = Vec::with_capacity(64);
        let mut count = 0;
        for e in records {
            line.clear();
            if let Err(error) = Delta.encode(&previous, &e, &mut line) {
                warn!(id = e.id, %error, "dropping unencodable execution");
                continue;
            }
            line.extend_from_slice(CRLF);
            out.write_all(&line).at(&tmp)?;
            previous = e;
            count += 1;
        }
        let buffered = out.finish().at(&tmp)?;
        let file = buffered.into_inner().map_err(|e| LogError::io(&tmp, e.into_error()))?;
        file.sync_all().at(&tmp)?;
        Ok(Self {
            tmp,
            count,
            last_id: (count > 0).then_some(previous.id),
        })
    }

    fn commit(self, path: &Path) -> Result<()> {
        fs::rename(&self.tmp, path).at(path)
    }

    fn discard(self) {
        if let Err(error) = fs::remove_file(&self.tmp) {
            debug!(path = %self.tmp.display(), %error, "cannot remove staged tier");
        }
    }
}

/// Decodes one tier file line by line. Ends after the first error.
struct TierLines {
    tier: Tier,
    path: PathBuf,
    reader: Box<dyn BufRead + Send>,
    previous: Execution,
    line: usize,
    buf: Vec<u8>,
    done: bool,
}

impl TierLines {
    fn open(tier: Tier, path: &Path) -> Result<Self> {
        let file = File::open(path).at(path)?;
        let reader: Box<dyn BufRead + Send> = match tier {
            Tier::Normal => Box::new(BufReader::new(file)),
            Tier::Compact | Tier::Fast => Box::new(BufReader::new(GzDecoder::new(file))),
        };
        Ok(Self {
            tier,
            path: path.to_path_buf(),
            reader,
            previous: Execution::BASE,
            line: 0,
            buf: Vec::with_capacity(128),
            done: false,
        })
    }
}

impl Iterator for TierLines {
    type Item = Result<Execution>;

    fn next(&mut self) -> Option<Result<Execution>> {
        if self.done {
            return None;
        }
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) if self.buf.last() != Some(&b'\n') => {
                // A writer is mid-append, or crashed there.
                debug!(path = %self.path.display(), "ignoring partial trailing line");
                self.done = true;
                None
            }
            Ok(_) => {
                self.line += 1;
                let body = self.buf.strip_suffix(b"\n").unwrap_or(&self.buf);
                let body = body.strip_suffix(b"\r").unwrap_or(body);
                match self.tier.codec().decode(&self.previous, body) {
                    Ok(e) => {
                        self.previous = e.clone();
                        Some(Ok(e))
                    }
                    Err(source) => {
                        self.done = true;
                        Some(Err(LogError::Codec {
                            tier: self.tier,
                            path: self.path.clone(),
                            line: self.line,
                            source,
                        }))
                    }
                }
            }
            Err(e) => {
                self.done = true;
                Some(Err(LogError::io(&self.path, e)))
            }
        }
    }
}

type Fallback = Box<dyn FnOnce(Option<Execution>) -> Executions + Send>;

/// Reads a derived tier and switches to a fallback source on the first error.
struct Lenient {
    primary: Option<TierLines>,
    fallback: Option<Fallback>,
    rest: Option<Executions>,
    last: Option<Execution>,
}

impl Lenient {
    fn new(primary: TierLines, fallback: Fallback) -> Self {
        Self {
            primary: Some(primary),
            fallback: Some(fallback),
            rest: None,
            last: None,
        }
    }
}

impl Iterator for Lenient {
    type Item = Execution;

    fn next(&mut self) -> Option<Execution> {
        if let Some(primary) = &mut self.primary {
            match primary.next() {
                Some(Ok(e)) => {
                    self.last = Some(e.clone());
                    return Some(e);
                }
                Some(Err(error)) => {
                    warn!(%error, "tier unreadable, falling back");
                    self.primary = None;
                    if let Some(fallback) = self.fallback.take() {
                        self.rest = Some(fallback(self.last.take()));
                    }
                }
                None => self.primary = None,
            }
        }
        self.rest.as_mut()?.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::execution::Direction;
    use time::macros::date;

    fn dec(s: &str) -> rust_decimal::Decimal {
        s.parse().unwrap()
    }

    fn context(root: &Path) -> Arc<LogContext> {
        Arc::new(LogContext::new(LogConfig::new(root)))
    }

    fn trade(id: u64, direction: Direction, price: &str, size: &str, t: i64) -> Execution {
        Execution::new(id, direction, dec(price), dec(size), t)
    }

    #[test]
    fn day_bounds_are_utc_midnights() {
        let dir = tempfile::tempdir().unwrap();
        let day = context(dir.path()).day(date!(2024 - 01 - 01));
        assert_eq!(day.start_millis(), 1_704_067_200_000);
        assert_eq!(day.end_millis() - day.start_millis(), DAY_MS);
        assert!(day.contains(1_704_067_200_000));
        assert!(!day.contains(day.end_millis()));
        assert_eq!(date_of_millis(1_704_067_199_999), Some(date!(2023 - 12 - 31)));
    }

    #[test]
    fn flush_skips_ids_already_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let day = context(dir.path()).day(date!(2024 - 01 - 01));
        let t = day.start_millis();
        day.store(trade(1, Direction::Buy, "10", "1", t));
        day.store(trade(2, Direction::Sell, "11", "1", t + 1));
        assert_eq!(day.flush().unwrap(), FlushOutcome::Written { written: 2, skipped: 0 });
        day.store(trade(2, Direction::Sell, "11", "1", t + 1));
        day.store(trade(3, Direction::Buy, "12", "1", t + 2));
        assert_eq!(day.flush().unwrap(), FlushOutcome::Written { written: 1, skipped: 1 });
        assert_eq!(day.flush().unwrap(), FlushOutcome::Idle);
        assert_eq!(day.last_id().unwrap(), Some(3));
        let ids: Vec<u64> = day.read(Tier::Normal).unwrap().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn read_repairs_partial_normal_tail() {
        let dir = tempfile::tempdir().unwrap();
        let day = context(dir.path()).day(date!(2024 - 01 - 01));
        let t = day.start_millis();
        day.store(trade(1, Direction::Buy, "10", "1", t));
        day.flush().unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(day.path(Tier::Normal)).unwrap();
        file.write_all(b"2 2024-01-01T00:").unwrap();
        drop(file);

        let records: Vec<_> = day.read(Tier::Normal).unwrap().collect();
        assert_eq!(records.len(), 1);
        assert!(fs::read(day.path(Tier::Normal)).unwrap().ends_with(CRLF));
    }

    #[test]
    fn fast_tier_is_derived_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let day = context(dir.path()).day(date!(2024 - 01 - 01));
        let t = day.start_millis();
        for (i, (direction, price)) in [(Direction::Buy, "10"), (Direction::Sell, "9"), (Direction::Buy, "12"), (Direction::Sell, "11")]
            .into_iter()
            .enumerate()
        {
            day.store(trade(i as u64 + 1, direction, price, "2", t + i as i64 * 1_500));
        }
        day.flush().unwrap();
        assert!(day.promote_compact().unwrap());
        assert!(!day.exists(Tier::Normal));
        assert!(day.is_complete());

        let fast: Vec<_> = day.read(Tier::Fast).unwrap().collect();
        assert!(day.exists(Tier::Fast));
        assert_eq!(fast.len(), 4);
        let volume: rust_decimal::Decimal = fast.iter().map(|e| e.size).sum();
        assert_eq!(volume, dec("8"));
    }

    fn gzip_tier(path: &Path, records: &[Execution], tail: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        let mut previous = Execution::BASE;
        for e in records {
            let mut line = Vec::new();
            Delta.encode(&previous, e, &mut line).unwrap();
            line.extend_from_slice(CRLF);
            gz.write_all(&line).unwrap();
            previous = e.clone();
        }
        gz.write_all(tail).unwrap();
        fs::write(path, gz.finish().unwrap()).unwrap();
    }

    #[test]
    fn broken_compact_tier_continues_from_normal_tier() {
        let dir = tempfile::tempdir().unwrap();
        let day = context(dir.path()).day(date!(2024 - 01 - 01));
        let t = day.start_millis();
        let records: Vec<Execution> = (1..=4)
            .map(|id| trade(id, Direction::Buy, "10", "1", t + id as i64 * 2_000))
            .collect();
        for e in &records {
            day.store(e.clone());
        }
        day.flush().unwrap();
        gzip_tier(day.path(Tier::Compact), &records[..2], b"not a record\r\n");

        let ids: Vec<u64> = day.read(Tier::Compact).unwrap().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(!day.path(Tier::Compact).exists());
        assert!(sibling(day.path(Tier::Compact), ".broken").exists());
        assert!(day.exists(Tier::Normal));
    }

    #[test]
    fn reader_without_lock_leaves_broken_tier_alone() {
        let dir = tempfile::tempdir().unwrap();
        let day = context(dir.path()).day(date!(2024 - 01 - 01));
        let t = day.start_millis();
        gzip_tier(
            day.path(Tier::Compact),
            &[trade(1, Direction::Sell, "5", "1", t)],
            b"not a record\r\n",
        );

        let ids: Vec<u64> = day.read(Tier::Compact).unwrap().map(|e| e.id).collect();
        assert_eq!(ids, vec![1]);
        assert!(day.path(Tier::Compact).exists());
        assert!(!day.ctx.lock().is_held());
    }

    #[test]
    fn broken_compact_tier_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let day = context(dir.path()).day(date!(2024 - 01 - 01));
        assert!(day.is_writer().unwrap());
        fs::create_dir_all(day.path(Tier::Compact).parent().unwrap()).unwrap();
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(b"not a record\r\n").unwrap();
        fs::write(day.path(Tier::Compact), gz.finish().unwrap()).unwrap();

        let records: Vec<_> = day.read(Tier::Compact).unwrap().collect();
        assert!(records.is_empty());
        assert!(!day.path(Tier::Compact).exists());
        assert!(sibling(day.path(Tier::Compact), ".broken").exists());
    }

    #[test]
    fn tier_names_parse() {
        assert_eq!("Compact".parse::<Tier>(), Ok(Tier::Compact));
        assert_eq!("flog".parse::<Tier>(), Ok(Tier::Fast));
        assert!("raw".parse::<Tier>().is_err());
    }
}
