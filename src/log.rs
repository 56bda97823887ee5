//! Top-level manager for one market's execution log.
//!
//! [`LogContext`] holds everything days share: configuration, the writer lock,
//! repository metadata and the optional archive and exchange sources.
//! [`ExecutionLog`] adds the live side: the active day, a flush timer thread
//! and a background worker for promotions and repairs.
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded, select, tick, unbounded};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use time::{Date, OffsetDateTime};
use tracing::{debug, error, info, warn};

use crate::config::LogConfig;
use crate::day::{DayCache, FlushOutcome, RepairOutcome, Tier, date_of_millis};
use crate::error::Result;
use crate::execution::{Execution, Executions};
use crate::lock::WriterLock;
use crate::repository::Repository;
use crate::source::{ArchiveSource, ExchangeSource};

/// Background work handed to the worker thread.
pub(crate) enum Job {
    Promote(Arc<DayCache>),
    Repair(Arc<DayCache>),
}

pub struct LogContext {
    config: LogConfig,
    lock: WriterLock,
    repository: Mutex<Repository>,
    archive: Option<Arc<dyn ArchiveSource>>,
    exchange: Option<Arc<dyn ExchangeSource>>,
    jobs: OnceCell<Sender<Job>>,
    /// Live day handles, so every caller of one date shares its queue and file guard.
    days: Mutex<HashMap<Date, Weak<DayCache>>>,
}

impl LogContext {
    pub fn new(config: LogConfig) -> Self {
        let lock = WriterLock::new(config.lock_path());
        let repository = Repository::load(config.repository_path());
        Self {
            config,
            lock,
            repository: Mutex::new(repository),
            archive: None,
            exchange: None,
            jobs: OnceCell::new(),
            days: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_archive(mut self, archive: Arc<dyn ArchiveSource>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_exchange(mut self, exchange: Arc<dyn ExchangeSource>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn lock(&self) -> &WriterLock {
        &self.lock
    }

    pub fn archive(&self) -> Option<&Arc<dyn ArchiveSource>> {
        self.archive.as_ref()
    }

    pub fn exchange(&self) -> Option<&Arc<dyn ExchangeSource>> {
        self.exchange.as_ref()
    }

    pub fn day(self: &Arc<Self>, date: Date) -> Arc<DayCache> {
        let mut days = self.days.lock();
        if let Some(day) = days.get(&date).and_then(Weak::upgrade) {
            return day;
        }
        days.retain(|_, day| day.strong_count() > 0);
        let day = Arc::new(DayCache::new(Arc::clone(self), date));
        days.insert(date, Arc::downgrade(&day));
        day
    }

    /// Snapshot of the repository metadata.
    pub fn repository(&self) -> Repository {
        self.repository.lock().clone()
    }

    pub(crate) fn record_local(&self, date: Date) {
        let mut repository = self.repository.lock();
        if repository.record_local(date)
            && let Err(error) = repository.save()
        {
            warn!(%error, "cannot save repository");
        }
    }

    /// Runs the once-a-day local and archive scans and returns the result.
    pub fn refresh(&self) -> Result<Repository> {
        let today = OffsetDateTime::now_utc().date();
        let mut repository = self.repository.lock();
        let mut changed = repository.scan_local(&self.config.executions_dir(), today)?;
        if let Some(archive) = &self.archive {
            changed |= repository.scan_external(&**archive, today);
        }
        if changed {
            repository.save()?;
        }
        Ok(repository.clone())
    }

    /// Hands `job` to the worker. Returns `false` when no worker is running.
    pub(crate) fn schedule(&self, job: Job) -> bool {
        self.jobs.get().is_some_and(|jobs| jobs.send(job).is_ok())
    }
}

pub struct ExecutionLog {
    ctx: Arc<LogContext>,
    active: Arc<Mutex<Option<Arc<DayCache>>>>,
    stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

fn flush_logged(day: &DayCache) {
    match day.flush() {
        Ok(FlushOutcome::Idle) => {}
        Ok(outcome) => debug!(date = %day.date(), ?outcome, "flushed"),
        Err(error) => error!(date = %day.date(), %error, "flush failed"),
    }
}

fn run_worker(jobs: Receiver<Job>, stop: Receiver<()>) {
    loop {
        select! {
            recv(jobs) -> job => match job {
                Ok(Job::Promote(day)) => match day.promote_compact() {
                    Ok(promoted) => debug!(date = %day.date(), promoted, "promotion finished"),
                    Err(error) => warn!(date = %day.date(), %error, "promotion failed"),
                },
                Ok(Job::Repair(day)) => match day.repair() {
                    Ok(outcome) => info!(date = %day.date(), ?outcome, "repair finished"),
                    Err(error) => warn!(date = %day.date(), %error, "repair failed"),
                },
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
    // Pending jobs hold their day, and through it the context; drop them here.
    let abandoned = jobs.try_iter().count();
    if abandoned > 0 {
        debug!(abandoned, "worker stopped with pending jobs");
    }
}

impl ExecutionLog {
    /// Starts the flush timer and the background worker.
    pub fn open(ctx: LogContext) -> Self {
        let (jobs_tx, jobs_rx) = unbounded::<Job>();
        if ctx.jobs.set(jobs_tx).is_err() {
            warn!("log context already has a worker");
        }
        let ctx = Arc::new(ctx);
        let active: Arc<Mutex<Option<Arc<DayCache>>>> = Arc::new(Mutex::new(None));
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let ticker = tick(ctx.config().flush_interval());
        let flush_stop = stop_rx.clone();
        let flush_active = Arc::clone(&active);
        let flusher = std::thread::spawn(move || {
            loop {
                select! {
                    recv(ticker) -> _ => {
                        let day = flush_active.lock().clone();
                        if let Some(day) = day {
                            flush_logged(&day);
                        }
                    }
                    recv(flush_stop) -> _ => break,
                }
            }
        });
        let worker = std::thread::spawn(move || run_worker(jobs_rx, stop_rx));
        info!(root = %ctx.config().root.display(), "execution log opened");

        Self {
            ctx,
            active,
            stop: Some(stop_tx),
            threads: vec![flusher, worker],
        }
    }

    pub fn context(&self) -> &Arc<LogContext> {
        &self.ctx
    }

    pub fn day(&self, date: Date) -> Arc<DayCache> {
        self.ctx.day(date)
    }

    /// Queues a live execution. Crossing into a later day seals the previous one.
    pub fn store(&self, e: Execution) -> Result<()> {
        let Some(date) = date_of_millis(e.timestamp) else {
            warn!(id = e.id, timestamp = e.timestamp, "execution timestamp out of range");
            return Ok(());
        };
        let mut active = self.active.lock();
        match active.as_ref() {
            Some(day) if day.contains(e.timestamp) => {
                day.store(e);
                return Ok(());
            }
            Some(day) if e.timestamp < day.start_millis() => {
                warn!(id = e.id, %date, active = %day.date(), "ignoring execution for an earlier day");
                return Ok(());
            }
            _ => {}
        }
        let next = self.ctx.day(date);
        next.store(e);
        let previous = active.replace(next);
        drop(active);
        if let Some(previous) = previous {
            info!(from = %previous.date(), to = %date, "day rollover");
            previous.seal()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<FlushOutcome> {
        let day = self.active.lock().clone();
        match day {
            Some(day) => day.flush(),
            None => Ok(FlushOutcome::Idle),
        }
    }

    pub fn at(&self, date: Date, tier: Tier) -> Result<Executions> {
        self.day(date).read(tier)
    }

    /// Every execution from `start` through `end`, both inclusive. A day that
    /// cannot be read is logged and contributes nothing.
    pub fn range(&self, start: Date, end: Date, tier: Tier) -> Executions {
        let ctx = Arc::clone(&self.ctx);
        let days = std::iter::successors(Some(start), |d| d.next_day()).take_while(move |d| *d <= end);
        Box::new(days.flat_map(move |date| {
            ctx.day(date).read(tier).unwrap_or_else(|error| {
                warn!(%date, %error, "day unreadable, skipping");
                Box::new(std::iter::empty())
            })
        }))
    }

    /// Every execution from `start` through today.
    pub fn from(&self, start: Date, tier: Tier) -> Executions {
        self.range(start, OffsetDateTime::now_utc().date(), tier)
    }

    pub fn repair(&self, date: Date) -> Result<RepairOutcome> {
        self.day(date).repair()
    }

    /// Queues a repair on the background worker.
    pub fn repair_later(&self, date: Date) {
        self.day(date).repair_later();
    }

    pub fn first_cache_date(&self) -> Result<Option<Date>> {
        Ok(self.ctx.refresh()?.first_date())
    }

    pub fn last_cache_date(&self) -> Result<Option<Date>> {
        Ok(self.ctx.refresh()?.last_date())
    }

    /// Stops both threads and flushes the active day.
    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            drop(stop);
            for handle in self.threads.drain(..) {
                if handle.join().is_err() {
                    error!("execution log thread panicked");
                }
            }
        }
        self.flush().map(|_| ())
    }
}

impl Drop for ExecutionLog {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            error!(%error, "final flush failed");
        }
    }
}
