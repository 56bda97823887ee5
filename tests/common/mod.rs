#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use execution_log::error::SourceError;
use execution_log::source::{ArchiveRecords, ArchiveSource, ExchangeSource, RetryPolicy};
use execution_log::{Direction, Execution, LogConfig, LogContext};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use time::Date;

pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

pub fn trade(id: u64, direction: Direction, price: &str, size: &str, t: i64) -> Execution {
    Execution::new(id, direction, dec(price), dec(size), t)
}

pub fn config(root: &Path) -> LogConfig {
    let mut config = LogConfig::new(root);
    config.flush_interval_ms = 20;
    config.retry = RetryPolicy::new(1, 0, 1_000);
    config
}

pub fn context(root: &Path) -> Arc<LogContext> {
    Arc::new(LogContext::new(config(root)))
}

/// Polls `done` until it holds or a few seconds pass.
pub fn eventually(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    done()
}

#[derive(Default)]
pub struct StubArchive {
    pub days: BTreeMap<Date, Vec<Execution>>,
}

impl ArchiveSource for StubArchive {
    fn collect(&self) -> Result<Vec<Date>, SourceError> {
        Ok(self.days.keys().copied().collect())
    }

    fn has(&self, date: Date) -> bool {
        self.days.contains_key(&date)
    }

    fn convert(&self, date: Date) -> Result<ArchiveRecords, SourceError> {
        let records = self.days.get(&date).cloned().unwrap_or_default();
        Ok(Box::new(records.into_iter().map(Ok)))
    }
}

/// Exchange serving a fixed id sequence and recording every requested window.
pub struct StubExchange {
    pub records: Vec<Execution>,
    pub requests: Mutex<Vec<(u64, u64)>>,
}

impl StubExchange {
    pub fn new(records: Vec<Execution>) -> Self {
        Self {
            records,
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl ExchangeSource for StubExchange {
    fn executions(&self, from_id: u64, to_id: u64) -> Result<Vec<Execution>, SourceError> {
        self.requests.lock().push((from_id, to_id));
        Ok(self
            .records
            .iter()
            .filter(|e| from_id < e.id && e.id <= to_id)
            .cloned()
            .collect())
    }

    fn execution_latest(&self) -> Result<Execution, SourceError> {
        self.records
            .last()
            .cloned()
            .ok_or_else(|| SourceError::Malformed("no executions".into()))
    }

    fn search_nearest_execution(&self, millis: i64) -> Result<Option<Execution>, SourceError> {
        Ok(self
            .records
            .iter()
            .min_by_key(|e| (e.timestamp - millis).abs())
            .cloned())
    }
}
