//! External collaborators used to backfill the log.
//!
//! - [`ArchiveSource`]: a bulk, day-granular archive. [`HttpArchive`] fetches
//!   gzip-compressed CSV day files over HTTP.
//! - [`ExchangeSource`]: a paginated id-range query against the exchange.
//!   Exchange clients live outside this crate and implement the trait.
//!
//! Network calls go through a [`RetryPolicy`]: a bounded number of retries
//! with a fixed backoff. Exhausting it yields [`SourceError::Unavailable`],
//! which callers turn into an incomplete day rather than a failure.
use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use flate2::read::GzDecoder;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use time::{Date, Duration as Days, OffsetDateTime};
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::execution::{Direction, Execution};

pub type ArchiveRecords = Box<dyn Iterator<Item = Result<Execution, SourceError>> + Send>;

pub trait ArchiveSource: Send + Sync {
    /// Every date the archive can deliver.
    fn collect(&self) -> Result<Vec<Date>, SourceError>;

    /// Cheap existence probe for one date.
    fn has(&self, date: Date) -> bool;

    /// Streams one day's executions in id order.
    fn convert(&self, date: Date) -> Result<ArchiveRecords, SourceError>;
}

pub trait ExchangeSource: Send + Sync {
    /// Executions with `from_id < id <= to_id`, ascending by id.
    fn executions(&self, from_id: u64, to_id: u64) -> Result<Vec<Execution>, SourceError>;

    fn execution_latest(&self) -> Result<Execution, SourceError>;

    /// The execution closest to `millis`, if the exchange still retains it.
    fn search_nearest_execution(&self, millis: i64) -> Result<Option<Execution>, SourceError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: usize,
    pub backoff_ms: u64,
    /// Per-request timeout applied by HTTP sources.
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_ms: 1_000,
            timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: usize, backoff_ms: u64, timeout_ms: u64) -> Self {
        Self {
            retries,
            backoff_ms,
            timeout_ms: timeout_ms.max(1),
        }
    }

    pub fn attempts(&self) -> usize {
        self.retries + 1
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Runs `op` until it succeeds or the attempts are used up. `op` receives
    /// the zero-based attempt number.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut(usize) -> Result<T, SourceError>,
    ) -> Result<T, SourceError> {
        let mut reason = String::new();
        for attempt in 0..self.attempts() {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(what, attempt = attempt + 1, error = %e, "source call failed");
                    reason = e.to_string();
                    if attempt + 1 < self.attempts() {
                        std::thread::sleep(self.backoff());
                    }
                }
            }
        }
        Err(SourceError::Unavailable {
            what: what.to_string(),
            attempts: self.attempts(),
            reason,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Millis,
    /// Possibly fractional epoch seconds, e.g. `1704067200.123`.
    Seconds,
}

/// Column positions of one archive CSV flavour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvLayout {
    pub header: bool,
    pub id: usize,
    pub timestamp: usize,
    pub side: usize,
    pub price: usize,
    pub size: usize,
    pub time_unit: TimeUnit,
}

impl Default for CsvLayout {
    fn default() -> Self {
        Self {
            header: true,
            id: 0,
            timestamp: 1,
            side: 2,
            price: 3,
            size: 4,
            time_unit: TimeUnit::Millis,
        }
    }
}

impl CsvLayout {
    pub fn parse(&self, line: &str) -> Result<Execution, SourceError> {
        let columns: Vec<&str> = line.split(',').map(str::trim).collect();
        let column = |i: usize, name: &str| {
            columns
                .get(i)
                .copied()
                .filter(|c| !c.is_empty())
                .ok_or_else(|| SourceError::Malformed(format!("missing {name} in {line:?}")))
        };
        let malformed = |name: &str| SourceError::Malformed(format!("bad {name} in {line:?}"));

        let id = column(self.id, "id")?.parse::<u64>().map_err(|_| malformed("id"))?;
        let direction = match column(self.side, "side")?.to_ascii_lowercase().as_str() {
            "buy" | "b" => Direction::Buy,
            "sell" | "s" => Direction::Sell,
            _ => return Err(malformed("side")),
        };
        let price = column(self.price, "price")?.parse::<Decimal>().map_err(|_| malformed("price"))?;
        let size = column(self.size, "size")?.parse::<Decimal>().map_err(|_| malformed("size"))?;
        let raw = column(self.timestamp, "timestamp")?;
        let timestamp = match self.time_unit {
            TimeUnit::Millis => raw.parse::<i64>().map_err(|_| malformed("timestamp"))?,
            TimeUnit::Seconds => raw
                .parse::<Decimal>()
                .ok()
                .and_then(|s| (s * Decimal::ONE_THOUSAND).trunc().to_i64())
                .ok_or_else(|| malformed("timestamp"))?,
        };
        Ok(Execution::new(id, direction, price, size, timestamp))
    }
}

/// Day archive served over HTTP, one gzip CSV file per date.
pub struct HttpArchive {
    client: reqwest::blocking::Client,
    /// URL with a `{date}` placeholder replaced by `yyyy-MM-dd`.
    url_template: String,
    first: Date,
    layout: CsvLayout,
    retry: RetryPolicy,
}

impl HttpArchive {
    pub fn new(
        url_template: impl Into<String>,
        first: Date,
        layout: CsvLayout,
        retry: RetryPolicy,
    ) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder().timeout(retry.timeout()).build()?;
        Ok(Self {
            client,
            url_template: url_template.into(),
            first,
            layout,
            retry,
        })
    }

    pub fn url(&self, date: Date) -> String {
        let day = format!("{:04}-{:02}-{:02}", date.year(), date.month() as u8, date.day());
        self.url_template.replace("{date}", &day)
    }
}

impl ArchiveSource for HttpArchive {
    fn collect(&self) -> Result<Vec<Date>, SourceError> {
        let today = OffsetDateTime::now_utc().date();
        // Archives publish with a lag of a day or two.
        let Some(latest) = (1..=3).map(|lag| today - Days::days(lag)).find(|d| self.has(*d)) else {
            return Ok(Vec::new());
        };
        Ok(std::iter::successors(Some(self.first), |d| d.next_day())
            .take_while(|d| *d <= latest)
            .collect())
    }

    fn has(&self, date: Date) -> bool {
        if date < self.first {
            return false;
        }
        let url = self.url(date);
        self.retry
            .run("archive probe", |_| {
                Ok(self.client.head(&url).send()?.status().is_success())
            })
            .unwrap_or(false)
    }

    fn convert(&self, date: Date) -> Result<ArchiveRecords, SourceError> {
        let url = self.url(date);
        let response = self.retry.run("archive download", |_| {
            Ok(self.client.get(&url).send()?.error_for_status()?)
        })?;
        debug!(%url, "streaming archive day");
        let reader: Box<dyn Read + Send> = if url.ends_with(".gz") {
            Box::new(GzDecoder::new(response))
        } else {
            Box::new(response)
        };
        let layout = self.layout.clone();
        let skip = usize::from(layout.header);
        let records = BufReader::new(reader)
            .lines()
            .skip(skip)
            .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
            .map(move |line| layout.parse(&line?));
        Ok(Box::new(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retry_stops_at_first_success() {
        let policy = RetryPolicy::new(3, 0, 10);
        let calls = Cell::new(0);
        let result = policy.run("test", |attempt| {
            calls.set(calls.get() + 1);
            if attempt < 2 {
                Err(SourceError::Malformed("flaky".into()))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_gives_up_after_all_attempts() {
        let policy = RetryPolicy::new(2, 0, 10);
        let calls = Cell::new(0);
        let result: Result<(), _> = policy.run("test", |_| {
            calls.set(calls.get() + 1);
            Err(SourceError::Malformed("down".into()))
        });
        assert!(matches!(result, Err(SourceError::Unavailable { attempts: 3, .. })));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn csv_layout_parses_millis_and_seconds() {
        let layout = CsvLayout::default();
        let e = layout.parse("17,1704067200123,Sell,42000.5,0.25").unwrap();
        assert_eq!(e.id, 17);
        assert_eq!(e.direction, Direction::Sell);
        assert_eq!(e.timestamp, 1_704_067_200_123);

        let seconds = CsvLayout {
            time_unit: TimeUnit::Seconds,
            ..CsvLayout::default()
        };
        let e = seconds.parse("18, 1704067200.5, buy, 1, 2").unwrap();
        assert_eq!(e.timestamp, 1_704_067_200_500);
        assert!(layout.parse("18,,buy,1,2").is_err());
        assert!(layout.parse("18,1,hold,1,2").is_err());
    }

    #[test]
    fn archive_url_uses_iso_date() {
        let archive = HttpArchive::new(
            "https://archive.example/BTCUSD/{date}.csv.gz",
            time::macros::date!(2020 - 01 - 01),
            CsvLayout::default(),
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(
            archive.url(time::macros::date!(2024 - 02 - 09)),
            "https://archive.example/BTCUSD/2024-02-09.csv.gz"
        );
    }
}
