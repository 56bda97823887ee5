//! Log configuration and on-disk layout.
//!
//! ```text
//! <root>/repository.json
//! <root>/executions/lock
//! <root>/executions/<yyyy>/<yyyyMMdd>/execution<yyyyMMdd>.{log,clog,flog}
//! ```
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::{Date, Month};

use crate::source::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub root: PathBuf,
    pub flush_interval_ms: u64,
    /// Width of one exchange id window during gap repair.
    pub page_size: u64,
    /// The market answers id-range queries with a stable result, so a sealed
    /// day can be rebuilt from its normal tier into the compact tier.
    pub stable_ids: bool,
    pub retry: RetryPolicy,
    pub consolidation_window_ms: i64,
    pub approximation_window_ms: i64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            flush_interval_ms: 1_000,
            page_size: 500,
            stable_ids: true,
            retry: RetryPolicy::default(),
            consolidation_window_ms: crate::consolidate::DEFAULT_WINDOW_MS,
            approximation_window_ms: crate::approximate::DEFAULT_WINDOW_MS,
        }
    }
}

impl LogConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.root.join("executions")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.executions_dir().join("lock")
    }

    pub fn repository_path(&self) -> PathBuf {
        self.root.join("repository.json")
    }

    pub fn day_dir(&self, date: Date) -> PathBuf {
        self.executions_dir()
            .join(format!("{:04}", date.year()))
            .join(compact_date(date))
    }

    pub fn tier_path(&self, date: Date, extension: &str) -> PathBuf {
        self.day_dir(date)
            .join(format!("execution{}.{}", compact_date(date), extension))
    }
}

/// `yyyyMMdd`
pub fn compact_date(date: Date) -> String {
    format!("{:04}{:02}{:02}", date.year(), date.month() as u8, date.day())
}

pub fn parse_compact_date(text: &str) -> Option<Date> {
    if text.len() != 8 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = text[0..4].parse().ok()?;
    let month = Month::try_from(text[4..6].parse::<u8>().ok()?).ok()?;
    let day = text[6..8].parse().ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

/// True when `path` holds a non-empty file.
pub(crate) fn has_content(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn layout_follows_year_and_day_directories() {
        let config = LogConfig::new("/data/btc");
        assert_eq!(
            config.tier_path(date!(2024 - 03 - 07), "clog"),
            PathBuf::from("/data/btc/executions/2024/20240307/execution20240307.clog")
        );
        assert_eq!(config.lock_path(), PathBuf::from("/data/btc/executions/lock"));
    }

    #[test]
    fn compact_dates_parse_back() {
        assert_eq!(parse_compact_date("20240307"), Some(date!(2024 - 03 - 07)));
        assert_eq!(parse_compact_date("20241307"), None);
        assert_eq!(parse_compact_date("2024037"), None);
        assert_eq!(compact_date(date!(2024 - 03 - 07)), "20240307");
    }
}
