//! Known date range of local and archived data, persisted as `repository.json`.
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::Date;
use tracing::{debug, info, warn};

use crate::config::{has_content, parse_compact_date};
use crate::day::Tier;
use crate::error::{IoContext, LogError, Result};
use crate::source::ArchiveSource;

time::serde::format_description!(day, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    #[serde(with = "day::option", default)]
    pub local_first_date: Option<Date>,
    #[serde(with = "day::option", default)]
    pub local_last_date: Option<Date>,
    #[serde(with = "day::option", default)]
    pub local_last_scan_date: Option<Date>,
    #[serde(with = "day::option", default)]
    pub external_first_date: Option<Date>,
    #[serde(with = "day::option", default)]
    pub external_last_date: Option<Date>,
    #[serde(with = "day::option", default)]
    pub external_last_scan_date: Option<Date>,
    #[serde(skip)]
    path: PathBuf,
}

fn min_date(a: Option<Date>, b: Option<Date>) -> Option<Date> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_date(a: Option<Date>, b: Option<Date>) -> Option<Date> {
    a.max(b)
}

impl Repository {
    /// Loads the metadata at `path`. A missing or unreadable document starts
    /// over empty; the next scan rebuilds it.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let parsed = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Repository>(&bytes)
                .inspect_err(|e| warn!(path = %path.display(), error = %e, "discarding unreadable repository"))
                .ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read repository");
                None
            }
        };
        Self {
            path,
            ..parsed.unwrap_or_default()
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes through a temporary file so readers never see a torn document.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|source| LogError::Metadata {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).at(&tmp)?;
        fs::rename(&tmp, &self.path).at(&self.path)?;
        Ok(())
    }

    pub fn first_date(&self) -> Option<Date> {
        min_date(self.local_first_date, self.external_first_date)
    }

    pub fn last_date(&self) -> Option<Date> {
        max_date(self.local_last_date, self.external_last_date)
    }

    /// Widens the local range to include `date`. Returns whether it changed.
    pub fn record_local(&mut self, date: Date) -> bool {
        let first = min_date(self.local_first_date, Some(date));
        let last = max_date(self.local_last_date, Some(date));
        let changed = first != self.local_first_date || last != self.local_last_date;
        self.local_first_date = first;
        self.local_last_date = last;
        changed
    }

    /// Rebuilds the local range from the day directories, at most once per day.
    /// Returns whether a scan ran.
    pub fn scan_local(&mut self, executions_dir: &Path, today: Date) -> Result<bool> {
        if self.local_last_scan_date == Some(today) {
            return Ok(false);
        }
        let mut first = None;
        let mut last = None;
        for date in local_dates(executions_dir)? {
            first = min_date(first, Some(date));
            last = max_date(last, Some(date));
        }
        self.local_first_date = first;
        self.local_last_date = last;
        self.local_last_scan_date = Some(today);
        info!(?first, ?last, "scanned local executions");
        Ok(true)
    }

    /// Refreshes the archive range, at most once per day. An unreachable
    /// archive keeps the previous range and is retried on the next call.
    pub fn scan_external(&mut self, archive: &dyn ArchiveSource, today: Date) -> bool {
        if self.external_last_scan_date == Some(today) {
            return false;
        }
        match archive.collect() {
            Ok(dates) => {
                self.external_first_date = dates.iter().min().copied();
                self.external_last_date = dates.iter().max().copied();
                self.external_last_scan_date = Some(today);
                info!(
                    first = ?self.external_first_date,
                    last = ?self.external_last_date,
                    "scanned archive"
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "archive scan failed");
                false
            }
        }
    }
}

/// Dates under `executions/<yyyy>/<yyyyMMdd>/` holding at least one non-empty tier.
fn local_dates(executions_dir: &Path) -> Result<Vec<Date>> {
    let mut dates = Vec::new();
    let years = match fs::read_dir(executions_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dates),
        Err(e) => return Err(e).at(executions_dir),
    };
    for year in years {
        let year = year.at(executions_dir)?.path();
        if !year.is_dir() {
            continue;
        }
        for day in fs::read_dir(&year).at(&year)? {
            let day = day.at(&year)?.path();
            let Some(date) = day.file_name().and_then(|n| n.to_str()).and_then(parse_compact_date) else {
                continue;
            };
            let name = crate::config::compact_date(date);
            let stored = [Tier::Normal, Tier::Compact, Tier::Fast]
                .iter()
                .any(|tier| has_content(&day.join(format!("execution{name}.{}", tier.extension()))));
            if stored {
                dates.push(date);
            } else {
                debug!(path = %day.display(), "skipping empty day directory");
            }
        }
    }
    dates.sort();
    Ok(dates)
}
