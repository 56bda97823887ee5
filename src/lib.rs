//! Tick-level execution log storage.
//!
//! Stores every trade print of one market, one UTC day per directory, in up
//! to three tiers of decreasing fidelity and size:
//!
//! - `codec`, `radix`: the absolute and delta text record formats
//! - `consolidate`, `approximate`: the transforms producing the compact and
//!   fast tiers
//! - `segment`, `lock`, `day`: per-day files, writer election, reads with
//!   fallback, promotion and gap repair
//! - `repository`, `source`: known date ranges and the archive/exchange
//!   sources used for backfill
//! - `log`: the [`ExecutionLog`] manager used by the `execution_log` recorder
//!   and the `player` tool
pub mod approximate;
pub mod codec;
pub mod config;
pub mod consolidate;
pub mod day;
pub mod error;
pub mod execution;
pub mod lock;
pub mod log;
pub mod radix;
pub mod repository;
pub mod segment;
pub mod source;

pub use config::LogConfig;
pub use day::{DayCache, FlushOutcome, RepairOutcome, Tier};
pub use error::{LogError, Result};
pub use execution::{Direction, Execution, Executions};
pub use log::{ExecutionLog, LogContext};
