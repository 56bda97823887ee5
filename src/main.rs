use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, select};
use dotenvy::dotenv;
use time::Date;
use time::macros::format_description;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use execution_log::source::{CsvLayout, HttpArchive, RetryPolicy, TimeUnit};
use execution_log::{Execution, ExecutionLog, LogConfig, LogContext, RepairOutcome};

#[derive(Debug, Parser)]
#[command(version, about = "Tick-level execution log recorder and maintenance tool")]
struct Args {
    /// Directory holding executions/ and repository.json
    #[arg(long, env = "LOG_ROOT", default_value = ".")]
    root: PathBuf,

    /// Archive URL template; `{date}` is replaced by yyyy-MM-dd
    #[arg(long, env = "ARCHIVE_URL")]
    archive_url: Option<String>,

    /// First date available in the archive
    #[arg(long, env = "ARCHIVE_FIRST", value_parser = parse_date, default_value = "2019-01-01")]
    archive_first: Date,

    /// Archive timestamps are epoch seconds instead of milliseconds
    #[arg(long, env = "ARCHIVE_SECONDS", default_value_t = false)]
    archive_seconds: bool,

    /// Flush period of the live write queue
    #[arg(long, env = "FLUSH_INTERVAL_MS", default_value_t = 1_000)]
    flush_interval_ms: u64,

    /// Retries for archive and exchange calls
    #[arg(long, env = "SOURCE_RETRIES", default_value_t = 3)]
    retries: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record `id,timestamp_ms,side,price,size` lines from stdin until EOF or Ctrl-C
    Record,
    /// Complete a past day from the archive
    Repair {
        #[arg(long, value_parser = parse_date)]
        date: Date,
    },
    /// Rebuild the compact tier of a day, and optionally its fast tier
    Promote {
        #[arg(long, value_parser = parse_date)]
        date: Date,
        #[arg(long, default_value_t = false)]
        fast: bool,
    },
    /// Rescan local and archive date ranges and print them
    Scan,
}

fn parse_date(s: &str) -> std::result::Result<Date, String> {
    Date::parse(s, format_description!("[year]-[month]-[day]")).map_err(|e| format!("{s:?}: {e}"))
}

fn context(args: &Args) -> Result<LogContext> {
    let mut config = LogConfig::new(&args.root);
    config.flush_interval_ms = args.flush_interval_ms;
    config.retry = RetryPolicy {
        retries: args.retries,
        ..RetryPolicy::default()
    };
    let mut ctx = LogContext::new(config.clone());
    if let Some(url) = &args.archive_url {
        let layout = CsvLayout {
            time_unit: if args.archive_seconds { TimeUnit::Seconds } else { TimeUnit::Millis },
            ..CsvLayout::default()
        };
        let archive = HttpArchive::new(url.clone(), args.archive_first, layout, config.retry)
            .context("build archive client")?;
        ctx = ctx.with_archive(Arc::new(archive));
    }
    Ok(ctx)
}

fn record(ctx: LogContext) -> Result<()> {
    let mut log = ExecutionLog::open(ctx);
    let (tx, rx) = bounded::<Execution>(8192);
    let (stop_tx, stop_rx) = bounded::<()>(1);

    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    std::thread::spawn(move || {
        let layout = CsvLayout {
            header: false,
            ..CsvLayout::default()
        };
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match layout.parse(&line) {
                Ok(e) => {
                    if tx.send(e).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "skipping line"),
            }
        }
    });

    let mut stored = 0u64;
    loop {
        select! {
            recv(rx) -> e => match e {
                Ok(e) => {
                    log.store(e).context("store execution")?;
                    stored += 1;
                }
                Err(_) => break,
            },
            recv(stop_rx) -> _ => {
                info!("interrupted");
                break;
            }
        }
    }
    log.shutdown().context("final flush")?;
    info!(stored, "recorder stopped");
    Ok(())
}

fn main() -> Result<()> {
    let _ = dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("execution_log=info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let ctx = context(&args)?;
    match args.command {
        Command::Record => record(ctx),
        Command::Repair { date } => {
            let day = Arc::new(ctx).day(date);
            match day.repair().with_context(|| format!("repair {date}"))? {
                RepairOutcome::Complete => {
                    println!("{date}: complete");
                    Ok(())
                }
                RepairOutcome::Incomplete(reason) => bail!("{date}: incomplete: {reason}"),
            }
        }
        Command::Promote { date, fast } => {
            let day = Arc::new(ctx).day(date);
            let compact = day.promote_compact().with_context(|| format!("promote {date}"))?;
            if !compact && !day.is_complete() {
                bail!("{date}: nothing to promote, or another process holds the writer lock");
            }
            if fast && !day.promote_fast().with_context(|| format!("derive fast tier {date}"))? {
                bail!("{date}: fast tier not written");
            }
            println!("{date}: promoted");
            Ok(())
        }
        Command::Scan => {
            let repository = ctx.refresh().context("scan")?;
            println!("{}", serde_json::to_string_pretty(&repository)?);
            Ok(())
        }
    }
}
