use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use rust_decimal::Decimal;
use time::Date;
use time::macros::format_description;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use execution_log::{Direction, ExecutionLog, LogConfig, LogContext, Tier};

#[derive(Debug, Parser)]
#[command(about = "Replay a date range of the execution log")]
struct Args {
    /// Directory holding executions/ and repository.json
    #[arg(long, env = "LOG_ROOT", default_value = ".")]
    root: PathBuf,

    /// First day to replay
    #[arg(long, value_parser = parse_date)]
    from: Date,

    /// Last day to replay (inclusive); defaults to `from`
    #[arg(long, value_parser = parse_date)]
    to: Option<Date>,

    /// Tier to read: normal, compact or fast
    #[arg(long, default_value = "compact")]
    tier: Tier,

    /// Print every execution as it is read
    #[arg(long, default_value_t = false)]
    print_trades: bool,
}

fn parse_date(s: &str) -> std::result::Result<Date, String> {
    Date::parse(s, format_description!("[year]-[month]-[day]")).map_err(|e| format!("{s:?}: {e}"))
}

#[derive(Debug, Default)]
struct Summary {
    count: u64,
    buy: Decimal,
    sell: Decimal,
    first_id: Option<u64>,
    last_id: Option<u64>,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("execution_log=warn")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let to = args.to.unwrap_or(args.from);
    if to < args.from {
        bail!("--to {to} is before --from {}", args.from);
    }
    let log = ExecutionLog::open(LogContext::new(LogConfig::new(&args.root)));

    let mut summary = Summary::default();
    for e in log.range(args.from, to, args.tier) {
        if args.print_trades {
            println!("{e}");
        }
        summary.count += 1;
        match e.direction {
            Direction::Buy => summary.buy += e.size,
            Direction::Sell => summary.sell += e.size,
        }
        summary.first_id.get_or_insert(e.id);
        summary.last_id = Some(e.id);
    }

    let ids = match (summary.first_id, summary.last_id) {
        (Some(first), Some(last)) => format!("{first}..={last}"),
        _ => "none".to_string(),
    };
    println!(
        "{} executions ({} tier), buy {} sell {}, ids {}",
        summary.count, args.tier, summary.buy, summary.sell, ids
    );
    drop(log);
    std::io::Write::flush(&mut std::io::stdout()).context("flush stdout")?;
    Ok(())
}
