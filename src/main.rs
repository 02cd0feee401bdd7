//! ScaleTime CLI
//!
//! Generates synthetic option-chain snapshots and bulk-loads them, and runs
//! the inspection reports over a loaded database.
//!
//! Usage:
//!   scaletime ingest --fund SPX --start 2024-01-02 --end 2024-01-31
//!   scaletime ingest --fund SPX --start 2024-01-02 --end 2024-01-02 --dry-run
//!   scaletime size
//!   scaletime day --fund SPX --day 2024-01-02 --format json
//!   scaletime snapshot --fund SPX --start 2024-01-02T08:30 --end 2024-01-02T12:00 --dir asc

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use scaletime::config::{parse_step, Settings};
use scaletime::ingest::{self, IngestPlan, IngestSummary, TracingObserver};
use scaletime::loader::BulkLoader;
use scaletime::pricing::PRICING_SCHEMA_SQL;
use scaletime::report::{Direction, OutputFormat, ReportDb, ReportTable};
use scaletime::session::localize;
use scaletime::store::{Connector, MemoryStore, SqliteConnector};

#[derive(Parser, Debug)]
#[command(name = "scaletime")]
#[command(about = "Synthetic option-chain bulk loader")]
struct Args {
    /// Settings file (TOML); defaults to $SCALETIME_CONFIG or scaletime.toml
    #[arg(long, env = "SCALETIME_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides database.path)
    #[arg(long, env = "SCALETIME_DB")]
    db: Option<PathBuf>,

    /// Pricing table (overrides chain.table)
    #[arg(long)]
    table: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate and load snapshots for every session day in a range
    Ingest {
        #[arg(long)]
        fund: String,

        #[arg(long)]
        start: NaiveDate,

        /// Inclusive
        #[arg(long)]
        end: NaiveDate,

        /// Session open, HH:MM
        #[arg(long)]
        open: Option<String>,

        /// Session close, HH:MM
        #[arg(long)]
        close: Option<String>,

        /// Step interval, e.g. 5m, 300s, 1h
        #[arg(long)]
        step: Option<String>,

        #[arg(long)]
        tz: Option<Tz>,

        #[arg(long)]
        num_expiries: Option<usize>,

        #[arg(long)]
        num_strikes: Option<usize>,

        /// Reconnects allowed per insert or commit
        #[arg(long, env = "SCALETIME_RETRIES")]
        retries: Option<u32>,

        /// Fixed RNG seed for reproducible rows
        #[arg(long)]
        seed: Option<u64>,

        /// Load into an in-memory store instead of the database
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },

    /// Row count and database size
    Size,

    /// All rows for one local day, newest first
    Day {
        #[arg(long)]
        fund: String,

        #[arg(long)]
        day: NaiveDate,

        #[arg(long)]
        tz: Option<Tz>,

        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Rows at the first or last timestamp inside [start, end)
    Snapshot {
        #[arg(long)]
        fund: String,

        /// RFC 3339, or local YYYY-MM-DDTHH:MM[:SS] in --tz
        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        #[arg(long, default_value = "desc")]
        dir: Direction,

        #[arg(long)]
        tz: Option<Tz>,

        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Rows at exactly one timestamp
    ExactSnapshot {
        #[arg(long)]
        fund: String,

        #[arg(long)]
        ts: String,

        #[arg(long)]
        tz: Option<Tz>,

        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// First row per day and contract over a date range
    OpenDaily {
        #[arg(long)]
        fund: String,

        #[arg(long)]
        start: NaiveDate,

        #[arg(long)]
        end: NaiveDate,

        #[arg(long)]
        tz: Option<Tz>,

        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scaletime=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::from_env()?,
    };
    if let Some(db) = &args.db {
        settings.database.path = db.clone();
    }
    if let Some(table) = &args.table {
        settings.chain.table = table.clone();
    }

    match args.command {
        Commands::Ingest {
            fund,
            start,
            end,
            open,
            close,
            step,
            tz,
            num_expiries,
            num_strikes,
            retries,
            seed,
            dry_run,
        } => {
            if let Some(open) = open {
                settings.session.open = parse_clock(&open)?;
            }
            if let Some(close) = close {
                settings.session.close = parse_clock(&close)?;
            }
            if let Some(step) = step {
                parse_step(&step)?;
                settings.session.step = step;
            }
            if let Some(tz) = tz {
                settings.session.tz = tz;
            }
            if let Some(n) = num_expiries {
                settings.chain.num_expiries = n;
            }
            if let Some(n) = num_strikes {
                settings.chain.num_strikes = n;
            }
            if let Some(r) = retries {
                settings.database.retries_on_disconnect = r;
            }
            if seed.is_some() {
                settings.chain.seed = seed;
            }
            settings.validate()?;

            run_ingest(&settings, fund, start, end, dry_run)?;
        }
        Commands::Size => {
            let db = open_reports(&settings)?;
            let size = db.table_size()?;
            println!("{}", serde_json::to_string_pretty(&size)?);
        }
        Commands::Day {
            fund,
            day,
            tz,
            format,
        } => {
            let tz = tz.unwrap_or(settings.session.tz);
            let table = open_reports(&settings)?.day_data(&fund, day, tz)?;
            print_table(&table, format)?;
        }
        Commands::Snapshot {
            fund,
            start,
            end,
            dir,
            tz,
            format,
        } => {
            let tz = tz.unwrap_or(settings.session.tz);
            let start = parse_instant(&start, tz)?;
            let end = parse_instant(&end, tz)?;
            let table = open_reports(&settings)?.snapshot(&fund, start, end, dir)?;
            print_table(&table, format)?;
        }
        Commands::ExactSnapshot {
            fund,
            ts,
            tz,
            format,
        } => {
            let ts = parse_instant(&ts, tz.unwrap_or(settings.session.tz))?;
            let table = open_reports(&settings)?.exact_snapshot(&fund, ts)?;
            print_table(&table, format)?;
        }
        Commands::OpenDaily {
            fund,
            start,
            end,
            tz,
            format,
        } => {
            let tz = tz.unwrap_or(settings.session.tz);
            let table = open_reports(&settings)?.open_data_daily(&fund, start, end, tz)?;
            print_table(&table, format)?;
        }
    }

    Ok(())
}

fn run_ingest(
    settings: &Settings,
    fund: String,
    start: NaiveDate,
    end: NaiveDate,
    dry_run: bool,
) -> Result<()> {
    let plan = IngestPlan::from_settings(fund, start, end, settings)?;
    let retries = settings.database.retries_on_disconnect;

    info!("Starting ingest");
    info!("  Fund:     {}", plan.fund);
    info!("  Range:    {} .. {}", plan.start, plan.end);
    info!(
        "  Session:  {} - {} every {}s ({})",
        plan.open,
        plan.close,
        plan.step.num_seconds(),
        plan.tz
    );
    info!(
        "  Chain:    {} expiries x {} strikes",
        plan.num_expiries, plan.num_strikes
    );
    if let Some(remote) = &settings.database.remote {
        info!("  Remote:   {}", remote.redacted());
    }

    let summary = if dry_run {
        let store = MemoryStore::new();
        let summary = load(store.clone(), retries, &plan, settings.chain.seed)?;
        info!(
            rows = store.committed_count(&plan.table),
            "dry run complete, nothing written"
        );
        summary
    } else {
        let connector =
            SqliteConnector::new(&settings.database.path).with_init_sql(PRICING_SCHEMA_SQL);
        load(connector, retries, &plan, settings.chain.seed)?
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn load<C: Connector>(
    connector: C,
    retries: u32,
    plan: &IngestPlan,
    seed: Option<u64>,
) -> Result<IngestSummary> {
    let mut loader = BulkLoader::connect(connector, retries)?;
    let mut rng = match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };

    let summary = ingest::run(&mut loader, plan, &mut rng, &mut TracingObserver)?;
    loader.close();
    Ok(summary)
}

fn open_reports(settings: &Settings) -> Result<ReportDb> {
    ReportDb::open(&settings.database.path, &settings.chain.table)
}

fn print_table(table: &ReportTable, format: OutputFormat) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    table.write(&mut out, format)?;
    out.flush()?;
    Ok(())
}

fn parse_clock(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .with_context(|| format!("invalid time of day: {}", s))
}

/// RFC 3339 with an offset, or a naive local time in `tz`.
fn parse_instant(s: &str, tz: Tz) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .with_context(|| format!("invalid timestamp: {}", s))?;
    Ok(localize(naive, tz)?.with_timezone(&Utc))
}
