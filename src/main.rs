// Lodgetrack CLI - import validated snapshot batches, record allocations,
// and query the forecasting engine from the command line.

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use std::env;
use std::path::{Path, PathBuf};

use lodgetrack::{
    forecast, monthly_average, on_hand, priority_ratio, remaining_allocation,
    total_processed_this_fy, weighted_average_rate, EngineError, Forecast, SnapshotRecord, Store,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    match command {
        "init" => run_init(),
        "import" => run_import(&args[2..]),
        "allocation" => run_allocation(&args[2..]),
        "report" => run_report(&args[2..]),
        "forecast" => run_forecast(&args[2..]),
        "purge" => run_purge(&args[2..]),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("lodgetrack {}", lodgetrack::VERSION);
    println!();
    println!("Usage:");
    println!("  lodgetrack init                               create the database");
    println!("  lodgetrack import <CODE> <FILE.csv>           import a snapshot batch");
    println!("  lodgetrack allocation <CODE> <FY_START> <N>   record a fiscal-year quota");
    println!("  lodgetrack report <CODE> [--today DATE]       throughput and quota report");
    println!("  lodgetrack forecast <CODE> <LODGED_DATE> [--today DATE] [--json]");
    println!("  lodgetrack purge <CODE>                       remove an entity and its data");
    println!();
    println!("Database path comes from LODGETRACK_DB (default ./lodgetrack.db).");
    println!("CSV columns: lodged_period, observed_at, remaining_count (ISO dates).");
}

fn db_path() -> PathBuf {
    env::var_os("LODGETRACK_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("lodgetrack.db"))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))
}

/// Optional `--today DATE` override; defaults to the local calendar date.
fn today_arg(args: &[String]) -> Result<NaiveDate> {
    match args.iter().position(|a| a == "--today") {
        Some(i) => {
            let value = args
                .get(i + 1)
                .context("--today requires a date argument")?;
            parse_date(value)
        }
        None => Ok(Local::now().date_naive()),
    }
}

fn run_init() -> Result<()> {
    let path = db_path();
    Store::open(&path)?;
    println!("✓ Database ready at {}", path.display());
    Ok(())
}

fn run_import(args: &[String]) -> Result<()> {
    let (code, file) = match args {
        [code, file, ..] => (code, file),
        _ => bail!("usage: lodgetrack import <CODE> <FILE.csv>"),
    };

    let mut rdr = csv::Reader::from_path(Path::new(file))
        .with_context(|| format!("failed to open {}", file))?;
    let mut records: Vec<SnapshotRecord> = Vec::new();
    for result in rdr.deserialize() {
        records.push(result.context("failed to parse snapshot record")?);
    }

    let mut store = Store::open(&db_path())?;
    let summary = store.ingest_batch(code, &records)?;

    println!("✓ Batch applied for {}", code);
    println!("  cohorts created: {}", summary.cohorts_created);
    println!("  snapshots inserted: {}", summary.inserted);
    println!("  snapshots updated: {}", summary.updated);
    println!("  duplicates skipped: {}", summary.skipped);
    Ok(())
}

fn run_allocation(args: &[String]) -> Result<()> {
    let (code, fy_start, amount) = match args {
        [code, fy, amount, ..] => (
            code,
            fy.parse::<i32>().context("FY_START must be a year, e.g. 2024")?,
            amount.parse::<i64>().context("allocation amount must be an integer")?,
        ),
        _ => bail!("usage: lodgetrack allocation <CODE> <FY_START> <AMOUNT>"),
    };

    let store = Store::open(&db_path())?;
    store.upsert_allocation(code, fy_start, amount)?;
    println!("✓ Allocation for {} FY{}: {}", code, fy_start, amount);
    Ok(())
}

fn run_report(args: &[String]) -> Result<()> {
    let code = match args.first() {
        Some(code) => code,
        None => bail!("usage: lodgetrack report <CODE> [--today DATE]"),
    };
    let today = today_arg(args)?;
    let store = Store::open(&db_path())?;

    println!("Report for {} (as at {})", code, today);
    println!("  on hand: {}", on_hand(&store, code)?);

    let averages = monthly_average(&store, code, None, None)?;
    if averages.is_empty() {
        println!("  no processing history yet");
    } else {
        println!("  monthly processed (running average):");
        for entry in &averages {
            println!(
                "    {}  {:>6}  (avg {:.1})",
                entry.month.format("%Y-%m"),
                entry.total,
                entry.running_average
            );
        }
        println!(
            "  weighted rate: {:.1}/month",
            weighted_average_rate(&store, code, None, None)?
        );
    }

    let fy = total_processed_this_fy(&store, code, today)?;
    println!("  processed in {}: {}", fy.fy_label, fy.total);

    match remaining_allocation(&store, code, today) {
        Ok(alloc) => println!(
            "  allocation: {} used of {} ({:.1}%), {} remaining",
            alloc.total_processed, alloc.total_allocation, alloc.pct_used, alloc.remaining
        ),
        Err(EngineError::NoAllocation(_)) => println!("  allocation: none recorded"),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

fn run_forecast(args: &[String]) -> Result<()> {
    let (code, lodged) = match args {
        [code, lodged, ..] => (code, parse_date(lodged)?),
        _ => bail!("usage: lodgetrack forecast <CODE> <LODGED_DATE> [--today DATE] [--json]"),
    };
    let today = today_arg(args)?;
    let as_json = args.iter().any(|a| a == "--json");
    let store = Store::open(&db_path())?;

    let result = forecast(&store, code, lodged, today);

    if as_json {
        let value = match &result {
            Ok(f) => serde_json::to_value(f)?,
            Err(e) if e.is_insufficient_data() => {
                serde_json::json!({ "error": "insufficient data", "detail": e.to_string() })
            }
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match result {
        Ok(Forecast::NextFiscalYear { message, .. }) => {
            println!("✗ {}", message);
        }
        Ok(Forecast::Projection {
            fy_label,
            as_of,
            cases_ahead,
            adjusted_rate,
            eighty_percent_date,
            ninety_percent_date,
            latest_date,
            very_overdue,
            ..
        }) => {
            println!("Forecast for {} lodged {} ({})", code, lodged, fy_label);
            println!("  cases ahead: {} as at {}", cases_ahead, as_of.format("%Y-%m"));
            println!("  rate: {:.1}/month", adjusted_rate);
            println!("  80% of queue cleared by: {}", eighty_percent_date);
            println!("  90% of queue cleared by: {}", ninety_percent_date);
            println!("  latest estimate: {}", latest_date);
            if very_overdue {
                println!("  ⚠ predicted already complete; a manual status check is warranted");
            }
            if let Ok(ratio) = priority_ratio(&store, code, lodged, today) {
                println!(
                    "  ({} priority / {} non-priority processed in {})",
                    ratio.priority_count, ratio.non_priority_count, ratio.fy_label
                );
            }
        }
        Err(e) if e.is_insufficient_data() => {
            println!("✗ insufficient data: {}", e);
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

fn run_purge(args: &[String]) -> Result<()> {
    let code = match args.first() {
        Some(code) => code,
        None => bail!("usage: lodgetrack purge <CODE>"),
    };
    let store = Store::open(&db_path())?;
    store.purge_entity(code)?;
    println!("✓ Purged {} (cohorts, snapshots, allocations)", code);
    Ok(())
}
