//! Pipeline CLI - runs one batch from local files
//!
//! Responsibilities:
//! - Read the index and data spreadsheets from disk
//! - Run the unification/enrichment pipeline
//! - Persist output tables (Postgres, or a CSV directory)
//! - Print the warning report, optionally as JSON

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::Instrument;
use uuid::Uuid;

use pipeline::config::{parse_today, Settings};
use pipeline::logging::init_tracing;
use pipeline::profile::load_profiles;
use pipeline::{
    persist_tables, run, Batch, CalamineSource, CsvDirSink, InboundFile, PgSink, RelationalSink,
    RunOptions, RunReport, WarningLog,
};

#[derive(Parser, Debug)]
#[command(name = "pipeline", about = "Unifies and enriches clinic spreadsheets using an index")]
struct Args {
    /// Index spreadsheet (rename/drop rules)
    #[arg(long)]
    index: PathBuf,

    /// Data spreadsheets
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Reference date (YYYY-MM-DD) for ages and visit labels
    #[arg(long)]
    today: Option<String>,

    /// JSON file with profile definitions
    #[arg(long)]
    profiles: Option<PathBuf>,

    /// Write tables as CSV files into this directory instead of Postgres
    #[arg(long)]
    csv_out: Option<PathBuf>,

    /// Write the run report as JSON
    #[arg(long)]
    report: Option<PathBuf>,

    /// Dry run - don't persist anything
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

fn read_file(path: &Path) -> Result<InboundFile> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Not a file path: {}", path.display()))?;
    Ok(InboundFile::new(name, bytes))
}

fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write report {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();
    let settings = Settings::from_env()?;

    let run_id = Uuid::new_v4();
    execute(args, settings)
        .instrument(tracing::info_span!("run", %run_id))
        .await
}

async fn execute(args: Args, settings: Settings) -> Result<()> {
    let today = match &args.today {
        Some(raw) => parse_today(raw)?,
        None => settings.today(),
    };
    let profiles = match &args.profiles {
        Some(path) => load_profiles(path)?,
        None => settings.profiles()?,
    };
    let options = RunOptions::new(today).with_profiles(profiles);

    let index = read_file(&args.index)?;
    let data = args
        .files
        .iter()
        .map(|p| read_file(p))
        .collect::<Result<Vec<_>>>()?;
    let batch = Batch::new(index, data);

    tracing::info!(
        mode = if args.dry_run { "dry-run" } else { "live" },
        files = batch.data.len(),
        %today,
        "starting pipeline"
    );

    let result = run(&batch, &CalamineSource, &options);
    let mut report = RunReport::from_result(&result);

    let output = match result {
        Ok(output) => output,
        Err(failure) => {
            for warning in &failure.warnings {
                println!("  {}", warning);
            }
            if let Some(path) = &args.report {
                write_report(path, &report)?;
            }
            return Err(failure).context("Pipeline run failed");
        }
    };

    for table in &report.tables {
        println!("  {:<45} {:>8} rows {:>4} cols", table.name, table.rows, table.columns);
    }

    if !args.dry_run {
        let sink: Box<dyn RelationalSink> = match &args.csv_out {
            Some(dir) => Box::new(CsvDirSink::new(dir)),
            None => {
                let db_url = settings
                    .db_url
                    .clone()
                    .context(
                        "DB_URL env var missing (use --csv-out or --dry-run to skip Postgres)",
                    )?;
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(&db_url)
                    .await
                    .context("Failed to connect to database")?;
                Box::new(PgSink::new(pool))
            }
        };

        let mut persist_warnings = WarningLog::new();
        let written = persist_tables(sink.as_ref(), &output.tables, &mut persist_warnings).await;
        tracing::info!(written, total = output.tables.len(), "tables persisted");
        report.warnings.extend(persist_warnings.into_vec());
    } else {
        tracing::info!("dry run - nothing persisted");
    }

    if !report.warnings.is_empty() {
        println!("\nWarnings ({}):", report.warnings.len());
        for warning in &report.warnings {
            println!("  {}", warning);
        }
    }
    if let Some(path) = &args.report {
        write_report(path, &report)?;
    }

    Ok(())
}
