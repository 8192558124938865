//! Batch harvester for Warsaw public transport data.
//!
//! `rozklad timetables` walks the full pipeline (stop directory, line
//! discovery, timetable collection) and writes a compressed, date-stamped
//! snapshot; with `--daily` the run repeats every 24 hours in-process.
//! `rozklad positions` polls the live vehicle feed every 30 seconds and
//! appends the fixes into hourly JSON Lines files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use rozklad_core::{
    model::TrackedKind,
    pipeline::{HarvestOptions, Harvester},
    ports::{ApiError, Notifier, PositionApi},
    snapshot::{append_positions, write_snapshot},
};
use rozklad_provider_warsaw::{Credentials, WarsawApi};

const RESTART_INTERVAL_HOURS: u64 = 24;
const POSITION_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "rozklad",
    about = "Collect Warsaw public transport timetables and vehicle positions"
)]
struct Args {
    /// JSON file holding the api.um.warszawa.pl key.
    #[arg(long, default_value = "credentials.json")]
    credentials: PathBuf,

    /// Directory output files are written into.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Append logs to this file in addition to the console.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Harvest the full timetable into a daily snapshot.
    Timetables {
        /// Collect timetables for tram lines only.
        #[arg(long)]
        only_trams: bool,

        /// Keep running and repeat the harvest every 24 hours.
        #[arg(long)]
        daily: bool,
    },
    /// Poll live vehicle positions every 30 seconds into hourly logs.
    Positions {
        /// Which fleet to track.
        #[arg(long, value_enum, default_value = "trams")]
        kind: KindArg,

        /// Stop polling at this local time, e.g. "2026-12-31 23:59:59".
        /// Defaults to the end of the current year.
        #[arg(long, value_parser = parse_until)]
        until: Option<NaiveDateTime>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Buses,
    Trams,
}

impl From<KindArg> for TrackedKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Buses => Self::Buses,
            KindArg::Trams => Self::Trams,
        }
    }
}

fn parse_until(raw: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
}

/// Last second of the current local year, the default polling horizon.
fn end_of_year() -> NaiveDateTime {
    let year = Local::now().year();
    NaiveDate::from_ymd_opt(year, 12, 31)
        .and_then(|day| day.and_hms_opt(23, 59, 59))
        .unwrap_or_else(|| Local::now().naive_local())
}

/// Operator notification that only writes through the log.
///
/// Stands in for the mail side channel of the reference deployment; a
/// real sender is one [`Notifier`] implementation away.
struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        tracing::error!(subject, body, "Operator notification");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_file.as_deref())?;

    let credentials = Credentials::load(&args.credentials)
        .context("an API key from https://api.um.warszawa.pl is required")?;
    let api = Arc::new(WarsawApi::new(credentials)?);
    let notifier = LogNotifier;

    match args.command {
        Command::Timetables { only_trams, daily } => {
            let harvester = Harvester::new(api, HarvestOptions { only_trams });
            loop {
                run_once(&harvester, &notifier, &args.out_dir).await?;

                if !daily {
                    break;
                }
                wait_for_next_run().await;
            }
        }
        Command::Positions { kind, until } => {
            let until = until.unwrap_or_else(end_of_year);
            poll_positions(api.as_ref(), &notifier, &args.out_dir, kind.into(), until).await?;
        }
    }

    Ok(())
}

/// One full harvest. A failed pipeline notifies the operator and aborts
/// the process; a failed snapshot write is logged and swallowed, since the
/// data gathering already finished.
async fn run_once(
    harvester: &Harvester,
    notifier: &impl Notifier,
    out_dir: &Path,
) -> Result<()> {
    let today = Local::now().date_naive();

    let snapshot = match harvester.run(today).await {
        Ok(snapshot) => snapshot,
        Err(error) => {
            notifier
                .notify(
                    "rozklad harvest failed",
                    &format!(
                        "{error} at {}",
                        Local::now().format("%Y-%m-%d %H:%M:%S")
                    ),
                )
                .await;
            return Err(error).context("harvest aborted");
        }
    };

    match write_snapshot(out_dir, &snapshot) {
        Ok(path) => tracing::info!(path = %path.display(), "Snapshot written"),
        Err(error) => tracing::error!(%error, "Snapshot write failed"),
    }

    Ok(())
}

/// Poll the position feed until the deadline passes.
///
/// A spent retry budget skips the sample and keeps polling: one missed
/// 30-second sample must not end a collection that runs for months. Any
/// other terminal error notifies the operator and aborts.
async fn poll_positions(
    api: &impl PositionApi,
    notifier: &impl Notifier,
    out_dir: &Path,
    kind: TrackedKind,
    until: NaiveDateTime,
) -> Result<()> {
    tracing::info!(%kind, %until, "Position polling started");

    while Local::now().naive_local() < until {
        match api.positions(kind).await {
            Ok(positions) => {
                let stamped = Local::now().naive_local();
                match append_positions(out_dir, kind, stamped, &positions) {
                    Ok(path) => {
                        tracing::info!(fixes = positions.len(), path = %path.display(), "Sample stored");
                    }
                    Err(error) => tracing::error!(%error, "Sample lost"),
                }
            }
            Err(error @ ApiError::RetriesExhausted { .. }) => {
                tracing::warn!(%error, "Sample skipped");
            }
            Err(error) => {
                notifier
                    .notify(
                        "rozklad position poll failed",
                        &format!(
                            "{error} at {}",
                            Local::now().format("%Y-%m-%d %H:%M:%S")
                        ),
                    )
                    .await;
                return Err(error).context("position poll aborted");
            }
        }

        tokio::time::sleep(POSITION_POLL_INTERVAL).await;
    }

    tracing::info!("Position polling deadline reached");
    Ok(())
}

/// Sleep until the next daily run, logging an hourly countdown.
async fn wait_for_next_run() {
    tracing::info!("Harvest complete, next run in {RESTART_INTERVAL_HOURS} hours");
    for hours_left in (0..RESTART_INTERVAL_HOURS).rev() {
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        if hours_left > 0 {
            tracing::info!(hours_left, "Waiting for the next harvest");
        }
    }
}

/// Console logging, plus an optional non-ANSI file layer.
fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter);

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => registry.init(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Datelike;
    use clap::Parser;

    use super::{Args, Command, KindArg, end_of_year};

    #[test]
    fn defaults_match_the_scheduled_deployment() {
        let args = Args::parse_from(["rozklad", "timetables"]);
        assert_eq!(args.credentials.to_string_lossy(), "credentials.json");
        assert_eq!(args.out_dir.to_string_lossy(), ".");
        let Command::Timetables { only_trams, daily } = args.command else {
            panic!("expected the timetables subcommand");
        };
        assert!(!only_trams);
        assert!(!daily);
    }

    #[test]
    fn timetable_flags_parse() {
        let args = Args::parse_from([
            "rozklad",
            "--out-dir",
            "data",
            "--log-file",
            "StopsLog.log",
            "timetables",
            "--only-trams",
            "--daily",
        ]);
        assert_eq!(args.out_dir.to_string_lossy(), "data");
        assert!(args.log_file.is_some());
        let Command::Timetables { only_trams, daily } = args.command else {
            panic!("expected the timetables subcommand");
        };
        assert!(only_trams);
        assert!(daily);
    }

    #[test]
    fn position_flags_parse() {
        let args = Args::parse_from([
            "rozklad",
            "positions",
            "--kind",
            "buses",
            "--until",
            "2026-12-31 23:59:59",
        ]);
        let Command::Positions { kind, until } = args.command else {
            panic!("expected the positions subcommand");
        };
        assert!(matches!(kind, KindArg::Buses));
        let until = until.expect("deadline parsed");
        assert_eq!(until.to_string(), "2026-12-31 23:59:59");
    }

    #[test]
    fn position_deadline_defaults_to_year_end() {
        let args = Args::parse_from(["rozklad", "positions"]);
        let Command::Positions { kind, until } = args.command else {
            panic!("expected the positions subcommand");
        };
        assert!(matches!(kind, KindArg::Trams));
        assert!(until.is_none());

        let horizon = end_of_year();
        assert_eq!(horizon.month(), 12);
        assert_eq!(horizon.day(), 31);
    }
}
