//! `glyco` command surface for recording and resolving temporary schedule
//! overrides against a SQLite-backed history snapshot.
//!
//! Every mutating command loads the stored snapshot, applies the engine
//! operation, and writes the snapshot back, so the CLI stays a thin caller
//! around `glyco-override-core`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use glyco_override_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, DailySchedule, OverrideContext, OverrideDuration,
    OverrideHistory, OverrideSettings, ScheduleOverride, TargetRange,
};
use glyco_override_store_sqlite::SqliteOverrideStore;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Parser)]
#[command(name = "glyco")]
#[command(about = "Glyco temporary schedule override CLI")]
pub struct Cli {
    #[arg(long, default_value = "./glyco_overrides.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Override {
        #[command(subcommand)]
        command: Box<OverrideCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum OverrideCommand {
    Enable(EnableArgs),
    Disable(DisableArgs),
    Resolve(ResolveArgs),
    Show,
    Wipe,
}

#[derive(Debug, Args)]
pub struct EnableArgs {
    /// Override start, RFC3339 UTC. Defaults to now.
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    duration_hours: Option<f64>,
    #[arg(long)]
    indefinite: bool,
    #[arg(long)]
    scale_factor: Option<f64>,
    #[arg(long)]
    target_min: Option<f64>,
    #[arg(long)]
    target_max: Option<f64>,
    #[arg(long, value_enum, default_value = "custom")]
    context: ContextArg,
    #[arg(long)]
    preset_name: Option<String>,
    /// Instant the override was enabled at. Defaults to the start date.
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct DisableArgs {
    /// Instant the override was disabled at. Defaults to now.
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Path to a baseline schedule JSON file ({"items": [...]}).
    #[arg(long)]
    schedule: PathBuf,
    #[arg(long, value_enum)]
    kind: ScheduleKindArg,
    /// Reference instant, RFC3339 UTC. Defaults to now.
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ContextArg {
    Custom,
    PreMeal,
    Workout,
    Preset,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ScheduleKindArg {
    Basal,
    Sensitivity,
    CarbRatio,
}

impl ScheduleKindArg {
    fn as_str(self) -> &'static str {
        match self {
            Self::Basal => "basal",
            Self::Sensitivity => "insulin_sensitivity",
            Self::CarbRatio => "carb_ratio",
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Override { command } => {
            let mut store = SqliteOverrideStore::open(&cli.db)?;
            store.migrate()?;
            run_override(*command, &mut store)
        }
    }
}

/// Executes a parsed override command against an existing store handle.
///
/// # Errors
/// Returns an error when input validation, persistence, or resolution fails.
pub fn run_override(command: OverrideCommand, store: &mut SqliteOverrideStore) -> Result<()> {
    match command {
        OverrideCommand::Enable(args) => {
            let override_value = build_override(&args)?;
            let enable_date = match args.at.as_deref() {
                Some(raw) => {
                    parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid --at value: {err}"))?
                }
                None => override_value.start_date,
            };

            let loaded = store.load_history()?;
            let mut history = loaded.history;
            history.record_override(Some(override_value), enable_date);
            store.save_history(&history)?;

            let payload = build_history_payload(&history, loaded.skipped_records)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        OverrideCommand::Disable(args) => {
            let enable_date = parse_optional_utc(args.at.as_deref())?;

            let loaded = store.load_history()?;
            let mut history = loaded.history;
            history.record_override(None, enable_date);
            store.save_history(&history)?;

            let payload = build_history_payload(&history, loaded.skipped_records)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        OverrideCommand::Resolve(args) => {
            let schedule = read_schedule(&args.schedule)?;
            let reference_date = parse_optional_utc(args.at.as_deref())?;

            let loaded = store.load_history()?;
            let mut history = loaded.history;
            let resolved = match args.kind {
                ScheduleKindArg::Basal => {
                    history.resolving_basal_schedule(&schedule, reference_date)
                }
                ScheduleKindArg::Sensitivity => {
                    history.resolving_sensitivity_schedule(&schedule, reference_date)
                }
                ScheduleKindArg::CarbRatio => {
                    history.resolving_carb_ratio_schedule(&schedule, reference_date)
                }
            };

            // Resolution prunes stale events; keep the snapshot in step.
            store.save_history(&history)?;

            let payload = build_resolved_payload(args.kind, reference_date, resolved)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        OverrideCommand::Show => {
            let loaded = store.load_history()?;
            let payload = build_history_payload(&loaded.history, loaded.skipped_records)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        OverrideCommand::Wipe => {
            let loaded = store.load_history()?;
            let mut history = loaded.history;
            history.wipe();
            store.save_history(&history)?;

            let payload = build_history_payload(&history, loaded.skipped_records)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct HistoryJsonPayload {
    contract_version: String,
    event_count: usize,
    skipped_records: usize,
    events: serde_json::Value,
}

#[derive(Debug, serde::Serialize)]
pub struct ResolvedScheduleJsonPayload {
    contract_version: String,
    kind: String,
    reference_date: String,
    schedule: DailySchedule,
}

fn build_history_payload(
    history: &OverrideHistory,
    skipped_records: usize,
) -> Result<HistoryJsonPayload> {
    Ok(HistoryJsonPayload {
        contract_version: "override_history.v1".to_string(),
        event_count: history.len(),
        skipped_records,
        events: history.to_json().map_err(|err| anyhow!(err.to_string()))?,
    })
}

fn build_resolved_payload(
    kind: ScheduleKindArg,
    reference_date: OffsetDateTime,
    schedule: DailySchedule,
) -> Result<ResolvedScheduleJsonPayload> {
    Ok(ResolvedScheduleJsonPayload {
        contract_version: "resolved_schedule.v1".to_string(),
        kind: kind.as_str().to_string(),
        reference_date: format_rfc3339(reference_date).map_err(|err| anyhow!(err.to_string()))?,
        schedule,
    })
}

fn build_override(args: &EnableArgs) -> Result<ScheduleOverride> {
    let start_date = parse_optional_utc(args.start.as_deref())?;

    let duration = match (args.duration_hours, args.indefinite) {
        (Some(hours), false) if hours.is_finite() && hours > 0.0 => {
            OverrideDuration::Finite(Duration::seconds_f64(hours * 3600.0))
        }
        (Some(_), false) => {
            return Err(anyhow!("--duration-hours must be a positive number"));
        }
        (None, true) => OverrideDuration::Indefinite,
        _ => {
            return Err(anyhow!(
                "exactly one of --duration-hours or --indefinite is required"
            ));
        }
    };

    let target_range = match (args.target_min, args.target_max) {
        (Some(min), Some(max)) if min.is_finite() && max.is_finite() && min <= max => {
            Some(TargetRange { min, max })
        }
        (Some(_), Some(_)) => {
            return Err(anyhow!("--target-min must be <= --target-max, both finite"));
        }
        (None, None) => None,
        _ => {
            return Err(anyhow!(
                "--target-min and --target-max must be provided together"
            ));
        }
    };

    if let Some(scale_factor) = args.scale_factor {
        if !scale_factor.is_finite() || scale_factor <= 0.0 {
            return Err(anyhow!("--scale-factor must be a positive number"));
        }
    }

    let context = match args.context {
        ContextArg::Custom => OverrideContext::Custom,
        ContextArg::PreMeal => OverrideContext::PreMeal,
        ContextArg::Workout => OverrideContext::Workout,
        ContextArg::Preset => {
            let Some(name) = args.preset_name.clone() else {
                return Err(anyhow!("--preset-name is required with --context preset"));
            };
            OverrideContext::Preset { name }
        }
    };

    if !matches!(args.context, ContextArg::Preset) && args.preset_name.is_some() {
        return Err(anyhow!("--preset-name only applies to --context preset"));
    }

    Ok(ScheduleOverride {
        context,
        settings: OverrideSettings {
            target_range,
            insulin_needs_scale_factor: args.scale_factor,
        },
        start_date,
        duration,
    })
}

fn read_schedule(path: &Path) -> Result<DailySchedule> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schedule file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("schedule file {} must be valid JSON", path.display()))?;
    DailySchedule::from_json(&value).map_err(|err| anyhow!("invalid schedule: {err}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}
